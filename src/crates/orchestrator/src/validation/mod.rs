//! Sequential, fail-fast validation gate run after the implementation loop
//! applies a candidate change set (SPEC_FULL.md §4.7).
//!
//! Grounded on `agent_s3.coordinator.orchestrator.Orchestrator._run_validation_phase`
//! / `_run_tests`: database setup (optional, skipped unless configured),
//! then lint, then type check, then tests (with coverage), then a mutation
//! score gate compared against a configurable threshold. The first failing
//! step aborts the remaining ones; `ValidationResult::success` is true iff
//! no step failed. The pipeline's steps are external command invocations,
//! not value predicates.

use crate::collaborators::BashTool;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;

/// Identity of the step that failed, or `None` when every configured step
/// passed. Matches the failing-step vocabulary
/// `agent_s3.tools.test_runner_tool` and the orchestrator's validation loop
/// use: `"database"`, `"lint"`, `"type_check"`, `"tests"`, `"mutation"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailingStep {
    Database,
    Lint,
    TypeCheck,
    Tests,
    Mutation,
}

impl FailingStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailingStep::Database => "database",
            FailingStep::Lint => "lint",
            FailingStep::TypeCheck => "type_check",
            FailingStep::Tests => "tests",
            FailingStep::Mutation => "mutation",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub success: bool,
    pub failing_step: Option<FailingStep>,
    pub lint_output: Option<String>,
    pub type_output: Option<String>,
    pub test_output: Option<String>,
    pub coverage: Option<f64>,
    pub mutation_score: Option<f64>,
}

impl ValidationResult {
    fn passed() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn failed(step: FailingStep) -> Self {
        Self {
            success: false,
            failing_step: Some(step),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub run_database_setup: bool,
    pub lint_command: String,
    pub type_check_command: String,
    pub test_command: String,
    pub mutation_command: Option<String>,
    pub mutation_score_threshold: f64,
    pub step_timeout: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            run_database_setup: false,
            lint_command: "ruff check .".to_string(),
            type_check_command: "mypy .".to_string(),
            test_command: "pytest --cov --cov-report=json:.coverage.json".to_string(),
            mutation_command: None,
            mutation_score_threshold: 70.0,
            step_timeout: Duration::from_secs(120),
        }
    }
}

pub struct ValidationPipeline {
    bash_tool: Arc<dyn BashTool>,
    config: ValidationConfig,
}

impl ValidationPipeline {
    pub fn new(bash_tool: Arc<dyn BashTool>, config: ValidationConfig) -> Self {
        Self { bash_tool, config }
    }

    /// Run every configured step in order, stopping at the first failure.
    /// The invariant `success <=> failing_step.is_none()` holds for every
    /// returned value. Wrapped in `tooling::logging::timed` so the whole
    /// gate's wall-clock time lands in the logs the way every other
    /// external-call-heavy step in this codebase is timed.
    pub async fn run(&self) -> Result<ValidationResult> {
        tooling::logging::timed("validation_pipeline.run", self.run_steps()).await
    }

    async fn run_steps(&self) -> Result<ValidationResult> {
        if self.config.run_database_setup {
            let output = self
                .bash_tool
                .run("python manage.py migrate --check", self.config.step_timeout)
                .await?;
            if !output.success() {
                return Ok(ValidationResult::failed(FailingStep::Database));
            }
        }

        let lint = self
            .bash_tool
            .run(&self.config.lint_command, self.config.step_timeout)
            .await?;
        if !lint.success() {
            let mut result = ValidationResult::failed(FailingStep::Lint);
            result.lint_output = Some(lint.output);
            return Ok(result);
        }

        let type_check = self
            .bash_tool
            .run(&self.config.type_check_command, self.config.step_timeout)
            .await?;
        if !type_check.success() {
            let mut result = ValidationResult::failed(FailingStep::TypeCheck);
            result.type_output = Some(type_check.output);
            return Ok(result);
        }

        let tests = self
            .bash_tool
            .run(&self.config.test_command, self.config.step_timeout)
            .await?;
        let coverage = parse_coverage_percent(&tests.output);
        if !tests.success() {
            let mut result = ValidationResult::failed(FailingStep::Tests);
            result.test_output = Some(tests.output);
            result.coverage = coverage;
            return Ok(result);
        }

        let mut result = ValidationResult::passed();
        result.test_output = Some(tests.output);
        result.coverage = coverage;

        if let Some(mutation_command) = &self.config.mutation_command {
            let mutation = self
                .bash_tool
                .run(mutation_command, self.config.step_timeout)
                .await?;
            let score = parse_mutation_score(&mutation.output);
            result.mutation_score = score;

            let below_threshold = score
                .map(|s| s < self.config.mutation_score_threshold)
                .unwrap_or(true);
            if !mutation.success() || below_threshold {
                result.success = false;
                result.failing_step = Some(FailingStep::Mutation);
            }
        }

        Ok(result)
    }
}

/// Extract `totals.percent_covered` from a pytest-cov JSON report surfaced
/// on stdout, following the `.coverage.json` shape
/// `agent_s3.tools.test_runner_tool` parses.
fn parse_coverage_percent(output: &str) -> Option<f64> {
    let value: serde_json::Value = find_json_object(output)?;
    value
        .get("totals")
        .and_then(|t| t.get("percent_covered"))
        .and_then(|v| v.as_f64())
}

/// Extract a mutation score percentage from a mutation-testing tool's JSON
/// summary (`{"mutation_score": 82.5}`-shaped output).
fn parse_mutation_score(output: &str) -> Option<f64> {
    let value: serde_json::Value = find_json_object(output)?;
    value.get("mutation_score").and_then(|v| v.as_f64())
}

/// Scan command output line by line for the first line that parses as a
/// JSON object. Tool output often interleaves log lines with a single JSON
/// summary line; this avoids requiring the caller to isolate it.
fn find_json_object(output: &str) -> Option<serde_json::Value> {
    for line in output.lines().rev() {
        let trimmed = line.trim();
        if trimmed.starts_with('{') {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
                return Some(value);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::CommandOutput;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedBashTool {
        outputs: Mutex<Vec<CommandOutput>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedBashTool {
        fn new(outputs: Vec<CommandOutput>) -> Self {
            Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BashTool for ScriptedBashTool {
        async fn run(&self, command: &str, _timeout: Duration) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(command.to_string());
            Ok(self.outputs.lock().unwrap().remove(0))
        }
    }

    fn ok(output: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            output: output.to_string(),
        }
    }

    fn fail(output: &str) -> CommandOutput {
        CommandOutput {
            exit_code: 1,
            output: output.to_string(),
        }
    }

    #[tokio::test]
    async fn all_steps_pass_reports_success() {
        let bash = Arc::new(ScriptedBashTool::new(vec![
            ok(""),
            ok(""),
            ok(r#"{"totals": {"percent_covered": 91.5}}"#),
        ]));
        let pipeline = ValidationPipeline::new(bash, ValidationConfig::default());

        let result = pipeline.run().await.unwrap();
        assert!(result.success);
        assert!(result.failing_step.is_none());
        assert_eq!(result.coverage, Some(91.5));
    }

    #[tokio::test]
    async fn lint_failure_stops_pipeline_before_type_check() {
        let bash = Arc::new(ScriptedBashTool::new(vec![fail("E501 line too long")]));
        let pipeline = ValidationPipeline::new(bash.clone(), ValidationConfig::default());

        let result = pipeline.run().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failing_step, Some(FailingStep::Lint));
        assert_eq!(result.lint_output.as_deref(), Some("E501 line too long"));
        assert_eq!(bash.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_reports_coverage_and_aborts_before_mutation() {
        let mut config = ValidationConfig::default();
        config.mutation_command = Some("mutmut run".to_string());
        let bash = Arc::new(ScriptedBashTool::new(vec![
            ok(""),
            ok(""),
            fail(r#"{"totals": {"percent_covered": 40.0}}"#),
        ]));
        let pipeline = ValidationPipeline::new(bash.clone(), config);

        let result = pipeline.run().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failing_step, Some(FailingStep::Tests));
        assert_eq!(result.coverage, Some(40.0));
        assert_eq!(bash.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn mutation_score_below_threshold_fails_pipeline() {
        let mut config = ValidationConfig::default();
        config.mutation_command = Some("mutmut run".to_string());
        config.mutation_score_threshold = 70.0;
        let bash = Arc::new(ScriptedBashTool::new(vec![
            ok(""),
            ok(""),
            ok(r#"{"totals": {"percent_covered": 95.0}}"#),
            ok(r#"{"mutation_score": 55.0}"#),
        ]));
        let pipeline = ValidationPipeline::new(bash, config);

        let result = pipeline.run().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failing_step, Some(FailingStep::Mutation));
        assert_eq!(result.mutation_score, Some(55.0));
    }

    #[tokio::test]
    async fn database_setup_failure_short_circuits_everything() {
        let mut config = ValidationConfig::default();
        config.run_database_setup = true;
        let bash = Arc::new(ScriptedBashTool::new(vec![fail("migration error")]));
        let pipeline = ValidationPipeline::new(bash.clone(), config);

        let result = pipeline.run().await.unwrap();
        assert!(!result.success);
        assert_eq!(result.failing_step, Some(FailingStep::Database));
        assert_eq!(bash.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn parses_coverage_from_trailing_json_line() {
        let output = "collected 10 items\n...\n{\"totals\": {\"percent_covered\": 88.2}}";
        assert_eq!(parse_coverage_percent(output), Some(88.2));
    }
}
