//! Configuration loader for the orchestrator core (SPEC_FULL.md §4.9, C11).
//!
//! Layering follows `tooling::config::ConfigBuilder::from_env_with_defaults`:
//! defaults, then an optional TOML file, then environment variables
//! prefixed `ORCHESTRATOR_` win over both. Every section mirrors a
//! component's own config needs (`state::StateStore`, `server::ServerConfig`,
//! `validation::ValidationConfig`, `fsm::Orchestrator`'s retry/gate
//! settings) so `main` can build each component straight off the
//! corresponding field group.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tooling::config::{get_env_bool, get_env_or, get_env_parse_or, ConfigBuilder};
use tooling::ToolingError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStoreSettings {
    pub base_dir: PathBuf,
    pub max_age_days: u64,
}

impl Default for StateStoreSettings {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("./.orchestrator/state"),
            max_age_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub auth_token: String,
    pub messages_per_second: u32,
    pub heartbeat_interval_secs: u64,
    pub max_queue_size: usize,
    pub max_frame_bytes: usize,
    pub batch_size: usize,
    pub batch_interval_ms: u64,
    pub descriptor_path: PathBuf,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            auth_token: String::new(),
            messages_per_second: 5,
            heartbeat_interval_secs: 15,
            max_queue_size: 50,
            max_frame_bytes: 1_048_576,
            batch_size: 20,
            batch_interval_ms: 250,
            descriptor_path: PathBuf::from("./.orchestrator/server.json"),
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSettings {
    pub max_attempts: u32,
    pub max_plan_modifications: u32,
    pub pause_poll_timeout_secs: u64,
    pub retry_initial_interval_secs: f64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_plan_modifications: 3,
            pause_poll_timeout_secs: 30,
            retry_initial_interval_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSettings {
    pub run_database_setup: bool,
    pub lint_command: String,
    pub type_check_command: String,
    pub test_command: String,
    pub mutation_command: Option<String>,
    pub mutation_score_threshold: f64,
    pub step_timeout_secs: u64,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            run_database_setup: false,
            lint_command: "ruff check .".to_string(),
            type_check_command: "mypy .".to_string(),
            test_command: "pytest --cov --cov-report=json:.coverage.json".to_string(),
            mutation_command: None,
            mutation_score_threshold: 70.0,
            step_timeout_secs: 120,
        }
    }
}

/// Top-level configuration: one section per core component, loaded as a
/// unit so every component's settings travel through the same file/env
/// layering pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub state: StateStoreSettings,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub workflow: WorkflowSettings,
    #[serde(default)]
    pub validation: ValidationSettings,
}

impl OrchestratorConfig {
    /// Load defaults, overlay an optional TOML file, overlay environment
    /// variables (`ORCHESTRATOR_*`), then validate.
    ///
    /// Each layer is applied in place rather than through
    /// [`ConfigBuilder::merge`]: `merge`'s only sound implementation for an
    /// all-scalar struct like this one is whole-value replacement, and
    /// `from_env` has no way to tell "this field came from the file layer"
    /// from "this field is still a hardcoded default" once it's built a
    /// fresh `Self`. Applying the env overlay directly onto the
    /// already-file-merged config (using its current values, not
    /// `Self::default()`'s, as each variable's fallback) is what actually
    /// gives later layers precedence only where they set something.
    pub fn load(file_path: Option<&Path>) -> tooling::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = file_path {
            if path.exists() {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    ToolingError::General(format!("reading config file {}: {}", path.display(), e))
                })?;
                let from_file: Self = toml::from_str(&text).map_err(|e| {
                    ToolingError::General(format!("parsing config file {}: {}", path.display(), e))
                })?;
                config.merge(from_file);
            }
        }

        config.apply_env_overrides("ORCHESTRATOR_")?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `{prefix}*` environment variables onto `self` in place,
    /// falling back to each field's *current* value (not a fresh default)
    /// when the corresponding variable is unset.
    fn apply_env_overrides(&mut self, prefix: &str) -> tooling::Result<()> {
        self.state.base_dir = PathBuf::from(get_env_or(
            &format!("{prefix}STATE_BASE_DIR"),
            self.state.base_dir.to_string_lossy().to_string(),
        )?);
        self.state.max_age_days =
            get_env_parse_or(&format!("{prefix}STATE_MAX_AGE_DAYS"), self.state.max_age_days)?;

        self.server.host = get_env_or(&format!("{prefix}SERVER_HOST"), self.server.host.clone())?;
        self.server.port = get_env_parse_or(&format!("{prefix}SERVER_PORT"), self.server.port)?;
        self.server.auth_token =
            get_env_or(&format!("{prefix}SERVER_AUTH_TOKEN"), self.server.auth_token.clone())?;
        self.server.messages_per_second = get_env_parse_or(
            &format!("{prefix}SERVER_MESSAGES_PER_SECOND"),
            self.server.messages_per_second,
        )?;
        self.server.heartbeat_interval_secs = get_env_parse_or(
            &format!("{prefix}SERVER_HEARTBEAT_INTERVAL_SECS"),
            self.server.heartbeat_interval_secs,
        )?;
        self.server.descriptor_path = PathBuf::from(get_env_or(
            &format!("{prefix}SERVER_DESCRIPTOR_PATH"),
            self.server.descriptor_path.to_string_lossy().to_string(),
        )?);

        self.workflow.max_attempts = get_env_parse_or(
            &format!("{prefix}WORKFLOW_MAX_ATTEMPTS"),
            self.workflow.max_attempts,
        )?;
        self.workflow.max_plan_modifications = get_env_parse_or(
            &format!("{prefix}WORKFLOW_MAX_PLAN_MODIFICATIONS"),
            self.workflow.max_plan_modifications,
        )?;

        self.validation.run_database_setup = get_env_bool(&format!(
            "{prefix}VALIDATION_RUN_DATABASE_SETUP"
        ))?
        .unwrap_or(self.validation.run_database_setup);
        self.validation.mutation_score_threshold = get_env_parse_or(
            &format!("{prefix}VALIDATION_MUTATION_SCORE_THRESHOLD"),
            self.validation.mutation_score_threshold,
        )?;

        Ok(())
    }
}

impl ConfigBuilder for OrchestratorConfig {
    fn validate(&self) -> tooling::Result<()> {
        if self.server.port == 0 {
            return Err(ToolingError::General("server.port must be non-zero".into()));
        }
        if self.workflow.max_attempts == 0 {
            return Err(ToolingError::General(
                "workflow.max_attempts must be non-zero".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.validation.mutation_score_threshold) {
            return Err(ToolingError::General(
                "validation.mutation_score_threshold must be in [0, 100]".into(),
            ));
        }
        Ok(())
    }

    fn from_env(prefix: &str) -> tooling::Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides(prefix)?;
        Ok(config)
    }

    fn merge(&mut self, other: Self) -> &mut Self {
        *self = other;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = OrchestratorConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_port_fails_validation() {
        let mut config = OrchestratorConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn mutation_threshold_out_of_range_fails() {
        let mut config = OrchestratorConfig::default();
        config.validation.mutation_score_threshold = 150.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_with_missing_file_falls_back_to_defaults() {
        let config = OrchestratorConfig::load(Some(Path::new("/nonexistent/orchestrator.toml")))
            .expect("defaults should load even without a file");
        assert_eq!(config.server.port, ServerSettings::default().port);
    }

    /// A value set only by the TOML file must survive the subsequent
    /// environment-variable overlay pass untouched, since no
    /// `ORCHESTRATOR_SERVER_HOST` variable is set in this test.
    #[test]
    fn file_values_survive_env_overlay_when_no_override_is_set() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(&path, "[server]\nhost = \"0.0.0.0\"\nport = 9000\n").unwrap();

        let config = OrchestratorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 9000);
        assert_eq!(
            config.state.max_age_days,
            StateStoreSettings::default().max_age_days
        );
    }
}
