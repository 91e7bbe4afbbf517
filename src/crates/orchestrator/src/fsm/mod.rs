//! The workflow orchestrator: a 6-state FSM driving a task through the
//! fixed phase sequence planning -> prompt_approval -> issue_creation ->
//! code_generation -> execution -> pr_creation (SPEC_FULL.md §4.5).
//!
//! Grounded on `agent_s3.coordinator.orchestrator.Orchestrator.run_task`
//! for the phase sequence and its ternary plan-approval/regenerate loop,
//! and on its `git_tool.stash`/`stash pop`/`stash drop` bracketing of the
//! apply-validate-retry cycle inside `execution`. The state machine itself
//! — `ready/running/paused/stopped/completed/failed` behind a single control
//! lock, with a cooperative `tokio::sync::Notify` gate for pause/resume —
//! has no single counterpart in the Python source (which used cooperative
//! cancellation tokens); it follows the same shape
//! `workflow::executor::WorkflowExecutor` uses for its own state transitions
//! and control locking, generalized to the spec's six states and transition
//! table.

use crate::collaborators::{CodeGenerator, ContextProvider, Moderator, PlanDecision, Planner, VcsTool};
use crate::applicator::ChangeApplicator;
use crate::error::{AppError, ErrorCategory, Result};
use crate::message::{Message, MessageBus, MessageContent};
use crate::resumer::{ExecutionResumePoint, PrResumePoint, ResumePoint};
use crate::state::{
    CodeGenerationState, ExecutionState, IssueCreationState, Phase, PlanningState,
    PrCreationState, PromptApprovalState, Snapshot, StateStore,
};
use crate::validation::ValidationPipeline;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tooling::async_utils::retry::RetryPolicy;
use tracing::{info, warn};

/// The six fixed workflow states (SPEC_FULL.md §4.5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Ready,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl WorkflowState {
    fn as_str(&self) -> &'static str {
        match self {
            WorkflowState::Ready => "ready",
            WorkflowState::Running => "running",
            WorkflowState::Paused => "paused",
            WorkflowState::Stopped => "stopped",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowState::Stopped | WorkflowState::Completed | WorkflowState::Failed
        )
    }

    /// The fixed transition table: `Ready` only ever starts a run, the
    /// three terminal states never leave, and `Paused` can only return to
    /// `Running` or end the run via `Stopped`.
    fn can_transition_to(&self, to: WorkflowState) -> bool {
        use WorkflowState::*;
        matches!(
            (self, to),
            (Ready, Running)
                | (Running, Paused)
                | (Running, Stopped)
                | (Running, Completed)
                | (Running, Failed)
                | (Paused, Running)
                | (Paused, Stopped)
        )
    }
}

/// Raised by [`Orchestrator::transition`] when the requested move is not in
/// the transition table; carries both endpoints for the caller/log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: WorkflowState,
    pub to: WorkflowState,
}

pub struct OrchestratorDeps {
    pub bus: Arc<MessageBus>,
    pub store: StateStore,
    pub planner: Arc<dyn Planner>,
    pub code_generator: Arc<dyn CodeGenerator>,
    pub applicator: ChangeApplicator,
    pub validation: ValidationPipeline,
    pub vcs: Arc<dyn VcsTool>,
    pub moderator: Arc<dyn Moderator>,
    pub context: Arc<dyn ContextProvider>,
}

/// Drives one task through the fixed phase sequence under a single control
/// lock. One `Orchestrator` instance per in-flight task.
pub struct Orchestrator {
    task_id: String,
    state: Mutex<WorkflowState>,
    control_gate: Notify,
    stop_requested: AtomicBool,
    pause_poll_timeout: Duration,
    max_plan_modifications: u32,
    retry_policy: RetryPolicy,
    bus: Arc<MessageBus>,
    store: StateStore,
    planner: Arc<dyn Planner>,
    code_generator: Arc<dyn CodeGenerator>,
    applicator: ChangeApplicator,
    validation: ValidationPipeline,
    vcs: Arc<dyn VcsTool>,
    moderator: Arc<dyn Moderator>,
    context: Arc<dyn ContextProvider>,
}

impl Orchestrator {
    pub fn new(task_id: impl Into<String>, deps: OrchestratorDeps) -> Self {
        Self {
            task_id: task_id.into(),
            state: Mutex::new(WorkflowState::Ready),
            control_gate: Notify::new(),
            stop_requested: AtomicBool::new(false),
            pause_poll_timeout: Duration::from_secs(30),
            max_plan_modifications: 3,
            retry_policy: RetryPolicy::new(3).with_initial_interval(1.0),
            bus: deps.bus,
            store: deps.store,
            planner: deps.planner,
            code_generator: deps.code_generator,
            applicator: deps.applicator,
            validation: deps.validation,
            vcs: deps.vcs,
            moderator: deps.moderator,
            context: deps.context,
        }
    }

    pub async fn status(&self) -> WorkflowState {
        *self.state.lock().await
    }

    /// Atomically check-and-set the state, broadcasting `workflow_status`
    /// on success. Rejected transitions never touch the bus.
    async fn transition(&self, to: WorkflowState, phase: Option<&str>) -> Result<()> {
        let mut guard = self.state.lock().await;
        if !guard.can_transition_to(to) {
            return Err(AppError::new(
                ErrorCategory::Coordination,
                "fsm",
                format!(
                    "invalid transition from {} to {}",
                    guard.as_str(),
                    to.as_str()
                ),
            ));
        }
        let from = *guard;
        *guard = to;
        let snapshot_state = to;
        drop(guard);

        info!(
            task_id = %self.task_id,
            from = from.as_str(),
            to = to.as_str(),
            phase = phase.unwrap_or("-"),
            "workflow transition"
        );
        self.broadcast_status(snapshot_state, phase);
        Ok(())
    }

    fn broadcast_status(&self, state: WorkflowState, phase: Option<&str>) {
        let message = Message::construct(MessageContent::WorkflowStatus {
            status: state.as_str().to_string(),
            phase: phase.map(str::to_string),
            can_pause: state == WorkflowState::Running,
            can_resume: state == WorkflowState::Paused,
            can_stop: matches!(state, WorkflowState::Running | WorkflowState::Paused),
        })
        .expect("workflow_status content is always valid");
        self.bus.publish(&message);
    }

    /// Request a pause; takes effect at the next phase boundary the running
    /// workflow checks into.
    pub async fn pause(&self) -> Result<()> {
        self.transition(WorkflowState::Paused, None).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.transition(WorkflowState::Running, None).await?;
        self.control_gate.notify_waiters();
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!(task_id = %self.task_id, "stop requested");
        self.stop_requested.store(true, Ordering::SeqCst);
        let result = self.transition(WorkflowState::Stopped, None).await;
        self.control_gate.notify_waiters();
        result
    }

    /// Cooperative checkpoint: blocks while paused (bounded by
    /// `pause_poll_timeout` per wait, re-checking state afterward so a
    /// missed notify can't hang the workflow forever), and surfaces a stop
    /// request as an error that aborts the run immediately.
    async fn checkpoint(&self) -> Result<()> {
        loop {
            let state = *self.state.lock().await;
            match state {
                WorkflowState::Stopped => {
                    return Err(AppError::new(ErrorCategory::Coordination, "fsm", "stopped"))
                }
                WorkflowState::Paused => {
                    let _ = tokio::time::timeout(
                        self.pause_poll_timeout,
                        self.control_gate.notified(),
                    )
                    .await;
                    continue;
                }
                _ => return Ok(()),
            }
        }
    }

    fn snapshot(&self, phase: Phase, data: impl serde::Serialize) -> Result<()> {
        let snapshot = Snapshot::new(&self.task_id, phase, data)?;
        self.store.save(&snapshot)
    }

    /// Run the full phase sequence for a new task. Returns `Ok(())` on
    /// completion, explicit stop, or moderator rejection; `Err` on an
    /// unrecoverable phase failure (the workflow transitions to `Failed`
    /// before the error is returned).
    pub async fn run(&self, request_text: &str) -> Result<()> {
        info!(task_id = %self.task_id, "workflow run starting");
        self.transition(WorkflowState::Running, Some("planning")).await?;

        match self.run_phases(request_text).await {
            Ok(Outcome::Completed) => {
                info!(task_id = %self.task_id, "workflow run completed");
                self.transition(WorkflowState::Completed, Some("pr_creation")).await
            }
            Ok(Outcome::StoppedByModerator) => {
                info!(task_id = %self.task_id, "workflow run stopped by moderator");
                self.transition(WorkflowState::Stopped, None).await
            }
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "workflow run failed");
                let _ = self.transition(WorkflowState::Failed, None).await;
                Err(err)
            }
        }
    }

    async fn run_phases(&self, request_text: &str) -> Result<Outcome> {
        self.checkpoint().await?;
        let tech_stack = self.context.tech_stack().await?;
        let mut plan = self.planner.plan(request_text, &tech_stack).await?;
        self.snapshot(
            Phase::Planning,
            PlanningState {
                request_text: request_text.to_string(),
                tech_stack: tech_stack.clone(),
                plan: plan.clone(),
                ..Default::default()
            },
        )?;

        self.checkpoint().await?;
        let approved = self.run_prompt_approval(&mut plan).await?;
        if !approved {
            return Ok(Outcome::StoppedByModerator);
        }

        self.checkpoint().await?;
        self.snapshot(Phase::IssueCreation, IssueCreationState { is_created: true })?;

        self.checkpoint().await?;
        let changes = self.code_generator.generate(&plan, &tech_stack).await?;
        self.snapshot(
            Phase::CodeGeneration,
            CodeGenerationState {
                plan: plan.clone(),
                generated_changes: changes
                    .keys()
                    .map(|p| serde_json::Value::String(p.clone()))
                    .collect(),
                current_iteration: 0,
            },
        )?;

        self.checkpoint().await?;
        self.run_execution(changes).await?;

        self.checkpoint().await?;
        self.run_pr_creation(&plan).await?;

        Ok(Outcome::Completed)
    }

    /// Ternary plan-approval loop: `yes` proceeds, `modify` regenerates (up
    /// to `max_plan_modifications` times before falling back to asking
    /// whether to proceed with the current plan anyway), `no` stops the run.
    async fn run_prompt_approval(&self, plan: &mut serde_json::Value) -> Result<bool> {
        let mut discussion = String::new();
        for _ in 0..=self.max_plan_modifications {
            match self.moderator.ask_plan_approval(plan).await? {
                PlanDecision::Yes => {
                    self.snapshot(
                        Phase::PromptApproval,
                        PromptApprovalState {
                            plan: plan.clone(),
                            discussion,
                            is_approved: true,
                            user_modifications: String::new(),
                        },
                    )?;
                    return Ok(true);
                }
                PlanDecision::No => {
                    self.snapshot(
                        Phase::PromptApproval,
                        PromptApprovalState {
                            plan: plan.clone(),
                            discussion,
                            is_approved: false,
                            user_modifications: String::new(),
                        },
                    )?;
                    return Ok(false);
                }
                PlanDecision::Modify(text) => {
                    discussion.push_str(&text);
                    discussion.push('\n');
                    *plan = self.planner.regenerate(plan, &text).await?;
                }
            }
        }

        if self.moderator.ask_proceed_with_current_plan().await? {
            self.snapshot(
                Phase::PromptApproval,
                PromptApprovalState {
                    plan: plan.clone(),
                    discussion,
                    is_approved: true,
                    user_modifications: String::new(),
                },
            )?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Apply -> validate -> retry, bracketed by a VCS stash so a failed
    /// attempt never leaves partial changes behind for the next one. On
    /// validation failure, asks the moderator for debugging guidance before
    /// retrying; no guidance ends the run as a failure.
    async fn run_execution(&self, changes: HashMap<String, String>) -> Result<()> {
        let entries: Vec<(String, String)> = changes.into_iter().collect();
        let mut attempt: u32 = 0;

        loop {
            self.snapshot(
                Phase::Execution,
                ExecutionState {
                    changes: entries.iter().map(|(p, _)| serde_json::Value::String(p.clone())).collect(),
                    iteration: attempt,
                    sub_state: Some("applying_changes".to_string()),
                    ..Default::default()
                },
            )?;

            let stashed = self.vcs.stash_save().await?;
            let apply_result = self.applicator.apply(&entries).await?;

            if !apply_result.success {
                if stashed {
                    self.vcs.stash_pop().await?;
                }
                return Err(AppError::new(
                    ErrorCategory::Generation,
                    "fsm",
                    format!("failed to apply changes to {:?}", apply_result.failed_path),
                ));
            }

            self.snapshot(
                Phase::Execution,
                ExecutionState {
                    iteration: attempt,
                    is_applied: true,
                    sub_state: Some("running_tests".to_string()),
                    ..Default::default()
                },
            )?;

            let validation = self.validation.run().await?;

            if validation.success {
                if stashed {
                    self.vcs.stash_drop().await?;
                }
                self.snapshot(
                    Phase::Execution,
                    ExecutionState {
                        iteration: attempt,
                        is_applied: true,
                        sub_state: Some("analyzing_results".to_string()),
                        raw_test_output: validation.test_output,
                        ..Default::default()
                    },
                )?;
                return Ok(());
            }

            if stashed {
                self.vcs.stash_pop().await?;
            }

            attempt += 1;
            if !self.retry_policy.should_retry(attempt as usize) {
                warn!(
                    task_id = %self.task_id,
                    attempt_number = attempt,
                    failing_step = ?validation.failing_step,
                    "execution retries exhausted"
                );
                return Err(AppError::new(
                    ErrorCategory::Validation,
                    "fsm",
                    format!(
                        "validation failed at step {:?} after {attempt} attempts",
                        validation.failing_step
                    ),
                ));
            }

            warn!(
                task_id = %self.task_id,
                attempt_number = attempt,
                failing_step = ?validation.failing_step,
                "execution validation failed, requesting debugging guidance before retry"
            );
            let guidance = self
                .moderator
                .request_debugging_guidance(
                    "execution",
                    attempt,
                    validation
                        .failing_step
                        .map(|s| s.as_str())
                        .unwrap_or("unknown_error"),
                )
                .await?;
            if guidance.is_none() {
                return Err(AppError::new(
                    ErrorCategory::Debugging,
                    "fsm",
                    "moderator declined to provide further guidance",
                ));
            }

            self.checkpoint().await?;
            tokio::time::sleep(self.retry_policy.calculate_delay(attempt as usize)).await;
        }
    }

    async fn run_pr_creation(&self, plan: &serde_json::Value) -> Result<()> {
        self.execute_pr_creation(plan, PrResumePoint::CreateBranch, None, None)
            .await
    }

    /// Drive `pr_creation` starting at `start`, skipping any step a resumed
    /// run already completed (recorded via `existing_branch`/
    /// `existing_commit_sha`). Mirrors `run_pr_creation`'s step sequence;
    /// the fresh-start path is just `start = CreateBranch` with nothing
    /// already recorded.
    async fn execute_pr_creation(
        &self,
        plan: &serde_json::Value,
        start: PrResumePoint,
        existing_branch: Option<String>,
        existing_commit_sha: Option<String>,
    ) -> Result<()> {
        let start_index = pr_step_index(&start);
        let branch_name =
            existing_branch.unwrap_or_else(|| format!("orchestrator/{}", self.task_id));
        let commit_message = plan
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Automated change")
            .to_string();

        if start_index <= pr_step_index(&PrResumePoint::CreateBranch) {
            self.snapshot(
                Phase::PrCreation,
                PrCreationState {
                    branch_name: branch_name.clone(),
                    sub_state: Some("creating_branch".to_string()),
                    ..Default::default()
                },
            )?;
            self.vcs.create_branch(&branch_name, "main").await?;
        }

        let mut commit_sha = existing_commit_sha;
        if start_index <= pr_step_index(&PrResumePoint::Commit) {
            self.vcs.stage_all().await?;
            self.snapshot(
                Phase::PrCreation,
                PrCreationState {
                    branch_name: branch_name.clone(),
                    sub_state: Some("committing".to_string()),
                    ..Default::default()
                },
            )?;
            commit_sha = Some(self.vcs.commit(&commit_message).await?);
        }
        let commit_sha = commit_sha.ok_or_else(|| {
            AppError::new(
                ErrorCategory::Coordination,
                "fsm",
                "resuming pr_creation past commit without a recorded commit sha",
            )
        })?;

        if start_index <= pr_step_index(&PrResumePoint::Push) {
            self.snapshot(
                Phase::PrCreation,
                PrCreationState {
                    branch_name: branch_name.clone(),
                    commit_sha: Some(commit_sha.clone()),
                    sub_state: Some("pushing".to_string()),
                    ..Default::default()
                },
            )?;
            self.vcs.push(&branch_name).await?;
        }

        self.snapshot(
            Phase::PrCreation,
            PrCreationState {
                branch_name: branch_name.clone(),
                commit_sha: Some(commit_sha.clone()),
                sub_state: Some("creating_api_request".to_string()),
                ..Default::default()
            },
        )?;
        let pr = self
            .vcs
            .create_pull_request(&branch_name, &commit_message, "", "main", false)
            .await?;

        self.snapshot(
            Phase::PrCreation,
            PrCreationState {
                branch_name,
                commit_sha: Some(commit_sha),
                pr_url: Some(pr.url),
                is_created: true,
                sub_state: Some("creating_api_request".to_string()),
                ..Default::default()
            },
        )?;
        Ok(())
    }

    /// Re-enter a task the [`crate::resumer::Resumer`] found mid-flight.
    /// Phases before `execution` have no expensive side effect to avoid
    /// repeating, so they simply re-run their step from the saved inputs;
    /// `execution` and `pr_creation` honor the resumer's sub-point so a
    /// completed apply/commit/push is never redone (SPEC_FULL.md §4.4).
    pub async fn resume(&self, point: ResumePoint) -> Result<()> {
        let phase_label = resume_phase_label(&point);
        info!(task_id = %self.task_id, phase = phase_label, "resuming interrupted workflow");
        self.transition(WorkflowState::Running, Some(phase_label))
            .await?;

        match self.run_resumed(point).await {
            Ok(Outcome::Completed) => {
                info!(task_id = %self.task_id, "resumed workflow run completed");
                self.transition(WorkflowState::Completed, Some("pr_creation")).await
            }
            Ok(Outcome::StoppedByModerator) => {
                info!(task_id = %self.task_id, "resumed workflow run stopped by moderator");
                self.transition(WorkflowState::Stopped, None).await
            }
            Err(err) => {
                warn!(task_id = %self.task_id, error = %err, "resumed workflow run failed");
                let _ = self.transition(WorkflowState::Failed, None).await;
                Err(err)
            }
        }
    }

    async fn run_resumed(&self, point: ResumePoint) -> Result<Outcome> {
        self.checkpoint().await?;
        match point {
            ResumePoint::Planning(state) => self.run_phases(&state.request_text).await,
            ResumePoint::PromptApproval(state) => {
                let tech_stack = self.planning_tech_stack().await?;
                let mut plan = state.plan;
                let approved = self.run_prompt_approval(&mut plan).await?;
                if !approved {
                    return Ok(Outcome::StoppedByModerator);
                }
                self.continue_from_code_generation(tech_stack, plan).await
            }
            ResumePoint::IssueCreation(_) => {
                let tech_stack = self.planning_tech_stack().await?;
                let plan = self.prompt_approval_plan()?;
                self.continue_from_code_generation(tech_stack, plan).await
            }
            ResumePoint::CodeGeneration(state) => {
                let tech_stack = self.planning_tech_stack().await?;
                self.continue_from_execution(tech_stack, state.plan).await
            }
            ResumePoint::Execution { point, .. } => {
                let tech_stack = self.planning_tech_stack().await?;
                let plan = self.prompt_approval_plan()?;
                let changes = self.code_generator.generate(&plan, &tech_stack).await?;
                let changes = filter_pending_changes(changes, &point);
                self.run_execution(changes).await?;
                self.checkpoint().await?;
                self.run_pr_creation(&plan).await?;
                Ok(Outcome::Completed)
            }
            ResumePoint::PrCreation { state, point } => {
                if let PrResumePoint::AlreadyCreated { ref pr_url } = point {
                    info!(
                        task_id = %self.task_id,
                        pr_url = %pr_url,
                        "pull request already created, reporting existing URL and finalizing"
                    );
                    let message = Message::construct(MessageContent::TerminalOutput {
                        text: format!("Pull request already created: {pr_url}"),
                    })
                    .expect("terminal_output content is always valid");
                    self.bus.publish(&message);
                    return Ok(Outcome::Completed);
                }
                let plan = self.prompt_approval_plan()?;
                self.execute_pr_creation(&plan, point, Some(state.branch_name), state.commit_sha)
                    .await?;
                Ok(Outcome::Completed)
            }
        }
    }

    /// Continuation of `run_phases` starting at `code_generation`, shared
    /// by every resume point that has a plan but hasn't generated changes
    /// yet.
    async fn continue_from_code_generation(
        &self,
        tech_stack: serde_json::Value,
        plan: serde_json::Value,
    ) -> Result<Outcome> {
        self.checkpoint().await?;
        self.snapshot(Phase::IssueCreation, IssueCreationState { is_created: true })?;

        self.checkpoint().await?;
        self.continue_from_execution(tech_stack, plan).await
    }

    /// Continuation starting at `execution`, shared by the `code_generation`
    /// resume point and the tail of `continue_from_code_generation`.
    async fn continue_from_execution(
        &self,
        tech_stack: serde_json::Value,
        plan: serde_json::Value,
    ) -> Result<Outcome> {
        let changes = self.code_generator.generate(&plan, &tech_stack).await?;
        self.snapshot(
            Phase::CodeGeneration,
            CodeGenerationState {
                plan: plan.clone(),
                generated_changes: changes
                    .keys()
                    .map(|p| serde_json::Value::String(p.clone()))
                    .collect(),
                current_iteration: 0,
            },
        )?;

        self.checkpoint().await?;
        self.run_execution(changes).await?;

        self.checkpoint().await?;
        self.run_pr_creation(&plan).await?;
        Ok(Outcome::Completed)
    }

    /// The `tech_stack` value lives only in the `planning` snapshot; later
    /// phases' payloads don't repeat it, so resuming past `planning`
    /// re-reads it from there rather than re-querying the context
    /// collaborator.
    async fn planning_tech_stack(&self) -> Result<serde_json::Value> {
        match self.store.load(&self.task_id, Phase::Planning) {
            Ok(snapshot) => Ok(snapshot.planning_state()?.tech_stack),
            Err(_) => self.context.tech_stack().await,
        }
    }

    /// The approved plan lives in the `prompt_approval` snapshot; phases
    /// after it (`issue_creation`, `execution`, `pr_creation`) reference it
    /// by re-reading rather than duplicating it into their own payload.
    fn prompt_approval_plan(&self) -> Result<serde_json::Value> {
        let snapshot = self.store.load(&self.task_id, Phase::PromptApproval)?;
        Ok(snapshot.prompt_approval_state()?.plan)
    }
}

/// Step ordering used to decide which `pr_creation` steps a resumed run
/// can skip. Lower means earlier; `AlreadyCreated` sorts last since
/// nothing remains to do.
fn pr_step_index(point: &PrResumePoint) -> u8 {
    match point {
        PrResumePoint::CreateBranch => 0,
        PrResumePoint::Commit => 1,
        PrResumePoint::Push => 2,
        PrResumePoint::CreatePullRequest => 3,
        PrResumePoint::AlreadyCreated { .. } => 4,
    }
}

/// Narrow a freshly (re-)generated change set down to the paths the
/// resumer identified as not yet applied. Re-generation is assumed
/// deterministic for an unchanged plan/tech-stack pair; paths the resumer
/// didn't list as pending are dropped rather than re-applied.
fn filter_pending_changes(
    changes: HashMap<String, String>,
    point: &ExecutionResumePoint,
) -> HashMap<String, String> {
    match point {
        ExecutionResumePoint::ApplyChanges { pending } => {
            let pending_paths: std::collections::HashSet<String> = pending
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
            changes
                .into_iter()
                .filter(|(path, _)| pending_paths.contains(path))
                .collect()
        }
        ExecutionResumePoint::RunTests | ExecutionResumePoint::AnalyzeResults => HashMap::new(),
    }
}

fn resume_phase_label(point: &ResumePoint) -> &'static str {
    match point {
        ResumePoint::Planning(_) => "planning",
        ResumePoint::PromptApproval(_) => "prompt_approval",
        ResumePoint::IssueCreation(_) => "issue_creation",
        ResumePoint::CodeGeneration(_) => "code_generation",
        ResumePoint::Execution { .. } => "execution",
        ResumePoint::PrCreation { .. } => "pr_creation",
    }
}

enum Outcome {
    Completed,
    StoppedByModerator,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_only_transitions_to_running() {
        assert!(WorkflowState::Ready.can_transition_to(WorkflowState::Running));
        assert!(!WorkflowState::Ready.can_transition_to(WorkflowState::Completed));
        assert!(!WorkflowState::Ready.can_transition_to(WorkflowState::Paused));
    }

    #[test]
    fn terminal_states_accept_no_further_transitions() {
        for terminal in [
            WorkflowState::Completed,
            WorkflowState::Stopped,
            WorkflowState::Failed,
        ] {
            assert!(terminal.is_terminal());
            for target in [
                WorkflowState::Ready,
                WorkflowState::Running,
                WorkflowState::Paused,
                WorkflowState::Stopped,
                WorkflowState::Completed,
                WorkflowState::Failed,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn paused_can_only_resume_or_stop() {
        assert!(WorkflowState::Paused.can_transition_to(WorkflowState::Running));
        assert!(WorkflowState::Paused.can_transition_to(WorkflowState::Stopped));
        assert!(!WorkflowState::Paused.can_transition_to(WorkflowState::Completed));
        assert!(!WorkflowState::Paused.can_transition_to(WorkflowState::Failed));
    }

    #[tokio::test]
    async fn rejected_transition_does_not_broadcast() {
        use crate::message::MessageKind;
        use std::sync::atomic::AtomicUsize;

        let bus = Arc::new(MessageBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        bus.register_handler(MessageKind::WorkflowStatus, move |_| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = test_orchestrator(bus.clone(), dir.path());

        // Ready -> Completed is not in the transition table.
        let err = orchestrator
            .transition(WorkflowState::Completed, None)
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Coordination);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        orchestrator.transition(WorkflowState::Running, None).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    fn test_orchestrator(bus: Arc<MessageBus>, base_dir: &std::path::Path) -> Orchestrator {
        use crate::collaborators::*;
        use async_trait::async_trait;

        struct NoopPlanner;
        #[async_trait]
        impl Planner for NoopPlanner {
            async fn plan(&self, _task: &str, _ctx: &serde_json::Value) -> Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
            async fn regenerate(&self, plan: &serde_json::Value, _m: &str) -> Result<serde_json::Value> {
                Ok(plan.clone())
            }
        }

        struct NoopGenerator;
        #[async_trait]
        impl CodeGenerator for NoopGenerator {
            async fn generate(
                &self,
                _plan: &serde_json::Value,
                _tech_stack: &serde_json::Value,
            ) -> Result<HashMap<String, String>> {
                Ok(HashMap::new())
            }
        }

        struct NoopFileTool;
        #[async_trait]
        impl FileTool for NoopFileTool {
            async fn read(&self, _path: &str) -> Result<String> {
                Ok(String::new())
            }
            async fn write(&self, _path: &str, _content: &str) -> Result<()> {
                Ok(())
            }
            async fn exists(&self, _path: &str) -> Result<bool> {
                Ok(false)
            }
        }

        struct NoopBashTool;
        #[async_trait]
        impl BashTool for NoopBashTool {
            async fn run(&self, _command: &str, _timeout: Duration) -> Result<CommandOutput> {
                Ok(CommandOutput {
                    exit_code: 0,
                    output: String::new(),
                })
            }
        }

        struct NoopVcs;
        #[async_trait]
        impl VcsTool for NoopVcs {
            async fn stash_save(&self) -> Result<bool> {
                Ok(false)
            }
            async fn stash_pop(&self) -> Result<()> {
                Ok(())
            }
            async fn stash_drop(&self) -> Result<()> {
                Ok(())
            }
            async fn create_branch(&self, _name: &str, _base: &str) -> Result<()> {
                Ok(())
            }
            async fn stage_all(&self) -> Result<()> {
                Ok(())
            }
            async fn commit(&self, _message: &str) -> Result<String> {
                Ok("sha".to_string())
            }
            async fn push(&self, _branch: &str) -> Result<()> {
                Ok(())
            }
            async fn create_pull_request(
                &self,
                _branch: &str,
                _title: &str,
                _body: &str,
                _base: &str,
                _draft: bool,
            ) -> Result<PullRequest> {
                Ok(PullRequest {
                    url: "https://example.com/pr/1".to_string(),
                    number: 1,
                })
            }
        }

        struct NoopModerator;
        #[async_trait]
        impl Moderator for NoopModerator {
            async fn ask_plan_approval(&self, _plan: &serde_json::Value) -> Result<PlanDecision> {
                Ok(PlanDecision::Yes)
            }
            async fn request_debugging_guidance(
                &self,
                _group: &str,
                _attempt: u32,
                _failing_step: &str,
            ) -> Result<Option<String>> {
                Ok(None)
            }
            async fn ask_proceed_with_current_plan(&self) -> Result<bool> {
                Ok(true)
            }
        }

        struct NoopContext;
        #[async_trait]
        impl ContextProvider for NoopContext {
            async fn tech_stack(&self) -> Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
            async fn project_structure(&self) -> Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
            async fn dependencies(&self) -> Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
            async fn focused_context(&self, _keywords: &[String]) -> Result<serde_json::Value> {
                Ok(serde_json::json!({}))
            }
        }

        let file_tool: Arc<dyn FileTool> = Arc::new(NoopFileTool);
        let bash_tool: Arc<dyn BashTool> = Arc::new(NoopBashTool);

        Orchestrator::new(
            "task-1",
            OrchestratorDeps {
                bus,
                store: StateStore::new(base_dir),
                planner: Arc::new(NoopPlanner),
                code_generator: Arc::new(NoopGenerator),
                applicator: ChangeApplicator::new(file_tool, bash_tool.clone()),
                validation: ValidationPipeline::new(
                    bash_tool,
                    crate::validation::ValidationConfig::default(),
                ),
                vcs: Arc::new(NoopVcs),
                moderator: Arc::new(NoopModerator),
                context: Arc::new(NoopContext),
            },
        )
    }

    #[tokio::test]
    async fn full_run_completes_and_records_pr_snapshot() {
        let bus = Arc::new(MessageBus::new());
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = test_orchestrator(bus, dir.path());

        orchestrator.run("build a thing").await.unwrap();
        assert!(matches!(orchestrator.status().await, WorkflowState::Completed));

        let snapshot = orchestrator.store.load("task-1", Phase::PrCreation).unwrap();
        let pr_state = snapshot.pr_creation_state().unwrap();
        assert!(pr_state.is_created);
        assert_eq!(pr_state.pr_url.as_deref(), Some("https://example.com/pr/1"));
    }

    #[tokio::test]
    async fn resume_from_pr_creation_push_skips_branch_and_commit() {
        let bus = Arc::new(MessageBus::new());
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = test_orchestrator(bus, dir.path());

        orchestrator
            .store
            .save(
                &Snapshot::new(
                    "task-1",
                    Phase::PromptApproval,
                    PromptApprovalState {
                        plan: serde_json::json!({"title": "Do thing"}),
                        is_approved: true,
                        ..Default::default()
                    },
                )
                .unwrap(),
            )
            .unwrap();

        let point = ResumePoint::PrCreation {
            state: Box::new(PrCreationState {
                branch_name: "orchestrator/task-1".to_string(),
                commit_sha: Some("abc123".to_string()),
                sub_state: Some("pushing".to_string()),
                ..Default::default()
            }),
            point: PrResumePoint::Push,
        };

        orchestrator.resume(point).await.unwrap();
        assert!(matches!(orchestrator.status().await, WorkflowState::Completed));

        let snapshot = orchestrator.store.load("task-1", Phase::PrCreation).unwrap();
        let pr_state = snapshot.pr_creation_state().unwrap();
        assert!(pr_state.is_created);
        assert_eq!(pr_state.branch_name, "orchestrator/task-1");
    }

    #[tokio::test]
    async fn resume_from_pr_creation_already_created_reports_url_without_recreating() {
        use crate::message::MessageKind;

        let bus = Arc::new(MessageBus::new());
        let reported = Arc::new(std::sync::Mutex::new(Vec::new()));
        let reported_clone = reported.clone();
        bus.register_handler(MessageKind::TerminalOutput, move |msg| {
            if let MessageContent::TerminalOutput { text } = &msg.content {
                reported_clone.lock().unwrap().push(text.clone());
            }
        });

        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = test_orchestrator(bus, dir.path());

        let point = ResumePoint::PrCreation {
            state: Box::new(PrCreationState {
                branch_name: "orchestrator/task-1".to_string(),
                commit_sha: Some("abc123".to_string()),
                pr_url: Some("https://example.com/pr/1".to_string()),
                is_created: true,
                sub_state: Some("creating_api_request".to_string()),
                ..Default::default()
            }),
            point: PrResumePoint::AlreadyCreated {
                pr_url: "https://example.com/pr/1".to_string(),
            },
        };

        orchestrator.resume(point).await.unwrap();
        assert!(matches!(orchestrator.status().await, WorkflowState::Completed));
        assert_eq!(reported.lock().unwrap().len(), 1);
        assert!(reported.lock().unwrap()[0].contains("https://example.com/pr/1"));
    }

    #[tokio::test]
    async fn resume_from_execution_applies_only_pending_paths() {
        let bus = Arc::new(MessageBus::new());
        let dir = tempfile::TempDir::new().unwrap();
        let orchestrator = test_orchestrator(bus, dir.path());

        orchestrator
            .store
            .save(
                &Snapshot::new(
                    "task-1",
                    Phase::Planning,
                    PlanningState {
                        request_text: "build a thing".to_string(),
                        tech_stack: serde_json::json!({"lang": "python"}),
                        ..Default::default()
                    },
                )
                .unwrap(),
            )
            .unwrap();
        orchestrator
            .store
            .save(
                &Snapshot::new(
                    "task-1",
                    Phase::PromptApproval,
                    PromptApprovalState {
                        plan: serde_json::json!({"title": "Do thing"}),
                        is_approved: true,
                        ..Default::default()
                    },
                )
                .unwrap(),
            )
            .unwrap();

        let point = ResumePoint::Execution {
            state: Box::new(ExecutionState::default()),
            point: ExecutionResumePoint::ApplyChanges {
                pending: vec![],
            },
        };

        orchestrator.resume(point).await.unwrap();
        assert!(matches!(orchestrator.status().await, WorkflowState::Completed));
    }
}
