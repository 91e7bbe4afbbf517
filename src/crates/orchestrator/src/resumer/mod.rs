//! Resumes an interrupted task from its most recent durable snapshot
//! (SPEC_FULL.md §4.4), without redoing side effects a prior run already
//! completed.
//!
//! Grounded on `agent_s3.task_resumer.TaskResumer`: `list_interrupted_tasks`
//! (newest first, excluding tasks whose last recorded phase is a completed
//! `pr_creation`), a phase-dispatch table mapping each [`Phase`] to a
//! resume handler, and sub-state-aware resumption for `execution` and
//! `pr_creation` — the two phases whose sub-states correspond to
//! irreversible or expensive side effects (applying a change batch,
//! pushing a branch) that must not be redone just because the process
//! restarted mid-phase.

use crate::state::{
    ExecutionState, Phase, PrCreationState, Snapshot, StateStore,
};
use crate::error::Result;
use tracing::info;

/// One task this process found mid-flight on startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterruptedTask {
    pub task_id: String,
    pub phase: Phase,
}

/// Sub-points inside `execution` the resumer can resume into, mirroring the
/// orchestrator's own sub-phase tracking (SPEC_FULL.md §4.5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResumePoint {
    /// Apply `pending` (already-narrowed to not-yet-applied entries), then
    /// move on to running tests.
    ApplyChanges { pending: Vec<serde_json::Value> },
    /// Changes are fully applied; (re-)run the test suite.
    RunTests,
    /// Tests already ran; (re-)analyze their results.
    AnalyzeResults,
}

/// Sub-points inside `pr_creation`, mirroring
/// `_resume_create_branch`/`_resume_commit_changes`/`_resume_push_branch`/
/// `_resume_create_pull_request` in the original task resumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrResumePoint {
    CreateBranch,
    /// A commit was already made (`commit_sha` recorded); skip straight to
    /// pushing instead of committing again.
    Push,
    Commit,
    CreatePullRequest,
    /// `pr_url` was already recorded: nothing left to do.
    AlreadyCreated { pr_url: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResumePoint {
    Planning(Box<crate::state::PlanningState>),
    PromptApproval(Box<crate::state::PromptApprovalState>),
    IssueCreation(Box<crate::state::IssueCreationState>),
    CodeGeneration(Box<crate::state::CodeGenerationState>),
    Execution {
        state: Box<ExecutionState>,
        point: ExecutionResumePoint,
    },
    PrCreation {
        state: Box<PrCreationState>,
        point: PrResumePoint,
    },
}

pub struct Resumer {
    store: StateStore,
}

impl Resumer {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Tasks with at least one snapshot whose most advanced recorded phase
    /// is not a completed `pr_creation`, newest-modified first.
    pub fn list_interrupted(&self) -> Result<Vec<InterruptedTask>> {
        let mut interrupted = Vec::new();
        for task_id in self.store.list_active_tasks()? {
            if let Some(snapshot) = self.latest_snapshot(&task_id)? {
                if self.is_complete(&snapshot)? {
                    continue;
                }
                interrupted.push(InterruptedTask {
                    task_id,
                    phase: snapshot.phase,
                });
            }
        }
        info!(count = interrupted.len(), "scanned for interrupted tasks");
        Ok(interrupted)
    }

    /// Resume every interrupted task found by [`Self::list_interrupted`].
    pub fn auto_resume(&self) -> Result<Vec<(String, ResumePoint)>> {
        let mut resumed = Vec::new();
        for task in self.list_interrupted()? {
            info!(task_id = %task.task_id, phase = task.phase.as_str(), "auto-resuming interrupted task");
            let point = self.resume(&task.task_id, task.phase)?;
            resumed.push((task.task_id, point));
        }
        Ok(resumed)
    }

    /// Compute the resume point for one task at `phase`, without executing
    /// any side effect — callers (the workflow FSM) drive actual
    /// replanning/re-application from the returned point.
    pub fn resume(&self, task_id: &str, phase: Phase) -> Result<ResumePoint> {
        let snapshot = self.store.load(task_id, phase)?;
        match phase {
            Phase::Planning => Ok(ResumePoint::Planning(Box::new(snapshot.planning_state()?))),
            Phase::PromptApproval => Ok(ResumePoint::PromptApproval(Box::new(
                snapshot.prompt_approval_state()?,
            ))),
            Phase::IssueCreation => Ok(ResumePoint::IssueCreation(Box::new(
                snapshot.issue_creation_state()?,
            ))),
            Phase::CodeGeneration => Ok(ResumePoint::CodeGeneration(Box::new(
                snapshot.code_generation_state()?,
            ))),
            Phase::Execution => {
                let state = snapshot.execution_state()?;
                let point = resume_execution(&state);
                Ok(ResumePoint::Execution {
                    state: Box::new(state),
                    point,
                })
            }
            Phase::PrCreation => {
                let state = snapshot.pr_creation_state()?;
                let point = resume_pr_creation(&state);
                Ok(ResumePoint::PrCreation {
                    state: Box::new(state),
                    point,
                })
            }
        }
    }

    fn latest_snapshot(&self, task_id: &str) -> Result<Option<Snapshot>> {
        for phase in [
            Phase::PrCreation,
            Phase::Execution,
            Phase::CodeGeneration,
            Phase::IssueCreation,
            Phase::PromptApproval,
            Phase::Planning,
        ] {
            if let Ok(snapshot) = self.store.load(task_id, phase) {
                return Ok(Some(snapshot));
            }
        }
        Ok(None)
    }

    fn is_complete(&self, snapshot: &Snapshot) -> Result<bool> {
        if snapshot.phase != Phase::PrCreation {
            return Ok(false);
        }
        Ok(snapshot.pr_creation_state()?.is_created)
    }
}

/// Decide where in `execution` to resume, narrowing `changes` down to the
/// entries not yet applied so the applicator never redoes completed writes.
fn resume_execution(state: &ExecutionState) -> ExecutionResumePoint {
    match state.sub_state.as_deref() {
        Some("running_tests") => ExecutionResumePoint::RunTests,
        Some("analyzing_results") => ExecutionResumePoint::AnalyzeResults,
        Some("applying_changes") => {
            let pending = if !state.pending_changes.is_empty() {
                state.pending_changes.clone()
            } else {
                state
                    .changes
                    .iter()
                    .filter(|c| !state.applied_changes.contains(c))
                    .cloned()
                    .collect()
            };
            if pending.is_empty() {
                ExecutionResumePoint::RunTests
            } else {
                ExecutionResumePoint::ApplyChanges { pending }
            }
        }
        _ => ExecutionResumePoint::ApplyChanges {
            pending: state.changes.clone(),
        },
    }
}

/// Decide where in `pr_creation` to resume, skipping any step whose
/// recorded output proves it already ran (a commit sha, a PR url).
fn resume_pr_creation(state: &PrCreationState) -> PrResumePoint {
    if let Some(pr_url) = &state.pr_url {
        if state.is_created {
            return PrResumePoint::AlreadyCreated {
                pr_url: pr_url.clone(),
            };
        }
    }

    match state.sub_state.as_deref() {
        Some("creating_api_request") => PrResumePoint::CreatePullRequest,
        Some("pushing") => PrResumePoint::Push,
        Some("committing") => {
            if state.commit_sha.is_some() {
                PrResumePoint::Push
            } else {
                PrResumePoint::Commit
            }
        }
        Some("creating_branch") => PrResumePoint::CreateBranch,
        _ => PrResumePoint::CreateBranch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::PlanningState;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, StateStore) {
        let dir = TempDir::new().unwrap();
        (dir, StateStore::new(dir.path()))
    }

    #[test]
    fn execution_resumes_applying_only_pending_changes() {
        let (_dir, store) = store();
        let state = ExecutionState {
            changes: vec![json!("A"), json!("B"), json!("C")],
            applied_changes: vec![json!("A")],
            pending_changes: vec![json!("B"), json!("C")],
            sub_state: Some("applying_changes".to_string()),
            ..Default::default()
        };
        store
            .save(&Snapshot::new("task-1", Phase::Execution, state).unwrap())
            .unwrap();

        let resumer = Resumer::new(store);
        let point = resumer.resume("task-1", Phase::Execution).unwrap();

        match point {
            ResumePoint::Execution { point, .. } => assert_eq!(
                point,
                ExecutionResumePoint::ApplyChanges {
                    pending: vec![json!("B"), json!("C")]
                }
            ),
            other => panic!("unexpected resume point: {other:?}"),
        }
    }

    #[test]
    fn execution_resumes_at_running_tests_when_all_applied() {
        let (_dir, store) = store();
        let state = ExecutionState {
            changes: vec![json!("A")],
            applied_changes: vec![json!("A")],
            sub_state: Some("running_tests".to_string()),
            ..Default::default()
        };
        store
            .save(&Snapshot::new("task-1", Phase::Execution, state).unwrap())
            .unwrap();

        let resumer = Resumer::new(store);
        let point = resumer.resume("task-1", Phase::Execution).unwrap();
        match point {
            ResumePoint::Execution { point, .. } => {
                assert_eq!(point, ExecutionResumePoint::RunTests)
            }
            other => panic!("unexpected resume point: {other:?}"),
        }
    }

    #[test]
    fn pr_creation_skips_commit_when_sha_already_recorded() {
        let (_dir, store) = store();
        let state = PrCreationState {
            sub_state: Some("committing".to_string()),
            commit_sha: Some("abc123".to_string()),
            ..Default::default()
        };
        store
            .save(&Snapshot::new("task-1", Phase::PrCreation, state).unwrap())
            .unwrap();

        let resumer = Resumer::new(store);
        let point = resumer.resume("task-1", Phase::PrCreation).unwrap();
        match point {
            ResumePoint::PrCreation { point, .. } => assert_eq!(point, PrResumePoint::Push),
            other => panic!("unexpected resume point: {other:?}"),
        }
    }

    #[test]
    fn pr_creation_already_created_short_circuits() {
        let (_dir, store) = store();
        let state = PrCreationState {
            is_created: true,
            pr_url: Some("https://example.com/pr/1".to_string()),
            ..Default::default()
        };
        store
            .save(&Snapshot::new("task-1", Phase::PrCreation, state).unwrap())
            .unwrap();

        let resumer = Resumer::new(store);
        let point = resumer.resume("task-1", Phase::PrCreation).unwrap();
        match point {
            ResumePoint::PrCreation { point, .. } => assert_eq!(
                point,
                PrResumePoint::AlreadyCreated {
                    pr_url: "https://example.com/pr/1".to_string()
                }
            ),
            other => panic!("unexpected resume point: {other:?}"),
        }
    }

    #[test]
    fn list_interrupted_excludes_completed_pr_creation() {
        let (_dir, store) = store();
        store
            .save(&Snapshot::new("done", Phase::PrCreation, PrCreationState {
                is_created: true,
                pr_url: Some("https://example.com/pr/2".to_string()),
                ..Default::default()
            })
            .unwrap())
            .unwrap();
        store
            .save(&Snapshot::new("mid-flight", Phase::Planning, PlanningState::default()).unwrap())
            .unwrap();

        let resumer = Resumer::new(store);
        let interrupted = resumer.list_interrupted().unwrap();
        assert_eq!(interrupted.len(), 1);
        assert_eq!(interrupted[0].task_id, "mid-flight");
        assert_eq!(interrupted[0].phase, Phase::Planning);
    }
}
