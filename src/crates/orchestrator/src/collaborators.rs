//! Narrow capability interfaces for the collaborators the orchestrator core
//! consumes but does not implement (SPEC_FULL.md §6): the planner/generator
//! pair, the file/bash/git tool wrappers, the moderator that turns approval
//! requests into a human decision, and the context provider. Grounded on
//! `agent_s3.coordinator.orchestrator.Orchestrator`'s duck-typed
//! `self.registry.get_tool(...)` lookups and `agent_s3.pre_planner_json_enforced
//! .call_pre_planner_with_enforced_json`, translated into explicit
//! dependency-injected traits per SPEC_FULL.md §9 ("duck-typed tools ->
//! explicit capability interfaces").
//!
//! Every method here is fallible and async: the orchestrator FSM (`crate::fsm`)
//! treats every call as a suspension point and a candidate for retry.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Produces an initial structured plan from a task description, and can
/// regenerate a plan given free-form modification text. The two operations
/// are kept on one trait because the FSM's planning phase (§4.5.1) always
/// holds both a planner and the concrete plan it returned.
#[async_trait]
pub trait Planner: Send + Sync {
    async fn plan(&self, task: &str, context: &serde_json::Value) -> Result<serde_json::Value>;
    async fn regenerate(
        &self,
        plan: &serde_json::Value,
        modification: &str,
    ) -> Result<serde_json::Value>;
}

/// Produces file contents from an approved plan and a tech-stack
/// description. Returns a `path -> content` map, the exact shape the Change
/// Applicator (`crate::applicator`) consumes.
#[async_trait]
pub trait CodeGenerator: Send + Sync {
    async fn generate(
        &self,
        plan: &serde_json::Value,
        tech_stack: &serde_json::Value,
    ) -> Result<HashMap<String, String>>;
}

/// Path-safety-constrained filesystem access, used by the Change
/// Applicator. A real implementation restricts `path` to the project root;
/// this trait does not encode that constraint itself (§6: "path-safety
/// constraints" are the collaborator's responsibility, not the core's).
#[async_trait]
pub trait FileTool: Send + Sync {
    async fn read(&self, path: &str) -> Result<String>;
    async fn write(&self, path: &str, content: &str) -> Result<()>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Result of a single bash invocation: exit code plus combined stdout+stderr.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait BashTool: Send + Sync {
    async fn run(&self, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// Version-control operations the PR-creation phase drives. Grounded on
/// `agent_s3.coordinator.orchestrator`'s `git_tool.run_git_command` call
/// sites (`stash`, `stash pop --index`, `stash drop`) plus the
/// `_create_pr_branch`/`_stage_pr_changes`/`_commit_pr_changes`/
/// `_push_pr_branch`/`_submit_pr` sequence used by the PR sub-state table.
#[async_trait]
pub trait VcsTool: Send + Sync {
    async fn stash_save(&self) -> Result<bool>;
    async fn stash_pop(&self) -> Result<()>;
    async fn stash_drop(&self) -> Result<()>;
    async fn create_branch(&self, name: &str, base: &str) -> Result<()>;
    async fn stage_all(&self) -> Result<()>;
    async fn commit(&self, message: &str) -> Result<String>;
    async fn push(&self, branch: &str) -> Result<()>;
    async fn create_pull_request(
        &self,
        branch: &str,
        title: &str,
        body: &str,
        base: &str,
        draft: bool,
    ) -> Result<PullRequest>;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PullRequest {
    pub url: String,
    pub number: u64,
}

/// A human or human-surrogate decision point. The FSM calls this exactly at
/// the points SPEC_FULL.md §4.5 names: plan approval (ternary yes/modify/no),
/// debugging guidance after a validation failure, and plan-exhaustion
/// fallback. Grounded on `agent_s3.coordinator.orchestrator`'s
/// `prompt_moderator.request_debugging_guidance` and the ternary plan
/// approval flow surfaced as an `interactive_approval` message (§6).
#[async_trait]
pub trait Moderator: Send + Sync {
    /// Planning approval: `yes` (proceed), `modify` (with accompanying text),
    /// or `no` (stop the run).
    async fn ask_plan_approval(&self, plan: &serde_json::Value) -> Result<PlanDecision>;

    /// Asked after a validation failure inside the implementation loop.
    /// `Some(text)` requests a re-plan with that guidance; `None` aborts the
    /// current plan attempt.
    async fn request_debugging_guidance(
        &self,
        group_name: &str,
        attempt: u32,
        failing_step: &str,
    ) -> Result<Option<String>>;

    /// Asked when plan-modification iterations are exhausted (§4.5 "Retry
    /// and tie-breaks"): proceed with the current plan, or give up.
    async fn ask_proceed_with_current_plan(&self) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    Yes,
    Modify(String),
    No,
}

/// Typed snapshot queries over the surrounding project, used to seed the
/// planning phase's context. Grounded on `agent_s3`'s `context_manager`
/// family of `tech_stack()`/`project_structure()` accessors, narrowed to the
/// four queries the orchestrator core actually consumes.
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn tech_stack(&self) -> Result<serde_json::Value>;
    async fn project_structure(&self) -> Result<serde_json::Value>;
    async fn dependencies(&self) -> Result<serde_json::Value>;
    async fn focused_context(&self, keywords: &[String]) -> Result<serde_json::Value>;
}
