//! Durable, versioned, per-phase task-state snapshots.
//!
//! Grounded on `task_state_manager.py`'s atomic snapshot writer (write to a
//! `.tmp` sibling, chmod owner-only, then `rename` over the target) and its
//! three-step corruption-recovery cascade: scan the raw bytes for the first
//! parseable suffix, fall back to the newest `{phase}_*.json` backup, fall
//! back to the previous phase's snapshot. Layout is one directory per task
//! under a configurable base directory, one JSON file per phase.

use crate::error::{AppError, ErrorCategory, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

pub const CURRENT_VERSION: u32 = 1;

/// A field-wise upgrade from the payload shape of one `state_version` to
/// the next, applied to `Snapshot::data` only; the envelope fields
/// (`task_id`, `phase`, timestamps) never change shape across versions.
type MigrationFn = fn(serde_json::Value) -> serde_json::Value;

/// `migrations[v]` upgrades a snapshot from version `v` to `v + 1`.
/// Registered here as each `CURRENT_VERSION` bump ships its own payload
/// migration; empty today since `CURRENT_VERSION` has never moved past its
/// initial value of 1 (SPEC_FULL.md §9 Open Question 3).
fn migrations() -> HashMap<u32, MigrationFn> {
    HashMap::new()
}

const PHASE_ORDER: [&str; 6] = [
    "planning",
    "prompt_approval",
    "issue_creation",
    "code_generation",
    "execution",
    "pr_creation",
];

/// The six fixed workflow phases a task snapshot can be in, in their
/// canonical execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    PromptApproval,
    IssueCreation,
    CodeGeneration,
    Execution,
    PrCreation,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Planning => "planning",
            Phase::PromptApproval => "prompt_approval",
            Phase::IssueCreation => "issue_creation",
            Phase::CodeGeneration => "code_generation",
            Phase::Execution => "execution",
            Phase::PrCreation => "pr_creation",
        }
    }

    pub fn from_str(s: &str) -> Option<Phase> {
        match s {
            "planning" => Some(Phase::Planning),
            "prompt_approval" => Some(Phase::PromptApproval),
            "issue_creation" => Some(Phase::IssueCreation),
            "code_generation" => Some(Phase::CodeGeneration),
            "execution" => Some(Phase::Execution),
            "pr_creation" => Some(Phase::PrCreation),
            _ => None,
        }
    }

    fn index(&self) -> usize {
        PHASE_ORDER
            .iter()
            .position(|p| *p == self.as_str())
            .expect("every Phase variant maps to a PHASE_ORDER entry")
    }

    /// The phase immediately preceding this one, or `None` for `Planning`.
    pub fn previous(&self) -> Option<Phase> {
        let idx = self.index();
        (idx > 0).then(|| Phase::from_str(PHASE_ORDER[idx - 1]).unwrap())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlanningState {
    #[serde(default)]
    pub request_text: String,
    #[serde(default)]
    pub code_context: serde_json::Value,
    #[serde(default)]
    pub tech_stack: serde_json::Value,
    #[serde(default)]
    pub plan: serde_json::Value,
    #[serde(default)]
    pub discussion: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PromptApprovalState {
    #[serde(default)]
    pub plan: serde_json::Value,
    #[serde(default)]
    pub discussion: String,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(default)]
    pub user_modifications: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IssueCreationState {
    #[serde(default)]
    pub is_created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CodeGenerationState {
    #[serde(default)]
    pub plan: serde_json::Value,
    #[serde(default)]
    pub generated_changes: Vec<serde_json::Value>,
    #[serde(default)]
    pub current_iteration: u32,
}

/// Sub-states within `execution`, used by the resumer to pick a resume
/// point rather than restarting the phase from scratch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutionState {
    #[serde(default)]
    pub changes: Vec<serde_json::Value>,
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub test_results: serde_json::Value,
    #[serde(default)]
    pub is_applied: bool,
    #[serde(default)]
    pub errors: Vec<serde_json::Value>,
    #[serde(default)]
    pub sub_state: Option<String>,
    #[serde(default)]
    pub raw_test_output: Option<String>,
    #[serde(default)]
    pub pending_changes: Vec<serde_json::Value>,
    #[serde(default)]
    pub applied_changes: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PrCreationState {
    #[serde(default)]
    pub branch_name: String,
    #[serde(default)]
    pub pr_title: String,
    #[serde(default)]
    pub pr_body: String,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub is_created: bool,
    #[serde(default)]
    pub sub_state: Option<String>,
    #[serde(default)]
    pub commit_sha: Option<String>,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub api_response: Option<serde_json::Value>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

/// A durable record of one task's progress through one phase. `data` holds
/// the phase-specific payload as JSON; typed accessors below deserialize it
/// on demand rather than requiring a tagged-enum variant per phase, so
/// adding fields to a phase payload never touches the envelope shape.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub version: u32,
    pub task_id: String,
    pub phase: Phase,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Snapshot {
    pub fn new(task_id: impl Into<String>, phase: Phase, data: impl Serialize) -> Result<Self> {
        let now = Utc::now();
        Ok(Self {
            version: CURRENT_VERSION,
            task_id: task_id.into(),
            phase,
            created_at: now,
            updated_at: now,
            data: serde_json::to_value(data).map_err(AppError::from)?,
        })
    }

    pub fn touch(mut self) -> Self {
        self.updated_at = Utc::now();
        self
    }

    pub fn planning_state(&self) -> Result<PlanningState> {
        serde_json::from_value(self.data.clone()).map_err(AppError::from)
    }

    pub fn prompt_approval_state(&self) -> Result<PromptApprovalState> {
        serde_json::from_value(self.data.clone()).map_err(AppError::from)
    }

    pub fn issue_creation_state(&self) -> Result<IssueCreationState> {
        serde_json::from_value(self.data.clone()).map_err(AppError::from)
    }

    pub fn code_generation_state(&self) -> Result<CodeGenerationState> {
        serde_json::from_value(self.data.clone()).map_err(AppError::from)
    }

    pub fn execution_state(&self) -> Result<ExecutionState> {
        serde_json::from_value(self.data.clone()).map_err(AppError::from)
    }

    pub fn pr_creation_state(&self) -> Result<PrCreationState> {
        serde_json::from_value(self.data.clone()).map_err(AppError::from)
    }
}

/// Snapshot store rooted at `base_dir`, one subdirectory per task.
pub struct StateStore {
    base_dir: PathBuf,
    max_age: Duration,
}

impl StateStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_age: Duration::from_secs(7 * 24 * 3600),
        }
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base_dir.join(task_id)
    }

    fn snapshot_path(&self, task_id: &str, phase: Phase) -> PathBuf {
        self.task_dir(task_id).join(format!("{}.json", phase.as_str()))
    }

    /// Write `snapshot` atomically: serialize to a `.tmp` sibling, restrict
    /// its permissions to owner read/write, then `rename` it over the
    /// target so a reader never observes a partially written file.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.task_dir(&snapshot.task_id);
        std::fs::create_dir_all(&dir).map_err(AppError::from)?;

        let target = self.snapshot_path(&snapshot.task_id, snapshot.phase);
        let tmp = target.with_extension("json.tmp");

        let body = serde_json::to_vec_pretty(snapshot).map_err(AppError::from)?;
        std::fs::write(&tmp, &body).map_err(AppError::from)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .map_err(AppError::from)?;
        }

        std::fs::rename(&tmp, &target).map_err(AppError::from)?;
        debug!(task_id = %snapshot.task_id, phase = snapshot.phase.as_str(), "snapshot saved");
        Ok(())
    }

    /// Load a task's snapshot for `phase`. On a JSON parse failure, runs
    /// the corruption-recovery cascade and re-persists whatever it
    /// recovers as a clean snapshot before returning it.
    pub fn load(&self, task_id: &str, phase: Phase) -> Result<Snapshot> {
        let path = self.snapshot_path(task_id, phase);
        let raw = std::fs::read_to_string(&path).map_err(AppError::from)?;

        match serde_json::from_str::<Snapshot>(&raw) {
            Ok(snapshot) => {
                let snapshot = self.upgrade_to_current(snapshot)?;
                self.verify_identity(&snapshot, task_id, phase)?;
                Ok(snapshot)
            }
            Err(e) => {
                warn!(task_id, phase = phase.as_str(), error = %e, "snapshot parse failed, attempting recovery");
                self.recover(task_id, phase, &raw)
            }
        }
    }

    /// Bring a just-parsed snapshot up to [`CURRENT_VERSION`], applying
    /// each registered migration to `data` in turn. A version newer than
    /// `CURRENT_VERSION`, or an older version with no migration path to
    /// it, fails with `incompatible_version` (SPEC_FULL.md §4.3 Load).
    fn upgrade_to_current(&self, mut snapshot: Snapshot) -> Result<Snapshot> {
        if snapshot.version > CURRENT_VERSION {
            return Err(AppError::new(
                ErrorCategory::Validation,
                "state_store",
                format!(
                    "incompatible_version: snapshot version {} newer than supported {CURRENT_VERSION}",
                    snapshot.version
                ),
            ));
        }

        let table = migrations();
        while snapshot.version < CURRENT_VERSION {
            let migrate = table.get(&snapshot.version).ok_or_else(|| {
                AppError::new(
                    ErrorCategory::Validation,
                    "state_store",
                    format!(
                        "incompatible_version: no migration registered from version {} toward {CURRENT_VERSION}",
                        snapshot.version
                    ),
                )
            })?;
            snapshot.data = migrate(snapshot.data);
            snapshot.version += 1;
            debug!(
                task_id = %snapshot.task_id,
                phase = snapshot.phase.as_str(),
                to_version = snapshot.version,
                "snapshot migrated"
            );
        }
        Ok(snapshot)
    }

    fn verify_identity(&self, snapshot: &Snapshot, task_id: &str, phase: Phase) -> Result<()> {
        if snapshot.task_id != task_id || snapshot.phase != phase {
            return Err(AppError::new(
                ErrorCategory::Validation,
                "state_store",
                format!(
                    "snapshot identity mismatch: expected {task_id}/{}, found {}/{}",
                    phase.as_str(),
                    snapshot.task_id,
                    snapshot.phase.as_str()
                ),
            ));
        }
        Ok(())
    }

    fn recover(&self, task_id: &str, phase: Phase, raw: &str) -> Result<Snapshot> {
        if let Some(snapshot) = Self::scan_for_valid_suffix(raw, task_id, phase) {
            warn!(task_id, phase = phase.as_str(), "recovered snapshot from valid suffix scan");
            let snapshot = self.upgrade_to_current(snapshot)?;
            self.save(&snapshot)?;
            return Ok(snapshot);
        }

        if let Some(snapshot) = self.newest_backup(task_id, phase)? {
            warn!(task_id, phase = phase.as_str(), "recovered snapshot from newest backup");
            let snapshot = self.upgrade_to_current(snapshot)?;
            self.save(&snapshot)?;
            return Ok(snapshot);
        }

        if let Some(previous) = phase.previous() {
            if let Ok(snapshot) = self.load(task_id, previous) {
                warn!(task_id, phase = phase.as_str(), fallback_phase = previous.as_str(), "falling back to previous phase's snapshot");
                return Ok(snapshot);
            }
        }

        warn!(task_id, phase = phase.as_str(), "snapshot recovery exhausted all fallbacks");
        Err(AppError::new(
            ErrorCategory::Validation,
            "state_store",
            format!("unable to recover snapshot for {task_id}/{}", phase.as_str()),
        ))
    }

    /// Walk every byte offset of a corrupted file looking for the first
    /// position whose remaining substring parses as a `Snapshot` matching
    /// the expected identity. Handles truncation/prepended garbage from a
    /// partial write that slipped past the atomic-rename guard (e.g. a
    /// concurrent process appending to the same inode out of band).
    fn scan_for_valid_suffix(raw: &str, task_id: &str, phase: Phase) -> Option<Snapshot> {
        for start in 0..raw.len() {
            if !raw.is_char_boundary(start) {
                continue;
            }
            let candidate = &raw[start..];
            if let Ok(snapshot) = serde_json::from_str::<Snapshot>(candidate) {
                if snapshot.task_id == task_id && snapshot.phase == phase {
                    return Some(snapshot);
                }
            }
        }
        None
    }

    fn newest_backup(&self, task_id: &str, phase: Phase) -> Result<Option<Snapshot>> {
        let dir = self.task_dir(task_id);
        let prefix = format!("{}_", phase.as_str());

        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };

        let mut backups: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.starts_with(&prefix) && name.ends_with(".json") {
                if let Ok(meta) = entry.metadata() {
                    if let Ok(modified) = meta.modified() {
                        backups.push((modified, path));
                    }
                }
            }
        }
        backups.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, path) in backups {
            if let Ok(raw) = std::fs::read_to_string(&path) {
                if let Ok(snapshot) = serde_json::from_str::<Snapshot>(&raw) {
                    if snapshot.task_id == task_id && snapshot.phase == phase {
                        return Ok(Some(snapshot));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Task ids with at least one snapshot, newest-modified first.
    pub fn list_active_tasks(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::from(e)),
        };

        let mut tasks: Vec<(SystemTime, String)> = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(task_id) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            tasks.push((Self::latest_mtime(&path)?, task_id.to_string()));
        }

        tasks.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(tasks.into_iter().map(|(_, id)| id).collect())
    }

    fn latest_mtime(dir: &Path) -> Result<SystemTime> {
        let mut latest = SystemTime::UNIX_EPOCH;
        for entry in std::fs::read_dir(dir).map_err(AppError::from)?.flatten() {
            if let Ok(meta) = entry.metadata() {
                if let Ok(modified) = meta.modified() {
                    latest = latest.max(modified);
                }
            }
        }
        Ok(latest)
    }

    pub fn delete_task(&self, task_id: &str) -> Result<()> {
        match std::fs::remove_dir_all(self.task_dir(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::from(e)),
        }
    }

    pub fn clear_state(&self, task_id: &str, phase: Phase) -> Result<()> {
        match std::fs::remove_file(self.snapshot_path(task_id, phase)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::from(e)),
        }
    }

    /// Delete every task directory whose most recent snapshot predates
    /// `max_age`. Call on startup; returns the number of tasks evicted.
    pub fn evict_aged(&self) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AppError::from(e)),
        };

        let mut evicted = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if Self::latest_mtime(&path)? < cutoff {
                debug!(path = %path.display(), "evicting aged task directory");
                std::fs::remove_dir_all(&path).map_err(AppError::from)?;
                evicted += 1;
            }
        }
        Ok(evicted)
    }
}
