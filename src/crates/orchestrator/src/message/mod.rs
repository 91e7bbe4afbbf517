//! Message envelope: a closed, per-kind-validated content enumeration.
//!
//! Generalizes `api::ws::events::RealtimeEvent`'s tagged-enum shape to the
//! full kind set and required-field schemas from `agent_s3.communication
//! .message_protocol.MessageType`. Construction enforces the per-kind schema
//! (SPEC_FULL.md §6's table) so an `invalid_message` is impossible to
//! construct; there is no separate validation pass.

pub mod bus;
pub mod queue;

use crate::error::{AppError, ErrorCategory};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use bus::MessageBus;
pub use queue::MessageQueue;

/// Content payload, one variant per wire kind. The `#[serde(tag = "type",
/// content = "content")]` representation matches the wire protocol in
/// SPEC_FULL.md §6 exactly: `{"type": "...", "content": {...}}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum MessageContent {
    TerminalOutput {
        text: String,
    },
    ApprovalRequest {
        text: String,
        options: Vec<String>,
        request_id: String,
    },
    DiffDisplay {
        text: String,
        files: Vec<String>,
        request_id: String,
    },
    InteractiveDiff {
        files: Vec<DiffFile>,
        summary: String,
        request_id: String,
    },
    InteractiveApproval {
        title: String,
        description: String,
        options: Vec<ApprovalOption>,
        request_id: String,
    },
    ProgressIndicator {
        title: String,
        percentage: f64,
    },
    ProgressResponse {
        action: ProgressAction,
    },
    WorkflowControl {
        action: WorkflowAction,
    },
    WorkflowStatus {
        status: String,
        #[serde(default)]
        phase: Option<String>,
        #[serde(default)]
        can_pause: bool,
        #[serde(default)]
        can_resume: bool,
        #[serde(default)]
        can_stop: bool,
    },
    Command {
        command: String,
    },
    CommandResult {
        success: bool,
        #[serde(default)]
        output: Option<String>,
    },
    StreamStart {
        stream_id: String,
    },
    StreamContent {
        stream_id: String,
        #[serde(default)]
        text: Option<String>,
    },
    StreamEnd {
        stream_id: String,
    },
    StreamInteractive {
        stream_id: String,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    LogOutput {
        text: String,
    },
    ErrorNotification {
        message: String,
    },
    Authenticate {
        token: String,
        #[serde(default)]
        resume_token: Option<String>,
    },
    ConnectionEstablished {
        client_id: String,
        #[serde(default)]
        resumed: bool,
    },
    Batch {
        messages: Vec<Message>,
    },
    Heartbeat {
        timestamp: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiffFile {
    pub filename: String,
    pub before: String,
    pub after: String,
    #[serde(default)]
    pub changes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalOption {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressAction {
    Cancel,
    Pause,
    Resume,
    Stop,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Pause,
    Resume,
    Stop,
    Cancel,
}

impl MessageContent {
    /// Validate structural invariants serde's derive can't express (e.g.
    /// non-empty required strings). Schema shape itself is enforced by the
    /// type system at deserialization time; this covers the residual
    /// "present but empty" cases SPEC_FULL.md §4.1 calls out.
    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            MessageContent::ApprovalRequest { request_id, .. }
            | MessageContent::DiffDisplay { request_id, .. }
            | MessageContent::InteractiveDiff { request_id, .. }
            | MessageContent::InteractiveApproval { request_id, .. } => {
                if request_id.is_empty() {
                    return Err("request_id must not be empty".to_string());
                }
                Ok(())
            }
            MessageContent::StreamStart { stream_id }
            | MessageContent::StreamContent { stream_id, .. }
            | MessageContent::StreamEnd { stream_id }
            | MessageContent::StreamInteractive { stream_id, .. } => {
                if stream_id.is_empty() {
                    return Err("stream_id must not be empty".to_string());
                }
                Ok(())
            }
            MessageContent::Authenticate { token, .. } => {
                if token.is_empty() {
                    return Err("token must not be empty".to_string());
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            MessageContent::TerminalOutput { .. } => MessageKind::TerminalOutput,
            MessageContent::ApprovalRequest { .. } => MessageKind::ApprovalRequest,
            MessageContent::DiffDisplay { .. } => MessageKind::DiffDisplay,
            MessageContent::InteractiveDiff { .. } => MessageKind::InteractiveDiff,
            MessageContent::InteractiveApproval { .. } => MessageKind::InteractiveApproval,
            MessageContent::ProgressIndicator { .. } => MessageKind::ProgressIndicator,
            MessageContent::ProgressResponse { .. } => MessageKind::ProgressResponse,
            MessageContent::WorkflowControl { .. } => MessageKind::WorkflowControl,
            MessageContent::WorkflowStatus { .. } => MessageKind::WorkflowStatus,
            MessageContent::Command { .. } => MessageKind::Command,
            MessageContent::CommandResult { .. } => MessageKind::CommandResult,
            MessageContent::StreamStart { .. } => MessageKind::StreamStart,
            MessageContent::StreamContent { .. } => MessageKind::StreamContent,
            MessageContent::StreamEnd { .. } => MessageKind::StreamEnd,
            MessageContent::StreamInteractive { .. } => MessageKind::StreamInteractive,
            MessageContent::LogOutput { .. } => MessageKind::LogOutput,
            MessageContent::ErrorNotification { .. } => MessageKind::ErrorNotification,
            MessageContent::Authenticate { .. } => MessageKind::Authenticate,
            MessageContent::ConnectionEstablished { .. } => MessageKind::ConnectionEstablished,
            MessageContent::Batch { .. } => MessageKind::Batch,
            MessageContent::Heartbeat { .. } => MessageKind::Heartbeat,
        }
    }
}

/// Kind discriminant, independent of content — used as the bus's
/// registration key so handlers can subscribe without constructing a dummy
/// content value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TerminalOutput,
    ApprovalRequest,
    DiffDisplay,
    InteractiveDiff,
    InteractiveApproval,
    ProgressIndicator,
    ProgressResponse,
    WorkflowControl,
    WorkflowStatus,
    Command,
    CommandResult,
    StreamStart,
    StreamContent,
    StreamEnd,
    StreamInteractive,
    LogOutput,
    ErrorNotification,
    Authenticate,
    ConnectionEstablished,
    Batch,
    Heartbeat,
}

/// Immutable message envelope. Construction is the only place validation
/// happens; once built, a `Message` cannot be mutated (SPEC_FULL.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: Uuid,
    #[serde(flatten)]
    pub content: MessageContent,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Construct a message, validating `content` against its kind's schema.
    /// Fails with an `ErrorCategory::Schema` error tagged `invalid_message`
    /// on violation, before any I/O occurs.
    pub fn construct(content: MessageContent) -> crate::error::Result<Self> {
        content.validate().map_err(|reason| {
            AppError::new(
                ErrorCategory::Schema,
                "message",
                format!("invalid_message: {reason}"),
            )
        })?;

        Ok(Self {
            id: Uuid::new_v4(),
            content,
            timestamp: Utc::now(),
        })
    }

    pub fn kind(&self) -> MessageKind {
        self.content.kind()
    }

    pub fn to_wire(&self) -> crate::error::Result<String> {
        serde_json::to_string(self).map_err(AppError::from)
    }

    pub fn from_wire(wire: &str) -> crate::error::Result<Self> {
        serde_json::from_str(wire).map_err(AppError::from)
    }
}
