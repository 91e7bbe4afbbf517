//! Multi-phase workflow orchestration engine with durable resumption and
//! realtime streaming.
//!
//! This crate implements the four tightly coupled subsystems a multi-phase,
//! LLM-driven software-engineering workflow needs: a message bus and
//! WebSocket fan-out server (`message`, `server`), durable per-phase task
//! state with crash recovery (`state`, `resumer`), a phase state machine
//! with external pause/resume/stop control (`fsm`), and the
//! validate/apply-dependency pipeline that gates each implementation
//! attempt (`applicator`, `validation`). The LLM client, planner, code
//! generator, and file/bash/git tool wrappers are deliberately out of
//! scope here; the orchestrator consumes them through the narrow
//! interfaces in `collaborators`.

pub mod applicator;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod fsm;
pub mod message;
pub mod resumer;
pub mod server;
pub mod state;
pub mod validation;
pub mod version;

pub use error::{AppError, ErrorCategory, ErrorContext, Result};
pub use fsm::{Orchestrator, OrchestratorDeps, WorkflowState};
pub use message::{Message, MessageBus, MessageContent, MessageKind, MessageQueue};
pub use resumer::Resumer;
pub use server::{ServerConfig, StreamingServer};
pub use state::{Phase, Snapshot, StateStore};
pub use validation::{FailingStep, ValidationConfig, ValidationPipeline, ValidationResult};
pub use version::VERSION;
