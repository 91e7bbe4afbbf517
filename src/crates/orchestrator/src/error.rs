//! Error taxonomy and structured error context shared by every subsystem.
//!
//! Every fallible operation in the orchestrator tags its error with exactly
//! one [`ErrorCategory`] and carries a structured [`ErrorContext`] record.
//! This sits atop `tooling::error::context`'s chain-formatting helpers rather
//! than replacing them: `ErrorContext` here is the rich, Agent-side record;
//! `tooling::error::ContextError` remains the generic "wrap any error with a
//! message" type used for plumbing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Closed enumeration of error categories. Every propagated error is tagged
/// with exactly one of these; the set is never extended ad hoc.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Syntax,
    Type,
    Import,
    Attribute,
    Name,
    Index,
    Value,
    Assertion,
    Runtime,
    Memory,
    Permission,
    Network,
    Database,
    Planning,
    Generation,
    Validation,
    Schema,
    Coordination,
    Debugging,
    Authentication,
    Unknown,
}

impl ErrorCategory {
    /// Short lowercase token used in wire/log output (matches the Python
    /// source's `ErrorCategory.value`, e.g. `"network_error"`).
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            ErrorCategory::Syntax => "syntax_error",
            ErrorCategory::Type => "type_error",
            ErrorCategory::Import => "import_error",
            ErrorCategory::Attribute => "attribute_error",
            ErrorCategory::Name => "name_error",
            ErrorCategory::Index => "index_error",
            ErrorCategory::Value => "value_error",
            ErrorCategory::Assertion => "assertion_error",
            ErrorCategory::Runtime => "runtime_error",
            ErrorCategory::Memory => "memory_error",
            ErrorCategory::Permission => "permission_error",
            ErrorCategory::Network => "network_error",
            ErrorCategory::Database => "database_error",
            ErrorCategory::Planning => "planning_error",
            ErrorCategory::Generation => "generation_error",
            ErrorCategory::Validation => "validation_error",
            ErrorCategory::Schema => "schema_error",
            ErrorCategory::Coordination => "coordination_error",
            ErrorCategory::Debugging => "debugging_error",
            ErrorCategory::Authentication => "authentication_error",
            ErrorCategory::Unknown => "unknown_error",
        }
    }

    /// Transient categories are retried with backoff; permanent ones never
    /// are. Mirrors `should_retry` in SPEC_FULL.md §4.8.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Network | ErrorCategory::Database | ErrorCategory::Runtime
        )
    }
}

/// Structured context attached to every propagated error at its origin and
/// enriched (never replaced) as it crosses component boundaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub category: ErrorCategory,
    pub message: String,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub function: Option<String>,
    pub component: String,
    pub phase: Option<String>,
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub inputs: HashMap<String, serde_json::Value>,
    pub stacktrace: String,
    pub timestamp: DateTime<Utc>,
    pub attempt_number: u32,
    pub recovery_attempted: bool,
    pub recovery_strategy: Option<String>,
}

impl ErrorContext {
    pub fn new(category: ErrorCategory, message: impl Into<String>, component: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            file: None,
            line: None,
            function: None,
            component: component.into(),
            phase: None,
            operation: None,
            variables: HashMap::new(),
            inputs: HashMap::new(),
            stacktrace: String::new(),
            timestamp: Utc::now(),
            attempt_number: 0,
            recovery_attempted: false,
            recovery_strategy: None,
        }
    }

    pub fn with_phase(mut self, phase: impl Into<String>) -> Self {
        self.phase = Some(phase.into());
        self
    }

    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt_number = attempt;
        self
    }

    pub fn with_recovery(mut self, strategy: impl Into<String>) -> Self {
        self.recovery_attempted = true;
        self.recovery_strategy = Some(strategy.into());
        self
    }

    pub fn should_retry(&self) -> bool {
        self.category.is_transient()
    }
}

/// Top-level error type for every component in this crate. Carries a
/// structured [`ErrorContext`] and chains to its source via `#[source]` so
/// `tooling::error::context::format_error_chain` can walk it uniformly.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{}", .context.message)]
    Categorized {
        context: Box<ErrorContext>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    pub fn new(category: ErrorCategory, component: &str, message: impl Into<String>) -> Self {
        AppError::Categorized {
            context: Box::new(ErrorContext::new(category, message, component)),
            source: None,
        }
    }

    pub fn from_context(context: ErrorContext) -> Self {
        AppError::Categorized {
            context: Box::new(context),
            source: None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            AppError::Categorized { context, .. } => context.category,
            AppError::Io(_) => ErrorCategory::Runtime,
            AppError::Serialization(_) => ErrorCategory::Schema,
        }
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        is_retryable_error(self, attempt)
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Retry classification predicate: transient categories retry until
/// `max_attempts` is reached; permanent categories never retry regardless
/// of attempt count. `attempt` is accepted for symmetry with
/// `tooling::async_utils::retry::RetryPolicy::should_retry` even though the
/// category alone decides the outcome here.
pub fn is_retryable_error(error: &AppError, _attempt: u32) -> bool {
    error.category().is_transient()
}

/// Builds an `ErrorContext` from a `component`/`phase`/`operation` triple and
/// an arbitrary displayable error, defaulting to `ErrorCategory::Unknown`
/// unless the caller supplies one (mirrors `agent_s3.errors.create_error_context`).
pub fn create_error_context(
    category: ErrorCategory,
    component: &str,
    phase: Option<&str>,
    operation: Option<&str>,
    message: impl Into<String>,
) -> ErrorContext {
    let mut ctx = ErrorContext::new(category, message, component);
    if let Some(phase) = phase {
        ctx = ctx.with_phase(phase);
    }
    if let Some(operation) = operation {
        ctx = ctx.with_operation(operation);
    }
    ctx
}
