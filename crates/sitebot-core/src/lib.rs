//! Core types and error definitions for the Sitebot orchestration core.
//!
//! This crate provides the foundational types shared by the orchestrator and
//! the CLI: the error taxonomy, the task submission/result data model, and the
//! idempotency key deriver.
//!
//! # Main types
//!
//! - [`SitebotError`]: Unified error enum for every orchestration subsystem.
//! - [`SitebotResult`]: Convenience alias for `Result<T, SitebotError>`.
//! - [`TaskDefinition`]: Immutable description of a unit of work.
//! - [`TaskResult`]: Lifecycle record of one task execution.
//! - [`derive_key`]: Deterministic fingerprint over (name, version, inputs).

/// Deterministic idempotency key derivation.
pub mod idempotency;
/// Task submission and result data model.
pub mod task;

pub use idempotency::{derive_key, normalize_inputs};
pub use task::{
    ConcurrencyClass, Priority, TaskDefinition, TaskMetrics, TaskResult, TaskStatus,
};

// --- Error types ---

/// Top-level error type for the orchestration core.
///
/// Every variant has a stable machine code (see [`SitebotError::code`]) that
/// ends up in [`TaskResult::error_code`] when the error settles a task.
#[derive(Debug, thiserror::Error)]
pub enum SitebotError {
    /// A task definition failed schema validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// No registered bot accepts the task name.
    #[error("No bot registered for task '{0}'")]
    BotNotFound(String),

    /// Another execution already holds the lock for this fingerprint.
    #[error("Locked: {0}")]
    Locked(String),

    /// A bot handler returned an error or panicked.
    #[error("Handler failure: {0}")]
    Handler(String),

    /// The token budget does not allow the task to start.
    #[error("Budget exceeded: requested {requested} tokens, {remaining} remaining")]
    BudgetExceeded {
        /// Tokens the task estimated it would need.
        requested: u64,
        /// Tokens still available under the daily cap.
        remaining: u64,
    },

    /// The task was skipped because a dependency has not succeeded.
    #[error("Dependencies not satisfied: {0}")]
    DependenciesUnsatisfied(String),

    /// The dependency graph contains a cycle through the listed task ids.
    #[error("Dependency cycle detected among tasks: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    /// The handler did not finish within its timeout budget.
    #[error("Timed out after {ms}ms")]
    Timeout {
        /// The timeout budget that elapsed.
        ms: u64,
    },

    /// No deterministic fallback rule is registered under the given name.
    #[error("No fallback rule registered for '{0}'")]
    NoFallbackRule(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An internal orchestrator failure (closed channels, lost workers).
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SitebotError {
    /// Stable machine-readable code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            SitebotError::Validation(_) => "VALIDATION",
            SitebotError::BotNotFound(_) => "BOT_NOT_FOUND",
            SitebotError::Locked(_) => "LOCKED",
            SitebotError::Handler(_) => "HANDLER_FAILURE",
            SitebotError::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            SitebotError::DependenciesUnsatisfied(_) => "DEPENDENCIES_UNSATISFIED",
            SitebotError::CycleDetected(_) => "CYCLE_DETECTED",
            SitebotError::Timeout { .. } => "TIMEOUT",
            SitebotError::NoFallbackRule(_) => "NO_FALLBACK_RULE",
            SitebotError::Config(_) => "CONFIG",
            SitebotError::Orchestrator(_) => "ORCHESTRATOR",
            SitebotError::Json(_) => "JSON",
            SitebotError::Io(_) => "IO",
        }
    }
}

/// A convenience `Result` alias using [`SitebotError`].
pub type SitebotResult<T> = Result<T, SitebotError>;
