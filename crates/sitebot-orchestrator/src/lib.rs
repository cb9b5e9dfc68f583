//! Site-building task orchestration: queue, locks, budget and planning.
//!
//! Bots register for task names; tasks are deduplicated by idempotency key,
//! serialized by a lock per fingerprint, throttled per concurrency class and
//! bot, and charged against a daily token budget. On top of the queue, the
//! planner orders a task set by its dependencies, the decision engine picks an
//! execution strategy from live telemetry, and the supervisor runs the plan.
//!
//! # Main types
//!
//! - [`Orchestrator`]: decide, plan and supervise a task set end to end.
//! - [`TaskQueue`]: admission, dedup and execution of single tasks.
//! - [`BotRegistry`]: first-match routing of task names to [`Bot`]s.
//! - [`LockManager`]: per-fingerprint mutual exclusion with TTL.
//! - [`BudgetLedger`]: daily token accounting backed by a JSONL metrics log.
//! - [`FallbackEngine`]: deterministic, token-free alternatives to bots.
//! - [`Planner`], [`Dispatcher`], [`DecisionEngine`], [`Supervisor`].

/// Daily token budget and the JSONL metrics log.
pub mod budget;
/// Strategy selection from telemetry.
pub mod decision;
/// Per-task bot assignment.
pub mod dispatcher;
/// End-to-end orchestration pipeline.
pub mod engine;
/// Deterministic fallback rules.
pub mod fallback;
/// Fingerprint locks and lock stores.
pub mod lock;
/// Resource telemetry sampling.
pub mod monitor;
/// Dependency ordering, risk grading and duration estimates.
pub mod planner;
/// Bot trait and registry.
pub mod registry;
/// Strategy executors.
pub mod supervisor;
/// Class-limited, deduplicating task queue.
pub mod task_queue;
/// Plan and analysis types.
pub mod types;

pub use budget::{BudgetConfig, BudgetLedger, LedgerEntry, MetricsLog, UsageSummary};
pub use decision::{Decision, DecisionConfig, DecisionEngine};
pub use dispatcher::{
    Assignment, AssignmentDecision, DispatchContext, Dispatcher, DispatcherConfig,
};
pub use engine::{Orchestrator, OrchestratorConfig, OrchestratorResult};
pub use fallback::{FallbackArtifact, FallbackEngine, FallbackRule, FALLBACK_DURATION_MS};
pub use lock::{FileLockStore, LockGuard, LockManager, LockStore, MemoryLockStore};
pub use monitor::{ResourceMonitor, ResourceTelemetry};
pub use planner::{topological_order, Planner, PlannerConfig};
pub use registry::{Bot, BotDescriptor, BotRegistry};
pub use supervisor::{
    Supervisor, SupervisorConfig, SupervisorReport, SupervisorState, ABANDONED_CODE,
};
pub use task_queue::{
    ClassLoad, QueueConfig, QueueSnapshot, TaskHandle, TaskQueue, TaskQueueBuilder, SHUTDOWN_CODE,
};
pub use types::{ExecutionPlan, ExecutionStrategy, RiskAssessment, RiskLevel, TaskAnalysis};
