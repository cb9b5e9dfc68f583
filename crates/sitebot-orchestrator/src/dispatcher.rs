use crate::registry::BotRegistry;
use crate::task_queue::QueueSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sitebot_core::{ConcurrencyClass, TaskDefinition};
use std::sync::Arc;

/// Delay heuristics used when a task cannot start right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Estimated wait before a saturated bot or class frees up.
    pub wait_heuristic_ms: u64,
    /// Suggested retry delay for unroutable tasks.
    pub no_bot_retry_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            wait_heuristic_ms: 5_000,
            no_bot_retry_ms: 60_000,
        }
    }
}

/// Live resource view a batch of assignments is decided against.
///
/// Every immediate assignment consumes a slot here, so later tasks in the
/// same batch see the load the earlier ones will add.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    snapshot: QueueSnapshot,
    remaining_tokens: u64,
}

impl DispatchContext {
    /// Context over a queue snapshot and the budget headroom.
    pub fn new(snapshot: QueueSnapshot, remaining_tokens: u64) -> Self {
        Self {
            snapshot,
            remaining_tokens,
        }
    }

    /// Budget headroom still unassigned.
    pub fn remaining_tokens(&self) -> u64 {
        self.remaining_tokens
    }
}

/// A routed task and when it is expected to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    /// Task id.
    pub task_id: String,
    /// Bot that will run it.
    pub bot: String,
    /// Whether bot, class and budget all admit it now.
    pub immediate: bool,
    /// Expected start time.
    pub estimated_start: DateTime<Utc>,
    /// Human-readable explanation.
    pub reason: String,
}

/// Outcome of [`Dispatcher::decide_assignment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "kebab-case")]
pub enum AssignmentDecision {
    /// No bot accepts the task name.
    NoBot {
        /// Task id.
        task_id: String,
        /// Suggested delay before trying again.
        retry_after_ms: u64,
        /// Human-readable explanation.
        reason: String,
    },
    /// A bot was found.
    Assigned(Assignment),
}

impl AssignmentDecision {
    /// Task id the decision is about.
    pub fn task_id(&self) -> &str {
        match self {
            AssignmentDecision::NoBot { task_id, .. } => task_id,
            AssignmentDecision::Assigned(a) => &a.task_id,
        }
    }

    /// Whether the task can start right away.
    pub fn is_immediate(&self) -> bool {
        matches!(self, AssignmentDecision::Assigned(a) if a.immediate)
    }
}

/// Per-task routing and start-time decisions.
pub struct Dispatcher {
    registry: Arc<BotRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    /// Dispatcher routing against `registry`.
    pub fn new(registry: Arc<BotRegistry>, config: DispatcherConfig) -> Self {
        Self { registry, config }
    }

    /// Route `task` and check bot, class and (for `llm`) budget headroom.
    pub fn decide_assignment(
        &self,
        task: &TaskDefinition,
        ctx: &mut DispatchContext,
    ) -> AssignmentDecision {
        let now = Utc::now();
        let Some(bot) = self.registry.route(&task.name) else {
            return AssignmentDecision::NoBot {
                task_id: task.id.clone(),
                retry_after_ms: self.config.no_bot_retry_ms,
                reason: format!("no bot accepts task '{}'", task.name),
            };
        };
        let descriptor = bot.descriptor();
        let class = task.concurrency_class;

        let bot_running = ctx.snapshot.running_for(&descriptor.name);
        let bot_free = bot_running < descriptor.concurrency;
        let load = *ctx.snapshot.class(class);
        let class_free = load.has_capacity();
        let budget_ok =
            class != ConcurrencyClass::Llm || task.estimated_tokens <= ctx.remaining_tokens;

        let immediate = bot_free && class_free && budget_ok;
        let reason = if immediate {
            format!(
                "bot '{}' has capacity ({}/{}), {class} slots {}/{}",
                descriptor.name, bot_running, descriptor.concurrency, load.running, load.capacity
            )
        } else {
            let mut waits = Vec::new();
            if !bot_free {
                waits.push(format!(
                    "bot '{}' busy ({}/{})",
                    descriptor.name, bot_running, descriptor.concurrency
                ));
            }
            if !class_free {
                waits.push(format!("{class} class full ({}/{})", load.running, load.capacity));
            }
            if !budget_ok {
                waits.push(format!(
                    "budget short ({} needed, {} left)",
                    task.estimated_tokens, ctx.remaining_tokens
                ));
            }
            waits.join("; ")
        };

        let estimated_start = if immediate {
            *ctx.snapshot
                .bot_running
                .entry(descriptor.name.clone())
                .or_insert(0) += 1;
            match class {
                ConcurrencyClass::Cpu => ctx.snapshot.cpu.running += 1,
                ConcurrencyClass::Io => ctx.snapshot.io.running += 1,
                ConcurrencyClass::Llm => {
                    ctx.snapshot.llm.running += 1;
                    ctx.remaining_tokens = ctx.remaining_tokens.saturating_sub(task.estimated_tokens);
                }
            }
            now
        } else {
            now + chrono::Duration::milliseconds(self.config.wait_heuristic_ms as i64)
        };

        AssignmentDecision::Assigned(Assignment {
            task_id: task.id.clone(),
            bot: descriptor.name.clone(),
            immediate,
            estimated_start,
            reason,
        })
    }
}
