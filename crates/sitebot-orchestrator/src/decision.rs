use crate::dispatcher::{AssignmentDecision, DispatchContext, Dispatcher};
use crate::monitor::ResourceTelemetry;
use crate::planner::Planner;
use crate::registry::BotRegistry;
use crate::task_queue::QueueSnapshot;
use crate::types::{ExecutionStrategy, TaskAnalysis};
use serde::{Deserialize, Serialize};
use sitebot_core::TaskDefinition;
use std::sync::Arc;
use tracing::info;

/// Thresholds for the global strategy choice.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// CPU or I/O utilization at or above which work is serialized.
    pub utilization_threshold: f64,
    /// Remaining tokens below which only the most important work should run.
    pub low_token_threshold: u64,
    /// Task counts above this are batched.
    pub batch_task_threshold: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            utilization_threshold: 0.8,
            low_token_threshold: 1000,
            batch_task_threshold: 5,
        }
    }
}

/// Strategy, per-task assignments and the reasoning behind them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Strategy chosen from live telemetry.
    pub strategy: ExecutionStrategy,
    /// Planner analysis per task, in submission order.
    pub analyses: Vec<TaskAnalysis>,
    /// Dispatcher verdict per task, in submission order.
    pub assignments: Vec<AssignmentDecision>,
    /// Telemetry the decision was made against.
    pub telemetry: ResourceTelemetry,
    /// Human-readable summary.
    pub rationale: String,
}

/// Combines planner, dispatcher and telemetry into one [`Decision`].
pub struct DecisionEngine {
    registry: Arc<BotRegistry>,
    planner: Arc<Planner>,
    dispatcher: Arc<Dispatcher>,
    config: DecisionConfig,
}

impl DecisionEngine {
    /// Build an engine over shared collaborators.
    pub fn new(
        registry: Arc<BotRegistry>,
        planner: Arc<Planner>,
        dispatcher: Arc<Dispatcher>,
        config: DecisionConfig,
    ) -> Self {
        Self {
            registry,
            planner,
            dispatcher,
            config,
        }
    }

    /// Pick a strategy and the reason for it.
    pub fn select_strategy(
        &self,
        telemetry: &ResourceTelemetry,
        task_count: usize,
    ) -> (ExecutionStrategy, String) {
        let threshold = self.config.utilization_threshold;
        if telemetry.cpu_utilization >= threshold || telemetry.io_utilization >= threshold {
            (
                ExecutionStrategy::Sequential,
                format!(
                    "resources under pressure (cpu {:.0}%, io {:.0}%)",
                    telemetry.cpu_utilization * 100.0,
                    telemetry.io_utilization * 100.0
                ),
            )
        } else if telemetry.remaining_tokens < self.config.low_token_threshold {
            (
                ExecutionStrategy::PriorityFirst,
                format!("token budget low ({} left)", telemetry.remaining_tokens),
            )
        } else if task_count > self.config.batch_task_threshold {
            (
                ExecutionStrategy::Batch,
                format!("{task_count} tasks exceed the batch threshold"),
            )
        } else {
            (
                ExecutionStrategy::Parallel,
                "resources and budget available".to_string(),
            )
        }
    }

    /// Analyze every task, choose a strategy and assign bots.
    pub fn make_decision(
        &self,
        tasks: &[TaskDefinition],
        telemetry: &ResourceTelemetry,
        snapshot: &QueueSnapshot,
    ) -> Decision {
        let analyses: Vec<TaskAnalysis> = tasks
            .iter()
            .map(|t| self.planner.analyze_task(t, tasks))
            .collect();
        let (strategy, why) = self.select_strategy(telemetry, tasks.len());

        let mut ctx = DispatchContext::new(snapshot.clone(), telemetry.remaining_tokens);
        let assignments: Vec<AssignmentDecision> = tasks
            .iter()
            .map(|t| self.dispatcher.decide_assignment(t, &mut ctx))
            .collect();

        let ready = analyses.iter().filter(|a| a.can_execute).count();
        let immediate = assignments.iter().filter(|a| a.is_immediate()).count();
        let rationale = format!(
            "{} bots available, {} tasks in flight, {} tokens remaining, {ready}/{} tasks ready, {immediate} can start now; {strategy}: {why}",
            self.registry.bot_count(),
            telemetry.in_flight,
            telemetry.remaining_tokens,
            tasks.len(),
        );
        info!(strategy = %strategy, ready, total = tasks.len(), "Decision made");

        Decision {
            strategy,
            analyses,
            assignments,
            telemetry: telemetry.clone(),
            rationale,
        }
    }
}
