use crate::decision::{Decision, DecisionConfig, DecisionEngine};
use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::monitor::ResourceMonitor;
use crate::planner::{Planner, PlannerConfig};
use crate::registry::BotRegistry;
use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorReport};
use crate::task_queue::TaskQueue;
use crate::types::{ExecutionPlan, ExecutionStrategy};
use serde::{Deserialize, Serialize};
use sitebot_core::{SitebotResult, TaskDefinition};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Tuning for every stage the orchestrator wires together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Planner thresholds.
    pub planner: PlannerConfig,
    /// Dispatcher delay heuristics.
    pub dispatcher: DispatcherConfig,
    /// Strategy thresholds.
    pub decision: DecisionConfig,
    /// Supervisor tuning.
    pub supervisor: SupervisorConfig,
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorResult {
    /// The plan that ran, with the decided strategy.
    pub plan: ExecutionPlan,
    /// Strategy decision and its rationale.
    pub decision: Decision,
    /// Per-task results and totals.
    pub report: SupervisorReport,
}

/// The site orchestrator.
/// Implements the decide → plan → supervise pipeline over one task queue.
pub struct Orchestrator {
    queue: TaskQueue,
    monitor: Arc<ResourceMonitor>,
    planner: Arc<Planner>,
    decision: DecisionEngine,
    supervisor: Supervisor,
}

impl Orchestrator {
    /// Wire the pipeline around an already-built queue.
    ///
    /// `registry` should be the one the queue routes with, so plans and
    /// execution agree on which tasks are routable.
    pub fn new(registry: Arc<BotRegistry>, queue: TaskQueue, config: OrchestratorConfig) -> Self {
        let planner = Arc::new(Planner::new(Arc::clone(&registry), config.planner));
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&registry), config.dispatcher));
        let decision = DecisionEngine::new(
            registry,
            Arc::clone(&planner),
            dispatcher,
            config.decision,
        );
        Self {
            monitor: Arc::new(ResourceMonitor::new(queue.clone())),
            supervisor: Supervisor::new(queue.clone(), config.supervisor),
            queue,
            planner,
            decision,
        }
    }

    /// Get a reference to the monitor.
    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    /// Get a reference to the task queue.
    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Decide a strategy from live telemetry, then build the plan under it.
    ///
    /// Fails without running anything if the task set is invalid or cyclic.
    pub async fn prepare(
        &self,
        tasks: Vec<TaskDefinition>,
    ) -> SitebotResult<(ExecutionPlan, Decision)> {
        let telemetry = self.monitor.sample().await;
        let decision = self
            .decision
            .make_decision(&tasks, &telemetry, &self.monitor.snapshot());

        let mut plan = self.planner.create_plan(tasks)?;
        if plan.strategy != decision.strategy {
            info!(
                planner = %plan.strategy,
                decided = %decision.strategy,
                "Strategy overridden by live telemetry"
            );
            self.apply_strategy(&mut plan, decision.strategy);
        }
        Ok((plan, decision))
    }

    /// Run the full pipeline for a task set.
    pub async fn run(&self, tasks: Vec<TaskDefinition>) -> SitebotResult<OrchestratorResult> {
        self.run_inner(tasks, None).await
    }

    /// Run the pipeline with a fixed strategy instead of the decided one.
    pub async fn run_with_strategy(
        &self,
        tasks: Vec<TaskDefinition>,
        strategy: ExecutionStrategy,
    ) -> SitebotResult<OrchestratorResult> {
        self.run_inner(tasks, Some(strategy)).await
    }

    async fn run_inner(
        &self,
        tasks: Vec<TaskDefinition>,
        forced: Option<ExecutionStrategy>,
    ) -> SitebotResult<OrchestratorResult> {
        let start = Instant::now();
        info!(tasks = tasks.len(), "Orchestrator: starting pipeline");

        let (mut plan, decision) = self.prepare(tasks).await?;
        if let Some(strategy) = forced {
            self.apply_strategy(&mut plan, strategy);
        }
        info!(
            strategy = %plan.strategy,
            estimated_ms = plan.estimated_total_duration_ms,
            "Orchestrator: plan ready"
        );

        let report = self.supervisor.execute(&plan).await?;
        self.monitor.sample().await;

        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            completed = report.completed,
            failed = report.failed,
            canceled = report.canceled,
            "Orchestrator: pipeline complete"
        );
        Ok(OrchestratorResult {
            plan,
            decision,
            report,
        })
    }

    fn apply_strategy(&self, plan: &mut ExecutionPlan, strategy: ExecutionStrategy) {
        plan.strategy = strategy;
        plan.estimated_total_duration_ms = self.planner.estimate_duration(plan, strategy);
    }
}
