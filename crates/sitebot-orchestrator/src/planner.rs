use crate::registry::BotRegistry;
use crate::types::{ExecutionPlan, ExecutionStrategy, RiskAssessment, RiskLevel, TaskAnalysis};
use serde::{Deserialize, Serialize};
use sitebot_core::{ConcurrencyClass, SitebotError, SitebotResult, TaskDefinition};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Planner thresholds and the per-class duration table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Estimated tokens above which a task is high risk.
    pub high_token_threshold: u64,
    /// Dependency count above which a task is medium risk.
    pub medium_dependency_threshold: usize,
    /// Group size for batch estimates and execution.
    pub batch_size: usize,
    /// Coordination overhead added to a parallel estimate.
    pub parallel_overhead_ms: u64,
    /// Base duration of a `cpu` task.
    pub cpu_base_ms: u64,
    /// Base duration of an `io` task.
    pub io_base_ms: u64,
    /// Base duration of an `llm` task.
    pub llm_base_ms: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            high_token_threshold: 4000,
            medium_dependency_threshold: 3,
            batch_size: 3,
            parallel_overhead_ms: 500,
            cpu_base_ms: 1000,
            io_base_ms: 3000,
            llm_base_ms: 10_000,
        }
    }
}

/// Turns a task set into an ordered, risk-graded [`ExecutionPlan`].
pub struct Planner {
    registry: Arc<BotRegistry>,
    config: PlannerConfig,
}

impl Planner {
    /// Planner routing against `registry`.
    pub fn new(registry: Arc<BotRegistry>, config: PlannerConfig) -> Self {
        Self { registry, config }
    }

    /// Thresholds in force.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Base duration for a class.
    pub fn base_duration(&self, class: ConcurrencyClass) -> u64 {
        match class {
            ConcurrencyClass::Cpu => self.config.cpu_base_ms,
            ConcurrencyClass::Io => self.config.io_base_ms,
            ConcurrencyClass::Llm => self.config.llm_base_ms,
        }
    }

    /// Resolve dependencies and grade the risk of one task.
    pub fn analyze_task(&self, task: &TaskDefinition, all: &[TaskDefinition]) -> TaskAnalysis {
        let (resolved, missing): (Vec<String>, Vec<String>) = task
            .depends_on
            .iter()
            .cloned()
            .partition(|dep| all.iter().any(|t| &t.id == dep));
        let routable = self.registry.route(&task.name).is_some();

        let risk_level = if !routable || task.estimated_tokens > self.config.high_token_threshold
        {
            RiskLevel::High
        } else if task.depends_on.len() > self.config.medium_dependency_threshold {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        TaskAnalysis {
            task_id: task.id.clone(),
            can_execute: missing.is_empty(),
            resolved_dependencies: resolved,
            missing_dependencies: missing,
            estimated_duration_ms: self.base_duration(task.concurrency_class),
            risk_level,
            routable,
        }
    }

    /// Build a plan: validate, order topologically, pick a strategy and
    /// estimate its duration.
    pub fn create_plan(&self, tasks: Vec<TaskDefinition>) -> SitebotResult<ExecutionPlan> {
        let execution_order = topological_order(&tasks)?;
        let analyses: Vec<TaskAnalysis> = tasks
            .iter()
            .map(|t| self.analyze_task(t, &tasks))
            .collect();
        let strategy = self.select_strategy(&tasks, &analyses);

        let risk_assessment = RiskAssessment {
            high_risk_tasks: analyses
                .iter()
                .filter(|a| a.risk_level == RiskLevel::High)
                .map(|a| a.task_id.clone())
                .collect(),
            blocking_tasks: analyses
                .iter()
                .filter(|a| !a.can_execute)
                .map(|a| a.task_id.clone())
                .collect(),
        };

        let mut plan = ExecutionPlan {
            tasks,
            execution_order,
            strategy,
            estimated_total_duration_ms: 0,
            risk_assessment,
        };
        plan.estimated_total_duration_ms = self.estimate_duration(&plan, strategy);
        debug!(
            tasks = plan.tasks.len(),
            strategy = %strategy,
            estimated_ms = plan.estimated_total_duration_ms,
            high_risk = plan.risk_assessment.high_risk_tasks.len(),
            "Plan created"
        );
        Ok(plan)
    }

    /// `priority-first` when anything is high risk or has dependencies,
    /// `parallel` when cpu tasks outnumber llm tasks more than twice over,
    /// `batch` otherwise.
    pub fn select_strategy(
        &self,
        tasks: &[TaskDefinition],
        analyses: &[TaskAnalysis],
    ) -> ExecutionStrategy {
        let any_high_risk = analyses.iter().any(|a| a.risk_level == RiskLevel::High);
        let any_dependencies = tasks.iter().any(|t| !t.depends_on.is_empty());
        if any_high_risk || any_dependencies {
            return ExecutionStrategy::PriorityFirst;
        }
        let count = |class: ConcurrencyClass| {
            tasks
                .iter()
                .filter(|t| t.concurrency_class == class)
                .count()
        };
        if count(ConcurrencyClass::Cpu) > 2 * count(ConcurrencyClass::Llm) {
            ExecutionStrategy::Parallel
        } else {
            ExecutionStrategy::Batch
        }
    }

    /// Duration estimate for running `plan` under `strategy`.
    pub fn estimate_duration(&self, plan: &ExecutionPlan, strategy: ExecutionStrategy) -> u64 {
        let durations: Vec<u64> = plan
            .ordered_tasks()
            .iter()
            .map(|t| self.base_duration(t.concurrency_class))
            .collect();
        match strategy {
            ExecutionStrategy::Parallel => {
                durations.iter().copied().max().unwrap_or(0) + self.config.parallel_overhead_ms
            }
            ExecutionStrategy::Sequential => durations.iter().sum(),
            ExecutionStrategy::Batch | ExecutionStrategy::PriorityFirst => durations
                .chunks(self.config.batch_size.max(1))
                .map(|chunk| chunk.iter().copied().max().unwrap_or(0))
                .sum(),
        }
    }
}

/// Kahn's algorithm over `dependsOn` edges, stable in submission order.
///
/// Dependencies on ids outside the set are ignored here (they surface as
/// blocking tasks instead). Fails on duplicate ids, invalid definitions and
/// cycles.
pub fn topological_order(tasks: &[TaskDefinition]) -> SitebotResult<Vec<String>> {
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(tasks.len());
    for (i, task) in tasks.iter().enumerate() {
        task.validate()?;
        if index.insert(task.id.as_str(), i).is_some() {
            return Err(SitebotError::Validation(format!(
                "duplicate task id '{}'",
                task.id
            )));
        }
    }

    let mut in_degree = vec![0usize; tasks.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); tasks.len()];
    for (i, task) in tasks.iter().enumerate() {
        for dep in &task.depends_on {
            if let Some(&d) = index.get(dep.as_str()) {
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }
    }

    let mut ready: VecDeque<usize> = (0..tasks.len()).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(tasks.len());
    while let Some(i) = ready.pop_front() {
        order.push(tasks[i].id.clone());
        for &next in &dependents[i] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push_back(next);
            }
        }
    }

    if order.len() < tasks.len() {
        let placed: HashSet<&str> = order.iter().map(String::as_str).collect();
        let cyclic: Vec<String> = tasks
            .iter()
            .filter(|t| !placed.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect();
        warn!(tasks = ?cyclic, "Dependency cycle detected");
        return Err(SitebotError::CycleDetected(cyclic));
    }
    Ok(order)
}
