//! Strategy executors that drive a plan through the task queue.
//!
//! Every task, whatever the strategy, goes through [`TaskQueue::enqueue`],
//! so locking, dedup and class limits apply uniformly.

use crate::task_queue::TaskQueue;
use crate::types::{ExecutionPlan, ExecutionStrategy};
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sitebot_core::{
    Priority, SitebotError, SitebotResult, TaskDefinition, TaskResult, TaskStatus,
};
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{info, warn};

/// Error code for tasks skipped after a high-priority failure.
pub const ABANDONED_CODE: &str = "ABANDONED";

/// Supervisor tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Group size for the batch strategy.
    pub batch_size: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self { batch_size: 3 }
    }
}

/// Supervisor lifecycle for one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No plan yet.
    Idle,
    /// A plan has been accepted.
    Planned,
    /// Tasks are being dispatched.
    Executing,
    /// Every task has a terminal result.
    Completed,
}

/// Outcome of executing one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupervisorReport {
    /// Strategy that ran.
    pub strategy: ExecutionStrategy,
    /// One terminal result per task, in plan order.
    pub results: Vec<TaskResult>,
    /// Tasks that succeeded.
    pub completed: usize,
    /// Tasks that failed, including skipped ones.
    pub failed: usize,
    /// Tasks abandoned before running.
    pub canceled: usize,
    /// Ids whose results ask for human review.
    pub needs_review: Vec<String>,
    /// Wall-clock time of the run.
    pub duration_ms: u64,
    /// One-line summary.
    pub summary: String,
}

impl SupervisorReport {
    /// Result for a task id.
    pub fn result(&self, id: &str) -> Option<&TaskResult> {
        self.results.iter().find(|r| r.id == id)
    }

    /// Whether every task succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.completed == self.results.len()
    }
}

/// Executes plans under their strategy.
pub struct Supervisor {
    queue: TaskQueue,
    config: SupervisorConfig,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    /// Supervisor dispatching through `queue`.
    pub fn new(queue: TaskQueue, config: SupervisorConfig) -> Self {
        Self {
            queue,
            config,
            state: Mutex::new(SupervisorState::Idle),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    fn transition(&self, next: SupervisorState) {
        let mut state = self.state.lock();
        info!(from = ?*state, to = ?next, "Supervisor state change");
        *state = next;
    }

    /// Run `plan` to completion. One plan at a time per supervisor.
    pub async fn execute(&self, plan: &ExecutionPlan) -> SitebotResult<SupervisorReport> {
        {
            let mut state = self.state.lock();
            if !matches!(*state, SupervisorState::Idle | SupervisorState::Completed) {
                return Err(SitebotError::Orchestrator(
                    "supervisor is already executing a plan".into(),
                ));
            }
            *state = SupervisorState::Planned;
        }
        let start = Instant::now();
        let ordered: Vec<&TaskDefinition> = plan.ordered_tasks();
        info!(strategy = %plan.strategy, tasks = ordered.len(), "Executing plan");

        self.transition(SupervisorState::Executing);
        let mut results = match plan.strategy {
            ExecutionStrategy::Parallel => self.run_parallel(&ordered).await,
            ExecutionStrategy::Sequential => self.run_sequential(&ordered).await,
            ExecutionStrategy::Batch => self.run_batch(&ordered).await,
            ExecutionStrategy::PriorityFirst => {
                let mut by_priority = ordered.clone();
                by_priority.sort_by_key(|t| t.priority);
                self.run_sequential(&by_priority).await
            }
        };
        self.transition(SupervisorState::Completed);

        let results: Vec<TaskResult> = ordered
            .iter()
            .filter_map(|t| results.remove(&t.id))
            .collect();
        Ok(build_report(plan.strategy, results, start))
    }

    async fn run_task(&self, task: &TaskDefinition) -> TaskResult {
        let mut result = match self.queue.enqueue(task.clone()).await {
            Ok(handle) => handle.wait().await,
            Err(e) => TaskResult::failed(&task.id, &e),
        };
        // A dedup hit carries the id of the task that started the execution.
        result.id.clone_from(&task.id);
        result
    }

    /// Repeated waves of every ready task until nothing new becomes ready.
    async fn run_parallel(&self, order: &[&TaskDefinition]) -> HashMap<String, TaskResult> {
        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut wave_no = 0usize;

        loop {
            let wave: Vec<&TaskDefinition> = order
                .iter()
                .copied()
                .filter(|t| !results.contains_key(&t.id) && t.is_ready(&succeeded))
                .collect();
            if wave.is_empty() {
                break;
            }
            wave_no += 1;
            info!(wave = wave_no, tasks = wave.len(), "Launching wave");
            let settled = join_all(wave.iter().map(|t| self.run_task(t))).await;
            for (task, result) in wave.iter().zip(settled) {
                if result.is_success() {
                    succeeded.insert(task.id.clone());
                }
                results.insert(task.id.clone(), result);
            }
        }

        for task in order {
            if !results.contains_key(&task.id) {
                results.insert(task.id.clone(), unsatisfied(task, &succeeded));
            }
        }
        results
    }

    /// In order; unmet dependencies skip the task, a failed high-priority
    /// task abandons the rest.
    async fn run_sequential(&self, order: &[&TaskDefinition]) -> HashMap<String, TaskResult> {
        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let mut succeeded: HashSet<String> = HashSet::new();
        let mut abandoned_by: Option<String> = None;

        for task in order {
            if let Some(failed_id) = &abandoned_by {
                results.insert(
                    task.id.clone(),
                    TaskResult::canceled(
                        &task.id,
                        ABANDONED_CODE,
                        format!("abandoned after high-priority task '{failed_id}' failed"),
                    ),
                );
                continue;
            }
            if !task.is_ready(&succeeded) {
                results.insert(task.id.clone(), unsatisfied(task, &succeeded));
                continue;
            }

            let result = self.run_task(task).await;
            if result.is_success() {
                succeeded.insert(task.id.clone());
            } else if task.priority == Priority::High {
                warn!(task_id = %task.id, "High-priority task failed, abandoning remaining tasks");
                abandoned_by = Some(task.id.clone());
            }
            results.insert(task.id.clone(), result);
        }
        results
    }

    /// Fixed-size concurrent groups, always moving on to the next group.
    async fn run_batch(&self, order: &[&TaskDefinition]) -> HashMap<String, TaskResult> {
        let mut results: HashMap<String, TaskResult> = HashMap::new();
        let mut succeeded: HashSet<String> = HashSet::new();

        for (n, group) in batch_groups(order, self.config.batch_size).iter().enumerate() {
            let (ready, blocked): (Vec<&TaskDefinition>, Vec<&TaskDefinition>) =
                group.iter().copied().partition(|t| t.is_ready(&succeeded));
            info!(batch = n + 1, ready = ready.len(), skipped = blocked.len(), "Launching batch");

            for task in blocked {
                results.insert(task.id.clone(), unsatisfied(task, &succeeded));
            }
            let settled = join_all(ready.iter().map(|t| self.run_task(t))).await;
            for (task, result) in ready.iter().zip(settled) {
                if result.is_success() {
                    succeeded.insert(task.id.clone());
                }
                results.insert(task.id.clone(), result);
            }
        }
        results
    }
}

/// Split `order` into consecutive groups of `size` (the last may be shorter).
fn batch_groups<'a>(order: &[&'a TaskDefinition], size: usize) -> Vec<Vec<&'a TaskDefinition>> {
    order.chunks(size.max(1)).map(<[_]>::to_vec).collect()
}

fn unsatisfied(task: &TaskDefinition, succeeded: &HashSet<String>) -> TaskResult {
    let missing: Vec<&str> = task
        .depends_on
        .iter()
        .filter(|d| !succeeded.contains(d.as_str()))
        .map(String::as_str)
        .collect();
    TaskResult::failed(
        &task.id,
        &SitebotError::DependenciesUnsatisfied(missing.join(", ")),
    )
}

fn build_report(
    strategy: ExecutionStrategy,
    results: Vec<TaskResult>,
    start: Instant,
) -> SupervisorReport {
    let count = |status: TaskStatus| results.iter().filter(|r| r.status == status).count();
    let completed = count(TaskStatus::Success);
    let failed = count(TaskStatus::Fail);
    let canceled = count(TaskStatus::Canceled);
    let needs_review: Vec<String> = results
        .iter()
        .filter(|r| r.metrics.human_review_required == Some(true))
        .map(|r| r.id.clone())
        .collect();
    let duration_ms = start.elapsed().as_millis() as u64;
    let summary = format!(
        "{strategy}: {completed}/{} succeeded, {failed} failed, {canceled} canceled in {duration_ms}ms",
        results.len()
    );
    info!(%summary, "Plan finished");

    SupervisorReport {
        strategy,
        results,
        completed,
        failed,
        canceled,
        needs_review,
        duration_ms,
        summary,
    }
}
