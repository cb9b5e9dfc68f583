use serde::{Deserialize, Serialize};
use sitebot_core::TaskDefinition;

/// How the supervisor runs a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionStrategy {
    /// Waves of every ready task, run concurrently.
    Parallel,
    /// One at a time in plan order; high-priority failures abort.
    Sequential,
    /// Fixed-size concurrent groups; never aborts.
    Batch,
    /// Sequential over a stable priority sort.
    PriorityFirst,
}

impl std::fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionStrategy::Parallel => write!(f, "parallel"),
            ExecutionStrategy::Sequential => write!(f, "sequential"),
            ExecutionStrategy::Batch => write!(f, "batch"),
            ExecutionStrategy::PriorityFirst => write!(f, "priority-first"),
        }
    }
}

impl std::str::FromStr for ExecutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "parallel" => Ok(ExecutionStrategy::Parallel),
            "sequential" => Ok(ExecutionStrategy::Sequential),
            "batch" => Ok(ExecutionStrategy::Batch),
            "priority-first" => Ok(ExecutionStrategy::PriorityFirst),
            other => Err(format!("unknown execution strategy '{other}'")),
        }
    }
}

/// Per-task risk grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Routable, cheap, few dependencies.
    Low,
    /// More than three dependencies.
    Medium,
    /// Unroutable or over the token threshold.
    High,
}

/// Planner verdict for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAnalysis {
    /// Task id.
    pub task_id: String,
    /// Every declared dependency resolves to a task in the set.
    pub can_execute: bool,
    /// Dependencies found in the set.
    pub resolved_dependencies: Vec<String>,
    /// Dependencies missing from the set.
    pub missing_dependencies: Vec<String>,
    /// Base duration for the task's class.
    pub estimated_duration_ms: u64,
    /// Risk grade.
    pub risk_level: RiskLevel,
    /// Whether a bot accepts the task name.
    pub routable: bool,
}

/// Risk lists attached to a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAssessment {
    /// Ids graded [`RiskLevel::High`].
    pub high_risk_tasks: Vec<String>,
    /// Ids with dependencies that do not resolve.
    pub blocking_tasks: Vec<String>,
}

/// Topologically ordered plan handed to the supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    /// Tasks in submission order.
    pub tasks: Vec<TaskDefinition>,
    /// Task ids in dependency order.
    pub execution_order: Vec<String>,
    /// Strategy the supervisor will use.
    pub strategy: ExecutionStrategy,
    /// Estimated wall-clock duration under `strategy`.
    pub estimated_total_duration_ms: u64,
    /// High-risk and blocked tasks.
    pub risk_assessment: RiskAssessment,
}

impl ExecutionPlan {
    /// Tasks in `execution_order`.
    pub fn ordered_tasks(&self) -> Vec<&TaskDefinition> {
        self.execution_order
            .iter()
            .filter_map(|id| self.tasks.iter().find(|t| &t.id == id))
            .collect()
    }

    /// Look a task up by id.
    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }
}
