use crate::idempotency::derive_key;
use crate::{SitebotError, SitebotResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default semantic version assumed when a submission omits one.
pub const DEFAULT_VERSION: &str = "1.0.0";
/// Default per-task timeout budget.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Scheduling priority. Orders `High < Normal < Low` so a plain sort puts
/// the most urgent work first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Drained first; failures abort ordered strategies.
    High,
    /// The default lane.
    #[default]
    Normal,
    /// Drained only after the other lanes are empty or blocked.
    Low,
}

impl Priority {
    /// All priorities in drain order.
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    /// Lane index in drain order.
    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Admission-control class a task consumes while it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConcurrencyClass {
    /// CPU-bound local work (page builds, transforms).
    #[default]
    Cpu,
    /// I/O-bound external calls (deploys, uploads, HTTP checks).
    Io,
    /// Budget-metered language-model calls.
    Llm,
}

impl ConcurrencyClass {
    /// All classes, in counter order.
    pub const ALL: [ConcurrencyClass; 3] =
        [ConcurrencyClass::Cpu, ConcurrencyClass::Io, ConcurrencyClass::Llm];

    /// Counter index for per-class arrays.
    pub fn index(self) -> usize {
        match self {
            ConcurrencyClass::Cpu => 0,
            ConcurrencyClass::Io => 1,
            ConcurrencyClass::Llm => 2,
        }
    }
}

impl std::fmt::Display for ConcurrencyClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConcurrencyClass::Cpu => write!(f, "cpu"),
            ConcurrencyClass::Io => write!(f, "io"),
            ConcurrencyClass::Llm => write!(f, "llm"),
        }
    }
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

/// Immutable description of a unit of work.
///
/// The serialized shape is the task submission format:
/// `{id, version, name, priority, concurrencyClass, idempotencyKey?,
/// inputsRef?, timeoutMs, dependsOn[], estimatedTokens, fallbackRules?[]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    /// Unique id within a plan.
    pub id: String,
    /// Semantic version of the task contract.
    #[serde(default = "default_version")]
    pub version: String,
    /// Routing key matched against bot `accepts` lists.
    pub name: String,
    /// Lane the task is queued on.
    #[serde(default)]
    pub priority: Priority,
    /// Counter the task consumes while running.
    #[serde(default)]
    pub concurrency_class: ConcurrencyClass,
    /// Explicit fingerprint; derived from (name, version, inputs) when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    /// Free-form input payload handed to the bot or fallback rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_ref: Option<serde_json::Value>,
    /// Deadline for a single execution.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Ids of tasks that must succeed before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Expected language-model token spend.
    #[serde(default)]
    pub estimated_tokens: u64,
    /// Fallback rules this task accepts in lieu of full execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback_rules: Vec<String>,
}

impl TaskDefinition {
    /// Create a task with default version, priority, class and timeout.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: default_version(),
            name: name.into(),
            priority: Priority::Normal,
            concurrency_class: ConcurrencyClass::Cpu,
            idempotency_key: None,
            inputs_ref: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            depends_on: Vec::new(),
            estimated_tokens: 0,
            fallback_rules: Vec::new(),
        }
    }

    /// Set the contract version.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Set the priority lane.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the concurrency class.
    pub fn with_class(mut self, class: ConcurrencyClass) -> Self {
        self.concurrency_class = class;
        self
    }

    /// Pin an explicit idempotency key.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Attach the input payload.
    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs_ref = Some(inputs);
        self
    }

    /// Set the timeout budget in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Replace the dependency list.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set the estimated token cost.
    pub fn with_estimated_tokens(mut self, tokens: u64) -> Self {
        self.estimated_tokens = tokens;
        self
    }

    /// Declare an acceptable fallback rule.
    pub fn with_fallback_rule(mut self, rule: impl Into<String>) -> Self {
        self.fallback_rules.push(rule.into());
        self
    }

    /// Check the definition against the submission schema.
    pub fn validate(&self) -> SitebotResult<()> {
        if self.id.trim().is_empty() {
            return Err(SitebotError::Validation("task id must not be empty".into()));
        }
        if self.name.trim().is_empty() {
            return Err(SitebotError::Validation(format!(
                "task '{}' has an empty name",
                self.id
            )));
        }
        if self.version.trim().is_empty() {
            return Err(SitebotError::Validation(format!(
                "task '{}' has an empty version",
                self.id
            )));
        }
        if self.timeout_ms == 0 {
            return Err(SitebotError::Validation(format!(
                "task '{}' must have a positive timeoutMs",
                self.id
            )));
        }
        if matches!(&self.idempotency_key, Some(k) if k.trim().is_empty()) {
            return Err(SitebotError::Validation(format!(
                "task '{}' has an empty idempotencyKey",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for dep in &self.depends_on {
            if dep == &self.id {
                return Err(SitebotError::Validation(format!(
                    "task '{}' depends on itself",
                    self.id
                )));
            }
            if !seen.insert(dep.as_str()) {
                return Err(SitebotError::Validation(format!(
                    "task '{}' lists dependency '{dep}' twice",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// The explicit idempotency key, or the derived fingerprint.
    pub fn resolved_key(&self) -> String {
        match &self.idempotency_key {
            Some(key) => key.clone(),
            None => derive_key(&self.name, &self.version, self.inputs_ref.as_ref()),
        }
    }

    /// True when every dependency id appears in `succeeded`.
    pub fn is_ready(&self, succeeded: &HashSet<String>) -> bool {
        self.depends_on
            .iter()
            .all(|dep| succeeded.contains(dep.as_str()))
    }
}

/// Lifecycle of a task execution: `queued → running → {success | fail | canceled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted by the queue, waiting for capacity.
    Queued,
    /// Handler invoked.
    Running,
    /// Finished without error.
    Success,
    /// Finished with an error.
    Fail,
    /// Abandoned before it ran.
    Canceled,
}

impl TaskStatus {
    /// Whether no further transition can happen.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Fail | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Fail => write!(f, "fail"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

/// Metrics bag attached to every result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    /// Wall-clock execution time measured by the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Retries performed inside the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Prompt tokens consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    /// Completion tokens produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    /// Whether the handler served the result from a cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_hit: Option<bool>,
    /// Whether a deterministic fallback rule produced the result.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_used: Option<bool>,
    /// Name of the fallback rule that ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_applied: Option<String>,
    /// Whether the artifacts need a human look before publishing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_review_required: Option<bool>,
}

impl TaskMetrics {
    /// Record token usage.
    pub fn with_tokens(mut self, tokens_in: u64, tokens_out: u64) -> Self {
        self.tokens_in = Some(tokens_in);
        self.tokens_out = Some(tokens_out);
        self
    }
}

/// Execution record for one task.
///
/// Owned by the queue while the task runs; immutable once terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    /// Id of the task this result belongs to.
    pub id: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// When the handler was invoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the result became terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Number of times the handler was invoked.
    pub attempts: u32,
    /// Machine-readable error code for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Human-readable error message for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    /// References to produced artifacts (paths, URLs).
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Execution metrics.
    #[serde(default)]
    pub metrics: TaskMetrics,
}

impl TaskResult {
    fn blank(id: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: id.into(),
            status,
            started_at: None,
            ended_at: None,
            attempts: 0,
            error_code: None,
            error_msg: None,
            artifacts: Vec::new(),
            metrics: TaskMetrics::default(),
        }
    }

    /// A freshly enqueued result.
    pub fn queued(id: impl Into<String>) -> Self {
        Self::blank(id, TaskStatus::Queued)
    }

    /// A successful outcome, as returned by a bot handler.
    pub fn success(id: impl Into<String>) -> Self {
        let mut result = Self::blank(id, TaskStatus::Success);
        result.ended_at = Some(Utc::now());
        result
    }

    /// A failed outcome carrying the error's code and message.
    pub fn failed(id: impl Into<String>, err: &SitebotError) -> Self {
        let mut result = Self::blank(id, TaskStatus::Fail);
        result.error_code = Some(err.code().to_string());
        result.error_msg = Some(err.to_string());
        result.ended_at = Some(Utc::now());
        result
    }

    /// A task abandoned before it ran.
    pub fn canceled(
        id: impl Into<String>,
        code: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        let mut result = Self::blank(id, TaskStatus::Canceled);
        result.error_code = Some(code.into());
        result.error_msg = Some(msg.into());
        result.ended_at = Some(Utc::now());
        result
    }

    /// Add an artifact reference.
    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifacts.push(artifact.into());
        self
    }

    /// Replace the metrics bag.
    pub fn with_metrics(mut self, metrics: TaskMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Transition to `running`, stamping the start time.
    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        self.attempts += 1;
    }

    /// Whether the result can no longer change.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the task succeeded.
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }

    /// Prompt tokens recorded in the metrics, zero when absent.
    pub fn tokens_in(&self) -> u64 {
        self.metrics.tokens_in.unwrap_or(0)
    }
}
