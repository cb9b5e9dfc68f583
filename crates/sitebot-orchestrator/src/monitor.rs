use crate::budget::BudgetLedger;
use crate::task_queue::{QueueSnapshot, TaskQueue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

const HISTORY_LIMIT: usize = 256;

/// Live resource readings the decision engine works from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceTelemetry {
    /// When the sample was taken.
    pub sampled_at: DateTime<Utc>,
    /// `cpu` running / capacity.
    pub cpu_utilization: f64,
    /// `io` running / capacity.
    pub io_utilization: f64,
    /// `llm` running / capacity.
    pub llm_utilization: f64,
    /// Tokens left under today's cap.
    pub remaining_tokens: u64,
    /// Fingerprints queued or running.
    pub in_flight: usize,
    /// Tasks waiting in the lanes.
    pub queued: usize,
}

impl ResourceTelemetry {
    /// Telemetry from a snapshot and budget headroom.
    pub fn from_snapshot(snapshot: &QueueSnapshot, remaining_tokens: u64) -> Self {
        Self {
            sampled_at: Utc::now(),
            cpu_utilization: snapshot.cpu.utilization(),
            io_utilization: snapshot.io.utilization(),
            llm_utilization: snapshot.llm.utilization(),
            remaining_tokens,
            in_flight: snapshot.in_flight,
            queued: snapshot.queued_total(),
        }
    }
}

/// Samples queue load and budget headroom, keeping a bounded history.
pub struct ResourceMonitor {
    queue: TaskQueue,
    ledger: Arc<BudgetLedger>,
    history: Arc<RwLock<VecDeque<ResourceTelemetry>>>,
}

impl ResourceMonitor {
    /// Monitor over `queue` and its ledger.
    pub fn new(queue: TaskQueue) -> Self {
        let ledger = Arc::clone(queue.ledger());
        Self {
            queue,
            ledger,
            history: Arc::new(RwLock::new(VecDeque::new())),
        }
    }

    /// Current queue snapshot.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    /// Take a reading and append it to the history.
    pub async fn sample(&self) -> ResourceTelemetry {
        let telemetry =
            ResourceTelemetry::from_snapshot(&self.queue.snapshot(), self.ledger.remaining());
        let mut history = self.history.write().await;
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(telemetry.clone());
        telemetry
    }

    /// Most recent reading, if any.
    pub async fn latest(&self) -> Option<ResourceTelemetry> {
        self.history.read().await.back().cloned()
    }

    /// Up to `n` most recent readings, oldest first.
    pub async fn recent(&self, n: usize) -> Vec<ResourceTelemetry> {
        let history = self.history.read().await;
        let skip = history.len().saturating_sub(n);
        history.iter().skip(skip).cloned().collect()
    }

    /// Highest utilization seen per class across the history.
    pub async fn peak_utilization(&self) -> (f64, f64, f64) {
        let history = self.history.read().await;
        history.iter().fold((0.0, 0.0, 0.0), |(cpu, io, llm), t| {
            (
                f64::max(cpu, t.cpu_utilization),
                f64::max(io, t.io_utilization),
                f64::max(llm, t.llm_utilization),
            )
        })
    }

    /// Latest reading, peak utilization, queue snapshot and today's budget
    /// summary as JSON.
    pub async fn to_json(&self) -> serde_json::Value {
        let latest = self.latest().await;
        let (cpu, io, llm) = self.peak_utilization().await;
        serde_json::json!({
            "telemetry": latest,
            "peak": { "cpu": cpu, "io": io, "llm": llm },
            "queue": self.queue.snapshot(),
            "budget": self.ledger.summary(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::BudgetConfig;
    use crate::registry::BotRegistry;
    use crate::task_queue::ClassLoad;

    #[test]
    fn test_telemetry_from_snapshot() {
        let snapshot = QueueSnapshot {
            cpu: ClassLoad {
                running: 3,
                claiming: 0,
                capacity: 4,
            },
            io: ClassLoad {
                running: 1,
                claiming: 0,
                capacity: 8,
            },
            llm: ClassLoad {
                running: 0,
                claiming: 0,
                capacity: 0,
            },
            queued: [1, 2, 0],
            in_flight: 6,
            ..QueueSnapshot::default()
        };
        let t = ResourceTelemetry::from_snapshot(&snapshot, 42);
        assert!((t.cpu_utilization - 0.75).abs() < f64::EPSILON);
        assert!((t.io_utilization - 0.125).abs() < f64::EPSILON);
        assert_eq!(t.llm_utilization, 0.0);
        assert_eq!(t.queued, 3);
        assert_eq!(t.remaining_tokens, 42);
    }

    #[tokio::test]
    async fn test_sample_history() {
        let ledger = Arc::new(BudgetLedger::in_memory(BudgetConfig::with_cap(500)));
        let queue = TaskQueue::builder(Arc::new(BotRegistry::new()))
            .ledger(ledger)
            .build();
        let monitor = ResourceMonitor::new(queue);

        assert!(monitor.latest().await.is_none());
        let first = monitor.sample().await;
        assert_eq!(first.remaining_tokens, 500);
        assert_eq!(first.cpu_utilization, 0.0);
        monitor.sample().await;

        assert_eq!(monitor.recent(10).await.len(), 2);
        assert_eq!(monitor.recent(1).await.len(), 1);
        assert_eq!(monitor.peak_utilization().await, (0.0, 0.0, 0.0));

        let json = monitor.to_json().await;
        assert_eq!(json["budget"]["remainingTokens"], 500);
        assert_eq!(json["telemetry"]["remainingTokens"], 500);
        assert_eq!(json["peak"]["cpu"], 0.0);
        assert_eq!(json["queue"]["inFlight"], 0);
    }
}
