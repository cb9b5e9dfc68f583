#![allow(clippy::unwrap_used, clippy::expect_used)]
//! End-to-end orchestration tests.
//!
//! Drives the queue, lock stores, budget ledger, fallback engine and the full
//! orchestrator pipeline through a scripted bot. Checks dedup, class limits,
//! cross-queue exclusion, dependency order, budget denial, fallback
//! preference and the fail-fast rules of each strategy.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sitebot_core::{
    ConcurrencyClass, Priority, SitebotError, SitebotResult, TaskDefinition, TaskMetrics,
    TaskResult, TaskStatus,
};
use sitebot_orchestrator::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Scripted bot: records calls, tracks peak concurrency, fails `fail*` ids
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tally {
    calls: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl Tally {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct ScriptBot {
    descriptor: BotDescriptor,
    delay: Duration,
    tally: Arc<Tally>,
}

#[async_trait]
impl Bot for ScriptBot {
    fn descriptor(&self) -> &BotDescriptor {
        &self.descriptor
    }

    async fn handle(&self, task: &TaskDefinition) -> SitebotResult<TaskResult> {
        self.tally.calls.lock().push(task.id.clone());
        let now = self.tally.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.tally.running.fetch_sub(1, Ordering::SeqCst);

        if task.id.starts_with("fail") {
            return Err(SitebotError::Handler(format!("{} broke", task.id)));
        }
        let tokens = task
            .inputs_ref
            .as_ref()
            .and_then(|v| v.get("tokens"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        Ok(TaskResult::success(&task.id)
            .with_artifact(format!("out/{}.html", task.id))
            .with_metrics(TaskMetrics::default().with_tokens(tokens, tokens / 2)))
    }
}

fn registry(concurrency: usize, delay_ms: u64) -> (Arc<BotRegistry>, Arc<Tally>) {
    let tally = Arc::new(Tally::default());
    let mut registry = BotRegistry::new();
    registry.register(Arc::new(ScriptBot {
        descriptor: BotDescriptor::new("builder", ["build", "write", "deploy"], concurrency),
        delay: Duration::from_millis(delay_ms),
        tally: Arc::clone(&tally),
    }));
    (Arc::new(registry), tally)
}

fn build(id: &str) -> TaskDefinition {
    TaskDefinition::new(id, "build").with_idempotency_key(id)
}

fn spent_today(tokens: u64) -> LedgerEntry {
    LedgerEntry {
        timestamp: Utc::now(),
        task_name: "write".into(),
        status: TaskStatus::Success,
        duration_ms: 10,
        tokens_in: tokens,
        tokens_out: 0,
        cache_hit: false,
    }
}

// ---------------------------------------------------------------------------
// Queue-level guarantees
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_duplicate_submission_shares_one_execution() {
    let (registry, tally) = registry(4, 50);
    let queue = TaskQueue::new(registry);

    let first = queue.enqueue(build("home")).await.unwrap();
    let second = queue.enqueue(build("home")).await.unwrap();
    assert!(first.same_execution(&second));

    let (a, b) = tokio::join!(first.wait(), second.wait());
    assert_eq!(a, b);
    assert_eq!(a.status, TaskStatus::Success);
    assert_eq!(tally.calls(), vec!["home"]);
}

#[tokio::test]
async fn test_cpu_class_never_exceeds_capacity() {
    let (registry, tally) = registry(16, 40);
    let config = QueueConfig::default().with_capacity(ConcurrencyClass::Cpu, 2);
    let queue = TaskQueue::builder(registry).config(config).build();

    let mut handles = Vec::new();
    for i in 0..8 {
        handles.push(queue.enqueue(build(&format!("page-{i}"))).await.unwrap());
    }
    for handle in &handles {
        assert!(handle.wait().await.is_success());
    }
    assert_eq!(tally.calls().len(), 8);
    assert!(tally.peak() <= 2, "peak was {}", tally.peak());

    // Slots are handed back after the handles settle.
    let mut snapshot = queue.snapshot();
    for _ in 0..200 {
        if snapshot.cpu.occupied() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
        snapshot = queue.snapshot();
    }
    assert_eq!(snapshot.cpu.running, 0);
    assert_eq!(snapshot.cpu.claiming, 0);
}

#[tokio::test]
async fn test_file_locks_exclude_across_queues() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileLockStore::new(dir.path()).await.unwrap());

    let (registry_a, tally_a) = registry(4, 200);
    let (registry_b, tally_b) = registry(4, 200);
    let queue_a = TaskQueue::builder(registry_a)
        .locks(LockManager::new(Arc::clone(&store) as Arc<dyn LockStore>))
        .build();
    let queue_b = TaskQueue::builder(registry_b)
        .locks(LockManager::new(store as Arc<dyn LockStore>))
        .build();

    let first = queue_a.enqueue(build("deploy-site")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = queue_b.run(build("deploy-site")).await.unwrap();

    assert_eq!(second.status, TaskStatus::Fail);
    assert_eq!(second.error_code.as_deref(), Some("LOCKED"));
    assert!(first.wait().await.is_success());
    assert_eq!(tally_a.calls().len() + tally_b.calls().len(), 1);

    // Released afterwards: the same fingerprint runs again.
    let again = queue_b.run(build("deploy-site")).await.unwrap();
    assert!(again.is_success());
}

#[tokio::test]
async fn test_handler_timeout() {
    let (registry, _) = registry(4, 500);
    let queue = TaskQueue::new(registry);
    let result = queue
        .run(build("slow").with_timeout_ms(50))
        .await
        .unwrap();
    assert_eq!(result.status, TaskStatus::Fail);
    assert_eq!(result.error_code.as_deref(), Some("TIMEOUT"));
    assert!(result.ended_at.is_some());
}

// ---------------------------------------------------------------------------
// Budget and fallback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_llm_task_denied_over_daily_cap() {
    let (registry, tally) = registry(4, 1);
    let ledger = Arc::new(BudgetLedger::from_entries(
        BudgetConfig::with_cap(6000),
        vec![spent_today(5900)],
    ));
    let queue = TaskQueue::builder(registry).ledger(ledger.clone()).build();

    let task = TaskDefinition::new("copy", "write")
        .with_class(ConcurrencyClass::Llm)
        .with_estimated_tokens(200);
    let result = queue.run(task).await.unwrap();

    assert_eq!(result.status, TaskStatus::Fail);
    assert_eq!(result.error_code.as_deref(), Some("BUDGET_EXCEEDED"));
    assert!(tally.calls().is_empty());
    assert_eq!(ledger.usage(), 5900);
}

#[tokio::test]
async fn test_fallback_preferred_below_threshold() {
    let out = tempfile::tempdir().unwrap();
    let (registry, tally) = registry(4, 1);
    let ledger = Arc::new(BudgetLedger::from_entries(
        BudgetConfig::with_cap(10_000),
        vec![spent_today(5000)],
    ));
    let queue = TaskQueue::builder(registry)
        .ledger(ledger.clone())
        .fallback(Arc::new(FallbackEngine::with_builtin_rules(out.path())))
        .build();

    let task = TaskDefinition::new("about", "write")
        .with_class(ConcurrencyClass::Llm)
        .with_estimated_tokens(800)
        .with_inputs(serde_json::json!({"slug": "About Us", "title": "About"}))
        .with_fallback_rule("page-stub");
    let result = queue.run(task).await.unwrap();

    assert!(result.is_success());
    assert_eq!(result.metrics.fallback_used, Some(true));
    assert_eq!(result.metrics.rule_applied.as_deref(), Some("page-stub"));
    assert_eq!(result.metrics.duration_ms, Some(FALLBACK_DURATION_MS));
    assert_eq!(result.metrics.tokens_in, None);
    assert!(tally.calls().is_empty());
    assert!(out.path().join("pages/about-us.md").exists());
    assert_eq!(ledger.usage(), 5000);
}

#[tokio::test]
async fn test_usage_persists_to_metrics_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("metrics.jsonl");
    let (registry, _) = registry(4, 1);
    let ledger = Arc::new(
        BudgetLedger::open(BudgetConfig::with_cap(50_000), &path)
            .await
            .unwrap(),
    );
    let queue = TaskQueue::builder(registry).ledger(ledger.clone()).build();

    let task = TaskDefinition::new("hero-copy", "write")
        .with_class(ConcurrencyClass::Llm)
        .with_estimated_tokens(1000)
        .with_inputs(serde_json::json!({"tokens": 700}));
    assert!(queue.run(task).await.unwrap().is_success());
    ledger.flush().await;

    let entries = MetricsLog::read_entries(&path).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].task_name, "write");
    assert_eq!(entries[0].tokens_in, 700);
    assert_eq!(entries[0].tokens_out, 350);

    let reopened = BudgetLedger::open(BudgetConfig::with_cap(50_000), &path)
        .await
        .unwrap();
    assert_eq!(reopened.usage(), 700);
    assert_eq!(reopened.remaining(), 49_300);
}

// ---------------------------------------------------------------------------
// Full pipeline
// ---------------------------------------------------------------------------

fn orchestrator(registry: Arc<BotRegistry>) -> Orchestrator {
    let queue = TaskQueue::new(Arc::clone(&registry));
    Orchestrator::new(registry, queue, OrchestratorConfig::default())
}

#[tokio::test]
async fn test_dependency_chain_runs_in_order() {
    let (registry, tally) = registry(4, 5);
    let orchestrator = orchestrator(registry);
    let result = orchestrator
        .run(vec![
            build("C").with_dependencies(["B"]),
            build("A"),
            build("B").with_dependencies(["A"]),
        ])
        .await
        .unwrap();

    assert_eq!(result.plan.execution_order, vec!["A", "B", "C"]);
    assert_eq!(tally.calls(), vec!["A", "B", "C"]);
    assert!(result.report.all_succeeded());
    assert!(result.decision.rationale.contains("1 bots available"));
}

#[tokio::test]
async fn test_sequential_abandons_after_high_priority_failure() {
    let (registry, tally) = registry(4, 1);
    let orchestrator = orchestrator(registry);
    let tasks = vec![
        build("one"),
        build("fail-two").with_priority(Priority::High),
        build("three"),
        build("four"),
    ];
    let result = orchestrator
        .run_with_strategy(tasks, ExecutionStrategy::Sequential)
        .await
        .unwrap();

    assert_eq!(tally.calls(), vec!["one", "fail-two"]);
    let report = &result.report;
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.canceled, 2);
    for id in ["three", "four"] {
        let skipped = report.result(id).unwrap();
        assert_eq!(skipped.status, TaskStatus::Canceled);
        assert_eq!(skipped.error_code.as_deref(), Some(ABANDONED_CODE));
        assert_eq!(skipped.attempts, 0);
    }
}

#[tokio::test]
async fn test_batch_keeps_going_after_failure() {
    let (registry, tally) = registry(4, 1);
    let orchestrator = orchestrator(registry);
    let tasks = vec![
        build("one"),
        build("fail-two").with_priority(Priority::High),
        build("three"),
        build("four"),
    ];
    let result = orchestrator
        .run_with_strategy(tasks, ExecutionStrategy::Batch)
        .await
        .unwrap();

    assert_eq!(tally.calls().len(), 4);
    assert_eq!(result.report.completed, 3);
    assert_eq!(result.report.failed, 1);
    assert_eq!(
        result.report.result("fail-two").unwrap().error_code.as_deref(),
        Some("HANDLER_FAILURE")
    );
}

#[tokio::test]
async fn test_cycle_rejected_before_execution() {
    let (registry, tally) = registry(4, 1);
    let orchestrator = orchestrator(registry);
    let err = orchestrator
        .run(vec![
            build("a").with_dependencies(["c"]),
            build("b").with_dependencies(["a"]),
            build("c").with_dependencies(["b"]),
        ])
        .await
        .unwrap_err();

    match err {
        SitebotError::CycleDetected(ids) => assert_eq!(ids, vec!["a", "b", "c"]),
        other => panic!("expected cycle, got {other:?}"),
    }
    assert!(tally.calls().is_empty());
}

#[tokio::test]
async fn test_many_tasks_are_batched() {
    let (registry, tally) = registry(8, 1);
    let orchestrator = orchestrator(registry);
    let tasks: Vec<TaskDefinition> = (0..7).map(|i| build(&format!("page-{i}"))).collect();
    let result = orchestrator.run(tasks).await.unwrap();

    assert_eq!(result.decision.strategy, ExecutionStrategy::Batch);
    assert_eq!(result.report.strategy, ExecutionStrategy::Batch);
    assert!(result.report.all_succeeded());
    assert_eq!(tally.calls().len(), 7);

    // One sample before planning, one after the report.
    assert_eq!(orchestrator.monitor().recent(10).await.len(), 2);
}
