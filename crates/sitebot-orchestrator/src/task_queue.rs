use crate::budget::{BudgetConfig, BudgetLedger};
use crate::fallback::FallbackEngine;
use crate::lock::LockManager;
use crate::registry::{Bot, BotRegistry};
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sitebot_core::{
    ConcurrencyClass, Priority, SitebotError, SitebotResult, TaskDefinition, TaskResult,
    TaskStatus,
};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Error code for tasks dropped from the lanes at shutdown.
pub const SHUTDOWN_CODE: &str = "SHUTDOWN";

fn default_cpu_capacity() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
        .saturating_sub(2)
        .max(1)
}

/// Per-class capacities and lock TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Concurrent `cpu` tasks. Defaults to logical cores minus two, at least one.
    pub cpu_capacity: usize,
    /// Concurrent `io` tasks. Defaults to twice the cpu capacity.
    pub io_capacity: usize,
    /// Concurrent `llm` tasks, on top of budget admission.
    pub llm_capacity: usize,
    /// TTL of the per-fingerprint execution lock.
    pub lock_ttl: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let cpu = default_cpu_capacity();
        Self {
            cpu_capacity: cpu,
            io_capacity: cpu * 2,
            llm_capacity: cpu * 2,
            lock_ttl: Duration::from_secs(300),
        }
    }
}

impl QueueConfig {
    /// Capacity of `class`.
    pub fn capacity(&self, class: ConcurrencyClass) -> usize {
        match class {
            ConcurrencyClass::Cpu => self.cpu_capacity,
            ConcurrencyClass::Io => self.io_capacity,
            ConcurrencyClass::Llm => self.llm_capacity,
        }
    }

    /// Override the capacity of `class` (floored at one).
    pub fn with_capacity(mut self, class: ConcurrencyClass, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        match class {
            ConcurrencyClass::Cpu => self.cpu_capacity = capacity,
            ConcurrencyClass::Io => self.io_capacity = capacity,
            ConcurrencyClass::Llm => self.llm_capacity = capacity,
        }
        self
    }
}

/// Running count against capacity for one class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassLoad {
    /// Tasks holding their lock and executing.
    pub running: usize,
    /// Admitted tasks still acquiring their lock. They hold a slot until
    /// the lock is theirs or is handed back.
    #[serde(default)]
    pub claiming: usize,
    /// Slots available in total.
    pub capacity: usize,
}

impl ClassLoad {
    /// `running / capacity`, zero for an empty class.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.running as f64 / self.capacity as f64
        }
    }

    /// Slots taken, running or claiming.
    pub fn occupied(&self) -> usize {
        self.running + self.claiming
    }

    /// Whether another task may start.
    pub fn has_capacity(&self) -> bool {
        self.occupied() < self.capacity
    }
}

/// Point-in-time view of the queue, published after every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    /// `cpu` class load.
    pub cpu: ClassLoad,
    /// `io` class load.
    pub io: ClassLoad,
    /// `llm` class load.
    pub llm: ClassLoad,
    /// Waiting tasks per lane, in drain order.
    pub queued: [usize; 3],
    /// Distinct fingerprints queued or running.
    pub in_flight: usize,
    /// Executions per bot name, including those still acquiring a lock.
    pub bot_running: HashMap<String, usize>,
}

impl QueueSnapshot {
    /// Load of `class`.
    pub fn class(&self, class: ConcurrencyClass) -> &ClassLoad {
        match class {
            ConcurrencyClass::Cpu => &self.cpu,
            ConcurrencyClass::Io => &self.io,
            ConcurrencyClass::Llm => &self.llm,
        }
    }

    /// Waiting tasks across all lanes.
    pub fn queued_total(&self) -> usize {
        self.queued.iter().sum()
    }

    /// Running tasks across all classes.
    pub fn running_total(&self) -> usize {
        self.cpu.running + self.io.running + self.llm.running
    }

    /// Running executions of `bot`.
    pub fn running_for(&self, bot: &str) -> usize {
        self.bot_running.get(bot).copied().unwrap_or(0)
    }
}

/// Shared view of one execution's result.
///
/// Every submission with the same fingerprint while the first is in flight
/// receives a clone of the same handle.
#[derive(Clone)]
pub struct TaskHandle {
    cell: Arc<watch::Sender<TaskResult>>,
}

impl TaskHandle {
    fn new(id: &str) -> Self {
        let (tx, _) = watch::channel(TaskResult::queued(id));
        Self { cell: Arc::new(tx) }
    }

    /// Id of the task that created this execution.
    pub fn id(&self) -> String {
        self.cell.borrow().id.clone()
    }

    /// Latest state of the result.
    pub fn current(&self) -> TaskResult {
        self.cell.borrow().clone()
    }

    /// Wait until the result is terminal.
    pub async fn wait(&self) -> TaskResult {
        let mut rx = self.cell.subscribe();
        loop {
            {
                let current = rx.borrow_and_update();
                if current.is_terminal() {
                    return current.clone();
                }
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    /// Whether both handles observe the same execution.
    pub fn same_execution(&self, other: &TaskHandle) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }

    fn mark_running(&self) {
        self.cell.send_modify(TaskResult::mark_running);
    }

    /// Merge the queue-owned fields (id, start time, attempts) into a
    /// handler's result.
    fn finalize(&self, mut result: TaskResult) -> TaskResult {
        {
            let current = self.cell.borrow();
            result.id.clone_from(&current.id);
            result.started_at = current.started_at.or(result.started_at);
            result.attempts = current.attempts.max(result.attempts);
        }
        if result.ended_at.is_none() {
            result.ended_at = Some(Utc::now());
        }
        result
    }

    fn publish(&self, result: TaskResult) {
        self.cell.send_replace(result);
    }

    fn settle(&self, result: TaskResult) -> TaskResult {
        let result = self.finalize(result);
        self.publish(result.clone());
        result
    }
}

enum Mode {
    Bot(Arc<dyn Bot>),
    Fallback(String),
}

struct Job {
    task: Arc<TaskDefinition>,
    key: String,
    handle: TaskHandle,
}

enum Admission {
    Start(Mode),
    Blocked,
    Reject(SitebotError),
}

enum QueueCommand {
    Submit {
        task: TaskDefinition,
        key: String,
        reply: oneshot::Sender<TaskHandle>,
    },
    /// The execution holds its lock; its claim becomes a running slot.
    Claimed {
        class: ConcurrencyClass,
        bot: Option<String>,
    },
    /// The lock was taken by someone else; the claim is handed back.
    LockDenied {
        key: String,
        class: ConcurrencyClass,
        bot: Option<String>,
    },
    Finished {
        key: String,
        class: ConcurrencyClass,
        bot: Option<String>,
    },
    Shutdown,
}

/// Tasks holding capacity: `claiming` are still acquiring their lock.
#[derive(Debug, Clone, Copy, Default)]
struct Occupancy {
    claiming: usize,
    running: usize,
}

impl Occupancy {
    fn total(&self) -> usize {
        self.claiming + self.running
    }

    fn claimed(&mut self) {
        self.claiming = self.claiming.saturating_sub(1);
        self.running += 1;
    }
}

/// One admitted execution's hold on the queue.
///
/// Dropping it settles the handle if nothing else did, returns any `llm`
/// reservation and tells the loop to free the slot, whether the execution
/// finished, lost its lock or unwound.
struct Slot {
    tx: mpsc::UnboundedSender<QueueCommand>,
    key: String,
    class: ConcurrencyClass,
    bot: Option<String>,
    handle: TaskHandle,
    reservation: Option<(Arc<BudgetLedger>, Arc<TaskDefinition>)>,
    running: bool,
}

impl Slot {
    fn mark_claimed(&mut self) {
        self.running = true;
        let _ = self.tx.send(QueueCommand::Claimed {
            class: self.class,
            bot: self.bot.clone(),
        });
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if !self.handle.current().is_terminal() {
            let id = self.handle.id();
            warn!(task_id = %id, "Execution ended without settling");
            self.handle.settle(TaskResult::failed(
                &id,
                &SitebotError::Handler("execution aborted before settling".into()),
            ));
        }
        if let Some((ledger, task)) = self.reservation.take() {
            ledger.release(&task);
        }
        let key = std::mem::take(&mut self.key);
        let class = self.class;
        let bot = self.bot.take();
        let cmd = if self.running {
            QueueCommand::Finished { key, class, bot }
        } else {
            QueueCommand::LockDenied { key, class, bot }
        };
        let _ = self.tx.send(cmd);
    }
}

/// Collaborators shared by the loop and every spawned execution.
struct Executor {
    registry: Arc<BotRegistry>,
    locks: LockManager,
    ledger: Arc<BudgetLedger>,
    fallback: Option<Arc<FallbackEngine>>,
    lock_ttl: Duration,
}

impl Executor {
    /// The fallback rule to run instead of the bot, if policy prefers one.
    fn fallback_rule(&self, task: &TaskDefinition) -> Option<String> {
        let engine = self.fallback.as_ref()?;
        if !self.ledger.should_prefer_fallback(task) {
            return None;
        }
        engine.select_rule(task).map(str::to_string)
    }

    async fn execute(&self, job: Job, mode: Mode, mut slot: Slot) {
        let Job { task, key, handle } = job;

        let result = match self.locks.acquire(&key, self.lock_ttl).await {
            Err(e) => {
                warn!(task_id = %task.id, key = %key, error = %e, "Fingerprint locked, execution skipped");
                TaskResult::failed(&task.id, &e)
            }
            Ok(guard) => {
                slot.mark_claimed();
                handle.mark_running();
                debug!(task_id = %task.id, class = %task.concurrency_class, "Task running");
                let started = Instant::now();
                let result = match &mode {
                    Mode::Fallback(rule) => self.run_fallback(rule, Arc::clone(&task)).await,
                    Mode::Bot(bot) => {
                        let mut result = run_bot(Arc::clone(bot), Arc::clone(&task)).await;
                        result.metrics.duration_ms = Some(started.elapsed().as_millis() as u64);
                        result
                    }
                };
                if let Err(e) = guard.release().await {
                    warn!(key = %key, error = %e, "Lock release failed");
                }
                result
            }
        };

        let result = handle.finalize(result);
        self.ledger.record_usage(&task, &result);
        info!(
            task_id = %task.id,
            status = %result.status,
            error_code = result.error_code.as_deref().unwrap_or(""),
            duration_ms = result.metrics.duration_ms.unwrap_or(0),
            "Task settled"
        );
        handle.publish(result);
        drop(slot);
    }

    async fn run_fallback(&self, rule: &str, task: Arc<TaskDefinition>) -> TaskResult {
        let Some(engine) = self.fallback.clone() else {
            return TaskResult::failed(&task.id, &SitebotError::NoFallbackRule(rule.to_string()));
        };
        let id = task.id.clone();
        let timeout_ms = task.timeout_ms;
        let rule = rule.to_string();
        match contained(&id, timeout_ms, async move { engine.execute_rule(&rule, &task).await })
            .await
        {
            Ok(Ok(result)) => result,
            Ok(Err(e)) | Err(e) => TaskResult::failed(&id, &e),
        }
    }
}

/// Run `work` in its own task so panics and deadlines stay contained.
/// The outer error is a panic or a timeout; the inner one is the work's own.
async fn contained<F>(
    id: &str,
    timeout_ms: u64,
    work: F,
) -> Result<SitebotResult<TaskResult>, SitebotError>
where
    F: Future<Output = SitebotResult<TaskResult>> + Send + 'static,
{
    let mut join = tokio::spawn(work);

    match tokio::time::timeout(Duration::from_millis(timeout_ms), &mut join).await {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(join_err)) => {
            let msg = if join_err.is_panic() {
                let payload = join_err.into_panic();
                payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string())
            } else {
                "task was cancelled".to_string()
            };
            warn!(task_id = %id, panic = %msg, "Task execution panicked");
            Err(SitebotError::Handler(format!("handler panicked: {msg}")))
        }
        Err(_) => {
            join.abort();
            warn!(task_id = %id, timeout_ms, "Task execution timed out");
            Err(SitebotError::Timeout { ms: timeout_ms })
        }
    }
}

async fn run_bot(bot: Arc<dyn Bot>, task: Arc<TaskDefinition>) -> TaskResult {
    let id = task.id.clone();
    let timeout_ms = task.timeout_ms;

    match contained(&id, timeout_ms, async move { bot.handle(&task).await }).await {
        Ok(Ok(mut result)) => {
            if !result.is_terminal() {
                result.status = TaskStatus::Success;
            }
            result
        }
        Ok(Err(e)) => {
            let err = match e {
                SitebotError::Handler(_) => e,
                other => SitebotError::Handler(other.to_string()),
            };
            TaskResult::failed(&id, &err)
        }
        Err(e) => TaskResult::failed(&id, &e),
    }
}

/// The single owner of lanes, counters and the in-flight map.
struct EventLoop {
    rx: mpsc::UnboundedReceiver<QueueCommand>,
    tx: mpsc::UnboundedSender<QueueCommand>,
    exec: Arc<Executor>,
    config: QueueConfig,
    lanes: [VecDeque<Job>; 3],
    in_flight: HashMap<String, TaskHandle>,
    classes: [Occupancy; 3],
    bots: HashMap<String, Occupancy>,
    snapshot: Arc<RwLock<QueueSnapshot>>,
    closing: bool,
}

impl EventLoop {
    async fn run(mut self) {
        self.publish();
        while let Some(cmd) = self.rx.recv().await {
            let mut accepted = None;
            match cmd {
                QueueCommand::Submit { task, key, reply } => {
                    accepted = Some((reply, self.submit(task, key)));
                }
                QueueCommand::Claimed { class, bot } => self.claimed(class, bot),
                QueueCommand::LockDenied { key, class, bot } => {
                    self.release(&key, class, bot, false)
                }
                QueueCommand::Finished { key, class, bot } => self.release(&key, class, bot, true),
                QueueCommand::Shutdown => self.begin_shutdown(),
            }
            if !self.closing {
                self.drain();
            }
            self.publish();
            // Reply only once the submission is reflected in the snapshot.
            if let Some((reply, handle)) = accepted {
                let _ = reply.send(handle);
            }
            if self.closing && self.classes.iter().all(|c| c.total() == 0) {
                break;
            }
        }
        debug!("Task queue loop stopped");
    }

    fn submit(&mut self, task: TaskDefinition, key: String) -> TaskHandle {
        // A terminal handle may linger until its slot is released.
        if let Some(existing) = self.in_flight.get(&key) {
            if !existing.current().is_terminal() {
                debug!(task_id = %task.id, key = %key, "Duplicate submission joined in-flight execution");
                return existing.clone();
            }
        }
        let handle = TaskHandle::new(&task.id);
        if self.closing {
            handle.settle(TaskResult::canceled(
                &task.id,
                SHUTDOWN_CODE,
                "task queue is shutting down",
            ));
            return handle;
        }
        debug!(task_id = %task.id, priority = %task.priority, class = %task.concurrency_class, "Task queued");
        self.in_flight.insert(key.clone(), handle.clone());
        self.lanes[task.priority.index()].push_back(Job {
            task: Arc::new(task),
            key,
            handle: handle.clone(),
        });
        handle
    }

    fn claimed(&mut self, class: ConcurrencyClass, bot: Option<String>) {
        self.classes[class.index()].claimed();
        if let Some(bot) = bot {
            if let Some(load) = self.bots.get_mut(&bot) {
                load.claimed();
            }
        }
    }

    /// Free a slot. `ran` tells a finished execution from a lock denial.
    fn release(&mut self, key: &str, class: ConcurrencyClass, bot: Option<String>, ran: bool) {
        let free = |load: &mut Occupancy| {
            if ran {
                load.running = load.running.saturating_sub(1);
            } else {
                load.claiming = load.claiming.saturating_sub(1);
            }
        };
        free(&mut self.classes[class.index()]);
        if let Some(bot) = bot {
            if let Some(load) = self.bots.get_mut(&bot) {
                free(load);
                if load.total() == 0 {
                    self.bots.remove(&bot);
                }
            }
        }
        if self
            .in_flight
            .get(key)
            .is_some_and(|h| h.current().is_terminal())
        {
            self.in_flight.remove(key);
        }
    }

    /// Drain lanes in priority order. A task blocked on capacity goes back
    /// to the head of its lane and draining moves to the next lane.
    fn drain(&mut self) {
        for priority in Priority::ALL {
            let lane = priority.index();
            while let Some(job) = self.lanes[lane].pop_front() {
                match self.admit(&job.task) {
                    Admission::Start(mode) => self.start(job, mode),
                    Admission::Blocked => {
                        self.lanes[lane].push_front(job);
                        break;
                    }
                    Admission::Reject(err) => self.reject(job, &err),
                }
            }
        }
    }

    fn admit(&self, task: &TaskDefinition) -> Admission {
        let class = task.concurrency_class;
        let mode = match self.exec.fallback_rule(task) {
            Some(rule) => Mode::Fallback(rule),
            None => match self.exec.registry.route(&task.name) {
                Some(bot) => Mode::Bot(bot),
                None => return Admission::Reject(SitebotError::BotNotFound(task.name.clone())),
            },
        };
        if self.classes[class.index()].total() >= self.config.capacity(class) {
            return Admission::Blocked;
        }
        if let Mode::Bot(bot) = &mode {
            let descriptor = bot.descriptor();
            let bot_load = self
                .bots
                .get(&descriptor.name)
                .map_or(0, Occupancy::total);
            if bot_load >= descriptor.concurrency {
                return Admission::Blocked;
            }
            if class == ConcurrencyClass::Llm {
                if let Err(e) = self.exec.ledger.reserve(task) {
                    return Admission::Reject(e);
                }
            }
        }
        Admission::Start(mode)
    }

    fn start(&mut self, job: Job, mode: Mode) {
        let class = job.task.concurrency_class;
        self.classes[class.index()].claiming += 1;
        let (bot, reservation) = match &mode {
            Mode::Bot(bot) => {
                let name = bot.descriptor().name.clone();
                self.bots.entry(name.clone()).or_default().claiming += 1;
                let reservation = (class == ConcurrencyClass::Llm)
                    .then(|| (Arc::clone(&self.exec.ledger), Arc::clone(&job.task)));
                (Some(name), reservation)
            }
            Mode::Fallback(_) => (None, None),
        };

        let slot = Slot {
            tx: self.tx.clone(),
            key: job.key.clone(),
            class,
            bot,
            handle: job.handle.clone(),
            reservation,
            running: false,
        };
        let exec = Arc::clone(&self.exec);
        tokio::spawn(async move { exec.execute(job, mode, slot).await });
    }

    fn reject(&mut self, job: Job, err: &SitebotError) {
        warn!(task_id = %job.task.id, code = err.code(), error = %err, "Task rejected before start");
        let result = job.handle.settle(TaskResult::failed(&job.task.id, err));
        self.exec.ledger.record_usage(&job.task, &result);
        self.in_flight.remove(&job.key);
    }

    fn begin_shutdown(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let mut dropped = 0usize;
        for lane in &mut self.lanes {
            for job in lane.drain(..) {
                job.handle.settle(TaskResult::canceled(
                    &job.task.id,
                    SHUTDOWN_CODE,
                    "task queue is shutting down",
                ));
                self.in_flight.remove(&job.key);
                dropped += 1;
            }
        }
        info!(dropped, "Task queue shutting down");
    }

    fn publish(&self) {
        let load = |class: ConcurrencyClass| {
            let occupancy = self.classes[class.index()];
            ClassLoad {
                running: occupancy.running,
                claiming: occupancy.claiming,
                capacity: self.config.capacity(class),
            }
        };
        let snapshot = QueueSnapshot {
            cpu: load(ConcurrencyClass::Cpu),
            io: load(ConcurrencyClass::Io),
            llm: load(ConcurrencyClass::Llm),
            queued: [
                self.lanes[0].len(),
                self.lanes[1].len(),
                self.lanes[2].len(),
            ],
            in_flight: self.in_flight.len(),
            bot_running: self
                .bots
                .iter()
                .map(|(name, load)| (name.clone(), load.total()))
                .collect(),
        };
        *self.snapshot.write() = snapshot;
    }
}

struct QueueInner {
    tx: mpsc::UnboundedSender<QueueCommand>,
    snapshot: Arc<RwLock<QueueSnapshot>>,
    ledger: Arc<BudgetLedger>,
    config: QueueConfig,
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        let _ = self.tx.send(QueueCommand::Shutdown);
    }
}

/// Priority-laned, class-gated task execution engine.
///
/// All mutable scheduling state lives in one event-loop task fed by a
/// channel; `enqueue` and completions are both just messages to it.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    /// Queue over `registry` with default config, in-memory locks, an
    /// in-memory ledger and no fallback rules. Must be called inside a
    /// Tokio runtime.
    pub fn new(registry: Arc<BotRegistry>) -> Self {
        Self::builder(registry).build()
    }

    /// Start configuring a queue.
    pub fn builder(registry: Arc<BotRegistry>) -> TaskQueueBuilder {
        TaskQueueBuilder {
            registry,
            config: QueueConfig::default(),
            locks: None,
            ledger: None,
            fallback: None,
        }
    }

    /// Submit a task. Returns the handle of the existing execution when the
    /// same fingerprint is already in flight.
    pub async fn enqueue(&self, task: TaskDefinition) -> SitebotResult<TaskHandle> {
        task.validate()?;
        let key = task.resolved_key();
        let (reply, handle) = oneshot::channel();
        self.inner
            .tx
            .send(QueueCommand::Submit { task, key, reply })
            .map_err(|_| SitebotError::Orchestrator("task queue is closed".into()))?;
        handle
            .await
            .map_err(|_| SitebotError::Orchestrator("task queue dropped the submission".into()))
    }

    /// Submit and wait for the terminal result.
    pub async fn run(&self, task: TaskDefinition) -> SitebotResult<TaskResult> {
        Ok(self.enqueue(task).await?.wait().await)
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.inner.snapshot.read().clone()
    }

    /// The ledger consulted for `llm` admission.
    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.inner.ledger
    }

    /// Capacities in force.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Cancel queued tasks and stop once running ones finish.
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(QueueCommand::Shutdown);
    }
}

/// Builder for [`TaskQueue`].
pub struct TaskQueueBuilder {
    registry: Arc<BotRegistry>,
    config: QueueConfig,
    locks: Option<LockManager>,
    ledger: Option<Arc<BudgetLedger>>,
    fallback: Option<Arc<FallbackEngine>>,
}

impl TaskQueueBuilder {
    /// Capacities and lock TTL.
    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Lock manager guarding each fingerprint.
    pub fn locks(mut self, locks: LockManager) -> Self {
        self.locks = Some(locks);
        self
    }

    /// Budget ledger for `llm` admission and usage recording.
    pub fn ledger(mut self, ledger: Arc<BudgetLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Fallback engine substituted for bots when policy prefers it.
    pub fn fallback(mut self, fallback: Arc<FallbackEngine>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Spawn the event loop and return the queue.
    pub fn build(self) -> TaskQueue {
        let ledger = self
            .ledger
            .unwrap_or_else(|| Arc::new(BudgetLedger::in_memory(BudgetConfig::default())));
        let exec = Arc::new(Executor {
            registry: self.registry,
            locks: self.locks.unwrap_or_else(LockManager::in_memory),
            ledger: Arc::clone(&ledger),
            fallback: self.fallback,
            lock_ttl: self.config.lock_ttl,
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let snapshot = Arc::new(RwLock::new(QueueSnapshot::default()));

        let event_loop = EventLoop {
            rx,
            tx: tx.clone(),
            exec,
            config: self.config,
            lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
            in_flight: HashMap::new(),
            classes: [Occupancy::default(); 3],
            bots: HashMap::new(),
            snapshot: Arc::clone(&snapshot),
            closing: false,
        };
        info!(
            cpu = self.config.cpu_capacity,
            io = self.config.io_capacity,
            llm = self.config.llm_capacity,
            "Task queue started"
        );
        tokio::spawn(event_loop.run());

        TaskQueue {
            inner: Arc::new(QueueInner {
                tx,
                snapshot,
                ledger,
                config: self.config,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fallback::FallbackArtifact;
    use crate::lock::{LockStore, MemoryLockStore};
    use crate::registry::BotDescriptor;
    use async_trait::async_trait;
    use sitebot_core::TaskMetrics;
    use tokio::sync::{Notify, Semaphore};

    /// Records start order and blocks until the test hands out permits.
    struct GateBot {
        descriptor: BotDescriptor,
        gate: Arc<Semaphore>,
        started: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Bot for GateBot {
        fn descriptor(&self) -> &BotDescriptor {
            &self.descriptor
        }

        async fn handle(&self, task: &TaskDefinition) -> SitebotResult<TaskResult> {
            self.started.lock().push(task.id.clone());
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| SitebotError::Handler(e.to_string()))?;
            permit.forget();
            Ok(TaskResult::success(&task.id).with_artifact(format!("out/{}", task.id)))
        }
    }

    struct FnBot<F> {
        descriptor: BotDescriptor,
        f: F,
    }

    #[async_trait]
    impl<F> Bot for FnBot<F>
    where
        F: Fn(&TaskDefinition) -> SitebotResult<TaskResult> + Send + Sync,
    {
        fn descriptor(&self) -> &BotDescriptor {
            &self.descriptor
        }

        async fn handle(&self, task: &TaskDefinition) -> SitebotResult<TaskResult> {
            (self.f)(task)
        }
    }

    fn gate_registry(
        accepts: &[&str],
        concurrency: usize,
    ) -> (
        Arc<BotRegistry>,
        Arc<Semaphore>,
        Arc<parking_lot::Mutex<Vec<String>>>,
    ) {
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut registry = BotRegistry::new();
        registry.register(Arc::new(GateBot {
            descriptor: BotDescriptor::new("gate", accepts.iter().copied(), concurrency),
            gate: Arc::clone(&gate),
            started: Arc::clone(&started),
        }));
        (Arc::new(registry), gate, started)
    }

    fn fn_registry<F>(name: &str, f: F) -> Arc<BotRegistry>
    where
        F: Fn(&TaskDefinition) -> SitebotResult<TaskResult> + Send + Sync + 'static,
    {
        let mut registry = BotRegistry::new();
        registry.register(Arc::new(FnBot {
            descriptor: BotDescriptor::new("fn", [name], 8),
            f,
        }));
        Arc::new(registry)
    }

    /// Treats `contended` as held elsewhere, answering only once notified.
    struct SlowDenyStore {
        inner: MemoryLockStore,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl LockStore for SlowDenyStore {
        async fn try_claim(&self, key: &str, owner: &str, ttl: Duration) -> SitebotResult<bool> {
            if key == "contended" {
                self.gate.notified().await;
                return Ok(false);
            }
            self.inner.try_claim(key, owner, ttl).await
        }

        async fn release(&self, key: &str, owner: &str) -> SitebotResult<()> {
            self.inner.release(key, owner).await
        }
    }

    /// Wait for every slot and in-flight entry to be released.
    async fn idle(queue: &TaskQueue) -> QueueSnapshot {
        for _ in 0..200 {
            let snapshot = queue.snapshot();
            let occupied =
                snapshot.cpu.occupied() + snapshot.io.occupied() + snapshot.llm.occupied();
            if occupied == 0 && snapshot.in_flight == 0 {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        queue.snapshot()
    }

    fn single_slot() -> QueueConfig {
        QueueConfig::default()
            .with_capacity(ConcurrencyClass::Cpu, 1)
            .with_capacity(ConcurrencyClass::Io, 1)
            .with_capacity(ConcurrencyClass::Llm, 1)
    }

    #[test]
    fn test_default_capacities() {
        let config = QueueConfig::default();
        assert!(config.cpu_capacity >= 1);
        assert_eq!(config.io_capacity, config.cpu_capacity * 2);
        assert_eq!(config.lock_ttl, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_success_result_is_stamped() {
        let queue = TaskQueue::new(fn_registry("build", |t| {
            Ok(TaskResult::success(&t.id).with_artifact("pages/home.md"))
        }));
        let result = queue.run(TaskDefinition::new("home", "build")).await.unwrap();
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.attempts, 1);
        assert!(result.started_at.is_some());
        assert!(result.ended_at.is_some());
        assert!(result.metrics.duration_ms.is_some());
        assert_eq!(result.artifacts, vec!["pages/home.md".to_string()]);
    }

    #[tokio::test]
    async fn test_duplicate_submission_shares_execution() {
        let (registry, gate, started) = gate_registry(&["build"], 4);
        let queue = TaskQueue::new(registry);
        let task = TaskDefinition::new("home", "build").with_inputs(serde_json::json!({"p": 1}));

        let first = queue.enqueue(task.clone()).await.unwrap();
        let second = queue.enqueue(task.with_inputs(serde_json::json!({"p": 1}))).await.unwrap();
        assert!(first.same_execution(&second));

        gate.add_permits(1);
        let (a, b) = tokio::join!(first.wait(), second.wait());
        assert_eq!(a, b);
        assert_eq!(started.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_resubmission_after_completion_runs_again() {
        let (registry, gate, started) = gate_registry(&["build"], 4);
        let queue = TaskQueue::new(registry);
        gate.add_permits(2);

        let first = queue.run(TaskDefinition::new("a", "build")).await.unwrap();
        let second = queue.run(TaskDefinition::new("a", "build")).await.unwrap();
        assert!(first.is_success() && second.is_success());
        assert_eq!(started.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_lanes_drain_by_priority() {
        let (registry, gate, started) = gate_registry(&["build"], 8);
        let queue = TaskQueue::builder(registry).config(single_slot()).build();

        let blocker = queue.enqueue(TaskDefinition::new("first", "build")).await.unwrap();
        let mut handles = vec![blocker];
        for (id, priority) in [
            ("low", Priority::Low),
            ("normal", Priority::Normal),
            ("high", Priority::High),
        ] {
            let task = TaskDefinition::new(id, "build")
                .with_priority(priority)
                .with_idempotency_key(id);
            handles.push(queue.enqueue(task).await.unwrap());
        }
        assert_eq!(queue.snapshot().queued, [1, 1, 1]);

        gate.add_permits(4);
        for handle in &handles {
            assert!(handle.wait().await.is_success());
        }
        assert_eq!(*started.lock(), vec!["first", "high", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_blocked_class_does_not_block_other_lanes() {
        let mut registry = BotRegistry::new();
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(parking_lot::Mutex::new(Vec::new()));
        registry.register(Arc::new(GateBot {
            descriptor: BotDescriptor::new("gate", ["build", "upload"], 8),
            gate: Arc::clone(&gate),
            started: Arc::clone(&started),
        }));
        let queue = TaskQueue::builder(Arc::new(registry))
            .config(single_slot())
            .build();

        let _busy = queue.enqueue(TaskDefinition::new("busy", "build")).await.unwrap();
        let _waiting = queue
            .enqueue(
                TaskDefinition::new("waiting", "build")
                    .with_priority(Priority::High)
                    .with_idempotency_key("w"),
            )
            .await
            .unwrap();
        let upload = queue
            .enqueue(
                TaskDefinition::new("upload", "upload")
                    .with_priority(Priority::Low)
                    .with_class(ConcurrencyClass::Io),
            )
            .await
            .unwrap();

        let snapshot = queue.snapshot();
        assert_eq!(snapshot.cpu.occupied(), 1);
        assert_eq!(snapshot.io.occupied(), 1);
        assert_eq!(snapshot.queued, [1, 0, 0]);

        gate.add_permits(3);
        assert!(upload.wait().await.is_success());
    }

    #[tokio::test]
    async fn test_bot_ceiling_limits_running() {
        let (registry, gate, started) = gate_registry(&["build"], 1);
        let queue = TaskQueue::new(registry);
        let a = queue
            .enqueue(TaskDefinition::new("a", "build").with_idempotency_key("a"))
            .await
            .unwrap();
        let b = queue
            .enqueue(TaskDefinition::new("b", "build").with_idempotency_key("b"))
            .await
            .unwrap();
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.running_for("gate"), 1);
        assert_eq!(snapshot.queued_total(), 1);

        gate.add_permits(2);
        assert!(a.wait().await.is_success());
        assert!(b.wait().await.is_success());
        assert_eq!(started.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_unroutable_task_fails_without_slot() {
        let queue = TaskQueue::new(Arc::new(BotRegistry::new()));
        let result = queue.run(TaskDefinition::new("x", "deploy")).await.unwrap();
        assert_eq!(result.status, TaskStatus::Fail);
        assert_eq!(result.error_code.as_deref(), Some("BOT_NOT_FOUND"));
        assert_eq!(result.attempts, 0);
        assert_eq!(queue.snapshot().running_total(), 0);
    }

    #[tokio::test]
    async fn test_invalid_task_is_rejected() {
        let queue = TaskQueue::new(Arc::new(BotRegistry::new()));
        let err = queue
            .enqueue(TaskDefinition::new("x", "build").with_timeout_ms(0))
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn test_held_lock_fails_task() {
        let locks = LockManager::in_memory();
        let task = TaskDefinition::new("a", "build").with_idempotency_key("fixed");
        let _held = locks
            .acquire("fixed", Duration::from_secs(60))
            .await
            .unwrap();

        let queue = TaskQueue::builder(fn_registry("build", |t| Ok(TaskResult::success(&t.id))))
            .locks(locks)
            .build();
        let result = queue.run(task).await.unwrap();
        assert_eq!(result.error_code.as_deref(), Some("LOCKED"));
        assert_eq!(result.attempts, 0);
    }

    #[tokio::test]
    async fn test_handler_error_and_panic_become_failures() {
        let queue = TaskQueue::new(fn_registry("build", |t| {
            if t.id == "boom" {
                panic!("exploded");
            }
            Err(SitebotError::Validation("bad page".into()))
        }));

        let failed = queue
            .run(TaskDefinition::new("bad", "build").with_idempotency_key("bad"))
            .await
            .unwrap();
        assert_eq!(failed.error_code.as_deref(), Some("HANDLER_FAILURE"));
        assert!(failed.error_msg.unwrap().contains("bad page"));

        let panicked = queue
            .run(TaskDefinition::new("boom", "build").with_idempotency_key("boom"))
            .await
            .unwrap();
        assert_eq!(panicked.error_code.as_deref(), Some("HANDLER_FAILURE"));
        assert!(panicked.error_msg.unwrap().contains("exploded"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(queue.snapshot().running_total(), 0);
        assert_eq!(queue.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_timeout_is_enforced() {
        let (registry, _gate, _) = gate_registry(&["build"], 1);
        let queue = TaskQueue::new(registry);
        let result = queue
            .run(TaskDefinition::new("slow", "build").with_timeout_ms(30))
            .await
            .unwrap();
        assert_eq!(result.status, TaskStatus::Fail);
        assert_eq!(result.error_code.as_deref(), Some("TIMEOUT"));
    }

    #[tokio::test]
    async fn test_llm_budget_denial() {
        let ledger = Arc::new(BudgetLedger::in_memory(BudgetConfig::with_cap(100)));
        let queue = TaskQueue::builder(fn_registry("write", |t| {
            Ok(TaskResult::success(&t.id).with_metrics(TaskMetrics::default().with_tokens(50, 5)))
        }))
        .ledger(Arc::clone(&ledger))
        .build();

        let task = TaskDefinition::new("copy", "write")
            .with_class(ConcurrencyClass::Llm)
            .with_estimated_tokens(60);
        assert!(queue.run(task.clone()).await.unwrap().is_success());
        assert_eq!(ledger.usage(), 50);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let denied = queue.run(task).await.unwrap();
        assert_eq!(denied.error_code.as_deref(), Some("BUDGET_EXCEEDED"));
        assert_eq!(ledger.summary().entries, 2);
    }

    #[tokio::test]
    async fn test_fallback_replaces_bot() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = TaskQueue::builder(Arc::new(BotRegistry::new()))
            .fallback(Arc::new(FallbackEngine::with_builtin_rules(tmp.path())))
            .build();

        let task = TaskDefinition::new("about", "build-page")
            .with_class(ConcurrencyClass::Llm)
            .with_estimated_tokens(5000)
            .with_fallback_rule("page-stub");
        let result = queue.run(task).await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.metrics.fallback_used, Some(true));
        assert_eq!(result.attempts, 1);
        assert!(tmp.path().join("pages/about.md").exists());
    }

    #[tokio::test]
    async fn test_panicking_fallback_rule_frees_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let mut engine = FallbackEngine::new(tmp.path());
        engine.register(
            "explode",
            Arc::new(|_: &TaskDefinition| -> SitebotResult<FallbackArtifact> {
                panic!("rule exploded")
            }),
        );
        let queue = TaskQueue::builder(Arc::new(BotRegistry::new()))
            .config(single_slot())
            .fallback(Arc::new(engine))
            .build();
        let task = TaskDefinition::new("about", "build-page").with_fallback_rule("explode");

        let first = queue.enqueue(task.clone()).await.unwrap();
        let result = first.wait().await;
        assert_eq!(result.status, TaskStatus::Fail);
        assert_eq!(result.error_code.as_deref(), Some("HANDLER_FAILURE"));
        assert!(result.error_msg.unwrap().contains("rule exploded"));

        let snapshot = idle(&queue).await;
        assert_eq!(snapshot.cpu.occupied(), 0);
        assert_eq!(snapshot.in_flight, 0);

        let second = queue.enqueue(task).await.unwrap();
        assert!(!second.same_execution(&first));
        assert_eq!(
            second.wait().await.error_code.as_deref(),
            Some("HANDLER_FAILURE")
        );
    }

    #[tokio::test]
    async fn test_lock_denial_hands_back_claim() {
        let gate = Arc::new(Notify::new());
        let locks = LockManager::new(Arc::new(SlowDenyStore {
            inner: MemoryLockStore::new(),
            gate: Arc::clone(&gate),
        }));
        let queue = TaskQueue::builder(fn_registry("build", |t| Ok(TaskResult::success(&t.id))))
            .config(single_slot())
            .locks(locks)
            .build();

        let denied = queue
            .enqueue(TaskDefinition::new("dup", "build").with_idempotency_key("contended"))
            .await
            .unwrap();
        let next = queue
            .enqueue(TaskDefinition::new("next", "build").with_idempotency_key("free"))
            .await
            .unwrap();

        // The claim holds the only slot, but nothing is running.
        let snapshot = queue.snapshot();
        assert_eq!(snapshot.cpu.running, 0);
        assert_eq!(snapshot.cpu.claiming, 1);
        assert_eq!(snapshot.queued, [0, 1, 0]);

        gate.notify_one();
        let locked = denied.wait().await;
        assert_eq!(locked.error_code.as_deref(), Some("LOCKED"));
        assert_eq!(locked.attempts, 0);
        assert!(locked.started_at.is_none());
        assert!(next.wait().await.is_success());

        let snapshot = idle(&queue).await;
        assert_eq!(snapshot.cpu, ClassLoad { running: 0, claiming: 0, capacity: 1 });
        assert!(snapshot.bot_running.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_estimate_is_denied_and_queue_survives() {
        let ledger = Arc::new(BudgetLedger::in_memory(BudgetConfig::with_cap(100)));
        ledger.record_usage(
            &TaskDefinition::new("seed", "write"),
            &TaskResult::success("seed").with_metrics(TaskMetrics::default().with_tokens(10, 0)),
        );
        let queue = TaskQueue::builder(fn_registry("write", |t| Ok(TaskResult::success(&t.id))))
            .ledger(Arc::clone(&ledger))
            .build();

        let huge = TaskDefinition::new("huge", "write")
            .with_class(ConcurrencyClass::Llm)
            .with_estimated_tokens(u64::MAX);
        let denied = queue.run(huge).await.unwrap();
        assert_eq!(denied.error_code.as_deref(), Some("BUDGET_EXCEEDED"));

        let page = queue.run(TaskDefinition::new("page", "write")).await.unwrap();
        assert!(page.is_success());
        assert_eq!(ledger.remaining(), 90);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_queued() {
        let (registry, gate, _) = gate_registry(&["build"], 8);
        let queue = TaskQueue::builder(registry).config(single_slot()).build();
        let running = queue
            .enqueue(TaskDefinition::new("a", "build").with_idempotency_key("a"))
            .await
            .unwrap();
        let queued = queue
            .enqueue(TaskDefinition::new("b", "build").with_idempotency_key("b"))
            .await
            .unwrap();

        queue.shutdown();
        let cancelled = queued.wait().await;
        assert_eq!(cancelled.status, TaskStatus::Canceled);
        assert_eq!(cancelled.error_code.as_deref(), Some(SHUTDOWN_CODE));

        gate.add_permits(1);
        assert!(running.wait().await.is_success());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(queue.enqueue(TaskDefinition::new("c", "build")).await.is_err());
    }
}
