//! Daily token budget and the append-only metrics log behind it.

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sitebot_core::{SitebotError, SitebotResult, TaskDefinition, TaskResult, TaskStatus};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

fn default_daily_token_cap() -> u64 {
    100_000
}

fn default_warn_ratio() -> f64 {
    0.9
}

fn default_fallback_ratio() -> f64 {
    0.7
}

/// Budget thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Maximum prompt tokens per UTC day.
    #[serde(default = "default_daily_token_cap")]
    pub daily_token_cap: u64,
    /// Usage ratio that triggers the one-time warning.
    #[serde(default = "default_warn_ratio")]
    pub warn_ratio: f64,
    /// Fallback rules are preferred while usage stays below this ratio.
    #[serde(default = "default_fallback_ratio")]
    pub fallback_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_token_cap: default_daily_token_cap(),
            warn_ratio: default_warn_ratio(),
            fallback_ratio: default_fallback_ratio(),
        }
    }
}

impl BudgetConfig {
    /// Config with the given cap and default ratios.
    pub fn with_cap(daily_token_cap: u64) -> Self {
        Self {
            daily_token_cap,
            ..Self::default()
        }
    }
}

/// One line of the metrics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// When the task settled.
    pub timestamp: DateTime<Utc>,
    /// Task name (routing key), not the per-plan id.
    pub task_name: String,
    /// Terminal status.
    pub status: TaskStatus,
    /// Measured duration.
    #[serde(default)]
    pub duration_ms: u64,
    /// Prompt tokens; these count against the cap.
    #[serde(default)]
    pub tokens_in: u64,
    /// Completion tokens.
    #[serde(default)]
    pub tokens_out: u64,
    /// Whether the result came from a cache.
    #[serde(default)]
    pub cache_hit: bool,
}

impl LedgerEntry {
    /// Build an entry from a settled result.
    pub fn from_result(task_name: impl Into<String>, result: &TaskResult) -> Self {
        Self {
            timestamp: result.ended_at.unwrap_or_else(Utc::now),
            task_name: task_name.into(),
            status: result.status,
            duration_ms: result.metrics.duration_ms.unwrap_or(0),
            tokens_in: result.metrics.tokens_in.unwrap_or(0),
            tokens_out: result.metrics.tokens_out.unwrap_or(0),
            cache_hit: result.metrics.cache_hit.unwrap_or(false),
        }
    }
}

enum LogCommand {
    Append(LedgerEntry),
    Flush(oneshot::Sender<()>),
}

/// Append-only JSON-lines metrics log.
///
/// Writes happen on a background task so callers never wait on disk.
pub struct MetricsLog {
    tx: mpsc::UnboundedSender<LogCommand>,
    path: PathBuf,
}

impl MetricsLog {
    /// Start the writer for `path`. Must be called inside a Tokio runtime.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<LogCommand>();
        let log_file = path.clone();

        tokio::spawn(async move {
            if let Some(parent) = log_file.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            let mut file: Option<tokio::fs::File> = None;

            while let Some(cmd) = rx.recv().await {
                match cmd {
                    LogCommand::Append(entry) => {
                        if file.is_none() {
                            file = match tokio::fs::OpenOptions::new()
                                .create(true)
                                .append(true)
                                .open(&log_file)
                                .await
                            {
                                Ok(f) => Some(f),
                                Err(e) => {
                                    warn!(path = %log_file.display(), error = %e, "Cannot open metrics log");
                                    None
                                }
                            };
                        }
                        let (Some(f), Ok(line)) = (file.as_mut(), serde_json::to_string(&entry))
                        else {
                            continue;
                        };
                        if let Err(e) = f.write_all(format!("{line}\n").as_bytes()).await {
                            warn!(error = %e, "Failed to append metrics entry");
                        }
                    }
                    LogCommand::Flush(reply) => {
                        if let Some(f) = file.as_mut() {
                            let _ = f.flush().await;
                        }
                        let _ = reply.send(());
                    }
                }
            }
        });

        Self { tx, path }
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an entry for writing.
    pub fn append(&self, entry: LedgerEntry) {
        debug!(task = %entry.task_name, status = %entry.status, tokens_in = entry.tokens_in, "metrics");
        let _ = self.tx.send(LogCommand::Append(entry));
    }

    /// Wait until every entry queued so far is on disk.
    pub async fn flush(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(reply)).is_ok() {
            let _ = done.await;
        }
    }

    /// Read every well-formed entry. A missing file reads as empty;
    /// malformed lines are skipped.
    pub async fn read_entries(path: &Path) -> SitebotResult<Vec<LedgerEntry>> {
        let data = match tokio::fs::read_to_string(path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut entries = Vec::new();
        for (lineno, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line = lineno + 1, error = %e, "Skipping malformed metrics line"),
            }
        }
        Ok(entries)
    }
}

/// Aggregate over today's ledger entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    /// UTC day the summary covers.
    pub day: Option<NaiveDate>,
    /// Number of settled tasks.
    pub entries: usize,
    /// Tasks that succeeded.
    pub successes: usize,
    /// Tasks that failed or were canceled.
    pub failures: usize,
    /// Prompt tokens spent.
    pub tokens_in: u64,
    /// Completion tokens produced.
    pub tokens_out: u64,
    /// Cache hits.
    pub cache_hits: usize,
    /// Sum of measured durations.
    pub total_duration_ms: u64,
    /// Configured daily cap.
    pub daily_token_cap: u64,
    /// Tokens still available today.
    pub remaining_tokens: u64,
}

struct LedgerState {
    day: NaiveDate,
    /// Usage recorded by earlier processes today.
    today_usage: u64,
    /// Usage recorded by this process.
    session_usage: u64,
    /// Estimates of admitted tasks that have not settled yet.
    reserved: u64,
    warned: bool,
    entries: Vec<LedgerEntry>,
}

impl LedgerState {
    fn roll_over(&mut self) {
        let today = Utc::now().date_naive();
        if today != self.day {
            info!(previous = %self.day, today = %today, "Budget day rolled over");
            self.day = today;
            self.today_usage = 0;
            self.session_usage = 0;
            self.warned = false;
            self.entries.clear();
        }
    }

    fn usage(&self) -> u64 {
        self.today_usage.saturating_add(self.session_usage)
    }

    /// Usage plus outstanding reservations.
    fn committed(&self) -> u64 {
        self.usage().saturating_add(self.reserved)
    }
}

/// Tracks token spend against a fixed daily cap.
pub struct BudgetLedger {
    config: BudgetConfig,
    log: Option<MetricsLog>,
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    /// Ledger seeded from `entries`, keeping only those from today.
    pub fn from_entries(config: BudgetConfig, entries: Vec<LedgerEntry>) -> Self {
        let day = Utc::now().date_naive();
        let entries: Vec<LedgerEntry> = entries
            .into_iter()
            .filter(|e| e.timestamp.date_naive() == day)
            .collect();
        let today_usage = entries
            .iter()
            .fold(0u64, |acc, e| acc.saturating_add(e.tokens_in));
        Self {
            config,
            log: None,
            state: Mutex::new(LedgerState {
                day,
                today_usage,
                session_usage: 0,
                reserved: 0,
                warned: false,
                entries,
            }),
        }
    }

    /// Ledger with no history and no log file.
    pub fn in_memory(config: BudgetConfig) -> Self {
        Self::from_entries(config, Vec::new())
    }

    /// Open the metrics log at `path`, seed today's usage from it and
    /// append future entries to it.
    pub async fn open(config: BudgetConfig, path: impl Into<PathBuf>) -> SitebotResult<Self> {
        let path = path.into();
        let entries = MetricsLog::read_entries(&path).await?;
        let mut ledger = Self::from_entries(config, entries);
        info!(
            path = %path.display(),
            today_usage = ledger.usage(),
            cap = config.daily_token_cap,
            "Budget ledger opened"
        );
        ledger.log = Some(MetricsLog::new(path));
        Ok(ledger)
    }

    /// Thresholds in force.
    pub fn config(&self) -> &BudgetConfig {
        &self.config
    }

    /// Today's usage (earlier processes plus this one).
    pub fn usage(&self) -> u64 {
        let mut state = self.state.lock();
        state.roll_over();
        state.usage()
    }

    /// Tokens left under the cap, net of outstanding reservations.
    pub fn remaining(&self) -> u64 {
        let mut state = self.state.lock();
        state.roll_over();
        self.config
            .daily_token_cap
            .saturating_sub(state.committed())
    }

    /// Whether `task` fits: today + session + estimate must not exceed the cap.
    /// A sum that overflows never fits.
    pub fn check_admission(&self, task: &TaskDefinition) -> bool {
        let mut state = self.state.lock();
        state.roll_over();
        state
            .committed()
            .checked_add(task.estimated_tokens)
            .is_some_and(|projected| projected <= self.config.daily_token_cap)
    }

    /// Admit `task` and hold its estimate until [`BudgetLedger::release`].
    pub fn reserve(&self, task: &TaskDefinition) -> SitebotResult<()> {
        let mut state = self.state.lock();
        state.roll_over();
        let committed = state.committed();
        let fits = committed
            .checked_add(task.estimated_tokens)
            .is_some_and(|projected| projected <= self.config.daily_token_cap);
        if !fits {
            return Err(SitebotError::BudgetExceeded {
                requested: task.estimated_tokens,
                remaining: self.config.daily_token_cap.saturating_sub(committed),
            });
        }
        state.reserved += task.estimated_tokens;
        Ok(())
    }

    /// Drop a reservation made by [`BudgetLedger::reserve`].
    pub fn release(&self, task: &TaskDefinition) {
        let mut state = self.state.lock();
        state.reserved = state.reserved.saturating_sub(task.estimated_tokens);
    }

    /// Append a ledger entry for a settled task and add its prompt tokens
    /// to the session usage.
    pub fn record_usage(&self, task: &TaskDefinition, result: &TaskResult) {
        let entry = LedgerEntry::from_result(&task.name, result);
        let cap = self.config.daily_token_cap;
        {
            let mut state = self.state.lock();
            state.roll_over();
            state.session_usage = state.session_usage.saturating_add(entry.tokens_in);
            let usage = state.usage();
            if !state.warned && cap > 0 && usage as f64 >= cap as f64 * self.config.warn_ratio {
                state.warned = true;
                warn!(usage, cap, "Token budget above warning threshold");
            }
            state.entries.push(entry.clone());
        }
        if let Some(log) = &self.log {
            log.append(entry);
        }
    }

    /// True when the task declares a fallback rule and usage is still
    /// below the fallback ratio of the cap.
    pub fn should_prefer_fallback(&self, task: &TaskDefinition) -> bool {
        if task.fallback_rules.is_empty() {
            return false;
        }
        (self.usage() as f64) < self.config.daily_token_cap as f64 * self.config.fallback_ratio
    }

    /// Aggregate over today's entries.
    pub fn summary(&self) -> UsageSummary {
        let mut state = self.state.lock();
        state.roll_over();
        let mut summary = UsageSummary {
            day: Some(state.day),
            daily_token_cap: self.config.daily_token_cap,
            remaining_tokens: self.config.daily_token_cap.saturating_sub(state.usage()),
            ..UsageSummary::default()
        };
        for entry in &state.entries {
            summary.entries += 1;
            match entry.status {
                TaskStatus::Success => summary.successes += 1,
                TaskStatus::Fail | TaskStatus::Canceled => summary.failures += 1,
                TaskStatus::Queued | TaskStatus::Running => {}
            }
            summary.tokens_in = summary.tokens_in.saturating_add(entry.tokens_in);
            summary.tokens_out = summary.tokens_out.saturating_add(entry.tokens_out);
            if entry.cache_hit {
                summary.cache_hits += 1;
            }
            summary.total_duration_ms = summary.total_duration_ms.saturating_add(entry.duration_ms);
        }
        summary
    }

    /// Wait for pending log writes.
    pub async fn flush(&self) {
        if let Some(log) = &self.log {
            log.flush().await;
        }
    }
}
