//! `sitebot.toml` and plan file formats.

use serde::Deserialize;
use sitebot_core::{ConcurrencyClass, SitebotError, SitebotResult, TaskDefinition};
use sitebot_orchestrator::{BudgetConfig, QueueConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct SitebotConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub locks: LocksSection,
    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

#[derive(Debug, Deserialize)]
pub struct QueueSection {
    #[serde(default)]
    pub cpu_capacity: Option<usize>,
    #[serde(default)]
    pub io_capacity: Option<usize>,
    #[serde(default)]
    pub llm_capacity: Option<usize>,
    #[serde(default = "default_lock_ttl_secs")]
    pub lock_ttl_secs: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            cpu_capacity: None,
            io_capacity: None,
            llm_capacity: None,
            lock_ttl_secs: default_lock_ttl_secs(),
        }
    }
}

impl QueueSection {
    /// Capacities the file sets, derived the way the queue derives its
    /// defaults otherwise: io is twice cpu, llm follows io.
    pub fn to_queue_config(&self) -> QueueConfig {
        let host = QueueConfig::default();
        let cpu = self.cpu_capacity.unwrap_or(host.cpu_capacity).max(1);
        let io = self.io_capacity.unwrap_or(cpu.saturating_mul(2));
        let llm = self.llm_capacity.unwrap_or(io);
        QueueConfig {
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            ..host
        }
        .with_capacity(ConcurrencyClass::Cpu, cpu)
        .with_capacity(ConcurrencyClass::Io, io)
        .with_capacity(ConcurrencyClass::Llm, llm)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockBackend {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Default, Deserialize)]
pub struct LocksSection {
    #[serde(default)]
    pub backend: LockBackend,
}

/// A bot backed by an external command.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub name: String,
    pub accepts: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// A plan file: `[[tasks]]` in the task submission shape.
#[derive(Debug, Deserialize)]
pub struct PlanFile {
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_lock_ttl_secs() -> u64 {
    300
}
fn default_concurrency() -> usize {
    1
}

impl SitebotConfig {
    pub fn parse(raw: &str) -> SitebotResult<Self> {
        let config: SitebotConfig =
            toml::from_str(raw).map_err(|e| SitebotError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> SitebotResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SitebotError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))
        })?;
        Self::parse(&raw)
    }

    fn validate(&self) -> SitebotResult<()> {
        let budget = &self.budget;
        if !(0.0..=1.0).contains(&budget.warn_ratio) || !(0.0..=1.0).contains(&budget.fallback_ratio)
        {
            return Err(SitebotError::Config(
                "budget ratios must be between 0 and 1".into(),
            ));
        }
        for (i, bot) in self.bots.iter().enumerate() {
            if bot.name.trim().is_empty() || bot.command.trim().is_empty() {
                return Err(SitebotError::Config(format!(
                    "bots[{i}] needs a name and a command"
                )));
            }
            if self.bots[..i].iter().any(|b| b.name == bot.name) {
                return Err(SitebotError::Config(format!(
                    "duplicate bot name '{}'",
                    bot.name
                )));
            }
        }
        Ok(())
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.data_dir.join("metrics.jsonl")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.data_dir.join("locks")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }
}

impl PlanFile {
    pub fn parse(raw: &str) -> SitebotResult<Self> {
        toml::from_str(raw).map_err(|e| SitebotError::Config(format!("invalid plan file: {e}")))
    }

    pub async fn load(path: &Path) -> SitebotResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            SitebotError::Config(format!("Failed to read plan '{}': {e}", path.display()))
        })?;
        Self::parse(&raw)
    }
}
