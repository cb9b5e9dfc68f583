use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sitebot_core::{SitebotResult, TaskDefinition, TaskResult};
use std::sync::Arc;
use tracing::info;

/// Capability descriptor a bot registers under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotDescriptor {
    /// Unique bot name.
    pub name: String,
    /// Task names this bot handles.
    pub accepts: Vec<String>,
    /// Maximum executions this bot runs at once.
    pub concurrency: usize,
}

impl BotDescriptor {
    /// Build a descriptor.
    pub fn new<I, S>(name: impl Into<String>, accepts: I, concurrency: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            accepts: accepts.into_iter().map(Into::into).collect(),
            concurrency: concurrency.max(1),
        }
    }

    /// Whether the bot handles `task_name`.
    pub fn accepts(&self, task_name: &str) -> bool {
        self.accepts.iter().any(|a| a == task_name)
    }
}

/// An autonomous agent that executes tasks by name.
///
/// Handlers return a result or an error; the queue owns status, timestamps
/// and duration, so bots only need to fill in artifacts and metrics.
#[async_trait]
pub trait Bot: Send + Sync {
    /// Registration descriptor.
    fn descriptor(&self) -> &BotDescriptor;

    /// Execute one task.
    async fn handle(&self, task: &TaskDefinition) -> SitebotResult<TaskResult>;
}

/// Capability-based routing table from task names to bots.
///
/// Built once and shared by reference; routing is first match in
/// registration order.
#[derive(Default, Clone)]
pub struct BotRegistry {
    bots: Vec<Arc<dyn Bot>>,
}

impl BotRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bot. Earlier registrations win for overlapping names.
    pub fn register(&mut self, bot: Arc<dyn Bot>) {
        let descriptor = bot.descriptor();
        info!(
            bot = %descriptor.name,
            accepts = ?descriptor.accepts,
            concurrency = descriptor.concurrency,
            "Registered bot"
        );
        self.bots.push(bot);
    }

    /// First bot accepting `task_name`.
    pub fn route(&self, task_name: &str) -> Option<Arc<dyn Bot>> {
        self.bots
            .iter()
            .find(|b| b.descriptor().accepts(task_name))
            .cloned()
    }

    /// Descriptors in registration order.
    pub fn list_descriptors(&self) -> Vec<BotDescriptor> {
        self.bots.iter().map(|b| b.descriptor().clone()).collect()
    }

    /// Number of registered bots.
    pub fn bot_count(&self) -> usize {
        self.bots.len()
    }
}
