mod bot;
mod config;

use bot::CommandBot;
use clap::{Parser, Subcommand};
use config::{LockBackend, PlanFile, SitebotConfig};
use sitebot_orchestrator::{
    BotRegistry, BudgetLedger, ExecutionStrategy, FallbackEngine, FileLockStore, LockManager,
    Orchestrator, OrchestratorConfig, TaskQueue,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sitebot", about = "Sitebot: site-building task orchestrator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "sitebot.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file and print the report
    Run {
        /// Plan file with `[[tasks]]`
        plan: PathBuf,
        /// Force a strategy instead of deciding from telemetry
        #[arg(long)]
        strategy: Option<ExecutionStrategy>,
    },
    /// Print the execution plan and decision without running anything
    Plan {
        /// Plan file with `[[tasks]]`
        plan: PathBuf,
    },
    /// Show today's token usage
    Budget,
    /// Print queue capacities, telemetry and budget as JSON
    Status,
    /// List configured bots and fallback rules
    Bots,
}

/// Everything a subcommand may need, wired from the config.
struct Runtime {
    orchestrator: Orchestrator,
    ledger: Arc<BudgetLedger>,
    registry: Arc<BotRegistry>,
    fallback: Arc<FallbackEngine>,
}

async fn build_runtime(config: &SitebotConfig) -> anyhow::Result<Runtime> {
    tokio::fs::create_dir_all(&config.data_dir).await?;

    let ledger = Arc::new(BudgetLedger::open(config.budget, config.metrics_path()).await?);
    let locks = match config.locks.backend {
        LockBackend::Memory => LockManager::in_memory(),
        LockBackend::File => {
            LockManager::new(Arc::new(FileLockStore::new(config.locks_dir()).await?))
        }
    };
    let fallback = Arc::new(FallbackEngine::with_builtin_rules(config.artifacts_dir()));

    let mut registry = BotRegistry::new();
    for bot in &config.bots {
        registry.register(Arc::new(CommandBot::new(bot)));
    }
    let registry = Arc::new(registry);
    info!(bots = registry.bot_count(), locks = ?config.locks.backend, "Bots registered");

    let queue = TaskQueue::builder(Arc::clone(&registry))
        .config(config.queue.to_queue_config())
        .locks(locks)
        .ledger(Arc::clone(&ledger))
        .fallback(Arc::clone(&fallback))
        .build();
    let orchestrator = Orchestrator::new(
        Arc::clone(&registry),
        queue,
        OrchestratorConfig::default(),
    );

    Ok(Runtime {
        orchestrator,
        ledger,
        registry,
        fallback,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr);
    if cli.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let config = SitebotConfig::load(&cli.config).await?;
    let runtime = build_runtime(&config).await?;

    match cli.command {
        Commands::Run { plan, strategy } => {
            let tasks = PlanFile::load(&plan).await?.tasks;
            info!(plan = %plan.display(), tasks = tasks.len(), "Running plan");
            let result = match strategy {
                Some(strategy) => runtime.orchestrator.run_with_strategy(tasks, strategy).await?,
                None => runtime.orchestrator.run(tasks).await?,
            };
            runtime.ledger.flush().await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.report.all_succeeded() {
                anyhow::bail!("{}", result.report.summary);
            }
        }
        Commands::Plan { plan } => {
            let tasks = PlanFile::load(&plan).await?.tasks;
            let (plan, decision) = runtime.orchestrator.prepare(tasks).await?;
            let out = serde_json::json!({ "plan": plan, "decision": decision });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Budget => {
            let summary = runtime.ledger.summary();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                let day = summary
                    .day
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "today".to_string());
                println!("Token budget for {day}:");
                println!(
                    "  used {} of {} ({} remaining)",
                    summary.tokens_in, summary.daily_token_cap, summary.remaining_tokens
                );
                println!(
                    "  {} entries: {} succeeded, {} failed, {} cache hits",
                    summary.entries, summary.successes, summary.failures, summary.cache_hits
                );
                println!("  completion tokens: {}", summary.tokens_out);
            }
        }
        Commands::Status => {
            let monitor = runtime.orchestrator.monitor();
            monitor.sample().await;
            println!("{}", serde_json::to_string_pretty(&monitor.to_json().await)?);
        }
        Commands::Bots => {
            let bots = runtime.registry.list_descriptors();
            if bots.is_empty() {
                println!("No bots configured.");
                println!("Configure bots in sitebot.toml under [[bots]]");
            } else {
                println!("Registered bots:");
                for bot in &bots {
                    println!(
                        "  {} (concurrency {}): {}",
                        bot.name,
                        bot.concurrency,
                        bot.accepts.join(", ")
                    );
                }
                println!("\nTotal: {} bot(s)", bots.len());
            }
            println!("Fallback rules: {}", runtime.fallback.rule_names().join(", "));
        }
    }

    Ok(())
}
