//! HiJot reminder engine
//!
//! Runs the due-task scheduler for the HiJot todo widget and exposes a few
//! inspection commands.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Local};
use clap::Parser;
use serde_json::json;
use tokio::io::BufReader;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use hijot_reminder::{
    api::{HttpApi, TaskSource},
    cache::{CachedRequest, CachedRequestOptions, CachedResponse, ResponseCache},
    cli::{CacheCommand, Cli, Command},
    clock::{Clock, SystemClock, Timestamp},
    config::Config,
    ipc::{Ipc, LocalIpc, StdioBridge},
    reminder::{Collaborators, LocalNotifiedSet, ReminderStateTracker, Scheduler, TaskFeed},
    setup_tracing,
    storage::{FileStore, KeyValueStore},
    task::{TodoStats, due_tasks, select_next_due},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let runs_scheduler = cli.runs_scheduler();
    let result = match cli.command {
        Some(Command::Next) => run_next(&config).await,
        Some(Command::Stats { fresh }) => run_stats(&config, fresh).await,
        Some(Command::Cache(cmd)) => run_cache_command(&config, &cmd),
        Some(Command::Config) => print_config(&config),
        Some(Command::Run) | None => run_scheduler(&config).await,
    };

    let ok = match result {
        Ok(()) => true,
        Err(e) => {
            error!("{e:#}");
            false
        }
    };

    if runs_scheduler {
        // A stdin read parked on a terminal keeps runtime shutdown waiting
        std::process::exit(if ok { 0 } else { 1 });
    }
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> hijot_reminder::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(ref url) = cli.api_url {
        config.api.base_url = url.clone();
    }
    if let Some(ref dir) = cli.storage_dir {
        config.storage.dir = dir.clone();
    }
    Ok(config)
}

/// Shared services every command works against
struct Services {
    store: Arc<dyn KeyValueStore>,
    cache: Arc<ResponseCache>,
    api: Arc<HttpApi>,
    clock: Arc<dyn Clock>,
}

fn open_services(config: &Config) -> anyhow::Result<Services> {
    let store = FileStore::open(&config.storage.dir, config.storage.quota())
        .with_context(|| format!("opening storage in {}", config.storage.dir.display()))?;
    let store: Arc<dyn KeyValueStore> = Arc::new(store);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache = Arc::new(ResponseCache::new(Arc::clone(&store), Arc::clone(&clock), &config.cache));
    let api = Arc::new(HttpApi::new(&config.api).context("creating API client")?);

    Ok(Services { store, cache, api, clock })
}

/// Run the scheduler until Ctrl+C or the host closes stdin
async fn run_scheduler(config: &Config) -> anyhow::Result<()> {
    let services = open_services(config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        api = %services.api.base_url(),
        storage = %config.storage.dir.display(),
        "Starting HiJot reminder engine"
    );

    let ipc: Arc<dyn Ipc> = Arc::new(LocalIpc::new());
    // Subscribe the bridge before the scheduler can emit anything
    let bridge = StdioBridge::new(Arc::clone(&ipc));

    let handle = Scheduler::new(
        config,
        Collaborators {
            store: services.store,
            source: services.api as Arc<dyn TaskSource>,
            cache: services.cache,
            ipc,
            clock: services.clock,
        },
    )
    .start();

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut bridge_task = tokio::spawn(bridge.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout(), shutdown_rx));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("listening for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down");
        }
        result = &mut bridge_task => {
            match result {
                Ok(Ok(())) => info!("Host closed IPC input, shutting down"),
                Ok(Err(e)) => error!(error = %e, "IPC bridge failed"),
                Err(e) => error!(error = %e, "IPC bridge task panicked"),
            }
        }
    }

    handle.teardown().await;
    if !bridge_task.is_finished() {
        let _ = shutdown_tx.send(());
        if let Ok(Err(e)) = bridge_task.await {
            error!(error = %e, "IPC bridge failed during shutdown");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Print the task that would be armed next
async fn run_next(config: &Config) -> anyhow::Result<()> {
    let services = open_services(config)?;
    let source = Arc::clone(&services.api) as Arc<dyn TaskSource>;

    let feed = TaskFeed::new(Arc::clone(&source), services.cache, &config.reminder, config.cache.enabled);
    let response = feed.fetch().await.context("fetching tasks")?;
    if response.expired {
        println!("(task source unreachable, showing cached tasks)");
    }

    let tracker = ReminderStateTracker::new(
        LocalNotifiedSet::load(services.store, config.reminder.notified_ids_key.clone()),
        source,
    );
    let now = services.clock.now();
    let tasks = response.data;

    let overdue = due_tasks(&tasks, |t| tracker.is_notified(t), now).len();
    if overdue > 0 {
        println!("{overdue} overdue task(s) not yet reminded");
    }

    match select_next_due(&tasks, |t| tracker.is_notified(t), now) {
        Some(task) => {
            println!("Next reminder: #{} {}", task.id, task.content);
            println!("   Due: {} (in {})", format_time(task.due_at), format_wait(task.due_at - now));
        }
        None => println!("No upcoming reminders"),
    }
    Ok(())
}

/// Print task counts
async fn run_stats(config: &Config, fresh: bool) -> anyhow::Result<()> {
    let services = open_services(config)?;

    let (stats, note) = if fresh {
        let stats = services.api.stats().await.context("fetching stats")?;
        services.cache.set("/todo/stats", &json!({}), &stats, config.cache.default_ttl);
        (stats, "")
    } else {
        let request: CachedRequest<TodoStats, HttpApi> = CachedRequest::new(
            services.cache,
            services.api,
            CachedRequestOptions::from_config(&config.cache),
        );
        let (mut response, refresh) = request
            .get_with_refresh("/todo/stats", &json!({}))
            .await
            .context("fetching stats")?;

        // Stats never expire from the cache, so a hit is only as current as
        // its refresh. Wait for it before the runtime goes away.
        if let Some(refresh) = refresh {
            match refresh.await {
                Ok(Some(stats)) => {
                    response = CachedResponse {
                        data: stats,
                        from_cache: false,
                        expired: false,
                    };
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Stats refresh task failed"),
            }
        }

        let note = match (response.from_cache, response.expired) {
            (true, true) => " (cached, expired)",
            (true, false) => " (cached)",
            _ => "",
        };
        (response.data, note)
    };

    println!("Pending:   {}{note}", stats.pending);
    println!("Overdue:   {}", stats.overdue);
    println!("Completed: {}", stats.completed);
    Ok(())
}

/// Inspect or clear the response cache
fn run_cache_command(config: &Config, cmd: &CacheCommand) -> anyhow::Result<()> {
    let services = open_services(config)?;

    match cmd {
        CacheCommand::List => {
            let keys = services.cache.keys();
            if keys.is_empty() {
                println!("Cache is empty");
            } else {
                println!("{} cached entr{}:", keys.len(), if keys.len() == 1 { "y" } else { "ies" });
                for key in keys {
                    println!("  {key}");
                }
            }
        }
        CacheCommand::Clear => {
            let removed = services.cache.clear_all();
            println!("Removed {removed} cache entr{}", if removed == 1 { "y" } else { "ies" });
        }
    }
    Ok(())
}

/// Print the merged configuration
fn print_config(config: &Config) -> anyhow::Result<()> {
    let yaml = serde_yaml::to_string(config).context("serializing configuration")?;
    print!("{yaml}");
    Ok(())
}

fn format_time(ts: Timestamp) -> String {
    DateTime::from_timestamp_millis(ts).map_or_else(
        || ts.to_string(),
        |t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
    )
}

fn format_wait(ms: i64) -> String {
    let minutes = ms / 60_000;
    match minutes {
        0 => format!("{}s", ms / 1000),
        m if m < 60 => format!("{m}m"),
        m => format!("{}h {}m", m / 60, m % 60),
    }
}
