//! Reminder scheduler task
//!
//! One tokio task owns the [`ReminderEngine`]. Timer expiry, sweep ticks,
//! fetch results and host signals are all handled on that task, so the
//! snapshot, the reminded set and the armed timer never change concurrently.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info, warn};

use super::engine::{ReminderEngine, SchedulerState};
use super::feed::TaskFeed;
use super::notified::{LocalNotifiedSet, ReminderStateTracker};
use super::prefs::NotificationPrefs;
use crate::api::TaskSource;
use crate::cache::{CachedResponse, ResponseCache};
use crate::clock::Clock;
use crate::config::Config;
use crate::ipc::{Channel, Ipc, Subscription};
use crate::storage::KeyValueStore;
use crate::task::Task;
use crate::{Error, Result};

/// External services the scheduler works against
#[derive(Clone)]
pub struct Collaborators {
    /// Durable storage for the reminded set and stored config
    pub store: Arc<dyn KeyValueStore>,
    /// Task source
    pub source: Arc<dyn TaskSource>,
    /// Response cache for the task list
    pub cache: Arc<ResponseCache>,
    /// Event bus
    pub ipc: Arc<dyn Ipc>,
    /// Wall clock
    pub clock: Arc<dyn Clock>,
}

enum Command {
    Refresh,
    Recompute,
    ConfigUpdated(Value),
    State(oneshot::Sender<SchedulerState>),
}

struct FetchOutcome {
    generation: u64,
    result: Result<CachedResponse<Vec<Task>>>,
}

/// Reminder scheduler, ready to start
pub struct Scheduler {
    engine: ReminderEngine,
    feed: Arc<TaskFeed>,
    ipc: Arc<dyn Ipc>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
}

impl Scheduler {
    /// Build the scheduler, loading the reminded set and notification
    /// preference from storage
    pub fn new(config: &Config, deps: Collaborators) -> Self {
        let reminder = &config.reminder;

        let local = LocalNotifiedSet::load(Arc::clone(&deps.store), reminder.notified_ids_key.clone());
        let tracker = ReminderStateTracker::new(local, Arc::clone(&deps.source));
        let prefs = NotificationPrefs::load(Arc::clone(&deps.store), reminder.preferences_key.clone());
        let engine = ReminderEngine::new(
            tracker,
            prefs,
            Arc::clone(&deps.ipc),
            Arc::clone(&deps.clock),
            reminder.notification_title.clone(),
        );
        let feed = TaskFeed::new(deps.source, deps.cache, reminder, config.cache.enabled);

        Self {
            engine,
            feed: Arc::new(feed),
            ipc: deps.ipc,
            clock: deps.clock,
            sweep_interval: reminder.sweep_interval.max(Duration::from_millis(10)),
        }
    }

    /// Spawn the scheduler task and attach it to `todo-updated` and
    /// `config-updated`
    pub fn start(self) -> SchedulerHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let refresh_tx = commands_tx.clone();
        let config_tx = commands_tx.clone();
        let subscriptions = vec![
            self.ipc.on(
                Channel::TodoUpdated,
                Arc::new(move |_: &Value| {
                    let _ = refresh_tx.send(Command::Refresh);
                }),
            ),
            self.ipc.on(
                Channel::ConfigUpdated,
                Arc::new(move |payload: &Value| {
                    let _ = config_tx.send(Command::ConfigUpdated(payload.clone()));
                }),
            ),
        ];

        let task = tokio::spawn(self.run(commands_rx, shutdown_rx));

        SchedulerHandle {
            commands: commands_tx,
            shutdown: shutdown_tx,
            subscriptions: Mutex::new(subscriptions),
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>, mut shutdown: broadcast::Receiver<()>) {
        info!(sweep_interval = ?self.sweep_interval, "Reminder scheduler started");

        let (fetch_tx, mut fetch_rx) = mpsc::unbounded_channel::<FetchOutcome>();
        let mut generation: u64 = 0;

        self.start_fetch(&mut generation, &fetch_tx);
        if let Some(tasks) = self.feed.cached() {
            self.engine.replace_tasks(tasks, false);
        }
        self.engine.sweep();
        self.engine.recompute();

        let mut sweep = interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.deadline();

            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    debug!("Reminder scheduler shutting down");
                    break;
                }
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    self.handle(command, &mut generation, &fetch_tx);
                }
                Some(outcome) = fetch_rx.recv() => {
                    if outcome.generation == generation {
                        self.apply_fetch(outcome.result);
                    } else {
                        debug!(generation = outcome.generation, current = generation, "Discarding superseded fetch");
                    }
                }
                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.engine.on_timer_expired();
                }
                _ = sweep.tick() => {
                    self.engine.sweep();
                }
            }
        }

        self.engine.disarm();
        info!("Reminder scheduler stopped");
    }

    fn handle(&mut self, command: Command, generation: &mut u64, fetch_tx: &mpsc::UnboundedSender<FetchOutcome>) {
        match command {
            Command::Refresh => {
                debug!("Task list changed, refetching");
                // No timer may fire against the snapshot being replaced
                self.engine.disarm();
                self.start_fetch(generation, fetch_tx);
            }
            Command::Recompute => {
                self.engine.recompute();
            }
            Command::ConfigUpdated(config) => {
                self.engine.update_config(&config);
            }
            Command::State(reply) => {
                let _ = reply.send(self.engine.state());
            }
        }
    }

    fn start_fetch(&self, generation: &mut u64, fetch_tx: &mpsc::UnboundedSender<FetchOutcome>) {
        *generation += 1;
        let generation = *generation;
        let feed = Arc::clone(&self.feed);
        let tx = fetch_tx.clone();

        tokio::spawn(async move {
            let result = feed.fetch().await;
            let _ = tx.send(FetchOutcome { generation, result });
        });
    }

    fn apply_fetch(&mut self, result: Result<CachedResponse<Vec<Task>>>) {
        match result {
            Ok(response) => {
                self.engine.replace_tasks(response.data, !response.from_cache);
                self.engine.sweep();
            }
            Err(e) => {
                warn!(error = %e, "Failed to fetch tasks, keeping current snapshot");
            }
        }
        self.engine.recompute();
    }

    fn deadline(&self) -> Option<Instant> {
        let SchedulerState::Armed(armed) = self.engine.state() else {
            return None;
        };
        let wait = u64::try_from(armed.due_at - self.clock.now()).unwrap_or(0);
        Some(Instant::now() + Duration::from_millis(wait))
    }
}

/// Control handle for a running scheduler
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    shutdown: broadcast::Sender<()>,
    subscriptions: Mutex<Vec<Subscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SchedulerHandle {
    /// Refetch the task list (same as a `todo-updated` signal)
    pub fn refresh(&self) {
        let _ = self.commands.send(Command::Refresh);
    }

    /// Re-arm against the current snapshot
    pub fn recompute(&self) {
        let _ = self.commands.send(Command::Recompute);
    }

    /// Current timer state
    ///
    /// # Errors
    ///
    /// Returns [`Error::Shutdown`] once the scheduler has stopped.
    pub async fn state(&self) -> Result<SchedulerState> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(Command::State(tx)).map_err(|_| Error::Shutdown)?;
        rx.await.map_err(|_| Error::Shutdown)
    }

    /// Whether the scheduler task is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the scheduler: detach listeners, cancel the timer and the sweep
    ///
    /// Safe to call more than once.
    pub async fn teardown(&self) {
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        let _ = self.shutdown.send(());

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Reminder scheduler task failed");
            }
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
    }
}
