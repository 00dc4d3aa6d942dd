//! Due-task state machine
//!
//! Holds the task snapshot and decides what the single timer should point at.
//! It owns no timers itself; the scheduler loop turns [`SchedulerState`] into
//! a sleep and reports expiry back through [`ReminderEngine::on_timer_expired`].

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::notified::ReminderStateTracker;
use super::prefs::NotificationPrefs;
use crate::clock::{Clock, Timestamp};
use crate::ipc::{Channel, Ipc, SystemNotification};
use crate::task::{Task, TaskId, due_tasks, select_next_due};

/// The one armed timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ArmedTimer {
    /// Task the timer fires for
    pub task_id: TaskId,
    /// When it fires (epoch milliseconds)
    pub due_at: Timestamp,
}

/// Scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum SchedulerState {
    /// No future task to wait for
    Idle,
    /// Waiting for one task's due time
    Armed(ArmedTimer),
}

/// Task snapshot plus the fire and sweep logic
pub struct ReminderEngine {
    tasks: Vec<Task>,
    snapshot_loaded: bool,
    armed: Option<ArmedTimer>,
    tracker: ReminderStateTracker,
    prefs: NotificationPrefs,
    ipc: Arc<dyn Ipc>,
    clock: Arc<dyn Clock>,
    notification_title: String,
}

impl ReminderEngine {
    /// Engine with an empty snapshot
    pub fn new(
        tracker: ReminderStateTracker,
        prefs: NotificationPrefs,
        ipc: Arc<dyn Ipc>,
        clock: Arc<dyn Clock>,
        notification_title: impl Into<String>,
    ) -> Self {
        Self {
            tasks: Vec::new(),
            snapshot_loaded: false,
            armed: None,
            tracker,
            prefs,
            ipc,
            clock,
            notification_title: notification_title.into(),
        }
    }

    /// Replace the task snapshot
    ///
    /// `authoritative` marks a freshly fetched list; only after one has been
    /// applied are local reminded ids pruned against the snapshot.
    pub fn replace_tasks(&mut self, tasks: Vec<Task>, authoritative: bool) {
        debug!(count = tasks.len(), authoritative, "Task snapshot replaced");
        self.tasks = tasks;
        self.snapshot_loaded |= authoritative;
    }

    /// Current snapshot
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SchedulerState {
        self.armed.map_or(SchedulerState::Idle, SchedulerState::Armed)
    }

    /// Whether `task` has already been reminded
    #[must_use]
    pub fn is_notified(&self, task: &Task) -> bool {
        self.tracker.is_notified(task)
    }

    /// Drop the armed timer
    pub fn disarm(&mut self) {
        if let Some(armed) = self.armed.take() {
            debug!(task_id = armed.task_id, "Timer disarmed");
        }
    }

    /// Re-arm for the earliest future, pending, unreminded task
    pub fn recompute(&mut self) -> SchedulerState {
        let now = self.clock.now();
        self.armed = select_next_due(&self.tasks, |t| self.tracker.is_notified(t), now).map(|t| ArmedTimer {
            task_id: t.id,
            due_at: t.due_at,
        });

        match self.armed {
            Some(armed) => debug!(task_id = armed.task_id, in_ms = armed.due_at - now, "Timer armed"),
            None => debug!("No upcoming task, idle"),
        }
        self.state()
    }

    /// Fire the reminder for `task_id` unless it is already reminded
    ///
    /// Returns whether anything was emitted.
    pub fn fire(&mut self, task_id: TaskId) -> bool {
        let Some(task) = self.tasks.iter().find(|t| t.id == task_id).cloned() else {
            debug!(task_id, "Fire for unknown task ignored");
            return false;
        };
        if !task.is_pending() || self.tracker.is_notified(&task) {
            debug!(task_id, "Task already reminded");
            return false;
        }
        self.emit(&task);
        true
    }

    /// Handle expiry of the armed timer: fire its task, then re-arm
    pub fn on_timer_expired(&mut self) -> bool {
        let Some(armed) = self.armed.take() else {
            return false;
        };
        let fired = self.fire(armed.task_id);
        self.recompute();
        fired
    }

    /// Fire every due, unreminded task; returns how many fired
    ///
    /// Re-arms after any fire and prunes local reminded ids once an
    /// authoritative snapshot is known.
    pub fn sweep(&mut self) -> usize {
        let now = self.clock.now();
        let due: Vec<Task> = due_tasks(&self.tasks, |t| self.tracker.is_notified(t), now)
            .into_iter()
            .cloned()
            .collect();

        for task in &due {
            self.emit(task);
        }
        if !due.is_empty() {
            self.recompute();
        }

        if self.snapshot_loaded {
            let pending: HashSet<TaskId> = self.tasks.iter().filter(|t| t.is_pending()).map(|t| t.id).collect();
            self.tracker.prune_stale(&pending);
        }
        due.len()
    }

    /// Apply a `config-updated` payload
    pub fn update_config(&mut self, config: &Value) {
        self.prefs.update(config);
    }

    fn emit(&mut self, task: &Task) {
        // Detached; the local set already records the reminder
        drop(self.tracker.mark_notified(task.id));

        self.ipc.send(Channel::TodoReminder, Value::Null);
        self.ipc.send(Channel::StatsUpdated, Value::Null);

        if self.prefs.system_notification() {
            let notification = SystemNotification {
                title: self.notification_title.clone(),
                content: task.content.clone(),
            };
            match serde_json::to_value(&notification) {
                Ok(payload) => self.ipc.send(Channel::ShowNotification, payload),
                Err(e) => warn!(error = %e, "Failed to encode notification"),
            }
        }

        info!(task_id = task.id, due_at = task.due_at, "Reminder fired");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::TaskSource;
    use crate::clock::ManualClock;
    use crate::ipc::{Listener, LocalIpc, Subscription};
    use crate::reminder::notified::LocalNotifiedSet;
    use crate::storage::{KeyValueStore, MemoryStore};
    use crate::task::{TaskStatus, task};
    use crate::{Error, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    struct OfflineSource;

    #[async_trait]
    impl TaskSource for OfflineSource {
        async fn list_tasks(&self) -> Result<Vec<Task>> {
            Err(Error::Transport("offline".to_string()))
        }

        async fn mark_notified(&self, _id: TaskId) -> Result<()> {
            Err(Error::Transport("offline".to_string()))
        }
    }

    struct Harness {
        engine: ReminderEngine,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        events: Arc<Mutex<Vec<(Channel, Value)>>>,
        _subs: Vec<Subscription>,
    }

    fn harness(system_notification: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        if system_notification {
            store.set_item("hijot-config", r#"{"systemNotification":true}"#).unwrap();
        }
        harness_with(store)
    }

    fn harness_with(store: Arc<MemoryStore>) -> Harness {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let ipc = LocalIpc::new();
        let events = Arc::new(Mutex::new(Vec::new()));
        let subs = Channel::OUTBOUND
            .into_iter()
            .map(|channel| {
                let events = Arc::clone(&events);
                let listener: Listener = Arc::new(move |payload: &Value| events.lock().push((channel, payload.clone())));
                ipc.on(channel, listener)
            })
            .collect();

        let kv = Arc::clone(&store) as Arc<dyn KeyValueStore>;
        let tracker = ReminderStateTracker::new(
            LocalNotifiedSet::load(Arc::clone(&kv), "hijot-reminded-ids"),
            Arc::new(OfflineSource),
        );
        let prefs = NotificationPrefs::load(kv, "hijot-config");
        let engine = ReminderEngine::new(
            tracker,
            prefs,
            Arc::new(ipc),
            Arc::clone(&clock) as Arc<dyn Clock>,
            "⏰ Todo reminder",
        );

        Harness {
            engine,
            clock,
            store,
            events,
            _subs: subs,
        }
    }

    fn channels(events: &Mutex<Vec<(Channel, Value)>>) -> Vec<Channel> {
        events.lock().iter().map(|(c, _)| *c).collect()
    }

    #[tokio::test]
    async fn test_recompute_arms_earliest_future_task() {
        let mut h = harness(false);
        let now = h.clock.now();
        h.engine.replace_tasks(vec![task(1, now + 10_000), task(2, now + 5_000), task(3, now + 20_000)], true);

        assert_eq!(
            h.engine.recompute(),
            SchedulerState::Armed(ArmedTimer {
                task_id: 2,
                due_at: now + 5_000
            })
        );
    }

    #[tokio::test]
    async fn test_timer_expiry_fires_then_rearms() {
        let mut h = harness(false);
        let now = h.clock.now();
        h.engine.replace_tasks(vec![task(1, now + 10_000), task(2, now + 5_000), task(3, now + 20_000)], true);
        h.engine.recompute();

        h.clock.advance(Duration::from_secs(5));
        assert!(h.engine.on_timer_expired());

        assert_eq!(channels(&h.events), vec![Channel::TodoReminder, Channel::StatsUpdated]);
        assert_eq!(
            h.engine.state(),
            SchedulerState::Armed(ArmedTimer {
                task_id: 1,
                due_at: now + 10_000
            })
        );
        assert_eq!(h.store.get_item("hijot-reminded-ids").as_deref(), Some("[2]"));
    }

    #[tokio::test]
    async fn test_fire_is_idempotent() {
        let mut h = harness(false);
        let now = h.clock.now();
        h.engine.replace_tasks(vec![task(4, now)], true);

        assert!(h.engine.fire(4));
        assert!(h.engine.is_notified(&task(4, now)));
        assert!(!h.engine.fire(4));
        assert_eq!(h.events.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_fire_skips_done_and_unknown_tasks() {
        let mut h = harness(false);
        let mut done = task(1, 0);
        done.status = TaskStatus::Done;
        h.engine.replace_tasks(vec![done], true);

        assert!(!h.engine.fire(1));
        assert!(!h.engine.fire(99));
        assert!(h.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_system_notification_when_enabled() {
        let mut h = harness(true);
        let now = h.clock.now();
        let mut t = task(5, now);
        t.content = "Submit expenses".to_string();
        h.engine.replace_tasks(vec![t], true);

        h.engine.fire(5);

        let events = h.events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            (
                Channel::ShowNotification,
                json!({"title": "⏰ Todo reminder", "content": "Submit expenses"})
            )
        );
    }

    #[tokio::test]
    async fn test_config_update_toggles_notification() {
        let mut h = harness(false);
        let now = h.clock.now();
        h.engine.replace_tasks(vec![task(1, now), task(2, now)], true);

        h.engine.fire(1);
        h.engine.update_config(&json!({"systemNotification": true}));
        h.engine.fire(2);

        assert_eq!(
            channels(&h.events),
            vec![
                Channel::TodoReminder,
                Channel::StatsUpdated,
                Channel::TodoReminder,
                Channel::StatsUpdated,
                Channel::ShowNotification,
            ]
        );
    }

    #[tokio::test]
    async fn test_sweep_fires_overdue_once() {
        let mut h = harness(false);
        let now = h.clock.now();
        let mut reminded = task(3, now - 1);
        reminded.notified_remote = true;
        h.engine.replace_tasks(vec![task(1, now - 60_000), task(2, now), reminded, task(4, now + 1_000)], true);

        assert_eq!(h.engine.sweep(), 2);
        assert_eq!(h.engine.sweep(), 0);
        assert_eq!(h.events.lock().len(), 4);
        assert_eq!(
            h.engine.state(),
            SchedulerState::Armed(ArmedTimer {
                task_id: 4,
                due_at: now + 1_000
            })
        );
    }

    #[tokio::test]
    async fn test_sweep_prunes_only_after_authoritative_snapshot() {
        let store = Arc::new(MemoryStore::new());
        store.set_item("hijot-reminded-ids", "[10,11]").unwrap();
        let mut h = harness_with(store);
        let later = h.clock.now() + 60_000;

        h.engine.replace_tasks(Vec::new(), false);
        h.engine.sweep();
        assert_eq!(h.store.get_item("hijot-reminded-ids").as_deref(), Some("[10,11]"));

        h.engine.replace_tasks(vec![task(10, later)], true);
        h.engine.sweep();
        assert_eq!(h.store.get_item("hijot-reminded-ids").as_deref(), Some("[10]"));
        assert_eq!(h.engine.recompute(), SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_disarm() {
        let mut h = harness(false);
        let now = h.clock.now();
        h.engine.replace_tasks(vec![task(1, now + 1)], true);
        h.engine.recompute();
        h.engine.disarm();

        assert_eq!(h.engine.state(), SchedulerState::Idle);
        assert!(!h.engine.on_timer_expired());
    }
}
