//! Event channels between the scheduler and its host
//!
//! Channel names form a closed set. Listeners are attached with
//! [`Ipc::on`], which returns a [`Subscription`]; dropping or unsubscribing
//! it detaches the listener.

mod stdio;

pub use self::stdio::StdioBridge;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

/// Known event channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Channel {
    /// A task became due and was marked notified
    TodoReminder,
    /// Displayed task counts should be refreshed
    StatsUpdated,
    /// Request a desktop notification (`SystemNotification` payload)
    ShowNotification,
    /// The task list changed remotely; refetch
    TodoUpdated,
    /// The application config changed (config JSON payload)
    ConfigUpdated,
}

impl Channel {
    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TodoReminder => "todo-reminder",
            Self::StatsUpdated => "stats-updated",
            Self::ShowNotification => "show-notification",
            Self::TodoUpdated => "todo-updated",
            Self::ConfigUpdated => "config-updated",
        }
    }

    /// Whether the scheduler emits on this channel (as opposed to listening)
    #[must_use]
    pub const fn is_outbound(self) -> bool {
        matches!(self, Self::TodoReminder | Self::StatsUpdated | Self::ShowNotification)
    }

    /// Channels emitted by the scheduler
    pub const OUTBOUND: [Self; 3] = [Self::TodoReminder, Self::StatsUpdated, Self::ShowNotification];
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event as carried over the stdio bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpcMessage {
    /// Channel
    pub channel: Channel,
    /// Payload (`null` when the event carries none)
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

/// Payload of [`Channel::ShowNotification`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemNotification {
    /// Notification title
    pub title: String,
    /// Notification body (the task content)
    pub content: String,
}

/// Event listener
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Event bus between the scheduler and its host
pub trait Ipc: Send + Sync {
    /// Deliver `payload` to every listener of `channel`
    fn send(&self, channel: Channel, payload: Value);

    /// Attach `listener` to `channel`
    fn on(&self, channel: Channel, listener: Listener) -> Subscription;
}

/// Handle for an attached listener
///
/// `unsubscribe` may be called any number of times; the listener is detached
/// on the first call or on drop, whichever comes first.
pub struct Subscription {
    detach: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Subscription that runs `detach` once when released
    pub fn new(detach: impl FnOnce() + Send + 'static) -> Self {
        Self {
            detach: Mutex::new(Some(Box::new(detach))),
        }
    }

    /// Detach the listener
    pub fn unsubscribe(&self) {
        let detach = self.detach.lock().take();
        if let Some(detach) = detach {
            detach();
        }
    }

    /// Whether the listener is still attached
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.detach.lock().is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("active", &self.is_active()).finish()
    }
}

type ListenerMap = HashMap<Channel, Vec<(u64, Listener)>>;

/// In-process event bus
#[derive(Clone, Default)]
pub struct LocalIpc {
    listeners: Arc<RwLock<ListenerMap>>,
    next_id: Arc<AtomicU64>,
}

impl LocalIpc {
    /// Empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of listeners attached to `channel`
    #[must_use]
    pub fn listener_count(&self, channel: Channel) -> usize {
        self.listeners.read().get(&channel).map_or(0, Vec::len)
    }
}

impl Ipc for LocalIpc {
    fn send(&self, channel: Channel, payload: Value) {
        // Listeners may subscribe or send in turn, so call them unlocked
        let targets: Vec<Listener> = self
            .listeners
            .read()
            .get(&channel)
            .map(|list| list.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        trace!(channel = %channel, listeners = targets.len(), "IPC send");
        for listener in targets {
            listener(&payload);
        }
    }

    fn on(&self, channel: Channel, listener: Listener) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().entry(channel).or_default().push((id, listener));

        let listeners = Arc::downgrade(&self.listeners);
        Subscription::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                if let Some(list) = listeners.write().get_mut(&channel) {
                    list.retain(|(lid, _)| *lid != id);
                }
            }
        })
    }
}

impl fmt::Debug for LocalIpc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<Channel, usize> = self.listeners.read().iter().map(|(c, l)| (*c, l.len())).collect();
        f.debug_struct("LocalIpc").field("listeners", &counts).finish()
    }
}
