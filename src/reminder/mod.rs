//! Due-task reminders
//!
//! - [`notified`]: which tasks were already reminded (remote flag OR local set)
//! - [`prefs`]: the desktop notification preference
//! - [`feed`]: the cache-assisted task list
//! - [`engine`]: the `Idle`/`Armed` state machine, fire sequence and sweep
//! - [`scheduler`]: the task that drives the engine with a timer and a sweep
//!   interval

pub mod engine;
pub mod feed;
pub mod notified;
pub mod prefs;
pub mod scheduler;

pub use engine::{ArmedTimer, ReminderEngine, SchedulerState};
pub use feed::TaskFeed;
pub use notified::{LocalNotifiedSet, ReminderStateTracker};
pub use prefs::NotificationPrefs;
pub use scheduler::{Collaborators, Scheduler, SchedulerHandle};
