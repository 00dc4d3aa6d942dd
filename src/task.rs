//! Task model and due-time selection
//!
//! Tasks are owned by the remote task source; this crate only reads them and
//! asks for the remote notified flag to be set.

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::clock::Timestamp;

/// Remote task identifier
pub type TaskId = i64;

/// Lifecycle status as encoded by the task source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TaskStatus {
    /// Not done yet (`0`)
    Pending,
    /// Completed (`1`)
    Done,
    /// Soft-deleted (`2`)
    Deleted,
}

impl TryFrom<u8> for TaskStatus {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pending),
            1 => Ok(Self::Done),
            2 => Ok(Self::Deleted),
            other => Err(Error::Internal(format!("Unknown task status: {other}"))),
        }
    }
}

impl From<TaskStatus> for u8 {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Pending => 0,
            TaskStatus::Done => 1,
            TaskStatus::Deleted => 2,
        }
    }
}

/// A todo item as returned by the task source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier
    pub id: TaskId,
    /// Text shown in notifications
    pub content: String,
    /// Due time (epoch milliseconds)
    #[serde(rename = "endTime")]
    pub due_at: Timestamp,
    /// Status
    pub status: TaskStatus,
    /// Remote "already reminded" flag
    #[serde(rename = "isReminded", default)]
    pub notified_remote: bool,
}

impl Task {
    /// Whether the task still awaits completion
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == TaskStatus::Pending
    }
}

/// Aggregate counts from `GET /todo/stats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoStats {
    /// Pending tasks past their due time
    pub overdue: u64,
    /// Pending tasks
    pub pending: u64,
    /// Completed tasks
    #[serde(default)]
    pub completed: u64,
}

/// Earliest future, pending, not-yet-notified task
///
/// Ties on `due_at` go to the lowest id.
pub fn select_next_due<'a, F>(tasks: &'a [Task], is_notified: F, now: Timestamp) -> Option<&'a Task>
where
    F: Fn(&Task) -> bool,
{
    tasks
        .iter()
        .filter(|t| t.is_pending() && t.due_at > now && !is_notified(t))
        .min_by_key(|t| (t.due_at, t.id))
}

/// Pending tasks already due and not yet notified, in due order
pub fn due_tasks<'a, F>(tasks: &'a [Task], is_notified: F, now: Timestamp) -> Vec<&'a Task>
where
    F: Fn(&Task) -> bool,
{
    let mut due: Vec<&Task> = tasks
        .iter()
        .filter(|t| t.is_pending() && t.due_at <= now && !is_notified(t))
        .collect();
    due.sort_by_key(|t| (t.due_at, t.id));
    due
}

#[cfg(test)]
pub(crate) fn task(id: TaskId, due_at: Timestamp) -> Task {
    Task {
        id,
        content: format!("task {id}"),
        due_at,
        status: TaskStatus::Pending,
        notified_remote: false,
    }
}
