//! Remote task source
//!
//! The scheduler only needs two operations from the backend: the current task
//! list and the "already reminded" flag update. [`HttpApi`] provides both over
//! the widget's REST API.

mod http;

pub use self::http::{Envelope, HttpApi, PageAttribute};

use async_trait::async_trait;

use crate::Result;
use crate::task::{Task, TaskId};

/// Source of tasks for the reminder scheduler
#[async_trait]
pub trait TaskSource: Send + Sync {
    /// All tasks with status pending or done
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    /// Set the remote notified flag on a task
    async fn mark_notified(&self, id: TaskId) -> Result<()>;
}
