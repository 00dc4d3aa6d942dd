//! HiJot reminder engine
//!
//! Reminder scheduling and response caching for the HiJot desktop todo
//! widget.
//!
//! # Features
//!
//! - **Single-timer scheduling**: one timer armed for the earliest upcoming
//!   task, plus a one-second sweep for anything already overdue
//! - **Durable reminded set**: reminders survive a backend that refuses the
//!   "reminded" flag update
//! - **Two-tier response cache**: in-memory over a persistent store, with
//!   TTLs, permanent keys, quota recovery and bounded size
//! - **Host bridge**: reminder events as JSON lines over stdio

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod cache;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod ipc;
pub mod reminder;
pub mod storage;
pub mod task;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// Logs go to stderr; stdout is reserved for the IPC bridge.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
        }
        _ => {
            subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
        }
    }

    Ok(())
}
