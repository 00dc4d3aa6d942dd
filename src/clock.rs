//! Wall-clock sources
//!
//! Task due times and cache write times are epoch milliseconds, matching the
//! REST collaborator's `endTime` field. Timers are armed on tokio's monotonic
//! clock; the [`Clock`] only answers "what time is it now".

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Milliseconds since the Unix epoch
pub type Timestamp = i64;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync {
    /// Current time in epoch milliseconds
    fn now(&self) -> Timestamp;
}

/// The real system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        chrono::Utc::now().timestamp_millis()
    }
}

/// A clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Move forward by `by`
    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_millis(by), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }
}

/// Wall clock derived from tokio's time source.
///
/// Reads `anchor + elapsed`, so under a paused runtime (`start_paused`) the
/// wall clock and armed timers advance together.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor: Timestamp,
    start: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor the clock at `anchor` as of now
    #[must_use]
    pub fn anchored(anchor: Timestamp) -> Self {
        Self {
            anchor,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> Timestamp {
        self.anchor + duration_millis(self.start.elapsed())
    }
}

/// Saturating conversion of a duration to signed milliseconds
#[must_use]
pub fn duration_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
