//! Monotonic timestamp sources.
//!
//! The manager never reads wall-clock time directly; the embedding hands it
//! an [`UndoClock`] at initialization. Retry gating only compares
//! timestamps from the same clock, so any monotonic origin works.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use undoq_types::Timestamp;

/// A monotonic timestamp source.
pub trait UndoClock: Send + Sync {
    /// Current time. Must never move backwards.
    fn now(&self) -> Timestamp;
}

/// System clock anchored to a process-local monotonic instant.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl UndoClock for SystemClock {
    fn now(&self) -> Timestamp {
        let micros = u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX);
        Timestamp::from_micros(micros)
    }
}

/// A clock driven by its owner.
///
/// Used by tests and by embeddings that already maintain their own time
/// base. `advance` and `set` are safe from any thread.
#[derive(Debug, Default)]
pub struct ManualClock {
    micros: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new(start: Timestamp) -> Self {
        Self {
            micros: AtomicU64::new(start.as_micros()),
        }
    }

    /// Move the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let delta_micros = u64::try_from(delta.as_micros()).unwrap_or(u64::MAX);
        self.micros.fetch_add(delta_micros, Ordering::Relaxed);
    }

    /// Jump the clock to `now`. Callers keep it monotonic.
    pub fn set(&self, now: Timestamp) {
        self.micros.store(now.as_micros(), Ordering::Relaxed);
    }
}

impl UndoClock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_micros(self.micros.load(Ordering::Relaxed))
    }
}
