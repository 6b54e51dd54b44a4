//! Lock-free activity timestamps.
//!
//! Links record their start time and last send/receive as nanoseconds since a
//! process-wide epoch so the multiplexer can read them without taking the
//! send or receive lock.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// A point in time, or unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The "never happened" value every fresh link starts with.
    pub const UNSET: Self = Self(0);

    #[must_use]
    pub fn now() -> Self {
        Self::from_instant(Instant::now())
    }

    #[must_use]
    pub fn from_instant(at: Instant) -> Self {
        let nanos = at.saturating_duration_since(*EPOCH).as_nanos();
        // 0 is reserved for UNSET
        Self(u64::try_from(nanos).unwrap_or(u64::MAX).max(1))
    }

    #[must_use]
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub fn as_instant(self) -> Option<Instant> {
        self.is_set()
            .then(|| *EPOCH + Duration::from_nanos(self.0))
    }

    /// Time since this timestamp, `None` when unset.
    #[must_use]
    pub fn elapsed(self) -> Option<Duration> {
        self.as_instant().map(|at| at.elapsed())
    }
}

/// A [`Timestamp`] that can be updated from several threads.
#[derive(Debug, Default)]
pub struct AtomicTimestamp(AtomicU64);

impl AtomicTimestamp {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn load(&self) -> Timestamp {
        Timestamp(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, ts: Timestamp) {
        self.0.store(ts.0, Ordering::Release);
    }

    pub fn touch(&self) {
        self.store(Timestamp::now());
    }

    pub fn reset(&self) {
        self.store(Timestamp::UNSET);
    }
}
