//! Global atomic counters for registry and engine activity.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. when a scenario finishes).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    rebuilds_published: AtomicU64,
    rebuilds_rejected: AtomicU64,
    runs_scheduled: AtomicU64,
    runs_succeeded: AtomicU64,
    runs_failed: AtomicU64,
    await_timeouts: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            rebuilds_published: AtomicU64::new(0),
            rebuilds_rejected: AtomicU64::new(0),
            runs_scheduled: AtomicU64::new(0),
            runs_succeeded: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            await_timeouts: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, metric: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = metric, "counter incremented");
    }

    pub fn inc_rebuilds_published(&self) {
        Self::bump(&self.rebuilds_published, "rebuilds_published");
    }

    pub fn inc_rebuilds_rejected(&self) {
        Self::bump(&self.rebuilds_rejected, "rebuilds_rejected");
    }

    pub fn inc_runs_scheduled(&self) {
        Self::bump(&self.runs_scheduled, "runs_scheduled");
    }

    /// Count a run that reached a terminal status.
    pub fn inc_runs_finished(&self, success: bool) {
        if success {
            Self::bump(&self.runs_succeeded, "runs_succeeded");
        } else {
            Self::bump(&self.runs_failed, "runs_failed");
        }
    }

    pub fn inc_await_timeouts(&self) {
        Self::bump(&self.await_timeouts, "await_timeouts");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            rebuilds_published = self.rebuilds_published(),
            rebuilds_rejected = self.rebuilds_rejected(),
            runs_scheduled = self.runs_scheduled(),
            runs_succeeded = self.runs_succeeded(),
            runs_failed = self.runs_failed(),
            await_timeouts = self.await_timeouts(),
        );
    }

    pub fn rebuilds_published(&self) -> u64 {
        self.rebuilds_published.load(Ordering::Relaxed)
    }

    pub fn rebuilds_rejected(&self) -> u64 {
        self.rebuilds_rejected.load(Ordering::Relaxed)
    }

    pub fn runs_scheduled(&self) -> u64 {
        self.runs_scheduled.load(Ordering::Relaxed)
    }

    pub fn runs_succeeded(&self) -> u64 {
        self.runs_succeeded.load(Ordering::Relaxed)
    }

    pub fn runs_failed(&self) -> u64 {
        self.runs_failed.load(Ordering::Relaxed)
    }

    pub fn await_timeouts(&self) -> u64 {
        self.await_timeouts.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.rebuilds_published,
            &self.rebuilds_rejected,
            &self.runs_scheduled,
            &self.runs_succeeded,
            &self.runs_failed,
            &self.await_timeouts,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
