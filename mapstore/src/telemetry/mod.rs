//! Transfer telemetry for status displays.
//!
//! Lock-free atomic counters recorded by the scheduler, snapshotted for
//! the CLI status line.
//!
//! ```text
//! TransferScheduler ─────► TransferMetrics ─────► TransferSnapshot ─────► Views
//!                          (atomic counters)      (point-in-time copy)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the scheduler as jobs move through the pool.
#[derive(Debug, Default)]
pub struct TransferMetrics {
    jobs_started: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl TransferMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self, bytes: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy for display.
    pub fn snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            jobs_started: self.jobs_started.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

/// A consistent-enough copy of the counters at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSnapshot {
    pub jobs_started: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub bytes_downloaded: u64,
}

impl TransferSnapshot {
    /// Jobs still queued or running.
    pub fn jobs_in_flight(&self) -> u64 {
        self.jobs_started
            .saturating_sub(self.jobs_completed + self.jobs_failed)
    }
}
