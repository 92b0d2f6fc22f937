//! Progress polling for transfers delegated to an external download
//! queue.
//!
//! Some platforms hand large downloads to a system download manager
//! instead of the in-process scheduler. The [`ProgressTracker`] polls
//! that queue's status table at a fixed interval, only while at least
//! one job is tracked, and feeds the same [`StorageEvent`] channel the
//! scheduler uses, so the model never cares where a transfer actually
//! ran.
//!
//! The poll loop is started and stopped explicitly and never runs idle;
//! a failing status query stops the tracker rather than busy-retrying.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DownloadError;
use crate::region::StorageEvent;

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// One job's state as reported by the external queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSnapshot {
    /// Still transferring.
    Running { bytes_downloaded: u64, bytes_total: u64 },
    /// Finished successfully and left the queue.
    Completed,
    /// Finished with an error and left the queue.
    Failed,
}

/// The external download queue's status table.
pub trait ExternalQueue: Send + Sync + 'static {
    /// Looks up one job by its queue handle.
    fn query(&self, handle: u64) -> Result<QueueSnapshot, DownloadError>;
}

struct TrackerInner {
    tracked: Mutex<HashMap<String, u64>>,
    loop_token: Mutex<Option<CancellationToken>>,
}

/// Polls an [`ExternalQueue`] for byte progress.
pub struct ProgressTracker<Q: ExternalQueue> {
    queue: Arc<Q>,
    event_tx: mpsc::Sender<StorageEvent>,
    interval: Duration,
    inner: Arc<TrackerInner>,
}

impl<Q: ExternalQueue> ProgressTracker<Q> {
    pub fn new(queue: Arc<Q>, event_tx: mpsc::Sender<StorageEvent>) -> Self {
        Self::with_interval(queue, event_tx, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(
        queue: Arc<Q>,
        event_tx: mpsc::Sender<StorageEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            queue,
            event_tx,
            interval,
            inner: Arc::new(TrackerInner {
                tracked: Mutex::new(HashMap::new()),
                loop_token: Mutex::new(None),
            }),
        }
    }

    /// Starts following a job. Takes effect on the next poll.
    pub fn track(&self, region_id: impl Into<String>, handle: u64) {
        self.inner.tracked.lock().insert(region_id.into(), handle);
    }

    /// Stops following a job without emitting anything.
    pub fn untrack(&self, region_id: &str) {
        self.inner.tracked.lock().remove(region_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.tracked.lock().len()
    }

    /// Whether the poll loop is currently alive.
    pub fn is_running(&self) -> bool {
        self.inner.loop_token.lock().is_some()
    }

    /// Spawns the poll loop. A no-op when already running or when
    /// nothing is tracked; the loop must never burn cycles idle.
    pub fn start(&self) {
        let mut slot = self.inner.loop_token.lock();
        if slot.is_some() {
            return;
        }
        if self.inner.tracked.lock().is_empty() {
            debug!("progress tracker not started: nothing tracked");
            return;
        }
        let token = CancellationToken::new();
        *slot = Some(token.clone());
        drop(slot);

        let queue = self.queue.clone();
        let event_tx = self.event_tx.clone();
        let inner = self.inner.clone();
        let interval = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let jobs: Vec<(String, u64)> = inner
                    .tracked
                    .lock()
                    .iter()
                    .map(|(region, &handle)| (region.clone(), handle))
                    .collect();

                for (region_id, handle) in jobs {
                    match queue.query(handle) {
                        Ok(QueueSnapshot::Running {
                            bytes_downloaded,
                            bytes_total,
                        }) => {
                            let _ = event_tx
                                .send(StorageEvent::Progress {
                                    region_id,
                                    bytes_local: bytes_downloaded,
                                    bytes_total,
                                })
                                .await;
                        }
                        Ok(QueueSnapshot::Completed) => {
                            inner.tracked.lock().remove(&region_id);
                            let _ = event_tx
                                .send(StorageEvent::Completed { region_id })
                                .await;
                        }
                        Ok(QueueSnapshot::Failed) => {
                            inner.tracked.lock().remove(&region_id);
                            let _ = event_tx
                                .send(StorageEvent::Failed {
                                    region_id,
                                    error: DownloadError::Io(
                                        "external queue reported failure".into(),
                                    ),
                                })
                                .await;
                        }
                        Err(e) => {
                            // A broken status table would otherwise have
                            // us spinning once a second forever.
                            warn!(error = %e, "external queue query failed, stopping tracker");
                            inner.loop_token.lock().take();
                            return;
                        }
                    }
                }

                if inner.tracked.lock().is_empty() {
                    debug!("no jobs tracked, stopping poll loop");
                    inner.loop_token.lock().take();
                    return;
                }
            }
            inner.loop_token.lock().take();
        });
    }

    /// Stops the poll loop. Tracked jobs are kept; a later `start`
    /// resumes them.
    pub fn stop(&self) {
        if let Some(token) = self.inner.loop_token.lock().take() {
            token.cancel();
        }
    }
}
