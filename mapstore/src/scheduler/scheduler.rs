//! The bounded-worker transfer scheduler.

use std::fs::OpenOptions;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::JobId;
use crate::chunk::{ChunkSink, ChunkTransfer, TransferParams};
use crate::error::{DownloadError, DownloadResult};
use crate::region::{StorageEvent, TransferBackend, TransferRequest};
use crate::storage::MapFilesStore;
use crate::telemetry::TransferMetrics;

/// Default number of concurrent transfer workers. Bounds sockets and
/// buffer memory, not logical jobs.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default chunk size for splitting a known-size download.
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent transfer workers.
    pub worker_count: usize,
    /// Byte-range size per chunk when the total size is known.
    pub chunk_size: u64,
    /// Whole-request deadline per chunk attempt; sized for a full
    /// chunk, not a single read.
    pub timeout: Duration,
    /// User-Agent for every request.
    pub user_agent: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: Duration::from_secs(300),
            user_agent: crate::region::DEFAULT_USER_AGENT.to_string(),
        }
    }
}

struct ActiveJob {
    job_id: JobId,
    cancel: CancellationToken,
}

/// Owns the worker pool and the active-job table.
///
/// `enqueue` is idempotent per target URL; `cancel` is cooperative at
/// buffer granularity and always keeps the partial file. All terminal
/// and progress reporting flows through the [`StorageEvent`] channel
/// back to the coordination context.
pub struct TransferScheduler {
    config: SchedulerConfig,
    store: MapFilesStore,
    permits: Arc<Semaphore>,
    /// Active jobs keyed by target URL, the idempotency key.
    active: Arc<DashMap<String, ActiveJob>>,
    /// Region id → target URL, for cancellation by region.
    by_region: Arc<DashMap<String, String>>,
    event_tx: mpsc::Sender<StorageEvent>,
    metrics: Arc<TransferMetrics>,
}

impl TransferScheduler {
    /// Builds a scheduler writing into `store` and reporting on
    /// `event_tx`. Construction is runtime-agnostic; `enqueue` must be
    /// called inside a tokio runtime, which jobs are spawned onto.
    pub fn new(
        config: SchedulerConfig,
        store: MapFilesStore,
        event_tx: mpsc::Sender<StorageEvent>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.worker_count));
        Self {
            config,
            store,
            permits,
            active: Arc::new(DashMap::new()),
            by_region: Arc::new(DashMap::new()),
            event_tx,
            metrics: Arc::new(TransferMetrics::new()),
        }
    }

    /// Number of jobs queued or running.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Transfer counters for status displays.
    pub fn metrics(&self) -> Arc<TransferMetrics> {
        self.metrics.clone()
    }

    fn spawn_job(&self, request: TransferRequest) {
        let job_id = JobId::next();
        let cancel = CancellationToken::new();
        self.active.insert(
            request.url.clone(),
            ActiveJob {
                job_id,
                cancel: cancel.clone(),
            },
        );
        self.by_region
            .insert(request.region_id.clone(), request.url.clone());
        info!(%job_id, region = request.region_id.as_str(), url = request.url.as_str(), "job enqueued");

        let permits = self.permits.clone();
        let active = self.active.clone();
        let by_region = self.by_region.clone();
        let event_tx = self.event_tx.clone();
        let store = self.store.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let region_id = request.region_id.clone();
            let url = request.url.clone();

            // Wait for a worker slot; a cancel while queued never
            // reaches the network.
            let permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return, // pool torn down
                },
                _ = cancel.cancelled() => {
                    debug!(%job_id, region = region_id.as_str(), "cancelled while queued");
                    active.remove(&url);
                    by_region.remove(&region_id);
                    let _ = event_tx
                        .send(StorageEvent::Cancelled { region_id })
                        .await;
                    return;
                }
            };

            metrics.job_started();
            let _ = event_tx
                .send(StorageEvent::Started {
                    region_id: region_id.clone(),
                })
                .await;

            let blocking_tx = event_tx.clone();
            let blocking_cancel = cancel.clone();
            let result = tokio::task::spawn_blocking(move || {
                run_job(
                    &config,
                    &store,
                    &request,
                    blocking_tx,
                    &blocking_cancel,
                )
            })
            .await;
            drop(permit);

            active.remove(&url);
            by_region.remove(&region_id);

            let event = match result {
                Ok(Ok(bytes)) => {
                    metrics.job_completed(bytes);
                    info!(%job_id, region = region_id.as_str(), bytes, "job completed");
                    StorageEvent::Completed { region_id }
                }
                Ok(Err(DownloadError::Cancelled)) => {
                    debug!(%job_id, region = region_id.as_str(), "job cancelled");
                    StorageEvent::Cancelled { region_id }
                }
                Ok(Err(error)) => {
                    metrics.job_failed();
                    warn!(%job_id, region = region_id.as_str(), %error, "job failed");
                    StorageEvent::Failed { region_id, error }
                }
                Err(join_error) => {
                    metrics.job_failed();
                    StorageEvent::Failed {
                        region_id,
                        error: DownloadError::Io(format!("worker panicked: {join_error}")),
                    }
                }
            };
            let _ = event_tx.send(event).await;
        });
    }
}

impl TransferBackend for TransferScheduler {
    fn enqueue(&self, request: TransferRequest) {
        if self.active.contains_key(&request.url) {
            // Same URL already queued or running; the duplicate is a
            // no-op, not an error.
            debug!(url = request.url.as_str(), "duplicate enqueue ignored");
            return;
        }
        self.spawn_job(request);
    }

    fn cancel(&self, region_id: &str) {
        let Some(url) = self.by_region.get(region_id).map(|u| u.clone()) else {
            debug!(region = region_id, "cancel for unknown job ignored");
            return;
        };
        if let Some(job) = self.active.get(&url) {
            info!(job_id = %job.job_id, region = region_id, "cancelling job");
            job.cancel.cancel();
        }
    }
}

/// Executes one job on a blocking worker: opens the partial file,
/// re-stats the resume offset, and runs chunk transfers sequentially
/// until the file is complete.
fn run_job(
    config: &SchedulerConfig,
    store: &MapFilesStore,
    request: &TransferRequest,
    event_tx: mpsc::Sender<StorageEvent>,
    cancel: &CancellationToken,
) -> DownloadResult<u64> {
    // The blocking HTTP client must be built and dropped on a blocking
    // worker; its pool teardown panics inside the async runtime.
    let transfer = ChunkTransfer::with_timeout(config.timeout)?;

    // The file on disk, not the request, is the resume authority; the
    // job may have been queued for a while.
    let mut offset = store.partial_size(&request.region_id);
    let total = request.expected_total_size;

    let mut sink = FileSink::open(
        store,
        &request.region_id,
        offset,
        total.unwrap_or(0),
        event_tx,
    )?;
    let mut transferred = 0u64;

    loop {
        if let Some(total) = total {
            if offset >= total {
                break;
            }
        }
        let params = TransferParams {
            url: request.url.clone(),
            range_start: offset,
            range_end: total.map(|t| (offset + config.chunk_size).min(t) - 1),
            expected_total_size: total,
            user_agent: config.user_agent.clone(),
            body: None,
        };
        let n = transfer.run(&params, &mut sink, cancel)?;
        if total.is_none() {
            // Unknown size: one request to EOF is the whole job.
            transferred += n;
            break;
        }
        if n == 0 {
            // The server accepted the range but sent nothing; bail out
            // instead of spinning on the same offset.
            return Err(DownloadError::Io(format!(
                "empty chunk at offset {offset} for {}",
                request.url
            )));
        }
        offset += n;
        transferred += n;
    }

    sink.flush()?;
    Ok(transferred)
}

/// Append-only writer for one job's partial file. Checks offset
/// contiguity and reports buffer-granularity progress; an I/O failure
/// surfaces as `WriteRejected`, which stops the transfer immediately.
struct FileSink {
    writer: BufWriter<std::fs::File>,
    region_id: String,
    expected_offset: u64,
    bytes_total: u64,
    event_tx: mpsc::Sender<StorageEvent>,
}

impl FileSink {
    fn open(
        store: &MapFilesStore,
        region_id: &str,
        offset: u64,
        bytes_total: u64,
        event_tx: mpsc::Sender<StorageEvent>,
    ) -> DownloadResult<Self> {
        let path = store.partial_path(region_id);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| DownloadError::WriteRejected(e.to_string()))?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| DownloadError::WriteRejected(e.to_string()))?;
        Ok(Self {
            writer: BufWriter::new(file),
            region_id: region_id.to_string(),
            expected_offset: offset,
            bytes_total,
            event_tx,
        })
    }

    fn flush(&mut self) -> DownloadResult<()> {
        self.writer
            .flush()
            .map_err(|e| DownloadError::WriteRejected(e.to_string()))
    }
}

impl ChunkSink for FileSink {
    fn write(&mut self, offset: u64, data: &[u8]) -> DownloadResult<()> {
        if offset != self.expected_offset {
            return Err(DownloadError::WriteRejected(format!(
                "non-contiguous write for {}: offset {offset}, expected {}",
                self.region_id, self.expected_offset
            )));
        }
        self.writer
            .write_all(data)
            .map_err(|e| DownloadError::WriteRejected(e.to_string()))?;
        self.expected_offset += data.len() as u64;

        // Buffer-granularity progress; blocking_send applies
        // backpressure instead of dropping updates.
        let _ = self.event_tx.blocking_send(StorageEvent::Progress {
            region_id: self.region_id.clone(),
            bytes_local: self.expected_offset,
            bytes_total: self.bytes_total,
        });
        Ok(())
    }
}
