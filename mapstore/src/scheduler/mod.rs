//! Turning "download this region" into chunk transfers and one
//! consistent on-disk result.
//!
//! ```text
//! MapStorage ──enqueue/cancel──► TransferScheduler
//!                                     │ permit (bounded pool)
//!                                     ▼
//!                               ChunkTransfer(s)  ── sequential per file
//!                                     │
//!                               FileSink (.downloading)
//!                                     │
//!           StorageEvent channel ◄────┘  Started / Progress / Completed /
//!                                         Failed / Cancelled
//! ```
//!
//! Concurrency is bounded by worker permits, not logical jobs: any
//! number of regions may be enqueued, at most `worker_count` transfer
//! threads run. Chunks of one file run sequentially inside their job,
//! which is what serializes writes per target file.

mod job;
#[allow(clippy::module_inception)]
mod scheduler;

pub use job::JobId;
pub use scheduler::{SchedulerConfig, TransferScheduler};
