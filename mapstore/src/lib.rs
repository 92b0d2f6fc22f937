//! mapstore - Offline map data acquisition
//!
//! This library implements the download side of an offline map stack:
//! a static region hierarchy, per-region download state, a chunked
//! resumable HTTP transfer layer behind a bounded worker pool, and the
//! observer plumbing that keeps UI surfaces current.
//!
//! The model ([`MapStorage`]) runs in a single coordination context and
//! owns all mutable state; transfers run on blocking worker threads and
//! report back over an event channel. Nothing in here spins up its own
//! runtime: the embedding application provides one and drains the event
//! channel.

pub mod bus;
pub mod chunk;
pub mod coord;
pub mod error;
pub mod migration;
pub mod progress;
pub mod region;
pub mod scheduler;
pub mod storage;
pub mod telemetry;

pub use bus::{SlotId, StorageObserver, SubscriptionBus};
pub use chunk::{ChunkSink, ChunkTransfer, TransferParams};
pub use coord::{LatLon, Rect};
pub use error::{CommandError, DownloadError, DownloadResult, MigrationError};
pub use migration::{MigrationConfig, MigrationController, MigrationState};
pub use region::{
    Category, MapStorage, MapStorageConfig, RegionItem, RegionStatus, RegionTree, StorageEvent,
    UpdateInfo,
};
pub use scheduler::{SchedulerConfig, TransferScheduler};
pub use storage::MapFilesStore;
