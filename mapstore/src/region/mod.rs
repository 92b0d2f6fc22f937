//! Region tree, per-region download status, and the command surface.
//!
//! A region is a node in the downloadable-content hierarchy (a country
//! or sub-area). Leaves carry authoritative download state; a non-leaf
//! region's status and progress are always derived from its leaf
//! descendants, never set directly.
//!
//! [`MapStorage`] is the coordination-context owner of all of it: UI
//! commands come in, scheduler events are applied, observers are
//! notified through the subscription bus.

mod item;
mod model;
mod status;
mod tree;

pub use item::{Category, RegionItem, UpdateInfo};
pub use model::{
    MapStorage, MapStorageConfig, StorageEvent, TransferBackend, TransferRequest,
    DEFAULT_USER_AGENT,
};
pub use status::{aggregate_status, RegionStatus};
pub use tree::{RegionNode, RegionSpec, RegionTree, TreeError};
