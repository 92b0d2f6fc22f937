//! Single byte-range HTTP transfers.
//!
//! A [`ChunkTransfer`] moves one byte range of one remote file into a
//! caller-supplied [`ChunkSink`]. It owns the wire-level contract:
//! `Range` headers, 206/200 status validation, total-size cross-checks,
//! basic auth from URL user-info. Nothing else: persistence and
//! scheduling belong to the caller.
//!
//! ```text
//! TransferScheduler ──► ChunkTransfer ──► HTTP(S)
//!        ▲                    │
//!        └── (offset, bytes) ─┘   strictly increasing, contiguous
//! ```

mod transfer;
mod types;

pub use transfer::ChunkTransfer;
pub use types::{ChunkSink, TransferParams, VecSink};
