//! Transfer parameter and sink types.

use crate::error::{DownloadError, DownloadResult};

/// Everything a [`super::ChunkTransfer`] needs to issue one request.
#[derive(Debug, Clone)]
pub struct TransferParams {
    /// Remote file URL. May carry user-info, which becomes basic auth.
    pub url: String,

    /// First byte of the requested range (offset from file start).
    pub range_start: u64,

    /// Last byte of the range, inclusive. `None` means "to EOF".
    pub range_end: Option<u64>,

    /// Total remote file size, when known. Used as an integrity check
    /// against the server's reported length.
    pub expected_total_size: Option<u64>,

    /// Value for the `User-Agent` header.
    pub user_agent: String,

    /// Optional request body; when present the request is a POST.
    pub body: Option<Vec<u8>>,
}

impl TransferParams {
    /// A full-file GET with no integrity expectation.
    pub fn full_file(url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            range_start: 0,
            range_end: None,
            expected_total_size: None,
            user_agent: user_agent.into(),
            body: None,
        }
    }

    /// Whether this is a full-file request (no `Range` header at all).
    pub fn is_full_file(&self) -> bool {
        self.range_start == 0 && self.range_end.is_none()
    }
}

/// Receiver for the transfer's write events.
///
/// Writes arrive in strictly increasing, contiguous offset order for a
/// given transfer. Returning an error (conventionally
/// [`DownloadError::WriteRejected`]) stops the transfer immediately.
pub trait ChunkSink {
    fn write(&mut self, offset: u64, data: &[u8]) -> DownloadResult<()>;
}

/// In-memory sink for tests and small metadata fetches.
#[derive(Debug, Default)]
pub struct VecSink {
    start: Option<u64>,
    buf: Vec<u8>,
}

impl VecSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl ChunkSink for VecSink {
    fn write(&mut self, offset: u64, data: &[u8]) -> DownloadResult<()> {
        let start = *self.start.get_or_insert(offset);
        let expected = start + self.buf.len() as u64;
        if offset != expected {
            return Err(DownloadError::WriteRejected(format!(
                "non-contiguous write: offset {offset}, expected {expected}"
            )));
        }
        self.buf.extend_from_slice(data);
        Ok(())
    }
}
