//! Blocking execution of a single chunk transfer.

use std::io::Read;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{self, HeaderValue};
use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::types::{ChunkSink, TransferParams};
use crate::error::{DownloadError, DownloadResult};

/// Connect timeout applied to every attempt.
const CONNECT_TIMEOUT_SECS: u64 = 60;

/// Whole-request deadline used by [`ChunkTransfer::new`].
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Read-buffer ladder. A failed read retries the remaining range with
/// the next smaller buffer before the transfer gives up; tiny buffers
/// survive flaky connections that drop long reads.
const BUFFER_LADDER: [usize; 3] = [64 * 1024, 32 * 1024, 1024];

/// Downloads one byte range of one remote file into a [`ChunkSink`].
///
/// The transfer blocks on socket I/O and is meant to run inside a worker
/// slot (`spawn_blocking`); it never touches the filesystem itself.
pub struct ChunkTransfer {
    client: Client,
}

impl ChunkTransfer {
    /// Creates a transfer with the default 60 s request deadline.
    pub fn new() -> DownloadResult<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Creates a transfer with a custom whole-request deadline. The
    /// blocking client has no per-read timeout; the deadline covers one
    /// request end to end, so it must be sized for a full chunk.
    /// Connection establishment is capped at 60 s separately.
    pub fn with_timeout(timeout: Duration) -> DownloadResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(timeout)
            .build()
            .map_err(|e| DownloadError::Io(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Runs the transfer to completion, cancellation, or failure.
    ///
    /// Returns the number of bytes handed to the sink. Cancellation is
    /// observed at buffer boundaries only; no partial buffer is ever
    /// delivered after the token trips.
    pub fn run(
        &self,
        params: &TransferParams,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> DownloadResult<u64> {
        let url = reqwest::Url::parse(&params.url)
            .map_err(|_| DownloadError::InvalidUrl(params.url.clone()))?;

        let mut offset = params.range_start;
        let mut transferred = 0u64;

        for (attempt, &buf_size) in BUFFER_LADDER.iter().enumerate() {
            match self.attempt(&url, params, buf_size, &mut offset, &mut transferred, sink, cancel)
            {
                Ok(()) => return Ok(transferred),
                // Only socket-read failures shrink the buffer; anything
                // else (bad status, size mismatch, sink rejection,
                // cancellation) is a hard stop.
                Err(DownloadError::Io(msg)) if attempt + 1 < BUFFER_LADDER.len() => {
                    warn!(
                        url = %params.url,
                        offset,
                        next_buffer = BUFFER_LADDER[attempt + 1],
                        "read failed ({msg}), retrying with smaller buffer"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(DownloadError::Io(format!(
            "transfer of {} failed at offset {offset} after {} attempts",
            params.url,
            BUFFER_LADDER.len()
        )))
    }

    /// One request/read-loop pass starting at `*offset`.
    #[allow(clippy::too_many_arguments)]
    fn attempt(
        &self,
        url: &reqwest::Url,
        params: &TransferParams,
        buf_size: usize,
        offset: &mut u64,
        transferred: &mut u64,
        sink: &mut dyn ChunkSink,
        cancel: &CancellationToken,
    ) -> DownloadResult<()> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        // A request is "full file" only while nothing has been fetched
        // yet; a shrink-retry mid-file always resumes with a range.
        let ranged = !(params.is_full_file() && *offset == 0);

        let mut clean_url = url.clone();
        let username = url.username().to_string();
        let password = url.password().map(str::to_string);
        if !username.is_empty() {
            // Credentials travel as an Authorization header, not in the
            // request line.
            let _ = clean_url.set_username("");
            let _ = clean_url.set_password(None);
        }

        let mut request = match &params.body {
            Some(body) => self.client.post(clean_url).body(body.clone()),
            None => self.client.get(clean_url),
        };
        request = request.header(header::USER_AGENT, params.user_agent.as_str());
        if !username.is_empty() {
            request = request.basic_auth(&username, password.as_deref());
        }
        if ranged {
            let value = match params.range_end {
                Some(end) => format!("bytes={}-{}", *offset, end),
                None => format!("bytes={}-", *offset),
            };
            request = request.header(header::RANGE, value);
        }

        let mut response = request.send().map_err(map_reqwest_error)?;

        let status = response.status();
        let expected = if ranged {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        if status != expected {
            if status.is_client_error() || status.is_server_error() {
                return Err(DownloadError::ServerError(status.as_u16()));
            }
            return Err(DownloadError::InconsistentResponse {
                expected: expected.as_u16(),
                actual: status.as_u16(),
            });
        }

        if let Some(expected_size) = params.expected_total_size {
            let reported = if ranged {
                response
                    .headers()
                    .get(header::CONTENT_RANGE)
                    .and_then(parse_content_range_total)
            } else {
                response.content_length()
            };
            if let Some(reported) = reported {
                if reported != expected_size {
                    return Err(DownloadError::InconsistentFileSize {
                        expected: expected_size,
                        reported,
                    });
                }
            }
        }

        debug!(url = %params.url, offset = *offset, buf_size, ranged, "streaming chunk");

        let mut buf = vec![0u8; buf_size];
        loop {
            if cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            let n = response
                .read(&mut buf)
                .map_err(|e| DownloadError::Io(e.to_string()))?;
            if n == 0 {
                return Ok(());
            }
            sink.write(*offset, &buf[..n])?;
            *offset += n as u64;
            *transferred += n as u64;
        }
    }
}

/// Classifies a reqwest transport error into the download taxonomy.
fn map_reqwest_error(e: reqwest::Error) -> DownloadError {
    if e.is_connect() {
        DownloadError::NoInternet
    } else if e.is_builder() {
        DownloadError::InvalidUrl(e.to_string())
    } else {
        // Timeouts and mid-stream failures are plain I/O errors,
        // eligible for a caller-issued retry.
        DownloadError::Io(e.to_string())
    }
}

/// Extracts the total size from a `Content-Range: bytes <s>-<e>/<total>`
/// header. Returns `None` for `*/...` or malformed values.
fn parse_content_range_total(value: &HeaderValue) -> Option<u64> {
    let s = value.to_str().ok()?;
    let total = s.strip_prefix("bytes ")?.rsplit('/').next()?;
    total.parse().ok()
}
