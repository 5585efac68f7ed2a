//! Sequential HTTPS body reader with mid-stream resumption.
//!
//! [`RangeReader`] streams an object's bytes over a pooled HTTPS client.
//! Reads are strictly sequential; a read at any other offset fails with
//! `InvalidArgument` and changes nothing. When the connection is truncated
//! mid-body (a routine event against object stores) the reader banks the
//! bytes it already delivered, reopens the object with a
//! `Range: bytes={offset}-` header, and keeps filling the caller's buffer
//! from the fresh response. Callers only ever see a contiguous byte stream.

use std::io;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tracing::{debug, warn};

use super::auth::AccessTokenProvider;
use crate::error::Status;

/// Send attempts per open, covering transient transport errors and one-shot
/// token refreshes after a 401.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

struct BodyState {
    response: reqwest::Response,
    /// Unconsumed tail of the last chunk pulled off the wire.
    buffered: Bytes,
    /// The body has been fully delivered.
    done: bool,
}

enum Pull {
    Data(Bytes),
    Eof,
    Truncated(String),
    Fatal(Status),
}

/// Sequential reader over one remote object.
pub struct RangeReader {
    client: reqwest::Client,
    provider: Arc<dyn AccessTokenProvider>,
    url: String,
    offset: u64,
    size: Option<u64>,
    body: Option<BodyState>,
}

impl RangeReader {
    /// Opens `url` for sequential reading: sends the initial GET (with
    /// bearer auth) and parses the response headers.
    pub async fn open(
        client: reqwest::Client,
        provider: Arc<dyn AccessTokenProvider>,
        url: impl Into<String>,
    ) -> Result<Self, Status> {
        let mut reader = Self {
            client,
            provider,
            url: url.into(),
            offset: 0,
            size: None,
            body: None,
        };
        reader.reopen().await?;
        Ok(reader)
    }

    /// Object length as advertised by the server, or `None` when it sent no
    /// `Content-Length` (reads still stream until EOF).
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    /// The next offset a read must start at.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads into `buf` starting at `offset`, which must equal the current
    /// offset. Returns the byte count delivered (the full buffer unless the
    /// body ended), and `Ok(0)` at EOF.
    pub async fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, Status> {
        if buf.is_empty() {
            return Err(Status::invalid_argument("empty read buffer"));
        }
        if offset != self.offset {
            return Err(Status::invalid_argument(format!(
                "only sequential access supported: expected offset {}, got {}",
                self.offset, offset
            )));
        }
        if self.body.is_none() {
            return Err(Status::invalid_argument("reader is closed"));
        }
        if self.body.as_ref().is_some_and(|b| b.done) {
            return Ok(0);
        }

        // `filled` counts bytes written into `buf`; `committed` the prefix of
        // those already reflected in `self.offset` (advanced early when a
        // truncation forces a ranged reopen).
        let mut filled = 0usize;
        let mut committed = 0usize;
        loop {
            {
                let body = self.body.as_mut().expect("body present during read");
                if !body.buffered.is_empty() {
                    let n = body.buffered.len().min(buf.len() - filled);
                    buf[filled..filled + n].copy_from_slice(&body.buffered[..n]);
                    body.buffered.advance(n);
                    filled += n;
                }
            }
            if filled == buf.len() {
                self.offset += (filled - committed) as u64;
                return Ok(filled);
            }

            let pull = {
                let body = self.body.as_mut().expect("body present during read");
                match body.response.chunk().await {
                    Ok(Some(bytes)) => Pull::Data(bytes),
                    Ok(None) => Pull::Eof,
                    Err(err) if is_stream_truncation(&err) => Pull::Truncated(err.to_string()),
                    Err(err) => Pull::Fatal(Status::transport(err.to_string())),
                }
            };
            match pull {
                Pull::Data(bytes) => {
                    self.body.as_mut().expect("body present during read").buffered = bytes;
                }
                Pull::Eof => {
                    self.body.as_mut().expect("body present during read").done = true;
                    self.offset += (filled - committed) as u64;
                    return Ok(filled);
                }
                Pull::Truncated(detail) => {
                    self.offset += (filled - committed) as u64;
                    committed = filled;
                    warn!(
                        url = %self.url,
                        offset = self.offset,
                        size = ?self.size,
                        error = %detail,
                        "stream truncated; reopening"
                    );
                    self.reopen().await?;
                    debug!(url = %self.url, size = ?self.size, "reopened after truncation");
                }
                Pull::Fatal(status) => {
                    self.body = None;
                    return Err(status);
                }
            }
        }
    }

    /// Releases the connection. A mid-body response is dropped rather than
    /// drained, so the pooled connection is not reused.
    pub fn close(&mut self) {
        if let Some(body) = self.body.take() {
            if !body.done {
                debug!(url = %self.url, offset = self.offset, "closed mid-body; dropping connection");
            }
        }
    }

    /// (Re)issues the GET, with `Range: bytes={offset}-` on resumed opens.
    /// Retries up to [`MAX_SEND_ATTEMPTS`] times, refreshing the access
    /// token after a 401.
    async fn reopen(&mut self) -> Result<(), Status> {
        self.body = None;
        let mut force_refresh = false;
        let mut last_err = Status::transport("no send attempts made");

        for attempt in 0..MAX_SEND_ATTEMPTS {
            let token = self.provider.access_token(force_refresh).await?;
            let mut request = self.client.get(&self.url).bearer_auth(&token);
            if self.offset > 0 {
                request = request.header(reqwest::header::RANGE, format!("bytes={}-", self.offset));
            }

            match request.send().await {
                Ok(response) => {
                    let http_status = response.status();
                    if http_status == reqwest::StatusCode::UNAUTHORIZED {
                        debug!(attempt, url = %self.url, "unauthorized; refreshing token");
                        force_refresh = true;
                        last_err = Status::transport("401 unauthorized");
                        continue;
                    }
                    if !http_status.is_success() {
                        return Err(Status::transport(format!(
                            "HTTP {http_status} from {}",
                            self.url
                        )));
                    }
                    if let Some(len) = response.content_length() {
                        // Ranged responses advertise the remaining length.
                        self.size = Some(self.offset + len);
                    }
                    self.body = Some(BodyState {
                        response,
                        buffered: Bytes::new(),
                        done: false,
                    });
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, url = %self.url, error = %err, "open failed");
                    last_err = Status::transport(err.to_string());
                }
            }
        }
        Err(last_err)
    }
}

impl std::fmt::Debug for RangeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeReader")
            .field("url", &self.url)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("open", &self.body.is_some())
            .finish_non_exhaustive()
    }
}

/// Classifies errors that mean "the connection died mid-body", the cases a
/// ranged reopen recovers from. Timeouts and protocol errors surface to the
/// caller instead.
fn is_stream_truncation(err: &reqwest::Error) -> bool {
    if err.is_timeout() {
        return false;
    }
    if err.is_body() || err.is_decode() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            );
        }
        source = cause.source();
    }
    false
}
