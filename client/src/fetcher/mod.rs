//! Resumable HTTP(S) downloads.
//!
//! A destination that already exists is treated as a true prefix of the
//! resource: the fetcher asks for the remainder with a `Range` header and
//! appends to it, falling back to a fresh download when the server will not
//! serve a partial body.

pub mod range;

use omni_core::{
    ProgressSample, ProgressSink, RateMeter, TransferError, TransferOutcome, TransferResult,
};
use range::{ContentRange, parse_content_range};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, HeaderName, RANGE};
use std::error::Error as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// What to do when the server answers a range request with something other
/// than the requested remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeFallback {
    /// Truncate the partial file and take the full body instead.
    #[default]
    Restart,
    /// Give up with [`TransferError::RangeNotHonored`], keeping the file.
    Fail,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Upper bound of the slices written (and reported) per network read.
    pub chunk_size: usize,
    pub range_fallback: RangeFallback,
    pub user_agent: String,
    /// Applies to establishing the connection only.
    pub connect_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            range_fallback: RangeFallback::default(),
            user_agent: concat!("omnifetch/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Truncate,
    Append,
}

/// What is known about the destination before the request goes out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferState {
    pub path: PathBuf,
    pub bytes_on_disk: u64,
    /// Filled in from the response headers.
    pub total_expected: Option<u64>,
    pub mode: WriteMode,
}

impl TransferState {
    /// Looks at `path`: a non-empty file is resumed, anything missing (or
    /// empty) starts from scratch.
    pub async fn inspect(path: &Path) -> Result<Self, TransferError> {
        let bytes_on_disk = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(TransferError::InvalidInput(format!(
                    "{} exists and is not a regular file",
                    path.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(TransferError::filesystem(path, e)),
        };
        Ok(Self {
            path: path.to_path_buf(),
            bytes_on_disk,
            total_expected: None,
            mode: if bytes_on_disk > 0 { WriteMode::Append } else { WriteMode::Truncate },
        })
    }

    /// The `Range` header value asking for the missing remainder.
    pub fn range_header(&self) -> Option<String> {
        (self.bytes_on_disk > 0).then(|| format!("bytes={}-", self.bytes_on_disk))
    }
}

/// The parts of a response that decide how it is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub content_range: Option<ContentRange>,
    pub content_length: Option<u64>,
}

impl ResponseHead {
    fn of(response: &reqwest::Response) -> Self {
        let header = |name: HeaderName| {
            response.headers().get(name).and_then(|v| v.to_str().ok())
        };
        Self {
            status: response.status().as_u16(),
            content_range: header(CONTENT_RANGE).and_then(parse_content_range),
            content_length: header(CONTENT_LENGTH).and_then(|v| v.trim().parse().ok()),
        }
    }
}

/// Outcome of matching a response against the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    /// Write the body at `start` (0 truncates, anything else appends).
    Write {
        mode: WriteMode,
        start: u64,
        total: Option<u64>,
    },
    /// The destination already holds the whole resource.
    Complete { total: u64 },
}

/// Decides what to do with a response, without touching the file.
///
/// # Errors
///
/// * `InconsistentResumeState` - the destination is larger than the
///   resource.
/// * `RangeNotHonored` - the server did not serve the requested remainder
///   and `fallback` is [`RangeFallback::Fail`], or it served a different
///   non-zero offset.
/// * `HttpStatus` - any other unusable status.
pub fn plan(
    state: &TransferState,
    head: &ResponseHead,
    fallback: RangeFallback,
    url: &Url,
) -> Result<Plan, TransferError> {
    let on_disk = state.bytes_on_disk;
    let status_error = || TransferError::HttpStatus {
        status: head.status,
        url: url.to_string(),
    };
    let oversize = |total: u64| TransferError::InconsistentResumeState {
        path: state.path.clone(),
        on_disk,
        total,
    };
    let restart = |total: Option<u64>| match fallback {
        RangeFallback::Restart => {
            tracing::warn!(%url, on_disk, "server ignored the range request; restarting from zero");
            Ok(Plan::Write {
                mode: WriteMode::Truncate,
                start: 0,
                total,
            })
        }
        RangeFallback::Fail => Err(TransferError::RangeNotHonored {
            url: url.to_string(),
        }),
    };

    match head.status {
        206 => {
            let (start, total) = match head.content_range {
                Some(ContentRange::Bytes { start, total, .. }) => {
                    (start, total.or(head.content_length.map(|len| start + len)))
                }
                Some(ContentRange::Unsatisfied { .. }) => return Err(status_error()),
                None => (on_disk, head.content_length.map(|len| on_disk + len)),
            };
            if let Some(total) = total.filter(|t| on_disk > *t) {
                return Err(oversize(total));
            }
            if start == on_disk {
                let mode = if start == 0 { WriteMode::Truncate } else { WriteMode::Append };
                Ok(Plan::Write { mode, start, total })
            } else if start == 0 {
                restart(total)
            } else {
                Err(TransferError::RangeNotHonored {
                    url: url.to_string(),
                })
            }
        }
        416 if on_disk > 0 => match head.content_range {
            Some(ContentRange::Unsatisfied { total }) if total == on_disk => {
                Ok(Plan::Complete { total })
            }
            Some(ContentRange::Unsatisfied { total }) if total < on_disk => Err(oversize(total)),
            _ => Err(status_error()),
        },
        s if (200..300).contains(&s) => {
            let total = head.content_length;
            if on_disk == 0 {
                return Ok(Plan::Write {
                    mode: WriteMode::Truncate,
                    start: 0,
                    total,
                });
            }
            if let Some(total) = total.filter(|t| on_disk > *t) {
                return Err(oversize(total));
            }
            restart(total)
        }
        _ => Err(status_error()),
    }
}

/// Chunked HTTP(S) downloader with byte-range resume.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    options: FetchOptions,
}

impl Fetcher {
    pub fn new() -> Result<Self, TransferError> {
        Self::with_options(FetchOptions::default())
    }

    pub fn with_options(options: FetchOptions) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .user_agent(options.user_agent.clone())
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|e| TransferError::InvalidInput(format!("HTTP client: {e}")))?;
        Ok(Self::with_client(client, options))
    }

    /// Uses a caller-built client; `options.user_agent` and
    /// `options.connect_timeout` are then up to that client.
    pub fn with_client(client: reqwest::Client, options: FetchOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// [`Fetcher::fetch`] with the configured chunk size and no cancellation.
    pub async fn fetch_to<S>(&self, url: &str, destination: &Path, sink: &mut S) -> TransferOutcome
    where
        S: ProgressSink + ?Sized,
    {
        self.fetch(
            url,
            destination,
            self.options.chunk_size,
            sink,
            &CancellationToken::new(),
        )
        .await
    }

    /// Downloads `url` into `destination`, resuming from whatever prefix is
    /// already there.
    ///
    /// # Arguments
    ///
    /// * `url` - Absolute `http` or `https` URL.
    /// * `destination` - Target file; missing parent directories are created.
    /// * `chunk_size` - Maximum bytes written between two progress samples.
    /// * `sink` - Receives one sample per written slice, strictly increasing.
    /// * `cancel` - Checked at every network suspension point.
    ///
    /// # Returns
    ///
    /// The destination path, its final size and the time the call took.
    ///
    /// # Errors
    ///
    /// Any [`TransferError`]. After `Network` or `Cancelled` the file holds a
    /// valid prefix and the call can simply be repeated.
    pub async fn fetch<S>(
        &self,
        url: &str,
        destination: &Path,
        chunk_size: usize,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> TransferOutcome
    where
        S: ProgressSink + ?Sized,
    {
        let started = Instant::now();
        if chunk_size == 0 {
            return Err(TransferError::InvalidInput("chunk size must be positive".into()));
        }
        let url = Url::parse(url).map_err(|e| TransferError::InvalidInput(format!("{url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransferError::InvalidInput(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::filesystem(parent, e))?;
        }

        let mut state = TransferState::inspect(destination).await?;
        let mut request = self.client.get(url.clone());
        if let Some(range) = state.range_header() {
            tracing::info!(%url, resume_from = state.bytes_on_disk, "resuming download");
            request = request.header(RANGE, range);
        }

        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            sent = request.send() => sent.map_err(|e| network(&url, &e))?,
        };
        let head = ResponseHead::of(&response);
        tracing::debug!(?head, "response received");

        let (mode, start, total) = match plan(&state, &head, self.options.range_fallback, &url)? {
            Plan::Complete { total } => {
                tracing::info!(path = %destination.display(), total, "already complete");
                sink.on_progress(&ProgressSample {
                    bytes: total,
                    total: Some(total),
                    elapsed: started.elapsed(),
                    rate: 0.0,
                });
                return Ok(TransferResult {
                    path: destination.to_path_buf(),
                    total_bytes: total,
                    elapsed: started.elapsed(),
                });
            }
            Plan::Write { mode, start, total } => (mode, start, total),
        };
        state.mode = mode;
        state.total_expected = total;

        let mut file = open(&state).await?;
        let mut written = start;
        let mut meter = RateMeter::default();
        meter.record(Instant::now(), written);
        let mut reported = false;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!(written, "download cancelled");
                    return Err(TransferError::Cancelled);
                }
                chunk = response.chunk() => chunk.map_err(|e| network(&url, &e))?,
            };
            let Some(chunk) = chunk else {
                break;
            };

            if let Some(total) = total.filter(|t| written + chunk.len() as u64 > *t) {
                return Err(TransferError::Network {
                    url: url.to_string(),
                    message: format!("server sent more than the declared {total} bytes"),
                });
            }

            for slice in chunk.chunks(chunk_size) {
                file.write_all(slice)
                    .await
                    .map_err(|e| TransferError::filesystem(destination, e))?;
                file.flush()
                    .await
                    .map_err(|e| TransferError::filesystem(destination, e))?;
                written += slice.len() as u64;
                sink.on_progress(&ProgressSample {
                    bytes: written,
                    total,
                    elapsed: started.elapsed(),
                    rate: meter.record(Instant::now(), written),
                });
                reported = true;
            }
        }

        if let Some(total) = total.filter(|t| written < *t) {
            return Err(TransferError::Network {
                url: url.to_string(),
                message: format!("connection closed after {written} of {total} bytes"),
            });
        }
        if !reported {
            sink.on_progress(&ProgressSample {
                bytes: written,
                total: Some(written),
                elapsed: started.elapsed(),
                rate: 0.0,
            });
        }

        let elapsed = started.elapsed();
        tracing::info!(
            path = %destination.display(),
            bytes = written,
            secs = elapsed.as_secs_f64(),
            "download complete"
        );
        Ok(TransferResult {
            path: destination.to_path_buf(),
            total_bytes: written,
            elapsed,
        })
    }
}

async fn open(state: &TransferState) -> Result<File, TransferError> {
    let mut options = OpenOptions::new();
    options.create(true);
    match state.mode {
        WriteMode::Truncate => options.write(true).truncate(true),
        WriteMode::Append => options.append(true),
    };
    options
        .open(&state.path)
        .await
        .map_err(|e| TransferError::filesystem(&state.path, e))
}

/// Flattens a reqwest error and its causes into one message.
fn network(url: &Url, err: &reqwest::Error) -> TransferError {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    TransferError::Network {
        url: url.to_string(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omni_core::ErrorKind;

    fn state(on_disk: u64) -> TransferState {
        TransferState {
            path: PathBuf::from("out.bin"),
            bytes_on_disk: on_disk,
            total_expected: None,
            mode: if on_disk > 0 { WriteMode::Append } else { WriteMode::Truncate },
        }
    }

    fn head(status: u16, content_range: Option<&str>, content_length: Option<u64>) -> ResponseHead {
        ResponseHead {
            status,
            content_range: content_range.and_then(parse_content_range),
            content_length,
        }
    }

    fn url() -> Url {
        Url::parse("http://example.com/file.bin").unwrap()
    }

    fn run(on_disk: u64, h: ResponseHead, fallback: RangeFallback) -> Result<Plan, ErrorKind> {
        plan(&state(on_disk), &h, fallback, &url()).map_err(|e| e.kind())
    }

    #[test]
    fn test_range_header() {
        assert_eq!(state(0).range_header(), None);
        assert_eq!(state(4096).range_header().as_deref(), Some("bytes=4096-"));
    }

    #[test]
    fn test_fresh_download() {
        assert_eq!(
            run(0, head(200, None, Some(10_000)), RangeFallback::Fail),
            Ok(Plan::Write { mode: WriteMode::Truncate, start: 0, total: Some(10_000) })
        );
        assert_eq!(
            run(0, head(200, None, None), RangeFallback::Fail),
            Ok(Plan::Write { mode: WriteMode::Truncate, start: 0, total: None })
        );
    }

    #[test]
    fn test_partial_content_appends() {
        assert_eq!(
            run(4096, head(206, Some("bytes 4096-9999/10000"), Some(5904)), RangeFallback::Fail),
            Ok(Plan::Write { mode: WriteMode::Append, start: 4096, total: Some(10_000) })
        );
        // Unknown total in Content-Range falls back to Content-Length.
        assert_eq!(
            run(4096, head(206, Some("bytes 4096-9999/*"), Some(5904)), RangeFallback::Fail),
            Ok(Plan::Write { mode: WriteMode::Append, start: 4096, total: Some(10_000) })
        );
        assert_eq!(
            run(100, head(206, None, Some(50)), RangeFallback::Fail),
            Ok(Plan::Write { mode: WriteMode::Append, start: 100, total: Some(150) })
        );
    }

    #[test]
    fn test_ignored_range() {
        assert_eq!(
            run(4096, head(200, None, Some(10_000)), RangeFallback::Restart),
            Ok(Plan::Write { mode: WriteMode::Truncate, start: 0, total: Some(10_000) })
        );
        assert_eq!(
            run(4096, head(200, None, Some(10_000)), RangeFallback::Fail),
            Err(ErrorKind::RangeNotHonored)
        );
        assert_eq!(
            run(4096, head(206, Some("bytes 0-9999/10000"), None), RangeFallback::Restart),
            Ok(Plan::Write { mode: WriteMode::Truncate, start: 0, total: Some(10_000) })
        );
        assert_eq!(
            run(4096, head(206, Some("bytes 2048-9999/10000"), None), RangeFallback::Restart),
            Err(ErrorKind::RangeNotHonored)
        );
    }

    #[test]
    fn test_oversize_destination() {
        assert_eq!(
            run(20_000, head(200, None, Some(10_000)), RangeFallback::Restart),
            Err(ErrorKind::InconsistentResumeState)
        );
        assert_eq!(
            run(20_000, head(416, Some("bytes */10000"), None), RangeFallback::Restart),
            Err(ErrorKind::InconsistentResumeState)
        );
    }

    #[test]
    fn test_unsatisfiable_range() {
        assert_eq!(
            run(10_000, head(416, Some("bytes */10000"), None), RangeFallback::Fail),
            Ok(Plan::Complete { total: 10_000 })
        );
        assert_eq!(
            run(500, head(416, Some("bytes */10000"), None), RangeFallback::Fail),
            Err(ErrorKind::HttpStatus)
        );
        assert_eq!(run(0, head(416, None, None), RangeFallback::Fail), Err(ErrorKind::HttpStatus));
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(run(0, head(404, None, None), RangeFallback::Restart), Err(ErrorKind::HttpStatus));
        assert_eq!(run(10, head(500, None, None), RangeFallback::Restart), Err(ErrorKind::HttpStatus));
    }

    #[tokio::test]
    async fn test_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        let fresh = TransferState::inspect(&path).await.unwrap();
        assert_eq!((fresh.bytes_on_disk, fresh.mode), (0, WriteMode::Truncate));

        std::fs::write(&path, [1u8; 77]).unwrap();
        let partial = TransferState::inspect(&path).await.unwrap();
        assert_eq!((partial.bytes_on_disk, partial.mode), (77, WriteMode::Append));

        let err = TransferState::inspect(dir.path()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_rejects_bad_arguments() {
        let fetcher = Fetcher::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("x");
        let cancel = CancellationToken::new();
        let sink = &mut omni_core::Silent;

        let err = fetcher.fetch("not a url", &out, 1024, sink, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = fetcher.fetch("ftp://host/x", &out, 1024, sink, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = fetcher.fetch("http://host/x", &out, 0, sink, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(!out.exists());
    }
}
