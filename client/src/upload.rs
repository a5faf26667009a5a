//! Re-uploading finished downloads.

use std::future::Future;
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload to {url} failed: {message}")]
    Http { url: String, message: String },

    #[error("upload to {url} rejected with {status}")]
    Status { status: u16, url: String },

    #[error("invalid upload endpoint: {0}")]
    InvalidEndpoint(String),
}

/// Where and as whom to upload. Passed explicitly; nothing here reads the
/// environment.
#[derive(Clone)]
pub struct UploadConfig {
    /// Base URL; uploaded paths are appended below it.
    pub endpoint: Url,
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for UploadConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

pub trait Uploader: Send + Sync {
    /// Uploads a file, or every file below a directory, and returns the
    /// resulting URLs.
    fn upload(&self, path: &Path) -> impl Future<Output = Result<Vec<Url>, UploadError>> + Send;
}

/// Uploads with HTTP `PUT` and basic auth, e.g. to a WebDAV share.
#[derive(Debug, Clone)]
pub struct HttpPutUploader {
    client: reqwest::Client,
    config: UploadConfig,
}

impl HttpPutUploader {
    pub fn new(config: UploadConfig) -> Result<Self, UploadError> {
        if config.endpoint.cannot_be_a_base() {
            return Err(UploadError::InvalidEndpoint(config.endpoint.to_string()));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("omnifetch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UploadError::InvalidEndpoint(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn target(&self, segments: &[String]) -> Result<Url, UploadError> {
        let mut url = self.config.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| UploadError::InvalidEndpoint(self.config.endpoint.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn put(&self, path: &Path, url: Url) -> Result<Url, UploadError> {
        let io_error = |source| UploadError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = tokio::fs::File::open(path).await.map_err(io_error)?;
        let length = file.metadata().await.map_err(io_error)?.len();

        let response = self
            .client
            .put(url.clone())
            .basic_auth(&self.config.username, Some(&self.config.password))
            .header(reqwest::header::CONTENT_LENGTH, length)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .map_err(|e| UploadError::Http {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(UploadError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }
        tracing::info!(file = %path.display(), %url, bytes = length, "uploaded");
        Ok(url)
    }
}

impl Uploader for HttpPutUploader {
    async fn upload(&self, path: &Path) -> Result<Vec<Url>, UploadError> {
        let mut urls = Vec::new();
        for (file, segments) in collect_files(path).await? {
            let url = self.target(&segments)?;
            urls.push(self.put(&file, url).await?);
        }
        Ok(urls)
    }
}

/// Every regular file at or below `root`, with its path segments relative to
/// the parent of `root`, in a stable order.
async fn collect_files(root: &Path) -> Result<Vec<(PathBuf, Vec<String>)>, UploadError> {
    let io_error = |path: &Path, source| UploadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let name = |path: &Path| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    let mut files = Vec::new();
    let mut pending = vec![(root.to_path_buf(), vec![name(root)])];
    while let Some((path, segments)) = pending.pop() {
        let meta = tokio::fs::metadata(&path).await.map_err(|e| io_error(&path, e))?;
        if meta.is_file() {
            files.push((path, segments));
            continue;
        }
        if !meta.is_dir() {
            continue;
        }
        let mut entries = tokio::fs::read_dir(&path).await.map_err(|e| io_error(&path, e))?;
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&path, e))? {
            let child = entry.path();
            let mut child_segments = segments.clone();
            child_segments.push(name(&child));
            pending.push((child, child_segments));
        }
    }
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}
