//! Transfer targets, results and the failure taxonomy.

use crate::magnet::MagnetLink;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// What is being fetched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferTarget {
    /// A plain HTTP(S) resource.
    Url(Url),
    /// A swarm identified by info hash only.
    Magnet(MagnetLink),
    /// A swarm with full metadata already at hand.
    Descriptor(DescriptorSource),
}

/// Where torrent descriptor bytes come from.
#[derive(Clone, PartialEq, Eq)]
pub enum DescriptorSource {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

impl fmt::Debug for DescriptorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DescriptorSource::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
            DescriptorSource::Path(p) => f.debug_tuple("Path").field(p).finish(),
        }
    }
}

impl fmt::Display for TransferTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferTarget::Url(url) => write!(f, "{url}"),
            TransferTarget::Magnet(link) => write!(f, "magnet {}", link.info_hash_hex()),
            TransferTarget::Descriptor(DescriptorSource::Path(p)) => {
                write!(f, "torrent {}", p.display())
            }
            TransferTarget::Descriptor(DescriptorSource::Bytes(b)) => {
                write!(f, "torrent ({} bytes)", b.len())
            }
        }
    }
}

/// Successful outcome of a transfer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    /// Final file (fetcher) or storage directory (swarm).
    pub path: PathBuf,
    /// Bytes present at `path` once the call returned.
    pub total_bytes: u64,
    /// Wall-clock time spent in the call.
    pub elapsed: Duration,
}

pub type TransferOutcome = Result<TransferResult, TransferError>;

/// Typed transfer failures surfaced to callers.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("server returned {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "{} holds {on_disk} bytes but the server declares {total}; delete it before retrying",
        path.display()
    )]
    InconsistentResumeState {
        path: PathBuf,
        on_disk: u64,
        total: u64,
    },

    #[error("server ignored the range request for {url}")]
    RangeNotHonored { url: String },

    #[error("storage error at {}: {message}", path.display())]
    Storage { path: PathBuf, message: String },

    #[error("swarm session error: {0}")]
    Session(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("transfer cancelled")]
    Cancelled,
}

/// Field-less view of [`TransferError`] for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Network,
    HttpStatus,
    Filesystem,
    InconsistentResumeState,
    RangeNotHonored,
    Storage,
    Session,
    InvalidInput,
    Cancelled,
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Network { .. } => ErrorKind::Network,
            TransferError::HttpStatus { .. } => ErrorKind::HttpStatus,
            TransferError::Filesystem { .. } => ErrorKind::Filesystem,
            TransferError::InconsistentResumeState { .. } => ErrorKind::InconsistentResumeState,
            TransferError::RangeNotHonored { .. } => ErrorKind::RangeNotHonored,
            TransferError::Storage { .. } => ErrorKind::Storage,
            TransferError::Session(_) => ErrorKind::Session,
            TransferError::InvalidInput(_) => ErrorKind::InvalidInput,
            TransferError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying the same call unchanged can succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Network
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        TransferError::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn storage(path: impl Into<PathBuf>, message: impl fmt::Display) -> Self {
        TransferError::Storage {
            path: path.into(),
            message: message.to_string(),
        }
    }
}
