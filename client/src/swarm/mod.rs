//! Swarm transfers: the engine capability seam and the driver that walks a
//! torrent from magnet or descriptor to completion.

mod driver;

pub use driver::{DriveState, DriverOptions, SwarmDriver};

use omni_core::{Descriptor, MagnetLink, TransferError};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Snapshot of a running swarm session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SwarmStatus {
    /// Verified fraction in `[0, 1]`.
    pub progress: f64,
    /// Bytes per second.
    pub download_rate: f64,
    /// Verified bytes present, resumed ones included.
    pub total_done: u64,
    pub total_size: u64,
    pub peers: usize,
    /// Set once the engine hit an unrecoverable failure.
    pub error: Option<String>,
}

/// A BitTorrent implementation able to join swarms.
pub trait SwarmEngine: Send + Sync {
    type Handle: SwarmHandle;

    /// Joins a swarm knowing only its info hash; metadata arrives later.
    fn add_magnet(
        &self,
        link: &MagnetLink,
    ) -> impl Future<Output = Result<Self::Handle, TransferError>> + Send;

    /// Joins a swarm with full metadata at hand.
    fn add_descriptor(
        &self,
        descriptor: Descriptor,
    ) -> impl Future<Output = Result<Self::Handle, TransferError>> + Send;
}

/// One torrent inside an engine.
pub trait SwarmHandle: Send {
    fn metadata(&self) -> Option<Arc<Descriptor>>;

    /// Attaches storage at `storage_dir` and begins downloading pieces.
    /// Pieces already on disk are verified and count as present.
    fn start(
        &mut self,
        storage_dir: &Path,
    ) -> impl Future<Output = Result<(), TransferError>> + Send;

    /// Every piece verified.
    fn is_complete(&self) -> bool;

    fn status(&mut self) -> SwarmStatus;

    /// Releases sockets, tasks and file handles.
    fn shutdown(self) -> impl Future<Output = ()> + Send;
}
