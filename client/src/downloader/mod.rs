//! Piece download for one torrent: shared state, resume check, the peer
//! run loop and per-peer sessions.

mod init;
mod manager;
mod session;
mod state;

pub use session::SessionConfig;
pub use state::{Claim, Downloader, PieceStatus};

use crate::discovery::Discovery;
use omni_core::Descriptor;
use std::path::Path;
use std::sync::Arc;

impl Downloader {
    /// Opens storage below `dir` for `descriptor`.
    pub async fn open(
        dir: &Path,
        descriptor: Arc<Descriptor>,
        peer_id: [u8; 20],
    ) -> std::io::Result<Self> {
        init::open(dir, descriptor, peer_id).await
    }

    /// Verifies pieces already on disk; returns how many were intact.
    pub async fn check_existing_data(&self) -> std::io::Result<usize> {
        init::check_existing_data(self).await
    }

    pub async fn run(
        self: Arc<Self>,
        discovery: Discovery,
        config: SessionConfig,
        max_peers: usize,
    ) {
        manager::run(self, discovery, config, max_peers).await
    }
}
