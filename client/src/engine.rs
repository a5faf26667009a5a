//! The built-in BitTorrent engine behind [`SwarmEngine`].

use crate::dht::DEFAULT_ROUTERS;
use crate::discovery::{AnnounceStats, DhtSettings, Discovery, SizeUnknown};
use crate::downloader::{Downloader, SessionConfig};
use crate::magnet;
use crate::swarm::{SwarmEngine, SwarmHandle, SwarmStatus};
use omni_core::{Descriptor, MagnetLink, RateMeter, TransferError};
use rand::Rng;
use std::net::SocketAddrV4;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracker::TrackerEvent;

const FINAL_ANNOUNCE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// First eight bytes of every peer id, Azureus style.
    pub peer_id_prefix: [u8; 8],
    /// Port reported to trackers. Nothing listens on it.
    pub listen_port: u16,
    /// UDP port of the DHT node; 0 picks an ephemeral one.
    pub dht_port: u16,
    pub dht_routers: Vec<String>,
    pub enable_dht: bool,
    pub max_peers: usize,
    pub connect_timeout: Duration,
    pub request_block_size: u32,
    /// Window of the download rate estimate.
    pub rate_window: Duration,
    /// Peers dialed directly, in addition to discovered ones.
    pub initial_peers: Vec<SocketAddrV4>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            peer_id_prefix: *b"-OF0001-",
            listen_port: 6881,
            dht_port: 0,
            dht_routers: DEFAULT_ROUTERS.iter().map(|r| r.to_string()).collect(),
            enable_dht: true,
            max_peers: 50,
            connect_timeout: Duration::from_secs(10),
            request_block_size: 16 * 1024,
            rate_window: Duration::from_secs(1),
            initial_peers: Vec::new(),
        }
    }
}

/// Swarm engine speaking the peer wire protocol itself.
#[derive(Debug, Clone, Default)]
pub struct PeerEngine {
    config: Arc<EngineConfig>,
}

impl PeerEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn peer_id(&self) -> [u8; 20] {
        let mut id = [0u8; 20];
        rand::rng().fill(&mut id[8..]);
        id[..8].copy_from_slice(&self.config.peer_id_prefix);
        id
    }

    fn handle(&self, info_hash: [u8; 20], trackers: Vec<String>) -> PeerHandle {
        PeerHandle {
            config: self.config.clone(),
            peer_id: self.peer_id(),
            info_hash,
            trackers,
            metadata: Arc::new(OnceLock::new()),
            downloader: None,
            tasks: JoinSet::new(),
            rate: RateMeter::new(self.config.rate_window),
        }
    }
}

impl SwarmEngine for PeerEngine {
    type Handle = PeerHandle;

    async fn add_magnet(&self, link: &MagnetLink) -> Result<PeerHandle, TransferError> {
        let mut handle = self.handle(link.info_hash, link.trackers.clone());
        let discovery = handle.discovery(Arc::new(SizeUnknown));
        if !discovery.has_sources() {
            return Err(TransferError::Session(
                "magnet has no trackers and DHT is disabled; no way to find peers".into(),
            ));
        }

        let (link, slot) = (link.clone(), handle.metadata.clone());
        let config = self.config.clone();
        handle.tasks.spawn(async move {
            let descriptor = magnet::fetch_metadata(
                &link,
                discovery,
                config.connect_timeout,
                config.max_peers,
            )
            .await;
            tracing::info!(
                name = %descriptor.name,
                pieces = descriptor.piece_count(),
                bytes = descriptor.total_length(),
                "metadata resolved"
            );
            let _ = slot.set(Arc::new(descriptor));
        });
        Ok(handle)
    }

    async fn add_descriptor(&self, descriptor: Descriptor) -> Result<PeerHandle, TransferError> {
        let handle = self.handle(descriptor.info_hash, descriptor.trackers());
        let _ = handle.metadata.set(Arc::new(descriptor));
        Ok(handle)
    }
}

/// One torrent inside a [`PeerEngine`]. Owns every task it spawned; they
/// stop when the handle is shut down or dropped.
pub struct PeerHandle {
    config: Arc<EngineConfig>,
    peer_id: [u8; 20],
    info_hash: [u8; 20],
    trackers: Vec<String>,
    metadata: Arc<OnceLock<Arc<Descriptor>>>,
    downloader: Option<Arc<Downloader>>,
    tasks: JoinSet<()>,
    rate: RateMeter,
}

impl PeerHandle {
    fn discovery(&self, stats: Arc<dyn AnnounceStats>) -> Discovery {
        Discovery {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            trackers: self.trackers.clone(),
            initial_peers: self.config.initial_peers.clone(),
            listen_port: self.config.listen_port,
            dht: self.config.enable_dht.then(|| DhtSettings {
                port: self.config.dht_port,
                routers: self.config.dht_routers.clone(),
            }),
            stats,
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }
}

impl SwarmHandle for PeerHandle {
    fn metadata(&self) -> Option<Arc<Descriptor>> {
        self.metadata.get().cloned()
    }

    async fn start(&mut self, storage_dir: &Path) -> Result<(), TransferError> {
        if self.downloader.is_some() {
            return Err(TransferError::Session("torrent already started".into()));
        }
        let descriptor = self
            .metadata()
            .ok_or_else(|| TransferError::Session("metadata not available yet".into()))?;
        // Trackers learned from the metadata join the magnet's own.
        for url in descriptor.trackers() {
            if !self.trackers.contains(&url) {
                self.trackers.push(url);
            }
        }

        let downloader = Downloader::open(storage_dir, descriptor.clone(), self.peer_id)
            .await
            .map_err(|e| TransferError::storage(storage_dir, e))?;
        let present = downloader
            .check_existing_data()
            .await
            .map_err(|e| TransferError::storage(storage_dir, e))?;
        tracing::info!(
            present,
            pieces = descriptor.piece_count(),
            dir = %storage_dir.display(),
            "storage attached"
        );

        let downloader = Arc::new(downloader);
        if !downloader.is_complete() {
            let discovery = self.discovery(downloader.clone());
            let config = SessionConfig {
                connect_timeout: self.config.connect_timeout,
                block_size: self.config.request_block_size,
            };
            self.tasks
                .spawn(downloader.clone().run(discovery, config, self.config.max_peers));
        }
        self.downloader = Some(downloader);
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.downloader.as_ref().is_some_and(|d| d.is_complete())
    }

    fn status(&mut self) -> SwarmStatus {
        let Some(downloader) = &self.downloader else {
            return SwarmStatus {
                total_size: self.metadata().map_or(0, |d| d.total_length()),
                ..SwarmStatus::default()
            };
        };
        let total = downloader.descriptor.total_length();
        let done = downloader.verified_bytes();
        SwarmStatus {
            progress: if total == 0 { 1.0 } else { done as f64 / total as f64 },
            download_rate: self.rate.record(Instant::now(), downloader.session_bytes()),
            total_done: done,
            total_size: total,
            peers: downloader.connected_peers(),
            error: downloader.failure(),
        }
    }

    async fn shutdown(mut self) {
        self.tasks.shutdown().await;

        let event = match &self.downloader {
            Some(d) if d.is_complete() && d.session_bytes() > 0 => TrackerEvent::Completed,
            _ => TrackerEvent::Stopped,
        };
        let stats: Arc<dyn AnnounceStats> = match &self.downloader {
            Some(d) => d.clone(),
            None => Arc::new(SizeUnknown),
        };
        let mut discovery = self.discovery(stats);
        discovery.dht = None;
        discovery
            .announce_once(event, FINAL_ANNOUNCE_GRACE)
            .await;
        tracing::debug!(info_hash = %hex::encode(self.info_hash), ?event, "handle shut down");
    }
}
