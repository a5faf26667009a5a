use crate::discovery::AnnounceStats;
use crate::peer::pack_bitfield;
use crate::storage::PieceStore;
use omni_core::Descriptor;
use rand::Rng;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;

/// Represents the download status of a specific piece of the torrent.
#[derive(Clone, Copy, PartialEq, Debug)]
pub enum PieceStatus {
    /// The piece has not been downloaded yet.
    Missing,
    /// The piece is currently being downloaded from a peer.
    InProgress,
    /// The piece has been successfully downloaded and verified.
    Have,
}

/// Shared download state of one torrent.
///
/// Peer sessions, the discovery loop and the engine handle all read from
/// here; piece bookkeeping sits behind a short-lived std mutex, the piece
/// store behind an async one since writes are awaited.
pub struct Downloader {
    /// The torrent metadata.
    pub descriptor: Arc<Descriptor>,
    /// The peer id this session announces.
    pub peer_id: [u8; 20],
    pub(super) store: Mutex<PieceStore>,
    pub(super) piece_status: StdMutex<Vec<PieceStatus>>,
    /// Verified bytes present on disk, resumed ones included.
    verified_bytes: AtomicU64,
    /// Bytes fetched from peers in this session.
    session_bytes: AtomicU64,
    completed_pieces: AtomicUsize,
    connected_peers: AtomicUsize,
    /// Fired once every piece is verified.
    pub complete: CancellationToken,
    /// Indices of freshly verified pieces, for `have` broadcasts.
    pub(super) have_tx: broadcast::Sender<u32>,
    failure: StdMutex<Option<String>>,
}

impl Downloader {
    pub(super) fn new(descriptor: Arc<Descriptor>, peer_id: [u8; 20], store: PieceStore) -> Self {
        let piece_count = descriptor.piece_count();
        let (have_tx, _) = broadcast::channel(64);
        let downloader = Self {
            descriptor,
            peer_id,
            store: Mutex::new(store),
            piece_status: StdMutex::new(vec![PieceStatus::Missing; piece_count]),
            verified_bytes: AtomicU64::new(0),
            session_bytes: AtomicU64::new(0),
            completed_pieces: AtomicUsize::new(0),
            connected_peers: AtomicUsize::new(0),
            complete: CancellationToken::new(),
            have_tx,
            failure: StdMutex::new(None),
        };
        if piece_count == 0 {
            downloader.complete.cancel();
        }
        downloader
    }

    pub fn is_complete(&self) -> bool {
        self.complete.is_cancelled()
    }

    pub fn verified_bytes(&self) -> u64 {
        self.verified_bytes.load(Ordering::Relaxed)
    }

    pub fn session_bytes(&self) -> u64 {
        self.session_bytes.load(Ordering::Relaxed)
    }

    pub fn completed_pieces(&self) -> usize {
        self.completed_pieces.load(Ordering::Relaxed)
    }

    pub fn connected_peers(&self) -> usize {
        self.connected_peers.load(Ordering::Relaxed)
    }

    /// First unrecoverable error hit by a background task, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    pub(super) fn fail(&self, message: String) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert(message);
        }
    }

    /// Marks a verified piece present. `fetched` is true when it came from a
    /// peer rather than from disk.
    pub(super) fn mark_have(&self, index: usize, fetched: bool) {
        let Ok(mut status) = self.piece_status.lock() else {
            return;
        };
        if status.get(index) == Some(&PieceStatus::Have) || index >= status.len() {
            return;
        }
        status[index] = PieceStatus::Have;
        drop(status);

        let len = self.descriptor.piece_size(index);
        self.verified_bytes.fetch_add(len, Ordering::Relaxed);
        if fetched {
            self.session_bytes.fetch_add(len, Ordering::Relaxed);
            let _ = self.have_tx.send(index as u32);
        }
        let done = self.completed_pieces.fetch_add(1, Ordering::Relaxed) + 1;
        if done == self.descriptor.piece_count() {
            self.complete.cancel();
        }
    }

    /// Claims a random missing piece the remote has. The claim is released
    /// when dropped unless the piece was completed.
    pub(super) fn claim_piece(&self, remote_has: impl Fn(usize) -> bool) -> Option<Claim<'_>> {
        let mut status = self.piece_status.lock().ok()?;
        let candidates: Vec<usize> = status
            .iter()
            .enumerate()
            .filter(|(i, s)| **s == PieceStatus::Missing && remote_has(*i))
            .map(|(i, _)| i)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let index = candidates[rand::rng().random_range(0..candidates.len())];
        status[index] = PieceStatus::InProgress;
        Some(Claim {
            downloader: self,
            index,
        })
    }

    /// Our pieces as a wire bitfield, or `None` when we have nothing.
    pub(super) fn have_bitfield(&self) -> Option<Vec<u8>> {
        let status = self.piece_status.lock().ok()?;
        status
            .iter()
            .any(|s| *s == PieceStatus::Have)
            .then(|| pack_bitfield(status.iter().map(|s| *s == PieceStatus::Have)))
    }

    pub(super) fn peer_connected(&self) -> PeerSlot<'_> {
        self.connected_peers.fetch_add(1, Ordering::Relaxed);
        PeerSlot(self)
    }
}

impl AnnounceStats for Downloader {
    fn downloaded(&self) -> u64 {
        self.session_bytes()
    }

    fn left(&self) -> u64 {
        self.descriptor.total_length().saturating_sub(self.verified_bytes())
    }
}

/// A piece reserved by one peer session.
pub struct Claim<'a> {
    downloader: &'a Downloader,
    pub index: usize,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        if let Ok(mut status) = self.downloader.piece_status.lock() {
            if status[self.index] == PieceStatus::InProgress {
                status[self.index] = PieceStatus::Missing;
            }
        }
    }
}

/// Counts a connected peer for as long as it is alive.
pub struct PeerSlot<'a>(&'a Downloader);

impl Drop for PeerSlot<'_> {
    fn drop(&mut self) {
        self.0.connected_peers.fetch_sub(1, Ordering::Relaxed);
    }
}
