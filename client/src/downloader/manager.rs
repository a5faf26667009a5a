use super::session::{self, SessionConfig};
use super::state::Downloader;
use crate::discovery::Discovery;
use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

/// Runs discovery and peer sessions until every piece is verified.
///
/// Sessions are capped at `max_peers` concurrent connections; a peer that
/// disconnects is forgotten and may be dialed again once rediscovered.
/// Dropping the returned future (or aborting its task) tears down every
/// connection.
pub async fn run(
    downloader: Arc<Downloader>,
    discovery: Discovery,
    config: SessionConfig,
    max_peers: usize,
) {
    let (peer_tx, mut peer_rx) = mpsc::channel(100);
    let mut discovery_task = JoinSet::new();
    discovery_task.spawn(discovery.run(peer_tx.clone()));

    let semaphore = Arc::new(Semaphore::new(max_peers.max(1)));
    let mut sessions: JoinSet<SocketAddrV4> = JoinSet::new();
    let mut known = HashSet::new();

    loop {
        tokio::select! {
            _ = downloader.complete.cancelled() => {
                tracing::info!(pieces = downloader.descriptor.piece_count(), "all pieces verified");
                break;
            }
            Some(addr) = peer_rx.recv() => {
                if !known.insert(addr) {
                    continue;
                }
                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    // At capacity; the address comes back on the next announce.
                    known.remove(&addr);
                    continue;
                };
                sessions.spawn(session::run(
                    addr,
                    downloader.clone(),
                    config,
                    peer_tx.clone(),
                    permit,
                ));
            }
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Ok(addr) = finished {
                    known.remove(&addr);
                }
            }
        }
    }
}
