//! Peer discovery: tracker announces and DHT lookups feeding one channel of
//! candidate addresses.

use crate::dht::Dht;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracker::{Tracker, TrackerEvent, TrackerRequest};

const MIN_REANNOUNCE: Duration = Duration::from_secs(60);
const MAX_REANNOUNCE: Duration = Duration::from_secs(30 * 60);
const DHT_QUERY_INTERVAL: Duration = Duration::from_secs(2);
/// How often directly configured peers are offered again.
const INITIAL_PEER_INTERVAL: Duration = Duration::from_secs(15);
const NUMWANT: u32 = 50;

/// Byte counters reported to trackers.
pub trait AnnounceStats: Send + Sync {
    fn downloaded(&self) -> u64;
    fn left(&self) -> u64;
}

/// Stats for a swarm whose size is not known yet (metadata still pending).
pub struct SizeUnknown;

impl AnnounceStats for SizeUnknown {
    fn downloaded(&self) -> u64 {
        0
    }

    // Non-zero so trackers treat us as a leecher and hand out seeders.
    fn left(&self) -> u64 {
        1
    }
}

#[derive(Debug, Clone)]
pub struct DhtSettings {
    pub port: u16,
    pub routers: Vec<String>,
}

pub struct Discovery {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub trackers: Vec<String>,
    pub initial_peers: Vec<SocketAddrV4>,
    pub listen_port: u16,
    pub dht: Option<DhtSettings>,
    pub stats: Arc<dyn AnnounceStats>,
}

impl Discovery {
    /// Whether any peer source is configured at all.
    pub fn has_sources(&self) -> bool {
        !self.trackers.is_empty() || self.dht.is_some() || !self.initial_peers.is_empty()
    }

    /// Sends every discovered address into `tx` until the receiver goes away
    /// or the task is aborted. Addresses may repeat; callers dedupe.
    ///
    /// Initial peers go out first and are repeated every 15 s, so a dropped
    /// connection to one of them is retried even without trackers or DHT.
    pub async fn run(self, tx: mpsc::Sender<SocketAddrV4>) {
        tokio::join!(
            self.initial_loop(&tx),
            self.announce_loop(&tx),
            self.dht_loop(&tx)
        );
    }

    async fn initial_loop(&self, tx: &mpsc::Sender<SocketAddrV4>) {
        if self.initial_peers.is_empty() {
            return;
        }
        loop {
            for peer in &self.initial_peers {
                if tx.send(*peer).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(INITIAL_PEER_INTERVAL).await;
        }
    }

    fn trackers(&self) -> Vec<Arc<Tracker>> {
        self.trackers
            .iter()
            .filter_map(|url| {
                let tracker = Tracker::from_url(url);
                if tracker.is_none() {
                    tracing::debug!(url = %url, "skipping tracker with unsupported scheme");
                }
                tracker.map(Arc::new)
            })
            .collect()
    }

    fn request(&self, event: Option<TrackerEvent>) -> TrackerRequest {
        TrackerRequest {
            info_hash: self.info_hash,
            peer_id: self.peer_id,
            port: self.listen_port,
            uploaded: 0,
            downloaded: self.stats.downloaded(),
            left: self.stats.left(),
            compact: true,
            event,
            numwant: Some(NUMWANT),
        }
    }

    async fn announce_loop(&self, tx: &mpsc::Sender<SocketAddrV4>) {
        let trackers = self.trackers();
        if trackers.is_empty() {
            return;
        }

        let mut event = Some(TrackerEvent::Started);
        loop {
            let request = self.request(event);
            let mut round = JoinSet::new();
            for tracker in &trackers {
                let (tracker, request) = (tracker.clone(), request.clone());
                round.spawn(async move { tracker.announce(&request).await });
            }

            let mut interval = MAX_REANNOUNCE;
            while let Some(joined) = round.join_next().await {
                let Ok(Ok(response)) = joined else {
                    continue;
                };
                interval = interval.min(Duration::from_secs(response.interval.into()));
                for peer in response.peers {
                    if tx.send(peer).await.is_err() {
                        return;
                    }
                }
            }

            event = None;
            tokio::time::sleep(interval.max(MIN_REANNOUNCE)).await;
        }
    }

    async fn dht_loop(&self, tx: &mpsc::Sender<SocketAddrV4>) {
        let Some(settings) = &self.dht else {
            return;
        };
        let dht = match Dht::bind(settings.port).await {
            Ok(dht) => dht,
            Err(e) => {
                tracing::warn!(port = settings.port, "DHT unavailable: {e}");
                return;
            }
        };

        let lookup = async {
            dht.bootstrap(&settings.routers).await;
            loop {
                tokio::time::sleep(DHT_QUERY_INTERVAL).await;
                dht.get_peers(self.info_hash).await;
                let found = dht.take_found_peers();
                if !found.is_empty() {
                    tracing::debug!(peers = found.len(), "DHT returned peers");
                }
                for peer in found {
                    if tx.send(peer).await.is_err() {
                        return;
                    }
                }
            }
        };

        tokio::select! {
            _ = dht.listen() => {}
            _ = lookup => {}
        }
    }

    /// One final announce to every tracker, bounded by `grace`.
    pub async fn announce_once(&self, event: TrackerEvent, grace: Duration) {
        let request = self.request(Some(event));
        let mut round = JoinSet::new();
        for tracker in self.trackers() {
            let request = request.clone();
            round.spawn(async move { tracker.announce(&request).await });
        }
        let _ = tokio::time::timeout(grace, async {
            while round.join_next().await.is_some() {}
        })
        .await;
    }
}
