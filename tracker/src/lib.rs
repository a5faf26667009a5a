//! Tracker announce client used by the swarm engine to discover peers.

use std::net::SocketAddrV4;

pub mod http;
pub mod udp;

use http::HttpTracker;
use udp::UdpTracker;

#[derive(Debug, Clone)]
pub struct TrackerRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub compact: bool,
    pub event: Option<TrackerEvent>,
    pub numwant: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerEvent {
    Started,
    Stopped,
    Completed,
}

#[derive(Debug, Clone)]
pub struct TrackerResponse {
    pub interval: u32,
    pub peers: Vec<SocketAddrV4>,
    pub complete: Option<u32>,   // seeders
    pub incomplete: Option<u32>, // leechers
}

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed response: {0}")]
    Decode(#[from] omni_core::bencoding::DecodeError),

    #[error("tracker refused announce: {0}")]
    Failure(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid tracker URL: {0}")]
    InvalidUrl(String),

    #[error("tracker did not answer in time")]
    Timeout,
}

/// A tracker endpoint, dispatched by URL scheme.
pub enum Tracker {
    Http(HttpTracker),
    Udp(UdpTracker),
}

impl Tracker {
    /// Returns `None` for schemes no client exists for (e.g. `wss://`).
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("http://") || url.starts_with("https://") {
            Some(Tracker::Http(HttpTracker::new(url)))
        } else if url.starts_with("udp://") {
            Some(Tracker::Udp(UdpTracker::new(url)))
        } else {
            None
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Tracker::Http(t) => t.url(),
            Tracker::Udp(t) => t.url(),
        }
    }

    pub async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse, TrackerError> {
        let res = match self {
            Tracker::Http(t) => t.announce(request).await,
            Tracker::Udp(t) => t.announce(request).await,
        };
        match &res {
            Ok(r) => tracing::debug!(url = self.url(), peers = r.peers.len(), "announce ok"),
            Err(e) => tracing::debug!(url = self.url(), "announce failed: {e}"),
        }
        res
    }
}

/// Decodes the compact peer format: 4 bytes IPv4 + 2 bytes port, big endian.
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddrV4> {
    bytes
        .chunks_exact(6)
        .map(|c| {
            SocketAddrV4::new(
                std::net::Ipv4Addr::new(c[0], c[1], c[2], c[3]),
                u16::from_be_bytes([c[4], c[5]]),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_url_dispatch() {
        assert!(matches!(Tracker::from_url("http://t/announce"), Some(Tracker::Http(_))));
        assert!(matches!(Tracker::from_url("https://t/announce"), Some(Tracker::Http(_))));
        assert!(matches!(Tracker::from_url("udp://t:80"), Some(Tracker::Udp(_))));
        assert!(Tracker::from_url("wss://t").is_none());
    }

    #[test]
    fn test_parse_compact_peers_ignores_trailing_bytes() {
        let peers = parse_compact_peers(&[127, 0, 0, 1, 0x1a, 0xe1, 9]);
        assert_eq!(peers, vec!["127.0.0.1:6881".parse::<SocketAddrV4>().unwrap()]);
    }
}
