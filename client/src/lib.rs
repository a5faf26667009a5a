//! omnifetch: resumable HTTP downloads and BitTorrent swarm transfers
//! behind one progress-reporting contract.

pub mod cli;
pub mod dht;
pub mod discovery;
pub mod downloader;
pub mod engine;
pub mod fetcher;
pub mod magnet;
pub mod peer;
pub mod resolver;
pub mod source;
pub mod storage;
pub mod swarm;
pub mod upload;

pub use engine::{EngineConfig, PeerEngine};
pub use fetcher::{FetchOptions, Fetcher, RangeFallback};
pub use swarm::{DriverOptions, SwarmDriver, SwarmEngine, SwarmHandle, SwarmStatus};
