use crate::discovery::Discovery;
use crate::peer::extension::{
    self, LOCAL_METADATA_ID, MAX_METADATA_SIZE, METADATA_PIECE_SIZE, MetadataMessage,
};
use crate::peer::{Message, PeerConnection, PeerError};
use omni_core::{Descriptor, MagnetLink};
use sha1::{Digest, Sha1};
use std::collections::HashSet;
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(30);

/// Resolves a magnet link to its torrent metadata.
///
/// This process involves:
/// 1. Running peer discovery for the link's info hash (trackers, DHT and
///    any directly configured peers).
/// 2. Connecting to discovered peers, at most `max_peers` at a time.
/// 3. Fetching the info dictionary over `ut_metadata` and accepting the first
///    copy whose SHA-1 equals the info hash.
///
/// There is no deadline here: the future completes only once metadata
/// arrives. Callers bound it (or drop it) as they see fit.
pub async fn fetch_metadata(
    link: &MagnetLink,
    discovery: Discovery,
    connect_timeout: Duration,
    max_peers: usize,
) -> Descriptor {
    let info_hash = link.info_hash;
    let peer_id = discovery.peer_id;
    let (peer_tx, mut peer_rx) = mpsc::channel(100);
    let (meta_tx, mut meta_rx) = mpsc::channel::<Vec<u8>>(1);

    let mut tasks = JoinSet::new();
    tasks.spawn(discovery.run(peer_tx));

    let semaphore = Arc::new(Semaphore::new(max_peers.max(1)));
    // Peers currently being asked; an address is dialed again once its
    // attempt has ended and discovery offers it anew.
    let mut searched_peers = HashSet::new();
    let mut attempts: JoinSet<SocketAddrV4> = JoinSet::new();

    loop {
        tokio::select! {
            Some(info) = meta_rx.recv() => {
                match Descriptor::from_info_bytes(&info, &link.trackers) {
                    Ok(descriptor) => return descriptor,
                    Err(e) => tracing::warn!("metadata matched the info hash but is unusable: {e}"),
                }
            }
            Some(peer) = peer_rx.recv() => {
                if !searched_peers.insert(peer) {
                    continue;
                }
                let (semaphore, meta_tx) = (semaphore.clone(), meta_tx.clone());
                attempts.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return peer;
                    };
                    match fetch_from_peer(peer, info_hash, peer_id, connect_timeout).await {
                        Ok(info) => {
                            tracing::info!(%peer, bytes = info.len(), "metadata acquired");
                            let _ = meta_tx.send(info).await;
                        }
                        Err(e) => tracing::debug!(%peer, "metadata fetch failed: {e}"),
                    }
                    peer
                });
            }
            Some(ended) = attempts.join_next(), if !attempts.is_empty() => {
                if let Ok(peer) = ended {
                    searched_peers.remove(&peer);
                }
            }
        }
    }
}

async fn fetch_from_peer(
    peer: SocketAddrV4,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    connect_timeout: Duration,
) -> Result<Vec<u8>, PeerError> {
    let conn = PeerConnection::connect(peer, &info_hash, &peer_id, connect_timeout).await?;
    exchange_metadata(conn, info_hash).await
}

/// Runs the `ut_metadata` exchange over an established connection and
/// returns the verified info dictionary bytes.
pub async fn exchange_metadata<S>(
    mut conn: PeerConnection<S>,
    info_hash: [u8; 20],
) -> Result<Vec<u8>, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.send_message(extension::handshake(None)).await?;

    let remote = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            if let Message::Extended { id: 0, payload } = conn.read_message().await? {
                return extension::parse_handshake(&payload);
            }
        }
    })
    .await
    .map_err(|_| PeerError::Timeout)??;

    let (Some(remote_id), Some(size)) = (remote.ut_metadata, remote.metadata_size) else {
        return Err(PeerError::Protocol("peer does not offer metadata".into()));
    };
    if size == 0 || size > MAX_METADATA_SIZE {
        return Err(PeerError::Protocol(format!("metadata size {size}")));
    }

    let pieces = size.div_ceil(METADATA_PIECE_SIZE);
    for piece in 0..pieces {
        conn.send_message(MetadataMessage::Request { piece }.to_message(remote_id))
            .await?;
    }

    let mut metadata = vec![0u8; size];
    let mut received = vec![false; pieces];
    tokio::time::timeout(TRANSFER_TIMEOUT, async {
        while received.iter().any(|r| !r) {
            let Message::Extended {
                id: LOCAL_METADATA_ID,
                payload,
            } = conn.read_message().await?
            else {
                continue;
            };
            match MetadataMessage::parse(&payload)? {
                MetadataMessage::Data { piece, data, .. } if piece < pieces => {
                    let start = piece * METADATA_PIECE_SIZE;
                    let end = (start + METADATA_PIECE_SIZE).min(size);
                    if data.len() != end - start {
                        return Err(PeerError::Protocol(format!("metadata piece {piece} has wrong length")));
                    }
                    metadata[start..end].copy_from_slice(&data);
                    received[piece] = true;
                }
                MetadataMessage::Reject { piece } => {
                    return Err(PeerError::Protocol(format!("metadata piece {piece} rejected")));
                }
                _ => {}
            }
        }
        Ok(())
    })
    .await
    .map_err(|_| PeerError::Timeout)??;

    let hash: [u8; 20] = Sha1::digest(&metadata).into();
    if hash != info_hash {
        return Err(PeerError::Protocol("metadata hash mismatch".into()));
    }
    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::extension::RemoteExtensions;
    use omni_core::bencoding::{Bencode, dict};
    use tokio::io::duplex;

    /// Serves `info` over ut_metadata in pieces of METADATA_PIECE_SIZE.
    async fn serve_metadata<S>(mut conn: PeerConnection<S>, info: Vec<u8>, corrupt: bool)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = RemoteExtensions::default();
        loop {
            let Ok(msg) = conn.read_message().await else {
                return;
            };
            let Message::Extended { id, payload } = msg else {
                continue;
            };
            if id == 0 {
                client = extension::parse_handshake(&payload).unwrap();
                let ours = dict([
                    ("m", dict([("ut_metadata", Bencode::Int(3))])),
                    ("metadata_size", Bencode::Int(info.len() as i64)),
                ]);
                conn.send_message(Message::Extended { id: 0, payload: ours.encode() })
                    .await
                    .unwrap();
            } else if id == 3 {
                let Ok(MetadataMessage::Request { piece }) = MetadataMessage::parse(&payload) else {
                    continue;
                };
                let start = piece * METADATA_PIECE_SIZE;
                let end = (start + METADATA_PIECE_SIZE).min(info.len());
                let mut data = info[start..end].to_vec();
                if corrupt {
                    data[0] ^= 0xff;
                }
                let reply = MetadataMessage::Data { piece, total_size: info.len(), data };
                conn.send_message(reply.to_message(client.ut_metadata.unwrap()))
                    .await
                    .unwrap();
            }
        }
    }

    fn big_info() -> Vec<u8> {
        dict([
            ("length", Bencode::Int(16_384_000)),
            ("name", Bencode::Bytes(b"x".to_vec())),
            ("piece length", Bencode::Int(16384)),
            ("pieces", Bencode::Bytes(vec![9u8; 20 * 1000])),
        ])
        .encode()
    }

    async fn run_exchange(info: Vec<u8>, corrupt: bool) -> Result<Vec<u8>, PeerError> {
        let hash: [u8; 20] = Sha1::digest(&info).into();
        let (a, b) = duplex(256 * 1024);
        let (client, server) = tokio::join!(
            PeerConnection::handshake(a, &hash, &[1; 20]),
            PeerConnection::handshake(b, &hash, &[2; 20]),
        );
        let server = tokio::spawn(serve_metadata(server.unwrap(), info, corrupt));
        let result = exchange_metadata(client.unwrap(), hash).await;
        server.abort();
        result
    }

    #[tokio::test]
    async fn test_exchange_reassembles_multi_piece_metadata() {
        let info = big_info();
        assert!(info.len() > METADATA_PIECE_SIZE);
        let fetched = run_exchange(info.clone(), false).await.unwrap();
        assert_eq!(fetched, info);
        let descriptor = Descriptor::from_info_bytes(&fetched, &[]).unwrap();
        assert_eq!(descriptor.piece_count(), 1000);
    }

    #[tokio::test]
    async fn test_exchange_rejects_tampered_metadata() {
        let err = run_exchange(big_info(), true).await.unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }
}
