use super::state::{Claim, Downloader};
use crate::peer::extension::{self, LOCAL_PEX_ID};
use crate::peer::{Message, PeerConnection, PeerError};
use sha1::{Digest, Sha1};
use std::net::SocketAddrV4;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{OwnedSemaphorePermit, mpsc};

/// Settings a peer session needs from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub block_size: u32,
}

/// Dials one peer and downloads from it until the torrent completes or the
/// peer goes away. Returns the address so the caller can forget it.
pub async fn run(
    addr: SocketAddrV4,
    downloader: Arc<Downloader>,
    config: SessionConfig,
    peer_tx: mpsc::Sender<SocketAddrV4>,
    _permit: OwnedSemaphorePermit,
) -> SocketAddrV4 {
    let connected = PeerConnection::connect(
        addr,
        &downloader.descriptor.info_hash,
        &downloader.peer_id,
        config.connect_timeout,
    )
    .await;
    let result = match connected {
        Ok(peer) => {
            tracing::debug!(%addr, "connected");
            exchange(peer, &downloader, config.block_size, &peer_tx).await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => tracing::debug!(%addr, "session finished"),
        Err(e) => tracing::debug!(%addr, "peer dropped: {e}"),
    }
    addr
}

/// A piece being assembled from block responses.
struct PieceInProgress<'a> {
    claim: Claim<'a>,
    data: Vec<u8>,
    received: Vec<bool>,
    block_size: usize,
}

impl PieceInProgress<'_> {
    /// Stores a block; returns false for blocks that do not fit the layout.
    fn accept(&mut self, begin: u32, block: &[u8]) -> bool {
        let begin = begin as usize;
        if begin % self.block_size != 0 || begin + block.len() > self.data.len() {
            return false;
        }
        self.data[begin..begin + block.len()].copy_from_slice(block);
        self.received[begin / self.block_size] = true;
        true
    }

    fn is_done(&self) -> bool {
        self.received.iter().all(|r| *r)
    }
}

/// Message loop over an established connection.
pub(super) async fn exchange<S>(
    mut peer: PeerConnection<S>,
    downloader: &Downloader,
    block_size: u32,
    peer_tx: &mpsc::Sender<SocketAddrV4>,
) -> Result<(), PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let _slot = downloader.peer_connected();
    let piece_count = u32::try_from(downloader.descriptor.piece_count())
        .map_err(|_| PeerError::Protocol("too many pieces".into()))?;
    peer.set_piece_count(piece_count);
    let mut have_rx = downloader.have_tx.subscribe();

    if let Some(bits) = downloader.have_bitfield() {
        peer.send_message(Message::Bitfield(bits)).await?;
    }
    peer.send_message(extension::handshake(None)).await?;
    peer.send_message(Message::Interested).await?;

    let mut current: Option<PieceInProgress<'_>> = None;
    loop {
        let msg = tokio::select! {
            _ = downloader.complete.cancelled() => return Ok(()),
            msg = peer.read_message() => msg?,
        };

        match msg {
            Message::Choke => {
                // Outstanding requests are void once choked.
                current = None;
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                if let Some(piece) = current.as_mut().filter(|p| p.claim.index == index as usize) {
                    if !piece.accept(begin, &block) {
                        return Err(PeerError::Protocol(format!(
                            "unexpected block {index}@{begin}"
                        )));
                    }
                    if piece.is_done() {
                        if let Some(piece) = current.take() {
                            finish_piece(piece, downloader).await?;
                        }
                    }
                }
            }
            Message::Extended { id: LOCAL_PEX_ID, payload } => {
                for addr in extension::parse_pex(&payload) {
                    tracing::debug!(%addr, "PEX peer");
                    // Discovery is best effort; a full queue just drops it.
                    let _ = peer_tx.try_send(addr);
                }
            }
            _ => {}
        }

        loop {
            match have_rx.try_recv() {
                Ok(index) => peer.send_message(Message::Have(index)).await?,
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        if !peer.peer_choking && current.is_none() {
            if let Some(claim) = downloader.claim_piece(|i| peer.has_piece(i as u32)) {
                current = Some(request_piece(&mut peer, claim, downloader, block_size).await?);
            }
        }
    }
}

/// Requests every block of the claimed piece in one go.
async fn request_piece<'a, S>(
    peer: &mut PeerConnection<S>,
    claim: Claim<'a>,
    downloader: &Downloader,
    block_size: u32,
) -> Result<PieceInProgress<'a>, PeerError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let piece_len = downloader.descriptor.piece_size(claim.index) as u32;
    let blocks = piece_len.div_ceil(block_size);
    for b in 0..blocks {
        let begin = b * block_size;
        peer.send_message(Message::Request {
            index: claim.index as u32,
            begin,
            length: block_size.min(piece_len - begin),
        })
        .await?;
    }
    Ok(PieceInProgress {
        claim,
        data: vec![0u8; piece_len as usize],
        received: vec![false; blocks as usize],
        block_size: block_size as usize,
    })
}

async fn finish_piece(piece: PieceInProgress<'_>, downloader: &Downloader) -> Result<(), PeerError> {
    let index = piece.claim.index;
    let hash: [u8; 20] = Sha1::digest(&piece.data).into();
    if hash != downloader.descriptor.pieces[index] {
        return Err(PeerError::Protocol(format!("piece {index} failed hash check")));
    }

    let written = downloader.store.lock().await.write_piece(index, &piece.data).await;
    if let Err(e) = written {
        downloader.fail(format!("writing piece {index}: {e}"));
        return Err(e.into());
    }
    downloader.mark_have(index, true);
    tracing::debug!(
        piece = index,
        done = downloader.completed_pieces(),
        total = downloader.descriptor.piece_count(),
        "piece verified"
    );
    Ok(())
}
