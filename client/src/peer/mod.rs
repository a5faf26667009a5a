//! BitTorrent peer wire protocol (BEP 3) with the extension handshake bit
//! (BEP 10) set.

pub mod extension;

use std::net::SocketAddrV4;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on a single message; blocks are 16 KiB, bitfields of very
/// large torrents stay well below this.
const MAX_MESSAGE_LEN: u32 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer timed out")]
    Timeout,

    #[error("bad handshake: {0}")]
    Handshake(&'static str),

    #[error("protocol violation: {0}")]
    Protocol(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Vec<u8>),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
    /// A message id this client does not speak; the payload is skipped.
    Unknown(u8),
}

impl Message {
    /// Length-prefixed wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut body: Vec<u8> = Vec::new();
        match self {
            Message::KeepAlive => {}
            Message::Choke => body.push(0),
            Message::Unchoke => body.push(1),
            Message::Interested => body.push(2),
            Message::NotInterested => body.push(3),
            Message::Have(index) => {
                body.push(4);
                body.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                body.push(5);
                body.extend_from_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                body.push(if matches!(self, Message::Request { .. }) { 6 } else { 8 });
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                body.push(7);
                body.extend_from_slice(&index.to_be_bytes());
                body.extend_from_slice(&begin.to_be_bytes());
                body.extend_from_slice(block);
            }
            Message::Extended { id, payload } => {
                body.push(20);
                body.push(*id);
                body.extend_from_slice(payload);
            }
            Message::Unknown(id) => body.push(*id),
        }
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    /// Parses a message body (everything after the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, PeerError> {
        let Some((&id, rest)) = body.split_first() else {
            return Ok(Message::KeepAlive);
        };
        let u32_at = |i: usize| -> Result<u32, PeerError> {
            rest.get(i..i + 4)
                .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
                .ok_or_else(|| PeerError::Protocol(format!("message {id} too short")))
        };
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have(u32_at(0)?),
            5 => Message::Bitfield(rest.to_vec()),
            6 => Message::Request {
                index: u32_at(0)?,
                begin: u32_at(4)?,
                length: u32_at(8)?,
            },
            7 => {
                let (index, begin) = (u32_at(0)?, u32_at(4)?);
                Message::Piece {
                    index,
                    begin,
                    block: rest[8..].to_vec(),
                }
            }
            8 => Message::Cancel {
                index: u32_at(0)?,
                begin: u32_at(4)?,
                length: u32_at(8)?,
            },
            20 => {
                let (&ext, payload) = rest
                    .split_first()
                    .ok_or_else(|| PeerError::Protocol("empty extended message".into()))?;
                Message::Extended {
                    id: ext,
                    payload: payload.to_vec(),
                }
            }
            other => Message::Unknown(other),
        };
        Ok(msg)
    }
}

/// An established, handshaken connection plus the choke/interest state and
/// the remote's advertised pieces.
pub struct PeerConnection<S = TcpStream> {
    stream: S,
    pub peer_id: [u8; 20],
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub am_interested: bool,
    pub bitfield: Vec<u8>,
    /// Set once the torrent is known; bounds `Have` and `Bitfield`.
    piece_count: Option<u32>,
}

impl PeerConnection<TcpStream> {
    /// Dials `addr` and runs the handshake.
    pub async fn connect(
        addr: SocketAddrV4,
        info_hash: &[u8; 20],
        client_id: &[u8; 20],
        connect_timeout: Duration,
    ) -> Result<Self, PeerError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        tokio::time::timeout(connect_timeout, Self::handshake(stream, info_hash, client_id))
            .await
            .map_err(|_| PeerError::Timeout)?
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> PeerConnection<S> {
    /// Sends our handshake and validates the remote one. Works for both the
    /// dialing and the accepting side.
    pub async fn handshake(
        mut stream: S,
        info_hash: &[u8; 20],
        client_id: &[u8; 20],
    ) -> Result<Self, PeerError> {
        let mut handshake = Vec::with_capacity(68);
        handshake.push(19);
        handshake.extend_from_slice(PROTOCOL);
        let mut reserved = [0u8; 8];
        reserved[5] |= 0x10; // extension protocol
        handshake.extend_from_slice(&reserved);
        handshake.extend_from_slice(info_hash);
        handshake.extend_from_slice(client_id);
        stream.write_all(&handshake).await?;

        let mut response = [0u8; 68];
        stream.read_exact(&mut response).await?;
        if response[0] != 19 || &response[1..20] != PROTOCOL {
            return Err(PeerError::Handshake("not a BitTorrent peer"));
        }
        if &response[28..48] != info_hash {
            return Err(PeerError::Handshake("info hash mismatch"));
        }

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&response[48..68]);

        Ok(Self {
            stream,
            peer_id,
            peer_choking: true,
            peer_interested: false,
            am_interested: false,
            bitfield: Vec::new(),
            piece_count: None,
        })
    }

    /// Bounds the remote's piece announcements by the torrent's size.
    /// Until this is called `Have` messages are not recorded.
    pub fn set_piece_count(&mut self, count: u32) {
        self.piece_count = Some(count);
        self.bitfield.truncate(count.div_ceil(8) as usize);
    }

    pub fn has_piece(&self, index: u32) -> bool {
        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8);
        self.bitfield
            .get(byte_index)
            .is_some_and(|b| (b >> bit_index) & 1 == 1)
    }

    pub async fn send_message(&mut self, msg: Message) -> Result<(), PeerError> {
        if msg == Message::Interested {
            self.am_interested = true;
        }
        self.stream.write_all(&msg.encode()).await?;
        Ok(())
    }

    /// Reads the next message, updating choke state and the remote bitfield
    /// along the way. Silence for longer than 30 s is a timeout.
    pub async fn read_message(&mut self) -> Result<Message, PeerError> {
        let body = tokio::time::timeout(READ_TIMEOUT, async {
            let len = self.stream.read_u32().await?;
            if len > MAX_MESSAGE_LEN {
                return Err(PeerError::Protocol(format!("message of {len} bytes")));
            }
            let mut body = vec![0u8; len as usize];
            self.stream.read_exact(&mut body).await?;
            Ok(body)
        })
        .await
        .map_err(|_| PeerError::Timeout)??;

        let msg = Message::decode(&body)?;
        match &msg {
            Message::Choke => self.peer_choking = true,
            Message::Unchoke => self.peer_choking = false,
            Message::Interested => self.peer_interested = true,
            Message::NotInterested => self.peer_interested = false,
            Message::Have(index) => self.mark_have(*index)?,
            Message::Bitfield(bits) => {
                if let Some(count) = self.piece_count {
                    if bits.len() > count.div_ceil(8) as usize {
                        return Err(PeerError::Protocol(format!(
                            "bitfield of {} bytes for {count} pieces",
                            bits.len()
                        )));
                    }
                }
                self.bitfield = bits.clone();
            }
            _ => {}
        }
        Ok(msg)
    }

    fn mark_have(&mut self, index: u32) -> Result<(), PeerError> {
        let Some(count) = self.piece_count else {
            return Ok(());
        };
        if index >= count {
            return Err(PeerError::Protocol(format!("have for piece {index} of {count}")));
        }
        let byte_index = (index / 8) as usize;
        if byte_index >= self.bitfield.len() {
            self.bitfield.resize(byte_index + 1, 0);
        }
        self.bitfield[byte_index] |= 1 << (7 - (index % 8));
        Ok(())
    }
}

/// Packs a have-list into the wire bitfield layout (high bit first).
pub fn pack_bitfield(have: impl IntoIterator<Item = bool>) -> Vec<u8> {
    let mut bits = Vec::new();
    for (i, present) in have.into_iter().enumerate() {
        if i % 8 == 0 {
            bits.push(0u8);
        }
        if present {
            if let Some(last) = bits.last_mut() {
                *last |= 1 << (7 - i % 8);
            }
        }
    }
    bits
}
