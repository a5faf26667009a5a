#![allow(dead_code)]

use omni_core::bencoding::{Bencode, dict};
use omnifetch::peer::extension::{self, METADATA_PIECE_SIZE, MetadataMessage};
use omnifetch::peer::{Message, PeerConnection, pack_bitfield};
use sha1::{Digest, Sha1};
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Deterministic, non-repeating-ish test content.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Minimal HTTP/1.1 file server that understands `Range: bytes=S-`, records
/// every Range header it sees and can cut connections short.
pub struct RangeServer {
    pub addr: SocketAddr,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
    task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct RangeServerConfig {
    pub data: Arc<Vec<u8>>,
    /// The n-th connection stops after `cuts[n]` body bytes.
    pub cuts: Vec<usize>,
    /// The n-th connection sends `stalls[n]` body bytes, then keeps the
    /// connection open without sending more until the client hangs up.
    pub stalls: Vec<usize>,
    /// When false every request gets the full body with `200 OK`.
    pub honor_ranges: bool,
}

impl RangeServer {
    pub async fn start(config: RangeServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let recorded = ranges.clone();
        let task = tokio::spawn(async move {
            let mut connection = 0;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let cut = config.cuts.get(connection).copied();
                let stall = config.stalls.get(connection).copied();
                connection += 1;
                let (config, recorded) = (config.clone(), recorded.clone());
                tokio::spawn(async move {
                    let _ = serve(stream, &config, cut, stall, &recorded).await;
                });
            }
        });
        Self { addr, ranges, task }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}/{}", self.addr, path.trim_start_matches('/'))
    }

    /// Range header of every request so far, `None` when absent.
    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }
}

impl Drop for RangeServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut stream: TcpStream,
    config: &RangeServerConfig,
    cut: Option<usize>,
    stall: Option<usize>,
    recorded: &Mutex<Vec<Option<String>>>,
) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }
    let head = String::from_utf8_lossy(&head).into_owned();
    let range = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    });
    recorded.lock().unwrap().push(range.clone());

    let data = &config.data;
    let total = data.len();
    let start = range
        .as_deref()
        .filter(|_| config.honor_ranges)
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|s| s.parse::<usize>().ok());

    let (status_line, extra, body): (&str, String, &[u8]) = match start {
        Some(s) if s >= total => (
            "416 Range Not Satisfiable",
            format!("Content-Range: bytes */{total}\r\n"),
            &[],
        ),
        Some(s) => (
            "206 Partial Content",
            format!("Content-Range: bytes {s}-{}/{total}\r\n", total - 1),
            &data[s..],
        ),
        None => ("200 OK", String::new(), &data[..]),
    };
    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Length: {}\r\n{extra}Connection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;

    if let Some(stall) = stall {
        stream.write_all(&body[..stall.min(body.len())]).await?;
        stream.flush().await?;
        while stream.read(&mut buf).await? > 0 {}
        return Ok(());
    }

    let body = match cut {
        Some(cut) => &body[..cut.min(body.len())],
        None => body,
    };
    stream.write_all(body).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Single-file torrent over `data`, with real piece hashes.
pub struct TestTorrent {
    pub name: String,
    pub data: Arc<Vec<u8>>,
    pub piece_length: usize,
    pub info: Vec<u8>,
    pub info_hash: [u8; 20],
}

impl TestTorrent {
    pub fn new(name: &str, data: Vec<u8>, piece_length: usize) -> Self {
        let hashes: Vec<u8> = data
            .chunks(piece_length)
            .flat_map(|chunk| <[u8; 20]>::from(Sha1::digest(chunk)))
            .collect();
        let info = dict([
            ("length", Bencode::Int(data.len() as i64)),
            ("name", Bencode::Bytes(name.as_bytes().to_vec())),
            ("piece length", Bencode::Int(piece_length as i64)),
            ("pieces", Bencode::Bytes(hashes)),
        ])
        .encode();
        let info_hash = Sha1::digest(&info).into();
        Self {
            name: name.to_string(),
            data: Arc::new(data),
            piece_length,
            info,
            info_hash,
        }
    }

    /// The `.torrent` file bytes; no trackers.
    pub fn torrent_bytes(&self) -> Vec<u8> {
        let mut out = b"d4:info".to_vec();
        out.extend_from_slice(&self.info);
        out.push(b'e');
        out
    }

    pub fn magnet(&self) -> String {
        format!(
            "magnet:?xt=urn:btih:{}&dn={}",
            hex::encode(self.info_hash),
            self.name
        )
    }

    fn piece_count(&self) -> usize {
        self.data.len().div_ceil(self.piece_length)
    }
}

/// A peer holding the whole torrent: it unchokes everyone, answers block
/// requests and serves the info dictionary over `ut_metadata`.
pub struct Seeder {
    pub addr: SocketAddrV4,
    task: JoinHandle<()>,
}

const SEEDER_METADATA_ID: u8 = 3;

impl Seeder {
    pub async fn start(torrent: &TestTorrent) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let SocketAddr::V4(addr) = listener.local_addr().unwrap() else {
            unreachable!("bound to an IPv4 address");
        };
        let torrent = Arc::new(TestTorrent {
            name: torrent.name.clone(),
            data: torrent.data.clone(),
            piece_length: torrent.piece_length,
            info: torrent.info.clone(),
            info_hash: torrent.info_hash,
        });
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let torrent = torrent.clone();
                tokio::spawn(async move {
                    let _ = seed(stream, &torrent).await;
                });
            }
        });
        Self { addr, task }
    }
}

impl Drop for Seeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn seed(stream: TcpStream, torrent: &TestTorrent) -> Result<(), omnifetch::peer::PeerError> {
    let mut conn = PeerConnection::handshake(stream, &torrent.info_hash, &[0xAB; 20]).await?;

    let ours = dict([
        ("m", dict([("ut_metadata", Bencode::Int(SEEDER_METADATA_ID.into()))])),
        ("metadata_size", Bencode::Int(torrent.info.len() as i64)),
    ]);
    conn.send_message(Message::Extended {
        id: 0,
        payload: ours.encode(),
    })
    .await?;
    conn.send_message(Message::Bitfield(pack_bitfield(
        std::iter::repeat_n(true, torrent.piece_count()),
    )))
    .await?;
    conn.send_message(Message::Unchoke).await?;

    let mut client_metadata_id = None;
    loop {
        match conn.read_message().await? {
            Message::Request {
                index,
                begin,
                length,
            } => {
                let start = index as usize * torrent.piece_length + begin as usize;
                let end = (start + length as usize).min(torrent.data.len());
                conn.send_message(Message::Piece {
                    index,
                    begin,
                    block: torrent.data[start..end].to_vec(),
                })
                .await?;
            }
            Message::Extended { id: 0, payload } => {
                client_metadata_id = extension::parse_handshake(&payload)?.ut_metadata;
            }
            Message::Extended {
                id: SEEDER_METADATA_ID,
                payload,
            } => {
                let (Some(reply_id), Ok(MetadataMessage::Request { piece })) =
                    (client_metadata_id, MetadataMessage::parse(&payload))
                else {
                    continue;
                };
                let start = piece * METADATA_PIECE_SIZE;
                let end = (start + METADATA_PIECE_SIZE).min(torrent.info.len());
                let reply = MetadataMessage::Data {
                    piece,
                    total_size: torrent.info.len(),
                    data: torrent.info[start..end].to_vec(),
                };
                conn.send_message(reply.to_message(reply_id)).await?;
            }
            _ => {}
        }
    }
}
