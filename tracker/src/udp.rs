//! UDP tracker client (BEP 15).

use super::{TrackerError, TrackerEvent, TrackerRequest, TrackerResponse, parse_compact_peers};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};
use std::time::Duration;
use tokio::net::UdpSocket;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const RECV_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for `udp://host:port` trackers.
pub struct UdpTracker {
    url: String,
}

impl UdpTracker {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Connect handshake followed by the announce itself.
    pub async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse, TrackerError> {
        let parsed = url::Url::parse(&self.url).map_err(|e| TrackerError::InvalidUrl(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| TrackerError::InvalidUrl("missing host".into()))?;
        let port = parsed
            .port()
            .ok_or_else(|| TrackerError::InvalidUrl("missing port".into()))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect((host, port)).await?;

        let transaction_id: u32 = rand::random();
        socket.send(&connect_request(transaction_id)?).await?;
        let reply = recv(&socket).await?;
        let connection_id = parse_connect_response(&reply, transaction_id)?;

        let transaction_id: u32 = rand::random();
        socket
            .send(&announce_request(connection_id, transaction_id, request)?)
            .await?;
        let reply = recv(&socket).await?;
        parse_announce_response(&reply, transaction_id)
    }
}

async fn recv(socket: &UdpSocket) -> Result<Vec<u8>, TrackerError> {
    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(RECV_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| TrackerError::Timeout)??;
    buf.truncate(len);
    Ok(buf)
}

fn connect_request(transaction_id: u32) -> std::io::Result<Vec<u8>> {
    let mut req = Vec::with_capacity(16);
    req.write_u64::<BigEndian>(PROTOCOL_ID)?;
    req.write_u32::<BigEndian>(ACTION_CONNECT)?;
    req.write_u32::<BigEndian>(transaction_id)?;
    Ok(req)
}

fn announce_request(
    connection_id: u64,
    transaction_id: u32,
    request: &TrackerRequest,
) -> std::io::Result<Vec<u8>> {
    let event_id = match request.event {
        None => 0,
        Some(TrackerEvent::Completed) => 1,
        Some(TrackerEvent::Started) => 2,
        Some(TrackerEvent::Stopped) => 3,
    };
    let num_want = request.numwant.map(|n| n as i32).unwrap_or(-1);

    let mut req = Vec::with_capacity(98);
    req.write_u64::<BigEndian>(connection_id)?;
    req.write_u32::<BigEndian>(ACTION_ANNOUNCE)?;
    req.write_u32::<BigEndian>(transaction_id)?;
    req.write_all(&request.info_hash)?;
    req.write_all(&request.peer_id)?;
    req.write_u64::<BigEndian>(request.downloaded)?;
    req.write_u64::<BigEndian>(request.left)?;
    req.write_u64::<BigEndian>(request.uploaded)?;
    req.write_u32::<BigEndian>(event_id)?;
    req.write_u32::<BigEndian>(0)?; // IP address, 0 = sender
    req.write_u32::<BigEndian>(rand::random())?; // key
    req.write_i32::<BigEndian>(num_want)?;
    req.write_u16::<BigEndian>(request.port)?;
    Ok(req)
}

/// Reads action + transaction id and rejects error replies.
fn read_header(buf: &[u8], transaction_id: u32, expected: u32) -> Result<Cursor<&[u8]>, TrackerError> {
    let mut rdr = Cursor::new(buf);
    let action = rdr.read_u32::<BigEndian>()?;
    let tid = rdr.read_u32::<BigEndian>()?;
    if tid != transaction_id {
        return Err(TrackerError::Protocol("transaction id mismatch".into()));
    }
    if action == ACTION_ERROR {
        return Err(TrackerError::Failure(String::from_utf8_lossy(&buf[8..]).into_owned()));
    }
    if action != expected {
        return Err(TrackerError::Protocol(format!(
            "expected action {expected}, got {action}"
        )));
    }
    Ok(rdr)
}

fn parse_connect_response(buf: &[u8], transaction_id: u32) -> Result<u64, TrackerError> {
    if buf.len() < 16 {
        return Err(TrackerError::Protocol("short connect response".into()));
    }
    let mut rdr = read_header(buf, transaction_id, ACTION_CONNECT)?;
    Ok(rdr.read_u64::<BigEndian>()?)
}

fn parse_announce_response(buf: &[u8], transaction_id: u32) -> Result<TrackerResponse, TrackerError> {
    if buf.len() < 8 {
        return Err(TrackerError::Protocol("short announce response".into()));
    }
    let mut rdr = read_header(buf, transaction_id, ACTION_ANNOUNCE)?;
    if buf.len() < 20 {
        return Err(TrackerError::Protocol("short announce response".into()));
    }
    let interval = rdr.read_u32::<BigEndian>()?;
    let leechers = rdr.read_u32::<BigEndian>()?;
    let seeders = rdr.read_u32::<BigEndian>()?;

    Ok(TrackerResponse {
        interval,
        peers: parse_compact_peers(&buf[20..]),
        complete: Some(seeders),
        incomplete: Some(leechers),
    })
}
