//! HTTP tracker client.

use super::{TrackerError, TrackerEvent, TrackerRequest, TrackerResponse, parse_compact_peers};
use omni_core::bencoding::{Bencode, decode};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// Client for HTTP/HTTPS announce endpoints.
pub struct HttpTracker {
    url: String,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            url: url.to_string(),
            client,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn announce(&self, request: &TrackerRequest) -> Result<TrackerResponse, TrackerError> {
        let full_url = announce_url(&self.url, request);
        let bytes = self
            .client
            .get(&full_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        let mut pos = 0;
        parse_http_response(&decode(&bytes, &mut pos)?)
    }
}

/// Builds the announce URL. Info hash and peer id are raw bytes, so they are
/// percent-encoded by hand instead of going through a `&str` query builder.
fn announce_url(base: &str, request: &TrackerRequest) -> String {
    let info_hash = form_urlencoded::byte_serialize(&request.info_hash).collect::<String>();
    let peer_id = form_urlencoded::byte_serialize(&request.peer_id).collect::<String>();

    let mut params = form_urlencoded::Serializer::new(String::new());
    params
        .append_pair("port", &request.port.to_string())
        .append_pair("uploaded", &request.uploaded.to_string())
        .append_pair("downloaded", &request.downloaded.to_string())
        .append_pair("left", &request.left.to_string())
        .append_pair("compact", if request.compact { "1" } else { "0" });

    if let Some(event) = request.event {
        let event_str = match event {
            TrackerEvent::Started => "started",
            TrackerEvent::Stopped => "stopped",
            TrackerEvent::Completed => "completed",
        };
        params.append_pair("event", event_str);
    }
    if let Some(numwant) = request.numwant {
        params.append_pair("numwant", &numwant.to_string());
    }

    let separator = if base.contains('?') { "&" } else { "?" };
    format!(
        "{base}{separator}info_hash={info_hash}&peer_id={peer_id}&{}",
        params.finish()
    )
}

fn parse_http_response(root: &Bencode) -> Result<TrackerResponse, TrackerError> {
    if root.as_dict().is_none() {
        return Err(TrackerError::Protocol("response is not a dictionary".into()));
    }
    if let Some(reason) = root.get(b"failure reason").and_then(Bencode::as_str_lossy) {
        return Err(TrackerError::Failure(reason));
    }

    let interval = root
        .get(b"interval")
        .and_then(Bencode::as_int)
        .ok_or_else(|| TrackerError::Protocol("missing or invalid interval".into()))?;

    let count = |key: &[u8]| root.get(key).and_then(Bencode::as_int).map(|i| i as u32);

    let peers = match root.get(b"peers") {
        Some(Bencode::Bytes(b)) => parse_compact_peers(b),
        Some(Bencode::List(l)) => l
            .iter()
            .filter_map(|item| {
                let ip: Ipv4Addr = item.get(b"ip")?.as_str_lossy()?.parse().ok()?;
                let port = u16::try_from(item.get(b"port")?.as_int()?).ok()?;
                Some(SocketAddrV4::new(ip, port))
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(TrackerResponse {
        interval: interval.max(0) as u32,
        peers,
        complete: count(&b"complete"[..]),
        incomplete: count(&b"incomplete"[..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use omni_core::bencoding::dict;

    fn request() -> TrackerRequest {
        TrackerRequest {
            info_hash: [0xab; 20],
            peer_id: *b"-OF0001-abcdefghijkl",
            port: 6881,
            uploaded: 0,
            downloaded: 10,
            left: 90,
            compact: true,
            event: Some(TrackerEvent::Started),
            numwant: Some(50),
        }
    }

    #[test]
    fn test_announce_url_encodes_binary_fields() {
        let url = announce_url("http://t/announce", &request());
        assert!(url.starts_with("http://t/announce?info_hash=%AB%AB"));
        assert!(url.contains("peer_id=-OF0001-abcdefghijkl"));
        assert!(url.contains("left=90"));
        assert!(url.contains("event=started"));
        assert!(url.contains("numwant=50"));

        let url = announce_url("http://t/announce?passkey=x", &request());
        assert!(url.starts_with("http://t/announce?passkey=x&info_hash="));
    }

    #[test]
    fn test_parse_compact_response() {
        let root = dict([
            ("interval", Bencode::Int(1800)),
            ("complete", Bencode::Int(3)),
            ("peers", Bencode::Bytes(vec![10, 0, 0, 1, 0x1a, 0xe1])),
        ]);
        let res = parse_http_response(&root).unwrap();
        assert_eq!(res.interval, 1800);
        assert_eq!(res.complete, Some(3));
        assert_eq!(res.incomplete, None);
        assert_eq!(res.peers, vec!["10.0.0.1:6881".parse::<SocketAddrV4>().unwrap()]);
    }

    #[test]
    fn test_parse_dictionary_peers() {
        let peer = dict([
            ("ip", Bencode::Bytes(b"192.168.1.2".to_vec())),
            ("port", Bencode::Int(51413)),
        ]);
        let bad_peer = dict([("ip", Bencode::Bytes(b"not-an-ip".to_vec()))]);
        let root = dict([
            ("interval", Bencode::Int(60)),
            ("peers", Bencode::List(vec![peer, bad_peer])),
        ]);
        let res = parse_http_response(&root).unwrap();
        assert_eq!(res.peers, vec!["192.168.1.2:51413".parse::<SocketAddrV4>().unwrap()]);
    }

    #[test]
    fn test_parse_failure_reason() {
        let root = dict([("failure reason", Bencode::Bytes(b"unregistered torrent".to_vec()))]);
        match parse_http_response(&root) {
            Err(TrackerError::Failure(msg)) => assert_eq!(msg, "unregistered torrent"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
