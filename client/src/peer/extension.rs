//! Extension protocol messages (BEP 10): `ut_metadata` (BEP 9) and `ut_pex`.
//!
//! Remote peers address our extensions by the ids we advertise in our
//! handshake, so incoming extended messages are matched against the `LOCAL_*`
//! ids while outgoing ones use the ids from the remote handshake.

use super::{Message, PeerError};
use omni_core::bencoding::{Bencode, decode, dict};
use std::net::SocketAddrV4;

pub const HANDSHAKE_ID: u8 = 0;
pub const LOCAL_PEX_ID: u8 = 1;
pub const LOCAL_METADATA_ID: u8 = 2;

/// Metadata travels in 16 KiB pieces.
pub const METADATA_PIECE_SIZE: usize = 16 * 1024;
/// Refuse info dictionaries larger than this.
pub const MAX_METADATA_SIZE: usize = 16 * 1024 * 1024;

/// What the remote announced in its extended handshake.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteExtensions {
    pub ut_metadata: Option<u8>,
    pub ut_pex: Option<u8>,
    pub metadata_size: Option<usize>,
}

/// Our extended handshake; `metadata_size` is only sent by peers that have it.
pub fn handshake(metadata_size: Option<usize>) -> Message {
    let mut entries = vec![(
        "m",
        dict([
            ("ut_pex", Bencode::Int(LOCAL_PEX_ID.into())),
            ("ut_metadata", Bencode::Int(LOCAL_METADATA_ID.into())),
        ]),
    )];
    if let Some(size) = metadata_size {
        entries.push(("metadata_size", Bencode::Int(size as i64)));
    }
    Message::Extended {
        id: HANDSHAKE_ID,
        payload: dict(entries).encode(),
    }
}

pub fn parse_handshake(payload: &[u8]) -> Result<RemoteExtensions, PeerError> {
    let root = decode(payload, &mut 0)
        .map_err(|e| PeerError::Protocol(format!("extended handshake: {e}")))?;
    let id_of = |name: &[u8]| {
        root.get(b"m")
            .and_then(|m| m.get(name))
            .and_then(Bencode::as_int)
            .and_then(|id| u8::try_from(id).ok())
            .filter(|id| *id != 0)
    };
    Ok(RemoteExtensions {
        ut_metadata: id_of(&b"ut_metadata"[..]),
        ut_pex: id_of(&b"ut_pex"[..]),
        metadata_size: root
            .get(b"metadata_size")
            .and_then(Bencode::as_int)
            .and_then(|s| usize::try_from(s).ok()),
    })
}

/// Peers listed in a `ut_pex` message's `added` field.
pub fn parse_pex(payload: &[u8]) -> Vec<SocketAddrV4> {
    decode(payload, &mut 0)
        .ok()
        .and_then(|root| root.get(b"added").and_then(Bencode::as_bytes).map(tracker::parse_compact_peers))
        .unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataMessage {
    Request { piece: usize },
    Data { piece: usize, total_size: usize, data: Vec<u8> },
    Reject { piece: usize },
}

impl MetadataMessage {
    /// Encodes for a remote that assigned `ut_metadata` the id `remote_id`.
    pub fn to_message(&self, remote_id: u8) -> Message {
        let payload = match self {
            MetadataMessage::Request { piece } => dict([
                ("msg_type", Bencode::Int(0)),
                ("piece", Bencode::Int(*piece as i64)),
            ])
            .encode(),
            MetadataMessage::Data {
                piece,
                total_size,
                data,
            } => {
                let mut out = dict([
                    ("msg_type", Bencode::Int(1)),
                    ("piece", Bencode::Int(*piece as i64)),
                    ("total_size", Bencode::Int(*total_size as i64)),
                ])
                .encode();
                out.extend_from_slice(data);
                out
            }
            MetadataMessage::Reject { piece } => dict([
                ("msg_type", Bencode::Int(2)),
                ("piece", Bencode::Int(*piece as i64)),
            ])
            .encode(),
        };
        Message::Extended {
            id: remote_id,
            payload,
        }
    }

    /// Parses a `ut_metadata` payload; data pieces carry raw bytes after the
    /// bencoded header.
    pub fn parse(payload: &[u8]) -> Result<Self, PeerError> {
        let mut pos = 0;
        let header = decode(payload, &mut pos)
            .map_err(|e| PeerError::Protocol(format!("ut_metadata: {e}")))?;
        let int = |key: &[u8]| {
            header
                .get(key)
                .and_then(Bencode::as_int)
                .and_then(|v| usize::try_from(v).ok())
        };
        let piece = int(&b"piece"[..]).ok_or_else(|| PeerError::Protocol("ut_metadata without piece".into()))?;
        match int(&b"msg_type"[..]) {
            Some(0) => Ok(MetadataMessage::Request { piece }),
            Some(1) => Ok(MetadataMessage::Data {
                piece,
                total_size: int(&b"total_size"[..]).unwrap_or(0),
                data: payload[pos..].to_vec(),
            }),
            Some(2) => Ok(MetadataMessage::Reject { piece }),
            other => Err(PeerError::Protocol(format!("ut_metadata msg_type {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_advertises_local_ids() {
        let Message::Extended { id, payload } = handshake(Some(1234)) else {
            panic!("not an extended message");
        };
        assert_eq!(id, HANDSHAKE_ID);
        let parsed = parse_handshake(&payload).unwrap();
        assert_eq!(parsed.ut_metadata, Some(LOCAL_METADATA_ID));
        assert_eq!(parsed.ut_pex, Some(LOCAL_PEX_ID));
        assert_eq!(parsed.metadata_size, Some(1234));
    }

    #[test]
    fn test_disabled_extension_is_none() {
        let payload = dict([("m", dict([("ut_metadata", Bencode::Int(0))]))]).encode();
        assert_eq!(parse_handshake(&payload).unwrap(), RemoteExtensions::default());
    }

    #[test]
    fn test_metadata_data_keeps_trailing_bytes() {
        let msg = MetadataMessage::Data {
            piece: 1,
            total_size: 20000,
            data: b"d4:name1:xe".to_vec(),
        };
        let Message::Extended { id, payload } = msg.to_message(3) else {
            panic!("not an extended message");
        };
        assert_eq!(id, 3);
        assert_eq!(MetadataMessage::parse(&payload).unwrap(), msg);
    }

    #[test]
    fn test_parse_pex_added() {
        let payload = dict([("added", Bencode::Bytes(vec![10, 0, 0, 2, 0x1a, 0xe1]))]).encode();
        assert_eq!(parse_pex(&payload), vec!["10.0.0.2:6881".parse::<SocketAddrV4>().unwrap()]);
        assert!(parse_pex(b"garbage").is_empty());
    }
}
