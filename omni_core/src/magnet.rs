//! Magnet URI parsing.

use url::Url;

/// A parsed `magnet:` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    /// The 20-byte info hash from the `xt=urn:btih:` parameter.
    pub info_hash: [u8; 20],
    /// Display name (`dn`), if the link carries one.
    pub display_name: Option<String>,
    /// Tracker URLs from `tr` parameters, in link order.
    pub trackers: Vec<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MagnetError {
    #[error("invalid URI: {0}")]
    Url(#[from] url::ParseError),

    #[error("not a magnet link")]
    NotMagnet,

    #[error("missing info hash")]
    MissingHash,

    #[error("invalid info hash encoding")]
    InvalidHash,
}

impl MagnetLink {
    /// Parses a magnet URI.
    ///
    /// Both hex (40 chars) and base32 (32 chars) `btih` hashes are accepted.
    pub fn parse(uri: &str) -> Result<Self, MagnetError> {
        let url = Url::parse(uri)?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::NotMagnet);
        }

        let mut hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "xt" => {
                    if let Some(h) = v.strip_prefix("urn:btih:") {
                        hash = Some(decode_btih(h)?);
                    }
                }
                "dn" => display_name = Some(v.into_owned()),
                "tr" => trackers.push(v.into_owned()),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: hash.ok_or(MagnetError::MissingHash)?,
            display_name,
            trackers,
        })
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }
}

impl std::str::FromStr for MagnetLink {
    type Err = MagnetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn decode_btih(h: &str) -> Result<[u8; 20], MagnetError> {
    let mut arr = [0u8; 20];
    match h.len() {
        40 => {
            hex::decode_to_slice(h, &mut arr).map_err(|_| MagnetError::InvalidHash)?;
            Ok(arr)
        }
        32 => {
            let mut acc: u64 = 0;
            let mut bits = 0;
            let mut out = 0;
            for c in h.bytes() {
                let v = match c.to_ascii_uppercase() {
                    c @ b'A'..=b'Z' => c - b'A',
                    c @ b'2'..=b'7' => c - b'2' + 26,
                    _ => return Err(MagnetError::InvalidHash),
                };
                acc = (acc << 5) | u64::from(v);
                bits += 5;
                if bits >= 8 {
                    bits -= 8;
                    arr[out] = (acc >> bits) as u8;
                    out += 1;
                }
            }
            Ok(arr)
        }
        _ => Err(MagnetError::InvalidHash),
    }
}
