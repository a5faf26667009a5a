//! Core library for omnifetch.
//!
//! Shared model used by both transfer components: bencoding, torrent
//! descriptor and magnet parsing, the transfer result/error taxonomy and the
//! progress-reporting contract.

pub mod bencoding;
pub mod magnet;
pub mod progress;
pub mod transfer;

use bencoding::{Bencode, DecodeError, decode, find_info_slice, info_hash};
use std::path::Path;

pub use magnet::{MagnetError, MagnetLink};
pub use progress::{ProgressSample, ProgressSink, RateMeter, Silent};
pub use transfer::{
    DescriptorSource, ErrorKind, TransferError, TransferOutcome, TransferResult, TransferTarget,
};

/// Information about a single file in a multi-file torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// The length of the file in bytes.
    pub length: u64,
    /// The path components of the file, relative to the torrent root.
    pub path: Vec<String>,
}

/// Metadata of a torrent: piece layout, total size and canonical name.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// Primary tracker, empty when the torrent is trackerless.
    pub announce: String,
    /// Optional list of backup trackers (tier-based).
    pub announce_list: Option<Vec<Vec<String>>>,
    /// The SHA-1 hash of the info dictionary.
    pub info_hash: [u8; 20],
    /// The length of a single piece in bytes.
    pub piece_length: u64,
    /// The list of SHA-1 hashes for each piece.
    pub pieces: Vec<[u8; 20]>,
    /// Canonical name of the file or directory.
    pub name: String,
    /// Total length of the file (single-file mode).
    pub length: Option<u64>,
    /// List of files (multi-file mode).
    pub files: Option<Vec<FileInfo>>,
}

/// Errors produced while reading a torrent descriptor.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed bencode: {0}")]
    Decode(#[from] DecodeError),

    #[error("missing {0}")]
    Missing(&'static str),

    #[error("invalid descriptor: {0}")]
    Invalid(&'static str),
}

impl Descriptor {
    /// Total size of the content in bytes.
    pub fn total_length(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(len), _) => *len,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            (None, None) => 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Size of piece `index`; the last piece carries the remainder.
    pub fn piece_size(&self, index: usize) -> u64 {
        let total = self.total_length();
        let start = index as u64 * self.piece_length;
        total.saturating_sub(start).min(self.piece_length)
    }

    /// Every tracker URL, primary first, without duplicates.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        let tiers = self.announce_list.iter().flatten().flatten();
        for url in std::iter::once(&self.announce).chain(tiers) {
            if !url.is_empty() && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Builds a descriptor from a raw info dictionary, as obtained through a
    /// metadata exchange with peers.
    pub fn from_info_bytes(info: &[u8], trackers: &[String]) -> Result<Self, DescriptorError> {
        let mut pos = 0;
        let info_dict = decode(info, &mut pos)?;
        if pos != info.len() {
            return Err(DescriptorError::Invalid("trailing bytes after info dictionary"));
        }
        let mut descriptor = parse_info(&info_dict, info_hash(info))?;
        if let Some((first, rest)) = trackers.split_first() {
            descriptor.announce = first.clone();
            if !rest.is_empty() {
                descriptor.announce_list = Some(vec![rest.to_vec()]);
            }
        }
        Ok(descriptor)
    }
}

/// Parses a `.torrent` file from disk.
pub fn parse_descriptor(path: impl AsRef<Path>) -> Result<Descriptor, DescriptorError> {
    let buf = std::fs::read(path)?;
    parse_descriptor_from_bytes(&buf)
}

/// Parses a torrent from its bencoded bytes.
pub fn parse_descriptor_from_bytes(buf: &[u8]) -> Result<Descriptor, DescriptorError> {
    let mut pos = 0;
    let root = decode(buf, &mut pos)?;
    if root.as_dict().is_none() {
        return Err(DescriptorError::Invalid("torrent root is not a dictionary"));
    }

    let hash = info_hash(find_info_slice(buf)?);
    let info = root.get(b"info").ok_or(DescriptorError::Missing("info dictionary"))?;
    let mut descriptor = parse_info(info, hash)?;

    descriptor.announce = root
        .get(b"announce")
        .and_then(Bencode::as_str_lossy)
        .unwrap_or_default();

    let tiers: Vec<Vec<String>> = root
        .get(b"announce-list")
        .and_then(Bencode::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(Bencode::as_list)
        .map(|tier| tier.iter().filter_map(Bencode::as_str_lossy).collect::<Vec<_>>())
        .filter(|tier| !tier.is_empty())
        .collect();
    descriptor.announce_list = if tiers.is_empty() { None } else { Some(tiers) };

    Ok(descriptor)
}

fn parse_info(info: &Bencode, hash: [u8; 20]) -> Result<Descriptor, DescriptorError> {
    if info.as_dict().is_none() {
        return Err(DescriptorError::Missing("info dictionary"));
    }

    let name = info
        .get(b"name")
        .and_then(Bencode::as_str_lossy)
        .ok_or(DescriptorError::Missing("name"))?;

    let piece_length = info
        .get(b"piece length")
        .and_then(Bencode::as_int)
        .ok_or(DescriptorError::Missing("piece length"))?;
    if piece_length <= 0 {
        return Err(DescriptorError::Invalid("piece length must be positive"));
    }

    let pieces_bytes = info
        .get(b"pieces")
        .and_then(Bencode::as_bytes)
        .ok_or(DescriptorError::Missing("pieces"))?;
    if pieces_bytes.len() % 20 != 0 {
        return Err(DescriptorError::Invalid("pieces length is not a multiple of 20"));
    }
    let pieces = pieces_bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect();

    let length = match info.get(b"length").map(Bencode::as_int) {
        Some(Some(len)) if len >= 0 => Some(len as u64),
        Some(_) => return Err(DescriptorError::Invalid("length must be a non-negative integer")),
        None => None,
    };

    let files = match info.get(b"files").and_then(Bencode::as_list) {
        Some(list) => Some(parse_files(list)?),
        None => None,
    };

    if length.is_none() && files.is_none() {
        return Err(DescriptorError::Missing("length or files"));
    }

    let descriptor = Descriptor {
        announce: String::new(),
        announce_list: None,
        info_hash: hash,
        piece_length: piece_length as u64,
        pieces,
        name,
        length,
        files,
    };

    let expected = descriptor.total_length().div_ceil(descriptor.piece_length);
    if expected != descriptor.pieces.len() as u64 {
        return Err(DescriptorError::Invalid("piece count does not match total length"));
    }

    Ok(descriptor)
}

fn parse_files(list: &[Bencode]) -> Result<Vec<FileInfo>, DescriptorError> {
    let mut files = Vec::with_capacity(list.len());
    for entry in list {
        let length = entry
            .get(b"length")
            .and_then(Bencode::as_int)
            .filter(|len| *len >= 0)
            .ok_or(DescriptorError::Invalid("file entry without a valid length"))?;
        let path: Vec<String> = entry
            .get(b"path")
            .and_then(Bencode::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(Bencode::as_str_lossy)
            .collect();
        if path.is_empty() {
            return Err(DescriptorError::Invalid("file entry without a path"));
        }
        files.push(FileInfo {
            length: length as u64,
            path,
        });
    }
    Ok(files)
}
