//! Classifying user input into a transfer source.

use percent_encoding::percent_decode_str;
use std::path::{Path, PathBuf};
use url::Url;

/// Name used when a URL carries no usable file name.
pub const FALLBACK_FILENAME: &str = "download.bin";

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("invalid Google Drive link: {0}")]
    InvalidDriveLink(String),

    #[error("unrecognized source: {0}")]
    Unrecognized(String),
}

/// Where a download comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
    Direct(Url),
    Magnet(String),
    TorrentFile(PathBuf),
    TorrentUrl(Url),
    Drive(Url),
    Video(Url),
}

impl Source {
    /// Works out what kind of source `input` is.
    ///
    /// Magnet URIs and existing `.torrent` files are recognized first; other
    /// input must be an `http(s)` URL, sorted by host and path.
    pub fn classify(input: &str) -> Result<Self, SourceError> {
        let input = input.trim();
        if input.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("magnet:")) {
            return Ok(Source::Magnet(input.to_string()));
        }

        let path = Path::new(input);
        if has_torrent_extension(input) && path.is_file() {
            return Ok(Source::TorrentFile(path.to_path_buf()));
        }

        let url = Url::parse(input).map_err(|_| SourceError::Unrecognized(input.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(SourceError::Unrecognized(input.to_string()));
        }

        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let on = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));
        Ok(if has_torrent_extension(url.path()) {
            Source::TorrentUrl(url)
        } else if host == "drive.google.com" {
            Source::Drive(url)
        } else if on("youtube.com") || host == "youtu.be" {
            Source::Video(url)
        } else {
            Source::Direct(url)
        })
    }
}

/// Whether a video URL names a whole playlist (`/playlist?list=..`) rather
/// than a single video.
pub fn is_playlist(url: &Url) -> bool {
    url.path().trim_end_matches('/') == "/playlist"
        && url.query_pairs().any(|(k, v)| k == "list" && !v.is_empty())
}

fn has_torrent_extension(path: &str) -> bool {
    Path::new(path)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("torrent"))
}

/// The last non-empty path segment of `url`, percent-decoded.
///
/// # Examples
///
/// ```
/// use omnifetch::source::filename_from_url;
/// use url::Url;
///
/// let url = Url::parse("https://example.com/files/My%20Report.pdf?dl=1").unwrap();
/// assert_eq!(filename_from_url(&url).as_deref(), Some("My Report.pdf"));
/// ```
pub fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.rev().find(|s| !s.is_empty())?;
    let name = percent_decode_str(segment).decode_utf8_lossy();
    let name = crate::storage::safe_component(&name);
    (name != "_").then_some(name)
}

/// Extracts the file id from a Google Drive sharing link: either its `id`
/// query parameter or the segment after `/file/d/`.
///
/// Ids are limited to `[A-Za-z0-9_-]`, so the result is also usable as a
/// file name.
pub fn drive_file_id(link: &str) -> Result<String, SourceError> {
    let invalid = || SourceError::InvalidDriveLink(link.to_string());
    let url = Url::parse(link.trim()).map_err(|_| invalid())?;

    if let Some((_, id)) = url.query_pairs().find(|(k, v)| k == "id" && !v.is_empty()) {
        return is_drive_id(&id).then(|| id.into_owned()).ok_or_else(invalid);
    }

    let mut segments = url.path_segments().ok_or_else(invalid)?;
    while let Some(segment) = segments.next() {
        if segment == "file" && segments.next() == Some("d") {
            return segments
                .next()
                .filter(|id| is_drive_id(id))
                .map(str::to_string)
                .ok_or_else(invalid);
        }
    }
    Err(invalid())
}

fn is_drive_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Direct download URL for a public Drive file.
pub fn drive_download_url(file_id: &str) -> Result<Url, SourceError> {
    Url::parse_with_params(
        "https://drive.google.com/uc",
        [("export", "download"), ("id", file_id)],
    )
    .map_err(|_| SourceError::InvalidDriveLink(file_id.to_string()))
}
