//! Locates the raw "info" value inside a bencoded torrent.

use super::decoder::{DecodeError, decode};

/// Returns the exact byte span of the value stored under the top-level
/// `info` key.
///
/// The span is taken from the original buffer rather than re-encoded, so the
/// hash matches what every other client computes even when the file is not
/// in canonical form.
pub fn find_info_slice(input: &[u8]) -> Result<&[u8], DecodeError> {
    if input.first() != Some(&b'd') {
        return Err(DecodeError::Invalid("torrent root is not a dictionary"));
    }
    let mut pos = 1;

    while input.get(pos).is_some_and(|&b| b != b'e') {
        let key = decode(input, &mut pos)?;
        let value_start = pos;
        decode(input, &mut pos)?;
        if key.as_bytes() == Some(&b"info"[..]) {
            return Ok(&input[value_start..pos]);
        }
    }

    Err(DecodeError::Invalid("info dictionary not found"))
}
