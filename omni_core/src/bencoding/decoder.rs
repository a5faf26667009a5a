use super::bencode::Bencode;
use std::collections::BTreeMap;

/// Errors produced while decoding bencoded input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input while parsing {0}")]
    Eof(&'static str),

    #[error("invalid integer at pos {0}")]
    InvalidInt(usize),

    #[error("invalid string length at pos {0}")]
    InvalidLength(usize),

    #[error("dict key must be a byte string (pos {0})")]
    NonBytesKey(usize),

    #[error("invalid bencode char '{ch}' at pos {pos}")]
    InvalidChar { ch: char, pos: usize },

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),

    #[error("{0}")]
    Invalid(&'static str),
}

const MAX_DEPTH: usize = 64;

/// Decodes one value starting at `*pos`, advancing `pos` past it.
///
/// Trailing bytes after the value are left untouched; `ut_metadata`
/// messages rely on this to find the raw piece payload behind the header dict.
pub fn decode(input: &[u8], pos: &mut usize) -> Result<Bencode, DecodeError> {
    decode_at(input, pos, 0)
}

fn decode_at(input: &[u8], pos: &mut usize, depth: usize) -> Result<Bencode, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep(MAX_DEPTH));
    }
    let Some(&first) = input.get(*pos) else {
        return Err(DecodeError::Eof("value"));
    };

    match first {
        b'i' => {
            let start = *pos + 1;
            let end = find(input, start, b'e').ok_or(DecodeError::Eof("integer"))?;
            let num = std::str::from_utf8(&input[start..end])
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(DecodeError::InvalidInt(start))?;
            *pos = end + 1;
            Ok(Bencode::Int(num))
        }

        b'l' => {
            *pos += 1;
            let mut list = Vec::new();
            loop {
                match input.get(*pos) {
                    None => return Err(DecodeError::Eof("list")),
                    Some(b'e') => break,
                    Some(_) => list.push(decode_at(input, pos, depth + 1)?),
                }
            }
            *pos += 1;
            Ok(Bencode::List(list))
        }

        b'd' => {
            *pos += 1;
            let mut dict = BTreeMap::new();
            loop {
                match input.get(*pos) {
                    None => return Err(DecodeError::Eof("dict")),
                    Some(b'e') => break,
                    Some(_) => {
                        let key_pos = *pos;
                        let key = match decode_at(input, pos, depth + 1)? {
                            Bencode::Bytes(b) => b,
                            _ => return Err(DecodeError::NonBytesKey(key_pos)),
                        };
                        let val = decode_at(input, pos, depth + 1)?;
                        dict.insert(key, val);
                    }
                }
            }
            *pos += 1;
            Ok(Bencode::Dict(dict))
        }

        b'0'..=b'9' => {
            let start = *pos;
            let colon = find(input, start, b':').ok_or(DecodeError::Eof("string length"))?;
            let len = std::str::from_utf8(&input[start..colon])
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or(DecodeError::InvalidLength(start))?;
            let data_start = colon + 1;
            let data_end = data_start
                .checked_add(len)
                .filter(|&end| end <= input.len())
                .ok_or(DecodeError::Eof("string"))?;
            *pos = data_end;
            Ok(Bencode::Bytes(input[data_start..data_end].to_vec()))
        }

        c => Err(DecodeError::InvalidChar {
            ch: c as char,
            pos: *pos,
        }),
    }
}

fn find(input: &[u8], from: usize, needle: u8) -> Option<usize> {
    input
        .get(from..)?
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
}
