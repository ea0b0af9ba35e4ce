//! ClearKey content protection header parsing.
//!
//! The header is carried either bare or as the data payload of an ISO-BMFF
//! `pssh` box:
//!
//! ```text
//! clearkey_pssh_data {
//!   u8 type
//!   if type == 0 {
//!     u16 url_length                  (big endian)
//!     u8[url_length] url              (base64)
//!   } else if type == 1 {
//!     u8 num_keys
//!     { u8[16] key_id; u8[16] key }[num_keys]
//!   }
//! }
//! ```
use base64::Engine;
use byteorder::{BigEndian, ByteOrder};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::key::{KeyPair, KEY_LEN};
use crate::keyset::KeySet;
use crate::utils::b64_decode_standard;

/// Header type tag for a remote license URL.
pub const TYPE_REMOTE: u8 = 0;
/// Header type tag for inline key pairs.
pub const TYPE_INLINE: u8 = 1;

/// A parsed ClearKey header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearKeyHeader {
    /// Keys must be fetched from `url`.
    Remote { url: String },
    /// Keys are embedded in the header.
    Inline { key_pairs: Vec<KeyPair> },
}

impl ClearKeyHeader {
    /// Parse a header, unwrapping a surrounding `pssh` box if present.
    ///
    /// A bare header may carry `pssh` at the box type offset inside a key ID.
    /// When the input does not read as a well-formed box holding a valid
    /// header, it is parsed as bare data; if that fails too, the box error is
    /// returned.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        match pssh_box_data(data) {
            Ok(None) => Self::parse_data(data),
            Ok(Some(payload)) => {
                Self::parse_data(payload).or_else(|e| Self::parse_data(data).map_err(|_| e))
            }
            Err(e) => Self::parse_data(data).map_err(|_| e),
        }
    }

    /// Parse a base64 encoded header.
    pub fn from_base64(data_b64: &str) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(data_b64.trim())
            .map_err(|e| Error::Parse(format!("Base64 decode error: {}", e)))?;
        Self::from_bytes(&data)
    }

    /// Parse bare header data (no box).
    pub fn parse_data(data: &[u8]) -> Result<Self> {
        let (&ck_type, rest) = data
            .split_first()
            .ok_or_else(|| Error::Parse("Header must not be empty".to_string()))?;

        match ck_type {
            TYPE_REMOTE => parse_remote(rest),
            TYPE_INLINE => parse_inline(rest),
            other => Err(Error::Parse(format!("unknown type {}", other))),
        }
    }

    /// Serialize the bare header data.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match self {
            ClearKeyHeader::Remote { url } => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(url);
                let len = u16::try_from(encoded.len()).map_err(|_| {
                    Error::Parse(format!("URL too long for header: {} bytes", encoded.len()))
                })?;
                out.push(TYPE_REMOTE);
                out.extend_from_slice(&len.to_be_bytes());
                out.extend_from_slice(encoded.as_bytes());
            }
            ClearKeyHeader::Inline { key_pairs } => {
                let count = u8::try_from(key_pairs.len()).map_err(|_| {
                    Error::Parse(format!("Too many keys for header: {}", key_pairs.len()))
                })?;
                out.push(TYPE_INLINE);
                out.push(count);
                for pair in key_pairs.iter() {
                    out.extend_from_slice(&pair.key_id);
                    out.extend_from_slice(&pair.key);
                }
            }
        }
        Ok(out)
    }

    /// Key set for an inline header, `None` for a remote one.
    pub fn key_set(&self) -> Option<KeySet> {
        match self {
            ClearKeyHeader::Inline { key_pairs } => Some(KeySet::new(key_pairs.clone(), None)),
            ClearKeyHeader::Remote { .. } => None,
        }
    }
}

fn parse_remote(data: &[u8]) -> Result<ClearKeyHeader> {
    if data.len() < 2 {
        return Err(Error::Parse("Missing URL length".to_string()));
    }
    let url_len = BigEndian::read_u16(&data[..2]) as usize;
    let remaining = &data[2..];
    if url_len > remaining.len() {
        return Err(Error::Parse(format!(
            "URL length {} exceeds remaining {} bytes",
            url_len,
            remaining.len()
        )));
    }

    if url_len == 0 {
        return Err(Error::Parse("URL must not be empty".to_string()));
    }

    let decoded = b64_decode_standard(&remaining[..url_len])?;
    let url = String::from_utf8(decoded)
        .map_err(|_| Error::Parse("URL is not valid UTF-8".to_string()))?;
    // Headers authored from XML manifests sometimes keep an escaped ampersand.
    let url = url.replacen("&amp;", "&", 1);

    Ok(ClearKeyHeader::Remote { url })
}

fn parse_inline(data: &[u8]) -> Result<ClearKeyHeader> {
    let (&num_keys, mut rest) = data
        .split_first()
        .ok_or_else(|| Error::Parse("Missing key count".to_string()))?;

    let required = num_keys as usize * KEY_LEN * 2;
    if rest.len() < required {
        return Err(Error::Parse(format!(
            "Header truncated: {} keys need {} bytes, got {}",
            num_keys,
            required,
            rest.len()
        )));
    }

    let mut key_pairs = Vec::with_capacity(num_keys as usize);
    for _ in 0..num_keys {
        let (kid, tail) = rest.split_at(KEY_LEN);
        let (key, tail) = tail.split_at(KEY_LEN);
        key_pairs.push(KeyPair::from_slices(kid, key)?);
        rest = tail;
    }

    Ok(ClearKeyHeader::Inline { key_pairs })
}

/// Extract the data payload of a `pssh` box.
///
/// Returns `Ok(None)` when `data` is not a box at all, so bare headers pass
/// through; a box that claims more bytes than available is an error.
pub fn pssh_box_data(data: &[u8]) -> Result<Option<&[u8]>> {
    if data.len() < 8 || &data[4..8] != b"pssh" {
        return Ok(None);
    }

    let mut offset = 8;
    let size = match BigEndian::read_u32(&data[..4]) {
        0 => data.len(),
        1 => {
            if data.len() < 16 {
                return Err(Error::Parse("PSSH box too short".to_string()));
            }
            offset += 8;
            BigEndian::read_u64(&data[8..16]) as usize
        }
        n => n as usize,
    };
    if size > data.len() {
        return Err(Error::Parse("PSSH size exceeds data length".to_string()));
    }
    let data = &data[..size];

    if data.len() < offset + 4 + 16 {
        return Err(Error::Parse("PSSH header incomplete".to_string()));
    }
    let version = data[offset];
    offset += 4 + 16;

    if version == 1 {
        if data.len() < offset + 4 {
            return Err(Error::Parse("Missing KID count".to_string()));
        }
        let kid_count = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
        offset += 4;
        offset = kid_count
            .checked_mul(16)
            .and_then(|n| n.checked_add(offset))
            .filter(|end| *end <= data.len())
            .ok_or_else(|| Error::Parse("Missing KIDs".to_string()))?;
    }

    if data.len() < offset + 4 {
        return Err(Error::Parse("Missing init data length".to_string()));
    }
    let data_size = BigEndian::read_u32(&data[offset..offset + 4]) as usize;
    offset += 4;
    if data.len() - offset < data_size {
        return Err(Error::Parse("Missing init data".to_string()));
    }

    Ok(Some(&data[offset..offset + data_size]))
}

/// Wrap header data in a version 0 `pssh` box for `system_id`.
pub fn build_pssh_box(system_id: Uuid, data: &[u8]) -> Vec<u8> {
    let size = (8 + 4 + 16 + 4 + data.len()) as u32;
    let mut out = Vec::with_capacity(size as usize);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(b"pssh");
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(system_id.as_bytes());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}
