//! Base64 helpers shared by the codec and the license fetcher.
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::error::{Error, Result};

/// Encode as unpadded base64url, the form used in JWK `k`/`kid` fields.
#[must_use]
pub fn b64url_encode(data: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// Decode base64 in either alphabet, with or without padding.
///
/// License servers in the wild mix standard and URL-safe encodings, so both
/// are normalized to unpadded base64url before decoding.
pub fn b64_decode_lenient(data: &str) -> Result<Vec<u8>> {
    let normalized: String = data
        .trim()
        .trim_end_matches('=')
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            other => other,
        })
        .collect();
    URL_SAFE_NO_PAD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::Parse(format!("Base64 decode error: {}", e)))
}

/// Decode strict standard base64 (the header URL field).
pub fn b64_decode_standard(data: &[u8]) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| Error::Parse(format!("Base64 decode error: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_decode_accepts_both_alphabets() {
        let bytes = [0xfbu8, 0xff, 0xfe, 0x10];
        let url_safe = b64url_encode(&bytes);
        assert!(!url_safe.contains('='));
        assert_eq!(b64_decode_lenient(&url_safe).unwrap(), bytes);

        let standard = STANDARD.encode(bytes);
        assert_eq!(b64_decode_lenient(&standard).unwrap(), bytes);
    }

    #[test]
    fn lenient_decode_rejects_garbage() {
        assert!(b64_decode_lenient("not base64!").is_err());
    }
}
