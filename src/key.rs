//! Key module for ClearKey content keys.
//!
//! Both the key ID and the key are fixed 16-byte values. A key may be an
//! all-zero placeholder while it waits for a provider lookup.

use std::fmt;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Length in bytes of key IDs and content keys.
pub const KEY_LEN: usize = 16;

/// A 16-byte key ID.
pub type KeyId = [u8; KEY_LEN];

/// A key ID paired with its AES-128 content key.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyPair {
    /// Key ID.
    pub key_id: KeyId,
    /// Content key bytes.
    pub key: [u8; KEY_LEN],
}

impl KeyPair {
    /// Create a new KeyPair.
    pub fn new(key_id: KeyId, key: [u8; KEY_LEN]) -> Self {
        Self { key_id, key }
    }

    /// Create a KeyPair whose key material is still unknown.
    pub fn placeholder(key_id: KeyId) -> Self {
        Self::new(key_id, [0u8; KEY_LEN])
    }

    /// Build a KeyPair from byte slices, checking both lengths.
    pub fn from_slices(key_id: &[u8], key: &[u8]) -> Result<Self> {
        Ok(Self::new(to_array(key_id, "key id")?, to_array(key, "key")?))
    }

    /// Whether the key material is still the zero placeholder.
    pub fn is_placeholder(&self) -> bool {
        self.key.iter().all(|b| *b == 0)
    }

    /// Key ID as UUID.
    pub fn kid(&self) -> Uuid {
        Uuid::from_bytes(self.key_id)
    }

    /// Key ID as lowercase hex.
    pub fn kid_hex(&self) -> String {
        hex::encode(self.key_id)
    }
}

// Key material stays out of logs and panic messages.
impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("kid", &self.kid_hex())
            .field("placeholder", &self.is_placeholder())
            .finish()
    }
}

/// Copy a slice into a 16-byte array.
pub(crate) fn to_array(bytes: &[u8], what: &str) -> Result<[u8; KEY_LEN]> {
    bytes.try_into().map_err(|_| {
        Error::Parse(format!(
            "Invalid {} length: expected {}, got {}",
            what,
            KEY_LEN,
            bytes.len()
        ))
    })
}
