//! Key system capability contract and its collaborators.
//!
//! A key system turns license messages from the decryption module into key
//! sets. Concrete systems are chosen at runtime and held as
//! `Arc<dyn KeySystem>`.
use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::LicenseRequestComplete;
use crate::key::{to_array, KeyId, KEY_LEN};

/// License-request capability implemented by every key system.
#[async_trait]
pub trait KeySystem: Send + Sync + fmt::Debug {
    /// Key system identifier, e.g. `org.w3.clearkey`.
    fn system_string(&self) -> &str;

    /// DRM system id used in `pssh` boxes.
    fn uuid(&self) -> Uuid;

    /// Scheme URI matched against manifest content protection elements.
    fn scheme_id_uri(&self) -> &str;

    /// Turn a license message into a key set.
    ///
    /// `request_data` is echoed back as the completion's correlation value.
    /// Failures are carried inside the returned completion, never raised.
    async fn do_license_request(
        &self,
        message: &[u8],
        url: Option<&str>,
        request_data: &str,
        is_initial_request: bool,
    ) -> LicenseRequestComplete;

    /// Init data this key system would supply on its own, if any.
    fn get_init_data(&self) -> Option<Vec<u8>>;

    /// Compare two init data buffers by content.
    fn init_data_equals(&self, a: &[u8], b: &[u8]) -> bool {
        a.len() == b.len() && a == b
    }
}

/// Resolves key IDs to key material for kid-only license requests.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    /// Look up the key for `key_id`.
    ///
    /// Returns [`Error::KeyResolution`] when the ID is unknown.
    async fn lookup(&self, key_id: &KeyId) -> Result<[u8; KEY_LEN]>;
}

/// Key provider backed by an in-memory table, typically loaded from config.
#[derive(Clone, Default)]
pub struct StaticKeyProvider {
    keys: HashMap<KeyId, [u8; KEY_LEN]>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key_id: KeyId, key: [u8; KEY_LEN]) {
        self.keys.insert(key_id, key);
    }

    /// Build from hex encoded `kid -> key` entries.
    pub fn from_hex_map<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        let mut provider = Self::new();
        for (kid, key) in entries {
            let kid_bytes = hex::decode(kid.trim())
                .map_err(|e| Error::Config(format!("Invalid key id {:?}: {}", kid, e)))?;
            let key_bytes = hex::decode(key.trim())
                .map_err(|e| Error::Config(format!("Invalid key for {:?}: {}", kid, e)))?;
            let kid_arr = to_array(&kid_bytes, "key id").map_err(|e| Error::Config(e.to_string()))?;
            let key_arr = to_array(&key_bytes, "key").map_err(|e| Error::Config(e.to_string()))?;
            provider.insert(kid_arr, key_arr);
        }
        Ok(provider)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticKeyProvider")
            .field("keys", &self.keys.len())
            .finish()
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn lookup(&self, key_id: &KeyId) -> Result<[u8; KEY_LEN]> {
        self.keys
            .get(key_id)
            .copied()
            .ok_or_else(|| Error::KeyResolution(hex::encode(key_id)))
    }
}

/// Fetches a license response body from a remote endpoint.
#[async_trait]
pub trait LicenseFetcher: Send + Sync {
    /// GET `url` and return the parsed JSON body.
    ///
    /// Transport failures, non-2xx statuses and non-JSON bodies are
    /// [`Error::Network`].
    async fn get_json(&self, url: &str) -> Result<serde_json::Value>;
}
