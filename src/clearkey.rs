//! ClearKey key system.
//!
//! Initial license messages carry the ClearKey content protection header:
//! inline keys complete immediately, a remote URL is fetched once. Later
//! messages are kid-only JSON requests whose keys come from a [`KeyProvider`].
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::events::LicenseRequestComplete;
use crate::key::KeyPair;
use crate::key_system::{KeyProvider, KeySystem, LicenseFetcher};
use crate::keyset::KeySet;
use crate::pssh::ClearKeyHeader;
use crate::utils::b64_decode_lenient;

/// ClearKey key system string.
pub const CLEARKEY_SYSTEM_STRING: &str = "org.w3.clearkey";
/// ClearKey DRM system id.
pub const CLEARKEY_UUID: Uuid = Uuid::from_u128(0x10000000_0000_0000_0000_000000000000);
/// Scheme URI of the MPEG common encryption protection scheme.
pub const CLEARKEY_SCHEME_ID_URI: &str = "urn:mpeg:dash:mp4protection:2011";

/// Reference ClearKey implementation of [`KeySystem`].
pub struct ClearKey {
    fetcher: Arc<dyn LicenseFetcher>,
    provider: Arc<dyn KeyProvider>,
}

impl ClearKey {
    pub fn new(fetcher: Arc<dyn LicenseFetcher>, provider: Arc<dyn KeyProvider>) -> Self {
        Self { fetcher, provider }
    }

    /// ClearKey over HTTP with keys served from the config's key table.
    #[cfg(feature = "http")]
    pub fn from_config(config: &crate::config::ProtectionConfig) -> Result<Self> {
        let fetcher = crate::fetch::HttpLicenseFetcher::new(config)?;
        Ok(Self::new(Arc::new(fetcher), Arc::new(config.key_provider()?)))
    }

    async fn request_remote(&self, url: &str) -> Result<KeySet> {
        debug!("Requesting ClearKey license from {}", url);
        let body = self.fetcher.get_json(url).await?;
        key_set_from_response(&body)
    }

    async fn resolve_keys(&self, message: &[u8]) -> (Result<KeySet>, Vec<Error>) {
        let mut key_set = match KeySet::decode(message) {
            Ok(set) => set,
            Err(e) => return (Err(e), Vec::new()),
        };

        let mut unresolved = Vec::new();
        for pair in key_set.key_pairs.iter_mut() {
            match self.provider.lookup(&pair.key_id).await {
                Ok(key) => pair.key = key,
                Err(e) => {
                    warn!("Couldn't find key for key id {}", pair.kid_hex());
                    unresolved.push(e);
                }
            }
        }
        (Ok(key_set), unresolved)
    }
}

impl std::fmt::Debug for ClearKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClearKey")
            .field("system_string", &CLEARKEY_SYSTEM_STRING)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl KeySystem for ClearKey {
    fn system_string(&self) -> &str {
        CLEARKEY_SYSTEM_STRING
    }

    fn uuid(&self) -> Uuid {
        CLEARKEY_UUID
    }

    fn scheme_id_uri(&self) -> &str {
        CLEARKEY_SCHEME_ID_URI
    }

    async fn do_license_request(
        &self,
        message: &[u8],
        _url: Option<&str>,
        request_data: &str,
        is_initial_request: bool,
    ) -> LicenseRequestComplete {
        if !is_initial_request {
            let (result, unresolved) = self.resolve_keys(message).await;
            return LicenseRequestComplete {
                result,
                correlation: request_data.to_string(),
                unresolved,
            };
        }

        let result = match ClearKeyHeader::from_bytes(message) {
            Ok(ClearKeyHeader::Inline { key_pairs }) => Ok(KeySet::new(key_pairs, None)),
            Ok(ClearKeyHeader::Remote { url }) => self.request_remote(&url).await,
            Err(e) => Err(e),
        };
        if let Err(ref e) = result {
            warn!("ClearKey license request for {} failed: {}", request_data, e);
        }

        LicenseRequestComplete {
            result,
            correlation: request_data.to_string(),
            unresolved: Vec::new(),
        }
    }

    fn get_init_data(&self) -> Option<Vec<u8>> {
        None
    }
}

/// Map a `{"keys":[{"kid":..,"k":..}]}` license response to a key set.
fn key_set_from_response(body: &serde_json::Value) -> Result<KeySet> {
    let keys = body
        .get("keys")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| Error::network("ClearKey remote update, illegal response JSON"))?;

    let mut key_pairs = Vec::with_capacity(keys.len());
    for entry in keys {
        let field = |name: &str| {
            entry
                .get(name)
                .and_then(serde_json::Value::as_str)
                .ok_or_else(|| Error::network(format!("License key entry missing {:?}", name)))
        };
        let kid = b64_decode_lenient(field("kid")?).map_err(|e| Error::network(e.to_string()))?;
        let key = b64_decode_lenient(field("k")?).map_err(|e| Error::network(e.to_string()))?;
        let pair = KeyPair::from_slices(&kid, &key).map_err(|e| Error::network(e.to_string()))?;
        key_pairs.push(pair);
    }

    let r#type = body.get("type").and_then(serde_json::Value::as_str);
    KeySet::with_type_str(key_pairs, r#type).map_err(|e| Error::network(e.to_string()))
}
