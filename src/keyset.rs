//! ClearKey key sets and their JSON Web Key style serialization.
//!
//! Outgoing key sets are written as
//! `{"keys":[{"kty":"oct","alg":"A128KW","k":..,"kid":..}],"type":..}` with
//! unpadded base64url values. Incoming license requests carry only key IDs:
//! `{"kids":[..],"type":..}`.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::{to_array, KeyPair};
use crate::utils::{b64_decode_lenient, b64url_encode};

/// Persistence type of a key set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySetType {
    Persistent,
    Temporary,
}

impl KeySetType {
    pub fn as_str(self) -> &'static str {
        match self {
            KeySetType::Persistent => "persistent",
            KeySetType::Temporary => "temporary",
        }
    }
}

impl FromStr for KeySetType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "persistent" => Ok(KeySetType::Persistent),
            "temporary" => Ok(KeySetType::Temporary),
            other => Err(Error::InvalidKeySetType(format!(
                "{:?}, must be one of 'persistent' or 'temporary'",
                other
            ))),
        }
    }
}

impl fmt::Display for KeySetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered collection of key pairs with an optional persistence type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    pub key_pairs: Vec<KeyPair>,
    pub r#type: Option<KeySetType>,
}

#[derive(Serialize)]
struct JwkSet<'a> {
    keys: Vec<Jwk>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    r#type: Option<&'a str>,
}

#[derive(Serialize)]
struct Jwk {
    kty: &'static str,
    alg: &'static str,
    k: String,
    kid: String,
}

#[derive(Deserialize)]
struct KidRequest {
    kids: Vec<String>,
    #[serde(rename = "type", default)]
    r#type: Option<String>,
}

impl KeySet {
    /// Create a key set with an already validated type.
    pub fn new(key_pairs: Vec<KeyPair>, r#type: Option<KeySetType>) -> Self {
        Self { key_pairs, r#type }
    }

    /// Create a key set from a raw type string.
    ///
    /// Fails with [`Error::InvalidKeySetType`] unless the type is absent,
    /// `persistent` or `temporary`.
    pub fn with_type_str(key_pairs: Vec<KeyPair>, r#type: Option<&str>) -> Result<Self> {
        let r#type = r#type.map(KeySetType::from_str).transpose()?;
        Ok(Self::new(key_pairs, r#type))
    }

    pub fn len(&self) -> usize {
        self.key_pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_pairs.is_empty()
    }

    /// Serialize to the JWK set JSON string.
    pub fn to_jwk_string(&self) -> String {
        let set = JwkSet {
            keys: self
                .key_pairs
                .iter()
                .map(|pair| Jwk {
                    kty: "oct",
                    alg: "A128KW",
                    k: b64url_encode(&pair.key),
                    kid: b64url_encode(&pair.key_id),
                })
                .collect(),
            r#type: self.r#type.map(KeySetType::as_str),
        };
        // Only strings and static fields, serialization cannot fail.
        serde_json::to_string(&set).unwrap_or_default()
    }

    /// Serialize to JWK set JSON bytes, as handed to the decryption module.
    pub fn to_jwk_bytes(&self) -> Vec<u8> {
        self.to_jwk_string().into_bytes()
    }

    /// Decode a kid-only license request message.
    ///
    /// Every resulting pair carries zero-filled key material; the keys must be
    /// supplied by a provider afterwards.
    pub fn decode(message: &[u8]) -> Result<Self> {
        let request: KidRequest = serde_json::from_slice(message)
            .map_err(|e| Error::Parse(format!("Invalid key id request JSON: {}", e)))?;

        let mut key_pairs = Vec::with_capacity(request.kids.len());
        for kid in request.kids.iter() {
            let bytes = b64_decode_lenient(kid)?;
            key_pairs.push(KeyPair::placeholder(to_array(&bytes, "key id")?));
        }

        Self::with_type_str(key_pairs, request.r#type.as_deref())
    }

    /// Encode a kid-only license request message for this key set.
    pub fn to_kid_request(&self) -> Vec<u8> {
        let kids: Vec<String> = self
            .key_pairs
            .iter()
            .map(|pair| b64url_encode(&pair.key_id))
            .collect();
        let mut value = serde_json::json!({ "kids": kids });
        if let Some(t) = self.r#type {
            value["type"] = serde_json::Value::from(t.as_str());
        }
        value.to_string().into_bytes()
    }
}
