//! rseme - Encrypted media protection layer with a ClearKey key system.
//!
//! This crate provides:
//! - ClearKey content protection header parsing and generation.
//! - JWK key set encoding and kid-only license request decoding.
//! - A protection model that negotiates capabilities with an external
//!   decryption module, tracks key sessions and translates native events.
//! - A protection controller that routes license messages to the selected
//!   key system and delivers the resulting keys.
//!
//! Feature flags:
//! - `http`: enable the reqwest license fetcher for remote ClearKey headers.
//! - `cli`: enable the CLI binary helpers.
//! - `tracing`: enable tracing macros and subscriber.
#![allow(clippy::result_large_err)]

#[macro_use]
mod macros;

/// Decryption module boundary and native events.
pub mod cdm;
/// ClearKey key system.
pub mod clearkey;
/// YAML configuration.
pub mod config;
/// Protection controller.
pub mod controller;
/// Common error types and Result alias.
pub mod error;
/// Domain events and the event bus.
pub mod events;
/// Key ID / key pairs.
pub mod key;
/// Key system and key provider contracts.
pub mod key_system;
/// Key sets and their JSON forms.
pub mod keyset;
/// Protection model.
pub mod model;
/// ClearKey header and PSSH box handling.
pub mod pssh;
/// Session tokens and state machine.
pub mod session;
/// Shared helper utilities.
pub mod utils;

/// HTTP license fetcher (feature: `http`).
#[cfg(feature = "http")]
pub mod fetch;

pub use cdm::{ContentDecryptionModule, MediaKeys};
pub use clearkey::ClearKey;
pub use config::ProtectionConfig;
pub use controller::{FirstSupportedSelector, KeySystemSelector, MediaInfo, ProtectionController};
pub use error::{Error, Result};
pub use events::{EventBus, EventKind, ProtectionEvent};
pub use key::KeyPair;
pub use key_system::{KeyProvider, KeySystem, LicenseFetcher, StaticKeyProvider};
pub use keyset::{KeySet, KeySetType};
pub use model::ProtectionModel;
pub use pssh::ClearKeyHeader;
pub use session::{SessionState, SessionToken};
