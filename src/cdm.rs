//! Content Decryption Module boundary.
//!
//! The decryption engine itself lives outside this crate. The protection model
//! only talks to it through [`ContentDecryptionModule`] and reads its native
//! notifications as [`CdmEvent`] values from a channel.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;

/// Opaque handle to media keys granted by a successful capability query.
#[derive(Clone)]
pub struct MediaKeys {
    /// Key system the handle was negotiated for.
    pub key_system_id: String,
    inner: Arc<dyn std::any::Any + Send + Sync>,
}

impl MediaKeys {
    /// Wrap a module-specific handle.
    pub fn new<T: Send + Sync + 'static>(key_system_id: impl Into<String>, inner: T) -> Self {
        Self {
            key_system_id: key_system_id.into(),
            inner: Arc::new(inner),
        }
    }

    /// Borrow the module-specific handle.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// Whether two handles refer to the same negotiated instance.
    pub fn same_instance(&self, other: &MediaKeys) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for MediaKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaKeys")
            .field("key_system_id", &self.key_system_id)
            .finish_non_exhaustive()
    }
}

/// Native notifications from the decryption module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdmEvent {
    /// Encrypted media was encountered (need-key).
    Encrypted {
        init_data: Vec<u8>,
        init_data_type: String,
    },
    /// A license message was generated for a session.
    Message {
        session_id: String,
        message: Vec<u8>,
        destination_url: Option<String>,
    },
    /// The session failed.
    Error { session_id: String, reason: String },
    /// Key statuses changed after an update.
    KeyStatusesChange { session_id: String },
    /// The session was closed by the module.
    Closed { session_id: String },
}

impl CdmEvent {
    /// Session the event belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            CdmEvent::Encrypted { .. } => None,
            CdmEvent::Message { session_id, .. }
            | CdmEvent::Error { session_id, .. }
            | CdmEvent::KeyStatusesChange { session_id }
            | CdmEvent::Closed { session_id } => Some(session_id),
        }
    }
}

/// Sender half handed to module implementations.
pub type CdmEventSender = mpsc::UnboundedSender<CdmEvent>;
/// Receiver half drained by the protection model.
pub type CdmEventReceiver = mpsc::UnboundedReceiver<CdmEvent>;

/// Create the channel a module uses to report native events.
pub fn event_channel() -> (CdmEventSender, CdmEventReceiver) {
    mpsc::unbounded_channel()
}

/// Capability contract of the external decryption module.
#[async_trait]
pub trait ContentDecryptionModule: Send + Sync {
    /// Ask whether `key_system_id` can play `content_type` with init data of
    /// `init_data_type`, returning media keys on success.
    async fn request_access(
        &self,
        key_system_id: &str,
        content_type: &str,
        init_data_type: &str,
    ) -> Result<MediaKeys>;

    /// Create a session and return its id.
    fn create_session(&self, media_keys: &MediaKeys) -> Result<String>;

    /// Ask the session to generate a license message for `init_data`.
    fn generate_request(&self, session_id: &str, init_data_type: &str, init_data: &[u8])
        -> Result<()>;

    /// Provide license response bytes to a session.
    fn update(&self, session_id: &str, response: &[u8]) -> Result<()>;

    /// Release a session.
    fn close(&self, session_id: &str) -> Result<()>;
}
