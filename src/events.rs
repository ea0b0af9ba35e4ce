//! Domain events and the protection event bus.
//!
//! Subscribers register a callback for one [`EventKind`] and receive events of
//! that kind in subscription order. Publishing is a sync call and never holds
//! the registry lock while callbacks run, so a callback may subscribe,
//! unsubscribe or publish again.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::Error;
use crate::keyset::KeySet;
use crate::session::SessionToken;

/// Events surfaced to the embedding player.
#[derive(Debug, Clone)]
pub enum ProtectionEvent {
    /// Encrypted media needs a key.
    NeedKey {
        init_data: Vec<u8>,
        init_data_type: String,
    },
    /// The decryption module produced a license message for a session.
    KeyMessage(KeyMessage),
    /// The decryption module reported an error for a session.
    KeyError {
        session: SessionToken,
        reason: String,
    },
    /// Keys were applied to a session.
    KeyAdded { session: SessionToken },
    /// A session was closed.
    KeySessionClosed { session: SessionToken },
    /// A license exchange finished.
    LicenseRequestComplete(LicenseRequestComplete),
}

/// License message emitted by the decryption module.
#[derive(Debug, Clone)]
pub struct KeyMessage {
    pub session: SessionToken,
    pub message: Vec<u8>,
    pub url: Option<String>,
    /// True for the first message of a session, which carries the
    /// content protection header rather than a kid-only request.
    pub is_initial_request: bool,
}

/// Result of a license exchange, correlated to the session that asked.
#[derive(Debug, Clone)]
pub struct LicenseRequestComplete {
    pub result: Result<KeySet, Error>,
    /// Session id of the originating request.
    pub correlation: String,
    /// Key IDs that could not be resolved. Their pairs keep placeholder keys.
    pub unresolved: Vec<Error>,
}

impl LicenseRequestComplete {
    pub fn success(key_set: KeySet, correlation: impl Into<String>) -> Self {
        Self {
            result: Ok(key_set),
            correlation: correlation.into(),
            unresolved: Vec::new(),
        }
    }

    pub fn failure(error: Error, correlation: impl Into<String>) -> Self {
        Self {
            result: Err(error),
            correlation: correlation.into(),
            unresolved: Vec::new(),
        }
    }
}

/// Discriminant used to route events to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NeedKey,
    KeyMessage,
    KeyError,
    KeyAdded,
    KeySessionClosed,
    LicenseRequestComplete,
}

impl ProtectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ProtectionEvent::NeedKey { .. } => EventKind::NeedKey,
            ProtectionEvent::KeyMessage(_) => EventKind::KeyMessage,
            ProtectionEvent::KeyError { .. } => EventKind::KeyError,
            ProtectionEvent::KeyAdded { .. } => EventKind::KeyAdded,
            ProtectionEvent::KeySessionClosed { .. } => EventKind::KeySessionClosed,
            ProtectionEvent::LicenseRequestComplete(_) => EventKind::LicenseRequestComplete,
        }
    }
}

impl From<KeyMessage> for ProtectionEvent {
    fn from(e: KeyMessage) -> Self {
        Self::KeyMessage(e)
    }
}

impl From<LicenseRequestComplete> for ProtectionEvent {
    fn from(e: LicenseRequestComplete) -> Self {
        Self::LicenseRequestComplete(e)
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&ProtectionEvent) + Send + Sync>;

/// Event kind to ordered subscriber list.
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<HashMap<EventKind, Vec<(SubscriptionId, Callback)>>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&ProtectionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registry()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) -> bool {
        let mut registry = self.registry();
        let Some(list) = registry.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub, _)| *sub != id);
        before != list.len()
    }

    /// Deliver an event to every subscriber of its kind.
    pub fn publish<E: Into<ProtectionEvent>>(&self, event: E) {
        let event = event.into();
        let callbacks: Vec<Callback> = self
            .registry()
            .get(&event.kind())
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();

        if callbacks.is_empty() {
            trace!("No subscribers for {:?}", event.kind());
        }
        for callback in callbacks {
            callback(&event);
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry().get(&kind).map_or(0, Vec::len)
    }

    fn registry(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<EventKind, Vec<(SubscriptionId, Callback)>>> {
        // A panicking subscriber cannot leave the map half-updated.
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        let counts: HashMap<_, _> = registry.iter().map(|(k, v)| (*k, v.len())).collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}
