//! Protection model: capability negotiation, session collection and native
//! event translation.
//!
//! The model owns every [`SessionToken`] it creates. Callers receive
//! snapshots and refer back to sessions by id. Native module events are read
//! from one channel by [`ProtectionModel::run_event_loop`], so events for a
//! session are handled in emission order.
use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::Mutex;

use crate::cdm::{CdmEvent, CdmEventReceiver, ContentDecryptionModule, MediaKeys};
use crate::error::{Error, Result};
use crate::events::{EventBus, KeyMessage, ProtectionEvent};
use crate::key_system::KeySystem;
use crate::keyset::KeySet;
use crate::session::{SessionState, SessionToken, SessionTransition};

type Negotiation = Shared<BoxFuture<'static, Result<MediaKeys>>>;

/// Cache key of a capability negotiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CapabilityKey {
    key_system_id: String,
    content_type: String,
    init_data_type: String,
}

#[derive(Default)]
struct ModelState {
    key_system: Option<Arc<dyn KeySystem>>,
    media_keys: Option<MediaKeys>,
    sessions: HashMap<String, SessionToken>,
}

/// Mediates between the player and the external decryption module.
pub struct ProtectionModel {
    cdm: Arc<dyn ContentDecryptionModule>,
    bus: EventBus,
    negotiations: Mutex<HashMap<CapabilityKey, Negotiation>>,
    state: Mutex<ModelState>,
}

impl ProtectionModel {
    /// Create a model bound to `cdm`, publishing domain events on `bus`.
    pub fn new(cdm: Arc<dyn ContentDecryptionModule>, bus: EventBus) -> Self {
        Self {
            cdm,
            bus,
            negotiations: Mutex::new(HashMap::new()),
            state: Mutex::new(ModelState::default()),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Negotiate media keys for a capability tuple.
    ///
    /// Concurrent and repeated calls with the same tuple share one underlying
    /// `request_access` call. The outcome, success or failure, stays cached
    /// until [`teardown`](Self::teardown).
    pub async fn negotiate_capability(
        &self,
        key_system_id: &str,
        content_type: &str,
        init_data_type: &str,
    ) -> Result<MediaKeys> {
        let key = CapabilityKey {
            key_system_id: key_system_id.to_string(),
            content_type: content_type.to_string(),
            init_data_type: init_data_type.to_string(),
        };

        let negotiation = {
            let mut cache = self.negotiations.lock().await;
            cache
                .entry(key)
                .or_insert_with_key(|key| {
                    debug!(
                        "Negotiating {} for {} ({})",
                        key.key_system_id, key.content_type, key.init_data_type
                    );
                    let cdm = self.cdm.clone();
                    let key = key.clone();
                    async move {
                        cdm.request_access(
                            &key.key_system_id,
                            &key.content_type,
                            &key.init_data_type,
                        )
                        .await
                    }
                    .boxed()
                    .shared()
                })
                .clone()
        };

        negotiation.await.map_err(|e| match e {
            Error::Capability(_) => e,
            other => Error::Capability(format!(
                "{} is not supported for {}: {}",
                key_system_id, content_type, other
            )),
        })
    }

    /// Whether `key_system` can be negotiated for the given content.
    pub async fn is_supported(
        &self,
        key_system: &dyn KeySystem,
        content_type: &str,
        init_data_type: &str,
    ) -> bool {
        self.negotiate_capability(key_system.system_string(), content_type, init_data_type)
            .await
            .is_ok()
    }

    /// Negotiate and bind `key_system` for subsequent session operations.
    pub async fn select_key_system(
        &self,
        key_system: Arc<dyn KeySystem>,
        content_type: &str,
        init_data_type: &str,
    ) -> Result<()> {
        let media_keys = self
            .negotiate_capability(key_system.system_string(), content_type, init_data_type)
            .await?;

        info!("Selected key system {}", key_system.system_string());
        let mut state = self.state.lock().await;
        state.key_system = Some(key_system);
        state.media_keys = Some(media_keys);
        Ok(())
    }

    /// Media keys bound by the last successful selection.
    pub async fn media_keys(&self) -> Option<MediaKeys> {
        self.state.lock().await.media_keys.clone()
    }

    /// Key system bound by the last successful selection.
    pub async fn key_system(&self) -> Option<Arc<dyn KeySystem>> {
        self.state.lock().await.key_system.clone()
    }

    /// Create a session and ask the module to generate its license message.
    ///
    /// Waits for the negotiation of the session's capability tuple before
    /// touching the module. The session is opened on the media keys bound by
    /// [`select_key_system`](Self::select_key_system). Fails with
    /// [`Error::SessionState`] when no key system has been selected.
    pub async fn create_session(
        &self,
        init_data: &[u8],
        content_type: &str,
        init_data_type: &str,
    ) -> Result<SessionToken> {
        let key_system = self.key_system().await.ok_or_else(|| {
            Error::SessionState(
                "Can not create sessions until you have selected a key system".to_string(),
            )
        })?;

        // Gate on the session's own tuple. A tuple matching the selection is a
        // cache hit.
        self.negotiate_capability(key_system.system_string(), content_type, init_data_type)
            .await?;

        let mut state = self.state.lock().await;
        let media_keys = state.media_keys.clone().ok_or_else(|| {
            Error::SessionState(
                "Key system was released before the session was created".to_string(),
            )
        })?;

        let session_id = self.cdm.create_session(&media_keys)?;
        if state.sessions.contains_key(&session_id) {
            return Err(Error::SessionState(format!(
                "Session id {} is already active",
                session_id
            )));
        }

        let token = SessionToken::new(session_id.clone(), init_data.to_vec());
        state.sessions.insert(session_id.clone(), token.clone());

        if let Err(e) = self
            .cdm
            .generate_request(&session_id, init_data_type, init_data)
        {
            state.sessions.remove(&session_id);
            let _ = self.cdm.close(&session_id);
            return Err(e);
        }

        debug!("Created session {}", session_id);
        Ok(token)
    }

    /// Hand key material for `token` to the module.
    pub async fn update_session(&self, token: &SessionToken, key_set: &KeySet) -> Result<()> {
        let mut state = self.state.lock().await;
        let session = state
            .sessions
            .get_mut(&token.session_id)
            .ok_or_else(|| unknown_session(&token.session_id))?;

        // Validate before touching the module, apply after it accepted.
        session.state.next(SessionTransition::KeysUpdated)?;
        self.cdm.update(&session.session_id, &key_set.to_jwk_bytes())?;
        session.apply(SessionTransition::KeysUpdated)?;

        debug!(
            "Updated session {} with {} keys",
            session.session_id,
            key_set.len()
        );
        Ok(())
    }

    /// Close `token`, release it in the module and forget it.
    ///
    /// The token is removed even if the module fails to release it; that
    /// failure is still returned. Closing an unknown or already closed token
    /// is a [`Error::SessionState`].
    pub async fn close_session(&self, token: &SessionToken) -> Result<()> {
        let mut closed = {
            let mut state = self.state.lock().await;
            state
                .sessions
                .remove(&token.session_id)
                .ok_or_else(|| unknown_session(&token.session_id))?
        };
        closed.apply(SessionTransition::Close)?;

        let released = self.cdm.close(&closed.session_id);
        if let Err(ref e) = released {
            warn!("Failed to release session {}: {}", closed.session_id, e);
        }

        debug!("Closed session {}", closed.session_id);
        self.bus
            .publish(ProtectionEvent::KeySessionClosed { session: closed });
        released
    }

    /// Snapshot of a live session.
    pub async fn session(&self, session_id: &str) -> Option<SessionToken> {
        self.state.lock().await.sessions.get(session_id).cloned()
    }

    /// Snapshot of all live sessions.
    pub async fn sessions(&self) -> Vec<SessionToken> {
        self.state.lock().await.sessions.values().cloned().collect()
    }

    /// Close every session, drop cached negotiations and unbind the module.
    pub async fn teardown(&self) {
        for token in self.sessions().await {
            if let Err(e) = self.close_session(&token).await {
                warn!("Teardown of session {} failed: {}", token.session_id, e);
            }
        }

        self.negotiations.lock().await.clear();
        let mut state = self.state.lock().await;
        state.key_system = None;
        state.media_keys = None;
    }

    /// Drain native module events until the sender side is dropped.
    pub async fn run_event_loop(&self, mut events: CdmEventReceiver) {
        while let Some(event) = events.recv().await {
            self.handle_cdm_event(event).await;
        }
        trace!("CDM event channel closed");
    }

    /// Translate one native event into domain events.
    pub async fn handle_cdm_event(&self, event: CdmEvent) {
        match event {
            CdmEvent::Encrypted {
                init_data,
                init_data_type,
            } => {
                self.bus.publish(ProtectionEvent::NeedKey {
                    init_data,
                    init_data_type,
                });
            }
            CdmEvent::Message {
                session_id,
                message,
                destination_url,
            } => {
                let Some((previous, session)) = self
                    .transition(&session_id, SessionTransition::LicenseMessage)
                    .await
                else {
                    return;
                };
                self.bus.publish(KeyMessage {
                    session,
                    message,
                    url: destination_url,
                    is_initial_request: previous == SessionState::Created,
                });
            }
            CdmEvent::Error { session_id, reason } => {
                warn!("Session {} reported error: {}", session_id, reason);
                let session = match self
                    .transition(&session_id, SessionTransition::ModuleError)
                    .await
                {
                    Some((_, session)) => session,
                    // Already in error: still surface the new reason.
                    None => match self.session(&session_id).await {
                        Some(session) => session,
                        None => return,
                    },
                };
                self.bus
                    .publish(ProtectionEvent::KeyError { session, reason });
            }
            CdmEvent::KeyStatusesChange { session_id } => {
                let session = match self
                    .transition(&session_id, SessionTransition::KeysUpdated)
                    .await
                {
                    Some((_, session)) => session,
                    None => return,
                };
                self.bus.publish(ProtectionEvent::KeyAdded { session });
            }
            CdmEvent::Closed { session_id } => {
                // Module-side close: reported, but only an explicit close
                // removes the token.
                if let Some(session) = self.session(&session_id).await {
                    self.bus
                        .publish(ProtectionEvent::KeySessionClosed { session });
                }
            }
        }
    }

    /// Apply a transition to a live session, returning its previous state and
    /// the updated snapshot. Unknown sessions and rejected transitions are
    /// logged and yield `None`.
    async fn transition(
        &self,
        session_id: &str,
        transition: SessionTransition,
    ) -> Option<(SessionState, SessionToken)> {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(session_id) else {
            debug!("Dropping {:?} for unknown session {}", transition, session_id);
            return None;
        };
        match session.apply(transition) {
            Ok(previous) => Some((previous, session.clone())),
            Err(e) => {
                debug!("{}", e);
                None
            }
        }
    }
}

impl std::fmt::Debug for ProtectionModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionModel")
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

fn unknown_session(session_id: &str) -> Error {
    Error::SessionState(format!("Session {} is unknown or already closed", session_id))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::cdm::mock::MockCdm;
    use crate::cdm::event_channel;
    use crate::events::EventKind;
    use crate::key::KeyPair;

    const CT: &str = "video/mp4; codecs=\"avc1.4d401e\"";

    #[derive(Debug)]
    struct NamedSystem(&'static str);

    #[async_trait::async_trait]
    impl KeySystem for NamedSystem {
        fn system_string(&self) -> &str {
            self.0
        }

        fn uuid(&self) -> uuid::Uuid {
            uuid::Uuid::nil()
        }

        fn scheme_id_uri(&self) -> &str {
            "urn:test"
        }

        async fn do_license_request(
            &self,
            _message: &[u8],
            _url: Option<&str>,
            request_data: &str,
            _is_initial_request: bool,
        ) -> crate::events::LicenseRequestComplete {
            crate::events::LicenseRequestComplete::success(KeySet::default(), request_data)
        }

        fn get_init_data(&self) -> Option<Vec<u8>> {
            None
        }
    }

    fn model(cdm: MockCdm) -> (Arc<MockCdm>, ProtectionModel) {
        let cdm = Arc::new(cdm);
        (cdm.clone(), ProtectionModel::new(cdm, EventBus::new()))
    }

    async fn selected(cdm: MockCdm) -> (Arc<MockCdm>, ProtectionModel) {
        let (cdm, model) = model(cdm);
        model
            .select_key_system(Arc::new(NamedSystem("org.w3.clearkey")), CT, "cenc")
            .await
            .unwrap();
        (cdm, model)
    }

    #[tokio::test]
    async fn concurrent_negotiations_share_one_attempt() {
        let (cdm, model) = model(MockCdm::supporting(&["org.w3.clearkey"]));

        let (a, b) = tokio::join!(
            model.negotiate_capability("org.w3.clearkey", CT, "cenc"),
            model.negotiate_capability("org.w3.clearkey", CT, "cenc"),
        );

        assert!(a.unwrap().same_instance(&b.unwrap()));
        assert_eq!(cdm.access_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_negotiation_is_cached() {
        let (cdm, model) = model(MockCdm::supporting(&[]));

        for _ in 0..2 {
            let err = model
                .negotiate_capability("com.example.drm", CT, "cenc")
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Capability(_)));
        }
        assert_eq!(cdm.access_calls.load(Ordering::SeqCst), 1);
        assert!(!model.is_supported(&NamedSystem("com.example.drm"), CT, "cenc").await);
    }

    #[tokio::test]
    async fn different_tuples_negotiate_separately() {
        let (cdm, model) = model(MockCdm::supporting(&["org.w3.clearkey"]));
        model.negotiate_capability("org.w3.clearkey", CT, "cenc").await.unwrap();
        model.negotiate_capability("org.w3.clearkey", CT, "keyids").await.unwrap();
        assert_eq!(cdm.access_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn select_then_create_negotiates_once() {
        let (cdm, model) = selected(MockCdm::supporting(&["org.w3.clearkey"])).await;
        model.create_session(&[1], CT, "cenc").await.unwrap();

        assert_eq!(cdm.access_calls.load(Ordering::SeqCst), 1);
        let bound = model.media_keys().await.unwrap();
        assert!(cdm.created_on.lock().unwrap()[0].same_instance(&bound));
    }

    #[tokio::test]
    async fn session_for_other_tuple_opens_on_bound_keys() {
        let (cdm, model) = selected(MockCdm::supporting(&["org.w3.clearkey"])).await;
        model.create_session(&[1], "audio/mp4", "keyids").await.unwrap();

        // The other tuple is still negotiated before the session is opened.
        assert_eq!(cdm.access_calls.load(Ordering::SeqCst), 2);
        let bound = model.media_keys().await.unwrap();
        assert!(cdm.created_on.lock().unwrap()[0].same_instance(&bound));
    }

    #[tokio::test]
    async fn create_before_select_fails() {
        let (_, model) = model(MockCdm::supporting(&["org.w3.clearkey"]));
        let err = model.create_session(&[1, 2, 3], CT, "cenc").await.unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));
        assert!(model.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn failed_generate_leaves_no_session() {
        let (cdm, model) = selected(MockCdm {
            fail_generate: true,
            ..MockCdm::supporting(&["org.w3.clearkey"])
        })
        .await;

        assert!(model.create_session(&[1], CT, "cenc").await.is_err());
        assert!(model.sessions().await.is_empty());
        assert_eq!(*cdm.closed.lock().unwrap(), vec!["session-0".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_session_id_is_rejected() {
        let (_, model) = selected(MockCdm {
            fixed_session_id: Some("dup".to_string()),
            ..MockCdm::supporting(&["org.w3.clearkey"])
        })
        .await;

        model.create_session(&[1], CT, "cenc").await.unwrap();
        let err = model.create_session(&[2], CT, "cenc").await.unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));
        assert_eq!(model.sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn close_twice_fails_second_time() {
        let (cdm, model) = selected(MockCdm::supporting(&["org.w3.clearkey"])).await;
        let closed = Arc::new(StdMutex::new(Vec::new()));
        let c = closed.clone();
        model.bus().subscribe(EventKind::KeySessionClosed, move |event| {
            if let ProtectionEvent::KeySessionClosed { session } = event {
                c.lock().unwrap().push(session.state);
            }
        });

        let token = model.create_session(&[1], CT, "cenc").await.unwrap();
        let other = model.create_session(&[2], CT, "cenc").await.unwrap();
        model.close_session(&token).await.unwrap();
        let err = model.close_session(&token).await.unwrap_err();
        assert_eq!(model.session(&other.session_id).await, Some(other));

        assert!(matches!(err, Error::SessionState(_)));
        assert_eq!(*closed.lock().unwrap(), vec![SessionState::Closed]);
        assert_eq!(cdm.closed.lock().unwrap().len(), 1);
        assert!(model.session(&token.session_id).await.is_none());
    }

    #[tokio::test]
    async fn update_after_close_is_rejected() {
        let (cdm, model) = selected(MockCdm::supporting(&["org.w3.clearkey"])).await;
        let token = model.create_session(&[1], CT, "cenc").await.unwrap();
        model.close_session(&token).await.unwrap();

        let keys = KeySet::new(vec![KeyPair::new([1; 16], [2; 16])], None);
        let err = model.update_session(&token, &keys).await.unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));
        assert!(cdm.updates.lock().unwrap().is_empty());
        assert!(model.sessions().await.is_empty());
    }

    #[tokio::test]
    async fn native_events_drive_session_state() {
        let (tx, rx) = event_channel();
        let (_, model) = selected(MockCdm {
            events: Some(tx.clone()),
            ..MockCdm::supporting(&["org.w3.clearkey"])
        })
        .await;
        let messages = Arc::new(StdMutex::new(Vec::new()));
        let m = messages.clone();
        model.bus().subscribe(EventKind::KeyMessage, move |event| {
            if let ProtectionEvent::KeyMessage(msg) = event {
                m.lock().unwrap().push((msg.session.state, msg.is_initial_request));
            }
        });

        let token = model.create_session(&[9, 9], CT, "cenc").await.unwrap();
        tx.send(CdmEvent::Message {
            session_id: token.session_id.clone(),
            message: b"{\"kids\":[]}".to_vec(),
            destination_url: None,
        })
        .unwrap();
        tx.send(CdmEvent::Error {
            session_id: token.session_id.clone(),
            reason: "boom".to_string(),
        })
        .unwrap();
        tx.send(CdmEvent::Message {
            session_id: "unknown".to_string(),
            message: Vec::new(),
            destination_url: None,
        })
        .unwrap();
        // The mock holds a sender, so drain what is queued instead of
        // waiting for the channel to close.
        let mut rx = rx;
        while let Ok(event) = rx.try_recv() {
            model.handle_cdm_event(event).await;
        }

        assert_eq!(
            *messages.lock().unwrap(),
            vec![(SessionState::Pending, true), (SessionState::Pending, false)]
        );
        let session = model.session(&token.session_id).await.unwrap();
        assert_eq!(session.state, SessionState::Error);
    }

    #[tokio::test]
    async fn encrypted_event_becomes_need_key() {
        let (_, model) = model(MockCdm::supporting(&["org.w3.clearkey"]));
        let needed = Arc::new(StdMutex::new(Vec::new()));
        let n = needed.clone();
        model.bus().subscribe(EventKind::NeedKey, move |event| {
            if let ProtectionEvent::NeedKey {
                init_data,
                init_data_type,
            } = event
            {
                n.lock()
                    .unwrap()
                    .push((init_data.clone(), init_data_type.clone()));
            }
        });

        model
            .handle_cdm_event(CdmEvent::Encrypted {
                init_data: vec![4, 5, 6],
                init_data_type: "cenc".to_string(),
            })
            .await;

        assert_eq!(
            *needed.lock().unwrap(),
            vec![(vec![4, 5, 6], "cenc".to_string())]
        );
    }

    #[tokio::test]
    async fn module_close_is_reported_and_token_kept() {
        let (cdm, model) = selected(MockCdm::supporting(&["org.w3.clearkey"])).await;
        let closed = Arc::new(StdMutex::new(Vec::new()));
        let c = closed.clone();
        model.bus().subscribe(EventKind::KeySessionClosed, move |event| {
            if let ProtectionEvent::KeySessionClosed { session } = event {
                c.lock().unwrap().push(session.clone());
            }
        });

        let token = model.create_session(&[1], CT, "cenc").await.unwrap();
        model
            .handle_cdm_event(CdmEvent::Closed {
                session_id: token.session_id.clone(),
            })
            .await;

        assert_eq!(*closed.lock().unwrap(), vec![token.clone()]);
        assert_eq!(model.session(&token.session_id).await, Some(token.clone()));
        assert!(cdm.closed.lock().unwrap().is_empty());

        // An explicit close still works afterwards.
        model.close_session(&token).await.unwrap();
        assert!(model.session(&token.session_id).await.is_none());
    }

    #[tokio::test]
    async fn teardown_closes_sessions_and_clears_cache() {
        let (cdm, model) = selected(MockCdm::supporting(&["org.w3.clearkey"])).await;
        model.create_session(&[1], CT, "cenc").await.unwrap();
        model.create_session(&[2], CT, "cenc").await.unwrap();

        model.teardown().await;

        assert!(model.sessions().await.is_empty());
        assert!(model.key_system().await.is_none());
        assert_eq!(cdm.closed.lock().unwrap().len(), 2);
        model.negotiate_capability("org.w3.clearkey", CT, "cenc").await.unwrap();
        assert_eq!(cdm.access_calls.load(Ordering::SeqCst), 2);
    }
}
