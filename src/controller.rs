//! Protection controller: the façade the player talks to.
//!
//! The controller picks a key system through a [`KeySystemSelector`], creates
//! sessions through the [`ProtectionModel`] and routes license messages from
//! the model to the selected key system and the resulting keys back.
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::events::{
    EventKind, KeyMessage, LicenseRequestComplete, ProtectionEvent, SubscriptionId,
};
use crate::key_system::KeySystem;
use crate::keyset::KeySet;
use crate::model::ProtectionModel;
use crate::session::SessionToken;

/// Media hints used to choose a key system.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaInfo {
    /// MIME type with codecs, e.g. `video/mp4; codecs="avc1.4d401e"`.
    pub content_type: String,
    /// Init data type, e.g. `cenc`.
    pub init_data_type: String,
    /// Content protection scheme URIs advertised by the manifest.
    pub scheme_id_uris: Vec<String>,
}

/// Chooses the key system for a piece of media.
#[async_trait]
pub trait KeySystemSelector: Send + Sync {
    async fn select(
        &self,
        model: &ProtectionModel,
        media_info: &MediaInfo,
        init_data: &[u8],
    ) -> Result<Arc<dyn KeySystem>>;
}

/// Picks the first candidate that the manifest advertises and the decryption
/// module accepts.
#[derive(Debug, Clone, Default)]
pub struct FirstSupportedSelector {
    candidates: Vec<Arc<dyn KeySystem>>,
}

impl FirstSupportedSelector {
    pub fn new(candidates: Vec<Arc<dyn KeySystem>>) -> Self {
        Self { candidates }
    }

    fn advertised(key_system: &dyn KeySystem, media_info: &MediaInfo) -> bool {
        if media_info.scheme_id_uris.is_empty() {
            return true;
        }
        let urn = format!("urn:uuid:{}", key_system.uuid());
        media_info.scheme_id_uris.iter().any(|uri| {
            uri.eq_ignore_ascii_case(key_system.scheme_id_uri()) || uri.eq_ignore_ascii_case(&urn)
        })
    }
}

#[async_trait]
impl KeySystemSelector for FirstSupportedSelector {
    async fn select(
        &self,
        model: &ProtectionModel,
        media_info: &MediaInfo,
        _init_data: &[u8],
    ) -> Result<Arc<dyn KeySystem>> {
        for candidate in self.candidates.iter() {
            if !Self::advertised(candidate.as_ref(), media_info) {
                continue;
            }
            if model
                .is_supported(
                    candidate.as_ref(),
                    &media_info.content_type,
                    &media_info.init_data_type,
                )
                .await
            {
                return Ok(candidate.clone());
            }
            debug!("Key system {} not supported", candidate.system_string());
        }
        Err(Error::Capability(format!(
            "No supported key system for {}",
            media_info.content_type
        )))
    }
}

type LicenseJob = (KeyMessage, oneshot::Sender<LicenseRequestComplete>);

/// Top-level orchestrator of content protection.
///
/// License messages for one session are handled one at a time, in arrival
/// order, by a worker task owned by that session's lane. Different sessions
/// proceed independently.
pub struct ProtectionController {
    model: Arc<ProtectionModel>,
    selector: Arc<dyn KeySystemSelector>,
    key_system: Mutex<Option<Arc<dyn KeySystem>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<LicenseJob>>>,
}

impl ProtectionController {
    pub fn new(model: Arc<ProtectionModel>, selector: Arc<dyn KeySystemSelector>) -> Arc<Self> {
        Arc::new(Self {
            model,
            selector,
            key_system: Mutex::new(None),
            subscription: Mutex::new(None),
            lanes: Mutex::new(HashMap::new()),
        })
    }

    pub fn model(&self) -> &Arc<ProtectionModel> {
        &self.model
    }

    /// Subscribe to license messages from the model.
    ///
    /// Must be called from within a tokio runtime; messages are handled on
    /// per-session worker tasks.
    pub fn init(self: &Arc<Self>) {
        let mut subscription = lock(&self.subscription);
        if subscription.is_some() {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let id = self
            .model
            .bus()
            .subscribe(EventKind::KeyMessage, move |event| {
                let (Some(controller), ProtectionEvent::KeyMessage(message)) =
                    (weak.upgrade(), event)
                else {
                    return;
                };
                controller.on_license_message(Ok(message.clone()));
            });
        *subscription = Some(id);
    }

    /// Stop listening for license messages and release every session lane.
    ///
    /// Messages already queued on a lane are still processed.
    pub fn teardown(&self) {
        if let Some(id) = lock(&self.subscription).take() {
            self.model.bus().unsubscribe(EventKind::KeyMessage, id);
        }
        lock(&self.lanes).clear();
    }

    /// Currently selected key system.
    pub fn key_system(&self) -> Option<Arc<dyn KeySystem>> {
        lock(&self.key_system).clone()
    }

    /// Choose a key system for `media_info` and bind it in the model.
    pub async fn select_key_system(
        &self,
        media_info: &MediaInfo,
        init_data: &[u8],
    ) -> Result<Arc<dyn KeySystem>> {
        let key_system = self
            .selector
            .select(&self.model, media_info, init_data)
            .await?;
        self.model
            .select_key_system(
                key_system.clone(),
                &media_info.content_type,
                &media_info.init_data_type,
            )
            .await?;
        *lock(&self.key_system) = Some(key_system.clone());
        Ok(key_system)
    }

    /// Create a key session with the selected key system.
    pub async fn create_key_session(
        &self,
        init_data: &[u8],
        content_type: &str,
        init_data_type: &str,
    ) -> Result<SessionToken> {
        if self.key_system().is_none() {
            return Err(Error::SessionState(
                "No key system has been selected".to_string(),
            ));
        }
        self.model
            .create_session(init_data, content_type, init_data_type)
            .await
    }

    /// React to a need-key signal: select a key system if none is selected
    /// yet, then open a session for `init_data`.
    pub async fn handle_need_key(
        &self,
        media_info: &MediaInfo,
        init_data: &[u8],
    ) -> Result<SessionToken> {
        if self.key_system().is_none() {
            self.select_key_system(media_info, init_data).await?;
        }
        self.create_key_session(init_data, &media_info.content_type, &media_info.init_data_type)
            .await
    }

    /// Dispatch an incoming license message notification.
    ///
    /// An error payload is logged and goes no further. Otherwise the message
    /// is queued on its session's lane without blocking the caller; the
    /// returned receiver yields the completion once the exchange has run.
    pub fn on_license_message(
        self: &Arc<Self>,
        event: Result<KeyMessage>,
    ) -> Option<oneshot::Receiver<LicenseRequestComplete>> {
        let message = match event {
            Ok(message) => message,
            Err(e) => {
                error!("License message error: {}", e);
                return None;
            }
        };

        let (reply, done) = oneshot::channel();
        let session_id = message.session.session_id.clone();
        if self.lane(&session_id).send((message, reply)).is_err() {
            warn!("License lane for session {} is gone", session_id);
            return None;
        }
        Some(done)
    }

    /// Sender of the session's lane, spawning its worker on first use.
    fn lane(self: &Arc<Self>, session_id: &str) -> mpsc::UnboundedSender<LicenseJob> {
        let mut lanes = lock(&self.lanes);
        if let Some(lane) = lanes.get(session_id).filter(|lane| !lane.is_closed()) {
            return lane.clone();
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<LicenseJob>();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some((message, reply)) = rx.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                let done = controller.process_license_message(message).await;
                let _ = reply.send(done);
            }
        });
        trace!("Opened license lane for session {}", session_id);
        lanes.insert(session_id.to_string(), tx.clone());
        tx
    }

    /// Run one license exchange to completion.
    ///
    /// Publishes the `LicenseRequestComplete` event and, on success, updates
    /// the session. A result arriving after its session was closed is
    /// discarded.
    pub async fn process_license_message(&self, message: KeyMessage) -> LicenseRequestComplete {
        let session_id = message.session.session_id.clone();
        let Some(key_system) = self.key_system() else {
            let done = LicenseRequestComplete::failure(
                Error::SessionState("No key system has been selected".to_string()),
                session_id,
            );
            self.model.bus().publish(done.clone());
            return done;
        };

        let done = key_system
            .do_license_request(
                &message.message,
                message.url.as_deref(),
                &session_id,
                message.is_initial_request,
            )
            .await;
        self.model.bus().publish(done.clone());

        if let Ok(ref key_set) = done.result {
            if self.model.session(&session_id).await.is_none() {
                info!("Discarding license for closed session {}", session_id);
            } else if let Err(e) = self.model.update_session(&message.session, key_set).await {
                warn!("Failed to update session {}: {}", session_id, e);
            }
        }
        done
    }

    /// Hand key material for `token` to the model.
    pub async fn update_key_session(&self, token: &SessionToken, key_set: &KeySet) -> Result<()> {
        self.model.update_session(token, key_set).await
    }

    /// Close a session through the model and release its license lane.
    pub async fn close_key_session(&self, token: &SessionToken) -> Result<()> {
        lock(&self.lanes).remove(&token.session_id);
        self.model.close_session(token).await
    }
}

impl std::fmt::Debug for ProtectionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtectionController")
            .field("key_system", &self.key_system())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::sync::{mpsc, Notify};

    use super::*;
    use crate::cdm::event_channel;
    use crate::cdm::mock::MockCdm;
    use crate::clearkey::{ClearKey, CLEARKEY_SYSTEM_STRING};
    use crate::events::EventBus;
    use crate::key::KeyPair;
    use crate::key_system::{LicenseFetcher, StaticKeyProvider};
    use crate::pssh::ClearKeyHeader;

    const CT: &str = "video/mp4";

    struct NoFetcher;

    /// Serves one key after a delay.
    struct SlowFetcher;

    #[async_trait]
    impl LicenseFetcher for SlowFetcher {
        async fn get_json(&self, _url: &str) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(serde_json::json!({
                "keys": [{
                    "kid": crate::utils::b64url_encode(&[0xaa; 16]),
                    "k": crate::utils::b64url_encode(&[0xab; 16]),
                }]
            }))
        }
    }

    #[async_trait]
    impl LicenseFetcher for NoFetcher {
        async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
            Err(Error::network(format!("unexpected fetch of {}", url)))
        }
    }

    /// Key system that blocks each license request until released.
    #[derive(Debug, Default)]
    struct GatedSystem {
        calls: AtomicUsize,
        gate: Notify,
    }

    #[async_trait]
    impl KeySystem for GatedSystem {
        fn system_string(&self) -> &str {
            CLEARKEY_SYSTEM_STRING
        }

        fn uuid(&self) -> uuid::Uuid {
            crate::clearkey::CLEARKEY_UUID
        }

        fn scheme_id_uri(&self) -> &str {
            crate::clearkey::CLEARKEY_SCHEME_ID_URI
        }

        async fn do_license_request(
            &self,
            _message: &[u8],
            _url: Option<&str>,
            request_data: &str,
            _is_initial_request: bool,
        ) -> LicenseRequestComplete {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            let keys = KeySet::new(vec![KeyPair::new([1; 16], [2; 16])], None);
            LicenseRequestComplete::success(keys, request_data)
        }

        fn get_init_data(&self) -> Option<Vec<u8>> {
            None
        }
    }

    fn clearkey() -> Arc<dyn KeySystem> {
        Arc::new(ClearKey::new(Arc::new(NoFetcher), Arc::new(StaticKeyProvider::new())))
    }

    fn media_info() -> MediaInfo {
        MediaInfo {
            content_type: CT.to_string(),
            init_data_type: "cenc".to_string(),
            scheme_id_uris: Vec::new(),
        }
    }

    fn controller(
        cdm: MockCdm,
        candidates: Vec<Arc<dyn KeySystem>>,
    ) -> (Arc<MockCdm>, Arc<ProtectionController>) {
        let cdm = Arc::new(cdm);
        let model = Arc::new(ProtectionModel::new(cdm.clone(), EventBus::new()));
        let selector = Arc::new(FirstSupportedSelector::new(candidates));
        (cdm, ProtectionController::new(model, selector))
    }

    fn inline_header() -> Vec<u8> {
        ClearKeyHeader::Inline {
            key_pairs: vec![KeyPair::new([0x0a; 16], [0xa0; 16])],
        }
        .to_bytes()
        .unwrap()
    }

    #[tokio::test]
    async fn selects_first_supported_candidate() {
        #[derive(Debug)]
        struct Other;

        #[async_trait]
        impl KeySystem for Other {
            fn system_string(&self) -> &str {
                "com.example.drm"
            }
            fn uuid(&self) -> uuid::Uuid {
                uuid::Uuid::nil()
            }
            fn scheme_id_uri(&self) -> &str {
                "urn:example"
            }
            async fn do_license_request(
                &self,
                _: &[u8],
                _: Option<&str>,
                request_data: &str,
                _: bool,
            ) -> LicenseRequestComplete {
                LicenseRequestComplete::failure(Error::network("unused"), request_data)
            }
            fn get_init_data(&self) -> Option<Vec<u8>> {
                None
            }
        }

        let (cdm, controller) = controller(
            MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING]),
            vec![Arc::new(Other) as Arc<dyn KeySystem>, clearkey()],
        );

        let selected = controller.select_key_system(&media_info(), &[]).await.unwrap();
        assert_eq!(selected.system_string(), CLEARKEY_SYSTEM_STRING);
        assert_eq!(cdm.access_calls.load(Ordering::SeqCst), 2);
        assert!(controller.model().key_system().await.is_some());
    }

    #[tokio::test]
    async fn concurrent_selection_negotiates_once() {
        let (cdm, controller) =
            controller(MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING]), vec![clearkey()]);
        let info = media_info();

        let (a, b) = tokio::join!(
            controller.select_key_system(&info, &[]),
            controller.select_key_system(&info, &[]),
        );
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(cdm.access_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manifest_scheme_filters_candidates() {
        let (cdm, controller) =
            controller(MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING]), vec![clearkey()]);
        let info = MediaInfo {
            scheme_id_uris: vec!["urn:uuid:edef8ba9-79d6-4ace-a3c8-27dcd51d21ed".to_string()],
            ..media_info()
        };

        let err = controller.select_key_system(&info, &[]).await.unwrap_err();
        assert!(matches!(err, Error::Capability(_)));
        assert_eq!(cdm.access_calls.load(Ordering::SeqCst), 0);

        let info = MediaInfo {
            scheme_id_uris: vec!["urn:uuid:10000000-0000-0000-0000-000000000000".to_string()],
            ..media_info()
        };
        assert!(controller.select_key_system(&info, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn create_before_select_fails() {
        let (_, controller) =
            controller(MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING]), vec![clearkey()]);
        let err = controller
            .create_key_session(&inline_header(), CT, "cenc")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionState(_)));
        assert!(controller.model().sessions().await.is_empty());
    }

    #[tokio::test]
    async fn error_notification_does_not_reach_key_system() {
        let gated = Arc::new(GatedSystem::default());
        let (_, controller) = controller(
            MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING]),
            vec![gated.clone() as Arc<dyn KeySystem>],
        );

        let handle = controller.on_license_message(Err(Error::network("dropped")));
        assert!(handle.is_none());
        assert_eq!(gated.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn late_license_for_closed_session_is_discarded() {
        let gated = Arc::new(GatedSystem::default());
        let (cdm, controller) = controller(
            MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING]),
            vec![gated.clone() as Arc<dyn KeySystem>],
        );
        controller.select_key_system(&media_info(), &[]).await.unwrap();
        let token = controller
            .create_key_session(&[1, 2, 3], CT, "cenc")
            .await
            .unwrap();

        let handle = controller
            .on_license_message(Ok(KeyMessage {
                session: token.clone(),
                message: vec![1, 2, 3],
                url: None,
                is_initial_request: true,
            }))
            .unwrap();
        while gated.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        controller.close_key_session(&token).await.unwrap();
        gated.gate.notify_one();
        let done = handle.await.unwrap();

        assert!(done.result.is_ok());
        assert!(cdm.updates.lock().unwrap().is_empty());
        assert!(controller.model().sessions().await.is_empty());
    }

    #[tokio::test]
    async fn renewal_waits_for_slow_initial_license() {
        let mut provider = StaticKeyProvider::new();
        provider.insert([0x0c; 16], [0xcc; 16]);
        let clearkey: Arc<dyn KeySystem> =
            Arc::new(ClearKey::new(Arc::new(SlowFetcher), Arc::new(provider)));
        let (cdm, controller) =
            controller(MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING]), vec![clearkey]);
        controller.select_key_system(&media_info(), &[]).await.unwrap();
        let token = controller.create_key_session(&[1], CT, "cenc").await.unwrap();

        let remote = ClearKeyHeader::Remote {
            url: "http://license.test/keys".to_string(),
        }
        .to_bytes()
        .unwrap();
        let renewal = KeySet::new(vec![KeyPair::placeholder([0x0c; 16])], None).to_kid_request();

        let first = controller
            .on_license_message(Ok(KeyMessage {
                session: token.clone(),
                message: remote,
                url: None,
                is_initial_request: true,
            }))
            .unwrap();
        let second = controller
            .on_license_message(Ok(KeyMessage {
                session: token.clone(),
                message: renewal,
                url: None,
                is_initial_request: false,
            }))
            .unwrap();

        assert!(second.await.unwrap().result.is_ok());
        assert!(first.await.unwrap().result.is_ok());

        let kids: Vec<String> = cdm
            .updates
            .lock()
            .unwrap()
            .iter()
            .map(|(_, body)| {
                let jwk: serde_json::Value = serde_json::from_slice(body).unwrap();
                jwk["keys"][0]["kid"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            kids,
            vec![
                crate::utils::b64url_encode(&[0xaa; 16]),
                crate::utils::b64url_encode(&[0x0c; 16]),
            ]
        );
    }

    #[tokio::test]
    async fn sessions_do_not_wait_on_each_other() {
        let gated = Arc::new(GatedSystem::default());
        let (_, controller) = controller(
            MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING]),
            vec![gated.clone() as Arc<dyn KeySystem>],
        );
        controller.select_key_system(&media_info(), &[]).await.unwrap();
        let a = controller.create_key_session(&[1], CT, "cenc").await.unwrap();
        let b = controller.create_key_session(&[2], CT, "cenc").await.unwrap();

        for token in [&a, &b] {
            controller.on_license_message(Ok(KeyMessage {
                session: token.clone(),
                message: vec![1],
                url: None,
                is_initial_request: true,
            }));
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while gated.calls.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("both sessions reach the key system");
        gated.gate.notify_waiters();
    }

    #[tokio::test]
    async fn unknown_header_type_completes_with_failure() {
        let (cdm, controller) =
            controller(MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING]), vec![clearkey()]);
        controller.select_key_system(&media_info(), &[]).await.unwrap();
        let token = controller.create_key_session(&[0x02], CT, "cenc").await.unwrap();

        let done = controller
            .process_license_message(KeyMessage {
                session: token.clone(),
                message: vec![0x02],
                url: None,
                is_initial_request: true,
            })
            .await;

        assert!(matches!(done.result, Err(Error::Parse(_))));
        assert_eq!(done.correlation, token.session_id);
        assert!(cdm.updates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn inline_license_flows_through_event_loop() {
        let (tx, rx) = event_channel();
        let (cdm, controller) = controller(
            MockCdm {
                events: Some(tx),
                ..MockCdm::supporting(&[CLEARKEY_SYSTEM_STRING])
            },
            vec![clearkey()],
        );
        controller.init();

        let (added_tx, mut added_rx) = mpsc::unbounded_channel();
        controller
            .model()
            .bus()
            .subscribe(EventKind::KeyAdded, move |event| {
                if let ProtectionEvent::KeyAdded { session } = event {
                    let _ = added_tx.send(session.clone());
                }
            });

        let model = controller.model().clone();
        tokio::spawn(async move { model.run_event_loop(rx).await });

        let header = inline_header();
        let token = controller
            .handle_need_key(&media_info(), &header)
            .await
            .unwrap();

        let added = tokio::time::timeout(Duration::from_secs(5), added_rx.recv())
            .await
            .expect("key added in time")
            .expect("key added");
        assert_eq!(added.session_id, token.session_id);
        assert_eq!(added.state, crate::session::SessionState::Active);

        let updates = cdm.updates.lock().unwrap().clone();
        assert_eq!(updates.len(), 1);
        let jwk: serde_json::Value = serde_json::from_slice(&updates[0].1).unwrap();
        assert_eq!(jwk["keys"][0]["kty"], "oct");

        controller.teardown();
        assert_eq!(controller.model().bus().subscriber_count(EventKind::KeyMessage), 0);
    }
}
