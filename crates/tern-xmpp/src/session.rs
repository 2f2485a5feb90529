use std::sync::Arc;
use std::time::Duration;

use minidom::Element;
use tern_core::config::AccountConfig;
use tern_core::event::{emit, EventBus, EventPayload, EventSource, PresenceShow};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::addr::{Address, BareKey};
use crate::composing::ComposingTracker;
use crate::disco::{DiscoCallback, DiscoManager, BROWSE_TIMEOUT};
use crate::dispatch::{Claim, Dispatcher, IqRegistry, PendingKind};
use crate::error::{ConnectionError, SessionError};
use crate::muc::{apply_show, ChatroomDef, ChatroomId, ChatroomManager, JoinCallback};
use crate::register::{
    RegistrationManager, RegistrationValues, RequirementsCallback, SubmitCallback,
};
use crate::roster::ContactStore;
use crate::stanza::{
    groupchat_message, iq_get, iq_result, iq_unavailable, new_id, ns, serialize, Stanza,
};
use crate::transport::{TransportConfig, XmppTransport};
use crate::vcard::{FetchCallback, Profile, UpdateCallback, VcardManager};

/// Watchdog on each phase of login; covers servers that accept the TCP
/// connection and then never finish the handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);

const DEFAULT_RESOURCE: &str = "tern";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Disconnecting,
}

/// Supplies a password when the config leaves it blank, typically backed by
/// the platform keyring.
pub trait CredentialSource: Send {
    fn password(&self, account: &str) -> Option<String>;
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub jid: String,
    pub password: String,
    pub server: Option<String>,
    pub port: Option<u16>,
    pub priority: i8,
}

impl From<&AccountConfig> for SessionConfig {
    fn from(account: &AccountConfig) -> Self {
        Self {
            jid: account.jid.clone(),
            password: account.password.clone(),
            server: account.server.clone(),
            port: account.port,
            priority: 0,
        }
    }
}

/// Everything the stanza handlers operate on. Kept apart from the transport
/// so handlers stay synchronous; anything they want sent goes through the
/// outbox and is flushed by the session afterwards.
pub(crate) struct Subsystems {
    pub registry: IqRegistry,
    pub roster: ContactStore,
    pub muc: ChatroomManager,
    pub disco: DiscoManager,
    pub register: RegistrationManager,
    pub vcard: VcardManager,
    pub composing: ComposingTracker,
    pub outbox: Vec<Element>,
    pub identity: Option<Address>,
    pub show: PresenceShow,
    pub status: Option<String>,
    pub priority: i8,
    pub queued_profile: Option<(Profile, UpdateCallback)>,
    pub event_bus: Arc<dyn EventBus>,
}

impl Subsystems {
    fn new(event_bus: Arc<dyn EventBus>, priority: i8) -> Self {
        Self {
            registry: IqRegistry::new(),
            roster: ContactStore::new(event_bus.clone()),
            muc: ChatroomManager::new(event_bus.clone()),
            disco: DiscoManager::new(),
            register: RegistrationManager::new(),
            vcard: VcardManager::new(),
            composing: ComposingTracker::new(event_bus.clone()),
            outbox: Vec::new(),
            identity: None,
            show: PresenceShow::Available,
            status: None,
            priority,
            queued_profile: None,
            event_bus,
        }
    }

    /// Our current presence as a broadcastable stanza.
    fn presence_element(&self) -> Element {
        let builder = crate::stanza::PresenceBuilder::new().priority(self.priority);
        apply_show(builder, self.show, self.status.as_deref()).build()
    }

    fn reset(&mut self) {
        self.registry.clear();
        self.roster.clear();
        self.muc.clear();
        self.disco.clear();
        self.register.clear();
        self.vcard.clear();
        self.composing.clear();
        self.outbox.clear();
        self.identity = None;
    }
}

/// One XMPP account connection: owns the transport, runs the handler chains
/// over inbound stanzas, and exposes the protocol operations.
pub struct Session<T: XmppTransport> {
    state: SessionState,
    config: SessionConfig,
    transport: Option<T>,
    subs: Subsystems,
    dispatcher: Dispatcher<Subsystems>,
    credentials: Option<Box<dyn CredentialSource>>,
    self_initiated: bool,
}

impl<T: XmppTransport> Session<T> {
    pub fn new(config: SessionConfig, event_bus: Arc<dyn EventBus>) -> Self {
        let priority = config.priority;
        Self {
            state: SessionState::Disconnected,
            config,
            transport: None,
            subs: Subsystems::new(event_bus, priority),
            dispatcher: build_dispatcher(),
            credentials: None,
            self_initiated: false,
        }
    }

    pub fn with_credentials(mut self, source: Box<dyn CredentialSource>) -> Self {
        self.credentials = Some(source);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The address the server bound for us, once logged in.
    pub fn identity(&self) -> Option<&Address> {
        self.subs.identity.as_ref()
    }

    pub fn contacts(&self) -> &ContactStore {
        &self.subs.roster
    }

    pub fn chatroom(&self, id: ChatroomId) -> Option<&crate::muc::Chatroom> {
        self.subs.muc.room(id)
    }

    pub fn discovery(&self) -> &DiscoManager {
        &self.subs.disco
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Connect, authenticate, and bring the session to ready. Idempotent
    /// while ready. On success the roster pull, initial presence, and own
    /// profile fetch have been sent.
    pub async fn login(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Ready {
            return Ok(());
        }

        let mut jid = Address::parse(&self.config.jid)
            .map_err(|error| ConnectionError::InvalidUser(error.to_string()))?;
        if jid.resource().is_none() {
            jid.set_resource(Some(DEFAULT_RESOURCE));
        }

        let password = if !self.config.password.is_empty() {
            self.config.password.clone()
        } else {
            match self
                .credentials
                .as_ref()
                .and_then(|source| source.password(&self.config.jid))
            {
                Some(password) => password,
                None => {
                    return self.fail_login(ConnectionError::AuthFailed(
                        "no password configured or stored".to_string(),
                    ));
                }
            }
        };

        self.self_initiated = false;
        self.state = SessionState::Connecting;
        info!(jid = %jid, "logging in");

        let transport_config = TransportConfig {
            domain: jid.domain().to_string(),
            server: self.config.server.clone(),
            port: self.config.port,
        };
        let mut transport =
            match tokio::time::timeout(CONNECT_TIMEOUT, T::connect(&transport_config)).await {
                Ok(Ok(transport)) => transport,
                Ok(Err(error)) => return self.fail_login(error),
                Err(_) => return self.fail_login(ConnectionError::TimedOut),
            };

        self.state = SessionState::Authenticating;
        let bound =
            match tokio::time::timeout(CONNECT_TIMEOUT, transport.authenticate(&jid, &password))
                .await
            {
                Ok(Ok(bound)) => bound,
                Ok(Err(error)) => return self.fail_login(error),
                Err(_) => return self.fail_login(ConnectionError::TimedOut),
            };

        self.transport = Some(transport);
        self.subs.identity = Some(bound.clone());
        self.state = SessionState::Ready;
        info!(jid = %bound, "session ready");
        emit(
            self.subs.event_bus.as_ref(),
            "session.login",
            EventSource::Session,
            EventPayload::LoggedIn {
                jid: bound.to_full(),
            },
        );

        // Roster first, then announce presence, then profile.
        let id = new_id();
        self.subs
            .registry
            .register(id.clone(), PendingKind::RosterPull, None);
        self.subs.outbox.push(iq_get(
            &id,
            None,
            Element::builder("query", ns::ROSTER).build(),
        ));
        self.subs.outbox.push(self.subs.presence_element());

        if let Some((profile, callback)) = self.subs.queued_profile.take() {
            let (id, element) = self.subs.vcard.set(&profile, callback);
            self.subs.registry.register(id, PendingKind::VcardSet, None);
            self.subs.outbox.push(element);
        } else {
            let (id, element) = self.subs.vcard.get(
                None,
                Box::new(|result| {
                    if let Err(error) = result {
                        debug!(%error, "own profile not available");
                    }
                }),
            );
            self.subs.registry.register(id, PendingKind::VcardGet, None);
            self.subs.outbox.push(element);
        }

        self.flush().await
    }

    /// Tear the session down deliberately.
    pub async fn logout(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.self_initiated = true;
        self.state = SessionState::Disconnecting;

        if let Some(mut transport) = self.transport.take() {
            if let Err(error) = transport.close().await {
                debug!(%error, "close failed; dropping connection");
            }
        }

        self.subs.reset();
        self.state = SessionState::Disconnected;
        info!("logged out");
        emit(
            self.subs.event_bus.as_ref(),
            "session.logout",
            EventSource::Session,
            EventPayload::LoggedOut,
        );
    }

    /// Drive the session: read frames and fire deadlines until the transport
    /// drops or `logout` flips the state.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        while self.state == SessionState::Ready {
            let deadline = self.next_deadline();
            let Some(transport) = self.transport.as_mut() else {
                return Err(SessionError::NotReady);
            };

            let inbound = match deadline {
                Some(deadline) => tokio::select! {
                    frame = transport.recv() => Some(frame),
                    _ = tokio::time::sleep_until(deadline) => None,
                },
                None => Some(transport.recv().await),
            };

            match inbound {
                Some(Ok(frame)) => self.handle_frame(&frame).await?,
                Some(Err(error)) => {
                    self.handle_transport_lost(&error);
                    return Err(error.into());
                }
                None => self.on_deadline(Instant::now()).await?,
            }
        }
        Ok(())
    }

    /// Dispatch one inbound frame and send whatever the handlers produced.
    pub async fn handle_frame(&mut self, frame: &[u8]) -> Result<(), SessionError> {
        match Stanza::parse(frame) {
            Ok(stanza) => {
                let claim = self
                    .dispatcher
                    .dispatch(&mut self.subs, &stanza, Instant::now());
                if claim == Claim::Pass {
                    trace!(kind = ?stanza.kind(), "stanza fell through every handler");
                }
            }
            Err(error) => warn!(%error, "dropping unparseable frame"),
        }
        self.flush().await
    }

    /// Fire every subsystem deadline that has passed and send the fallout.
    pub async fn on_deadline(&mut self, now: Instant) -> Result<(), SessionError> {
        self.subs.muc.expire(now);
        self.subs.composing.expire(now);
        for (id, kind) in self.subs.registry.expire(now) {
            match kind {
                PendingKind::DiscoItems { target } => self.subs.disco.on_items_timeout(&target),
                PendingKind::DiscoInfo { target } => self.subs.disco.on_info_timeout(&target),
                other => warn!(id = %id, kind = ?other, "request expired without a reply"),
            }
        }
        self.flush().await
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.subs.muc.next_deadline(),
            self.subs.composing.next_deadline(),
            self.subs.registry.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ── Operations ────────────────────────────────────────────────

    /// Update and broadcast our availability.
    pub async fn set_presence(
        &mut self,
        show: PresenceShow,
        status: Option<&str>,
    ) -> Result<(), SessionError> {
        self.ensure_ready()?;
        self.subs.show = show;
        self.subs.status = status.map(str::to_string);
        let element = self.subs.presence_element();
        self.subs.outbox.push(element);
        self.flush().await
    }

    /// Start joining a chatroom. The callback reports how the join ended.
    pub async fn join_chatroom(
        &mut self,
        def: &ChatroomDef,
        callback: JoinCallback,
    ) -> Result<ChatroomId, SessionError> {
        self.ensure_ready()?;
        let (id, element) = self
            .subs
            .muc
            .join(
                def,
                self.subs.show,
                self.subs.status.as_deref(),
                Instant::now(),
                callback,
            )
            .map_err(|error| ConnectionError::InvalidUser(error.to_string()))?;
        if let Some(element) = element {
            self.subs.outbox.push(element);
            self.flush().await?;
        }
        Ok(id)
    }

    /// Abort a join in progress.
    pub fn cancel_join(&mut self, id: ChatroomId) {
        self.subs.muc.cancel_join(id);
    }

    pub async fn leave_chatroom(&mut self, id: ChatroomId) -> Result<(), SessionError> {
        self.ensure_ready()?;
        if let Some(element) = self.subs.muc.leave(id) {
            self.subs.outbox.push(element);
            self.flush().await?;
        }
        Ok(())
    }

    pub async fn send_chatroom_message(
        &mut self,
        id: ChatroomId,
        body: &str,
    ) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let Some(room) = self.subs.muc.room(id) else {
            warn!(%id, "message to unknown chatroom dropped");
            return Ok(());
        };
        let element = groupchat_message(room.addr(), body);
        self.subs.outbox.push(element);
        self.flush().await
    }

    /// Grant a peer's subscription request.
    pub async fn approve_subscription(&mut self, peer: &Address) -> Result<(), SessionError> {
        self.answer_subscription(peer, "subscribed").await
    }

    /// Deny a peer's subscription request.
    pub async fn refuse_subscription(&mut self, peer: &Address) -> Result<(), SessionError> {
        self.answer_subscription(peer, "unsubscribed").await
    }

    async fn answer_subscription(
        &mut self,
        peer: &Address,
        kind: &str,
    ) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let element = crate::stanza::PresenceBuilder::new()
            .to(&peer.bare())
            .kind(kind)
            .build();
        self.subs.outbox.push(element);
        self.flush().await
    }

    /// Browse a target's services. Supersedes any browse of the same target.
    pub async fn discover(
        &mut self,
        target: &Address,
        callback: DiscoCallback,
    ) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let key = BareKey::from(target);
        self.subs.registry.discard(|kind| {
            matches!(
                kind,
                PendingKind::DiscoItems { target: t } | PendingKind::DiscoInfo { target: t }
                    if *t == key
            )
        });

        let (id, element) = self.subs.disco.request_items(target, callback);
        self.subs.registry.register(
            id,
            PendingKind::DiscoItems { target: key },
            Some(Instant::now() + BROWSE_TIMEOUT),
        );
        self.subs.outbox.push(element);
        self.flush().await
    }

    /// Ask a service what it needs for registration.
    pub async fn request_registration_requirements(
        &mut self,
        target: &Address,
        callback: RequirementsCallback,
    ) -> Result<(), SessionError> {
        self.ensure_ready()?;
        if let Some((id, element)) = self.subs.register.request_requirements(target, callback) {
            self.subs.registry.register(
                id,
                PendingKind::Registration {
                    target: BareKey::from(target),
                },
                None,
            );
            self.subs.outbox.push(element);
            self.flush().await?;
        }
        Ok(())
    }

    /// Submit a filled-in registration.
    pub async fn submit_registration(
        &mut self,
        target: &Address,
        values: &RegistrationValues,
        callback: SubmitCallback,
    ) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let (id, element) = self.subs.register.submit(target, values, callback)?;
        self.subs.registry.register(
            id,
            PendingKind::RegistrationSubmit {
                target: BareKey::from(target),
            },
            None,
        );
        self.subs.outbox.push(element);
        self.flush().await
    }

    /// Fetch a profile; `None` fetches our own.
    pub async fn fetch_profile(
        &mut self,
        target: Option<&Address>,
        callback: FetchCallback,
    ) -> Result<(), SessionError> {
        self.ensure_ready()?;
        let (id, element) = self.subs.vcard.get(target, callback);
        self.subs.registry.register(id, PendingKind::VcardGet, None);
        self.subs.outbox.push(element);
        self.flush().await
    }

    /// Publish our profile. Offline, the profile is queued and published on
    /// the next successful login.
    pub async fn update_profile(
        &mut self,
        profile: Profile,
        callback: UpdateCallback,
    ) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            debug!("session offline; queueing profile for next login");
            self.subs.queued_profile = Some((profile, callback));
            return Ok(());
        }
        let (id, element) = self.subs.vcard.set(&profile, callback);
        self.subs.registry.register(id, PendingKind::VcardSet, None);
        self.subs.outbox.push(element);
        self.flush().await
    }

    // ── Internals ─────────────────────────────────────────────────

    fn ensure_ready(&self) -> Result<(), SessionError> {
        if self.state == SessionState::Ready {
            Ok(())
        } else {
            Err(SessionError::NotReady)
        }
    }

    fn fail_login(&mut self, error: ConnectionError) -> Result<(), SessionError> {
        warn!(%error, "login failed");
        self.state = SessionState::Disconnected;
        self.transport = None;
        emit(
            self.subs.event_bus.as_ref(),
            "session.error",
            EventSource::Session,
            EventPayload::ErrorOccurred {
                component: "session".to_string(),
                message: error.to_string(),
                recoverable: error.is_retryable(),
            },
        );
        Err(error.into())
    }

    fn handle_transport_lost(&mut self, error: &ConnectionError) {
        warn!(%error, "connection lost");
        self.transport = None;
        self.state = SessionState::Disconnected;
        self.subs.reset();

        if !self.self_initiated {
            emit(
                self.subs.event_bus.as_ref(),
                "session.error",
                EventSource::Session,
                EventPayload::ErrorOccurred {
                    component: "transport".to_string(),
                    message: error.to_string(),
                    recoverable: error.is_retryable(),
                },
            );
        }
        emit(
            self.subs.event_bus.as_ref(),
            "session.logout",
            EventSource::Session,
            EventPayload::LoggedOut,
        );
    }

    async fn flush(&mut self) -> Result<(), SessionError> {
        if self.subs.outbox.is_empty() {
            return Ok(());
        }
        let Some(mut transport) = self.transport.take() else {
            self.subs.outbox.clear();
            return Err(SessionError::NotReady);
        };

        let queued: Vec<Element> = self.subs.outbox.drain(..).collect();
        for element in queued {
            if let Err(error) = transport.send(&serialize(&element)).await {
                self.handle_transport_lost(&error);
                return Err(error.into());
            }
        }
        self.transport = Some(transport);
        Ok(())
    }
}

/// Wire up the handler chains. Order within a chain is priority order.
fn build_dispatcher() -> Dispatcher<Subsystems> {
    let mut dispatcher = Dispatcher::new();

    dispatcher.presence.register(
        "chatroom",
        Box::new(|subs: &mut Subsystems, stanza, _now| subs.muc.handle_presence(stanza)),
    );
    dispatcher.presence.register(
        "subscription",
        Box::new(|subs: &mut Subsystems, stanza, _now| match stanza.type_attr() {
            Some("subscribe") => {
                let Some(from) = stanza.from_addr() else {
                    return Claim::Claimed;
                };
                emit(
                    subs.event_bus.as_ref(),
                    "contact.subscription",
                    EventSource::Contact,
                    EventPayload::SubscriptionRequest {
                        from: from.to_bare(),
                    },
                );
                Claim::Claimed
            }
            Some("subscribed") | Some("unsubscribe") | Some("unsubscribed") => {
                debug!(kind = ?stanza.type_attr(), "subscription bookkeeping presence");
                Claim::Claimed
            }
            _ => Claim::Pass,
        }),
    );
    dispatcher.presence.register(
        "contact",
        Box::new(|subs: &mut Subsystems, stanza, _now| subs.roster.apply_presence(stanza)),
    );

    dispatcher.message.register(
        "chatroom",
        Box::new(|subs: &mut Subsystems, stanza, _now| subs.muc.handle_message(stanza)),
    );
    dispatcher.message.register(
        "typing",
        Box::new(|subs: &mut Subsystems, stanza, now| subs.composing.handle_message(stanza, now)),
    );
    dispatcher.message.register(
        "chat",
        Box::new(|subs: &mut Subsystems, stanza, _now| {
            if stanza.type_attr() == Some("error") {
                return Claim::Pass;
            }
            let (Some(from), Some(body)) = (stanza.from_addr(), stanza.body()) else {
                return Claim::Pass;
            };
            emit(
                subs.event_bus.as_ref(),
                "contact.message",
                EventSource::Contact,
                EventPayload::MessageReceived {
                    from: from.to_bare(),
                    body,
                },
            );
            Claim::Claimed
        }),
    );

    dispatcher.iq.register(
        "reply",
        Box::new(|subs: &mut Subsystems, stanza, now| {
            let Some(id) = stanza.id().map(str::to_string) else {
                return Claim::Pass;
            };
            let Some(kind) = subs.registry.claim(&id) else {
                // Results and errors we never asked for are stale replies.
                return if matches!(stanza.type_attr(), Some("result") | Some("error")) {
                    trace!(id = %id, "dropping stale reply");
                    Claim::Claimed
                } else {
                    Claim::Pass
                };
            };

            match kind {
                PendingKind::RosterPull => {
                    if stanza.has_error() {
                        warn!(code = ?stanza.error_code(), "roster pull failed");
                    } else if let Some(query) = stanza.payload("query", ns::ROSTER) {
                        subs.roster.apply_roster(query);
                    }
                }
                PendingKind::DiscoItems { target } => {
                    for (info_id, element) in subs.disco.on_items_reply(&target, stanza) {
                        subs.registry.register(
                            info_id,
                            PendingKind::DiscoInfo {
                                target: target.clone(),
                            },
                            Some(now + BROWSE_TIMEOUT),
                        );
                        subs.outbox.push(element);
                    }
                }
                PendingKind::DiscoInfo { target } => subs.disco.on_info_reply(&target, stanza),
                PendingKind::Registration { target } => {
                    subs.register.on_requirements_reply(&target, stanza);
                }
                PendingKind::RegistrationSubmit { target } => {
                    subs.register.on_submit_reply(&target, stanza);
                }
                PendingKind::VcardGet => subs.vcard.on_get_reply(&id, stanza),
                PendingKind::VcardSet => {
                    if subs.vcard.on_set_reply(&id, stanza) {
                        // Rebroadcast so other clients notice the new vcard.
                        let element = subs.presence_element();
                        subs.outbox.push(element);
                    }
                }
            }
            Claim::Claimed
        }),
    );
    dispatcher.iq.register(
        "roster-push",
        Box::new(|subs: &mut Subsystems, stanza, _now| {
            if stanza.type_attr() != Some("set") {
                return Claim::Pass;
            }
            let Some(query) = stanza.payload("query", ns::ROSTER) else {
                return Claim::Pass;
            };
            subs.roster.apply_roster(query);
            if let Some(id) = stanza.id() {
                subs.outbox.push(iq_result(id, None));
            }
            Claim::Claimed
        }),
    );
    dispatcher.iq.register(
        "unhandled",
        Box::new(|subs: &mut Subsystems, stanza, _now| {
            if matches!(stanza.type_attr(), Some("get") | Some("set")) {
                if let Some(id) = stanza.id() {
                    subs.outbox
                        .push(iq_unavailable(id, stanza.from_addr().as_ref()));
                }
            }
            Claim::Claimed
        }),
    );

    dispatcher
}
