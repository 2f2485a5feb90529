use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::error::EventBusError;

/// Hierarchical channel name validation and parsing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

impl Channel {
    /// Create a new channel, validating its format.
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Check if a channel name is valid.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }

        // Must be lowercase and only contain a-z, 0-9, and dots
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }

        // Check domain
        matches!(
            name.split('.').next().unwrap_or(""),
            "session" | "contact" | "chatroom"
        )
    }

    /// Get the domain of the channel.
    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    /// Get the full channel name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

/// The standard event envelope wrapping all events emitted by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Hierarchical channel name (e.g., "chatroom.occupant.joined")
    pub channel: Channel,

    /// When the event was created (UTC)
    pub timestamp: DateTime<Utc>,

    /// Unique identifier for this event
    pub id: Uuid,

    /// Source component that emitted this event
    pub source: EventSource,

    /// The typed event payload
    pub payload: EventPayload,
}

impl Event {
    /// Create a new event with a given channel and payload.
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

/// Identifies the component that emitted an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// Session lifecycle machinery
    Session,
    /// Roster and presence tracking
    Contact,
    /// Groupchat machinery
    Chatroom,
    /// The embedding application
    Application(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventPayload {
    // ── Session events ────────────────────────────────────────────
    LoggedIn {
        jid: String,
    },
    LoggedOut,
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Contact events ────────────────────────────────────────────
    ContactAdded {
        contact: ContactInfo,
    },
    ContactUpdated {
        contact: ContactInfo,
    },
    ContactRemoved {
        jid: String,
    },
    ContactPresence {
        jid: String,
        show: PresenceShow,
        status: Option<String>,
    },
    SubscriptionRequest {
        from: String,
    },
    MessageReceived {
        from: String,
        body: String,
    },
    Composing {
        from: String,
        active: bool,
    },

    // ── Chatroom events ───────────────────────────────────────────
    ChatroomJoined {
        room_id: u32,
        room: String,
        nick: String,
    },
    ChatroomOccupantJoined {
        room_id: u32,
        room: String,
        nick: String,
    },
    ChatroomOccupantLeft {
        room_id: u32,
        room: String,
        nick: String,
    },
    ChatroomOccupantUpdated {
        room_id: u32,
        room: String,
        nick: String,
        show: PresenceShow,
        status: Option<String>,
    },
    ChatroomMessage {
        room_id: u32,
        room: String,
        nick: String,
        body: String,
    },
    ChatroomAnnouncement {
        room_id: u32,
        room: String,
        body: String,
    },
    ChatroomTopicChanged {
        room_id: u32,
        room: String,
        nick: String,
        topic: String,
    },
}

/// A single entry in the contact list as surfaced to the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    /// The contact's bare JID (e.g., "alice@example.com")
    pub jid: String,

    /// Display name set by the user, if any
    pub name: Option<String>,

    /// Roster subscription state
    pub subscription: Subscription,

    /// User-defined groups this contact belongs to
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Subscription {
    None,
    To,
    From,
    Both,
    Remove,
}

impl Subscription {
    pub fn as_str(&self) -> &'static str {
        match self {
            Subscription::None => "none",
            Subscription::To => "to",
            Subscription::From => "from",
            Subscription::Both => "both",
            Subscription::Remove => "remove",
        }
    }
}

impl std::str::FromStr for Subscription {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "to" => Subscription::To,
            "from" => Subscription::From,
            "both" => Subscription::Both,
            "remove" => Subscription::Remove,
            _ => Subscription::None,
        })
    }
}

/// XMPP presence "show" values (RFC 6121 section 4.7.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceShow {
    /// Available (no <show/> element -- the default)
    Available,
    /// Free for chat
    Chat,
    /// Away
    Away,
    /// Extended away
    Xa,
    /// Do not disturb
    Dnd,
    /// Unavailable (offline)
    Unavailable,
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// Validate the channel, wrap the payload in an envelope, and publish it,
/// logging (rather than propagating) bus failures. Protocol handling must
/// never be derailed by a misbehaving subscriber.
pub fn emit(bus: &dyn EventBus, channel: &str, source: EventSource, payload: EventPayload) {
    let channel = match Channel::new(channel) {
        Ok(channel) => channel,
        Err(error) => {
            trace!(%error, "dropping event with invalid channel");
            return;
        }
    };

    if let Err(error) = bus.publish(Event::new(channel, source, payload)) {
        trace!(%error, "failed to publish event");
    }
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    session_sender: broadcast::Sender<Event>,
    contact_sender: broadcast::Sender<Event>,
    chatroom_sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (session_sender, _) = broadcast::channel(capacity);
        let (contact_sender, _) = broadcast::channel(capacity);
        let (chatroom_sender, _) = broadcast::channel(capacity);

        Self {
            session_sender,
            contact_sender,
            chatroom_sender,
        }
    }

    fn sender_for_domain(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "session" => Some(&self.session_sender),
            "contact" => Some(&self.contact_sender),
            "chatroom" => Some(&self.chatroom_sender),
            _ => None,
        }
    }

    fn receivers_for_pattern(&self, pattern: &str) -> Result<DomainReceivers, EventBusError> {
        let first_segment = pattern.split('.').next().unwrap_or_default();

        if first_segment.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first_segment) {
            return Ok(DomainReceivers {
                session: Some(self.session_sender.subscribe()),
                contact: Some(self.contact_sender.subscribe()),
                chatroom: Some(self.chatroom_sender.subscribe()),
            });
        }

        match first_segment {
            "session" => Ok(DomainReceivers {
                session: Some(self.session_sender.subscribe()),
                contact: None,
                chatroom: None,
            }),
            "contact" => Ok(DomainReceivers {
                session: None,
                contact: Some(self.contact_sender.subscribe()),
                chatroom: None,
            }),
            "chatroom" => Ok(DomainReceivers {
                session: None,
                contact: None,
                chatroom: Some(self.chatroom_sender.subscribe()),
            }),
            _ => Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .sender_for_domain(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;

        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let receivers = self.receivers_for_pattern(pattern)?;

        Ok(EventSubscription { matcher, receivers })
    }
}

#[derive(Debug)]
struct DomainReceivers {
    session: Option<broadcast::Receiver<Event>>,
    contact: Option<broadcast::Receiver<Event>>,
    chatroom: Option<broadcast::Receiver<Event>>,
}

#[derive(Debug)]
pub struct EventSubscription {
    matcher: GlobMatcher,
    receivers: DomainReceivers,
}

impl EventSubscription {
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            let session_receiver = self.receivers.session.as_mut();
            let contact_receiver = self.receivers.contact.as_mut();
            let chatroom_receiver = self.receivers.chatroom.as_mut();

            let received = tokio::select! {
                result = recv_from_domain(session_receiver) => result,
                result = recv_from_domain(contact_receiver) => result,
                result = recv_from_domain(chatroom_receiver) => result,
            };

            match received {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

async fn recv_from_domain(
    receiver: Option<&mut broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match receiver {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment.contains(['*', '?', '[', '{'])
}
