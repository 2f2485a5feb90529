use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use minidom::Element;
use tern_core::event::{emit, EventBus, EventPayload, EventSource, PresenceShow};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::addr::{Address, AddressError, BareKey};
use crate::dispatch::Claim;
use crate::roster::presence_show;
use crate::stanza::{ns, PresenceBuilder, Stanza};

/// How long a join attempt may stay unanswered before it times out.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(20);

static NEXT_ROOM_ID: AtomicU32 = AtomicU32::new(1);

/// Process-local identifier for a chatroom, assigned when its definition is
/// created and kept for the life of the room object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChatroomId(u32);

impl ChatroomId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ChatroomId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A room the user wants to join: room name, chat service, and nick.
#[derive(Debug, Clone)]
pub struct ChatroomDef {
    id: ChatroomId,
    pub room: String,
    pub server: String,
    pub nick: String,
}

impl ChatroomDef {
    pub fn new(room: &str, server: &str, nick: &str) -> Self {
        Self {
            id: ChatroomId(NEXT_ROOM_ID.fetch_add(1, Ordering::Relaxed)),
            room: room.to_string(),
            server: server.to_string(),
            nick: nick.to_string(),
        }
    }

    pub fn id(&self) -> ChatroomId {
        self.id
    }

    /// The full occupant address `room@server/nick`.
    pub fn occupant_addr(&self) -> Result<Address, AddressError> {
        Address::parse(&format!("{}@{}/{}", self.room, self.server, self.nick))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatroomStatus {
    Joining,
    Active,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Ok,
    AlreadyOpen,
    Canceled,
    NickInUse,
    UnknownHost,
    TimedOut,
    UnknownError,
}

pub type JoinCallback = Box<dyn FnOnce(JoinOutcome, ChatroomId) + Send>;

/// Someone present in a room, keyed by their nick (the resource of the room
/// address, compared case-sensitively).
#[derive(Debug, Clone)]
pub struct Occupant {
    pub addr: Address,
    pub nick: String,
    pub show: PresenceShow,
    pub status: Option<String>,
}

struct PendingJoin {
    deadline: Instant,
    callback: JoinCallback,
}

pub struct Chatroom {
    id: ChatroomId,
    /// Own occupant address, `room@server/nick`.
    addr: Address,
    nick: String,
    status: ChatroomStatus,
    occupants: HashMap<String, Occupant>,
    pending: Option<PendingJoin>,
}

impl Chatroom {
    pub fn id(&self) -> ChatroomId {
        self.id
    }

    pub fn addr(&self) -> &Address {
        &self.addr
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn status(&self) -> ChatroomStatus {
        self.status
    }

    pub fn occupants(&self) -> impl Iterator<Item = &Occupant> {
        self.occupants.values()
    }
}

/// All rooms the session knows about, indexed both by id and by bare room
/// address. The two indexes are only ever touched through `insert_room` and
/// `remove_room` so they cannot drift apart.
pub struct ChatroomManager {
    rooms: HashMap<ChatroomId, Chatroom>,
    by_addr: HashMap<BareKey, ChatroomId>,
    event_bus: Arc<dyn EventBus>,
}

impl ChatroomManager {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            rooms: HashMap::new(),
            by_addr: HashMap::new(),
            event_bus,
        }
    }

    fn insert_room(&mut self, room: Chatroom) {
        self.by_addr
            .insert(BareKey::from(&room.addr), room.id);
        self.rooms.insert(room.id, room);
    }

    fn remove_room(&mut self, id: ChatroomId) -> Option<Chatroom> {
        let room = self.rooms.remove(&id)?;
        self.by_addr.remove(&BareKey::from(&room.addr));
        Some(room)
    }

    pub fn room(&self, id: ChatroomId) -> Option<&Chatroom> {
        self.rooms.get(&id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Start joining a room. Returns the room id, and the join presence to
    /// send unless the room is already open (in which case the callback has
    /// already fired with `AlreadyOpen`).
    pub fn join(
        &mut self,
        def: &ChatroomDef,
        show: PresenceShow,
        status: Option<&str>,
        now: Instant,
        callback: JoinCallback,
    ) -> Result<(ChatroomId, Option<Element>), AddressError> {
        let addr = def.occupant_addr()?;
        let key = BareKey::from(&addr);

        if let Some(&existing) = self.by_addr.get(&key) {
            debug!(room = %key, id = %existing, "room already open");
            callback(JoinOutcome::AlreadyOpen, existing);
            return Ok((existing, None));
        }

        let room = Chatroom {
            id: def.id,
            addr: addr.clone(),
            nick: def.nick.clone(),
            status: ChatroomStatus::Joining,
            occupants: HashMap::new(),
            pending: Some(PendingJoin {
                deadline: now + JOIN_TIMEOUT,
                callback,
            }),
        };
        self.insert_room(room);

        let mut presence = PresenceBuilder::new()
            .id(&format!("gc_join_{}", def.id))
            .to(&addr);
        presence = apply_show(presence, show, status);
        Ok((def.id, Some(presence.build())))
    }

    /// Abort a join in progress. The recorded callback fires with `Canceled`
    /// and the room is discarded. Joined rooms are unaffected.
    pub fn cancel_join(&mut self, id: ChatroomId) {
        let is_joining = self
            .rooms
            .get(&id)
            .is_some_and(|room| room.status == ChatroomStatus::Joining);
        if !is_joining {
            return;
        }
        if let Some(mut room) = self.remove_room(id) {
            if let Some(pending) = room.pending.take() {
                (pending.callback)(JoinOutcome::Canceled, id);
            }
        }
    }

    /// Leave a room unconditionally, regardless of its status. Returns the
    /// unavailable presence to send when the room was actually joined.
    pub fn leave(&mut self, id: ChatroomId) -> Option<Element> {
        let mut room = self.remove_room(id)?;
        if let Some(pending) = room.pending.take() {
            // Leaving mid-join counts as a cancellation.
            (pending.callback)(JoinOutcome::Canceled, id);
            return None;
        }

        Some(
            PresenceBuilder::new()
                .to(&room.addr)
                .kind("unavailable")
                .build(),
        )
    }

    /// Route a presence stanza. Claims anything whose bare sender matches a
    /// known room; everything else passes to the contact handlers.
    pub fn handle_presence(&mut self, stanza: &Stanza) -> Claim {
        let Some(from) = stanza.from_addr() else {
            return Claim::Pass;
        };
        let key = BareKey::from(&from);
        let Some(&id) = self.by_addr.get(&key) else {
            return Claim::Pass;
        };

        let joining = self
            .rooms
            .get(&id)
            .is_some_and(|room| room.status == ChatroomStatus::Joining);
        if joining {
            let outcome = match stanza.error_code() {
                None => JoinOutcome::Ok,
                Some(404) | Some(502) => JoinOutcome::UnknownHost,
                Some(409) => JoinOutcome::NickInUse,
                Some(504) => JoinOutcome::TimedOut,
                Some(code) => {
                    warn!(code, room = %key, "join failed with unmapped error code");
                    JoinOutcome::UnknownError
                }
            };

            if outcome != JoinOutcome::Ok {
                if let Some(mut room) = self.remove_room(id) {
                    if let Some(pending) = room.pending.take() {
                        (pending.callback)(outcome, id);
                    }
                }
                return Claim::Claimed;
            }

            let room = self.rooms.get_mut(&id).expect("room checked above");
            room.status = ChatroomStatus::Active;
            if let Some(pending) = room.pending.take() {
                (pending.callback)(JoinOutcome::Ok, id);
            }
            debug!(room = %key, %id, "joined chatroom");
            emit(
                self.event_bus.as_ref(),
                "chatroom.joined",
                EventSource::Chatroom,
                EventPayload::ChatroomJoined {
                    room_id: id.0,
                    room: key.as_str().to_string(),
                    nick: room.nick.clone(),
                },
            );
            // The confirming presence doubles as the first occupant update,
            // usually our own reflected nick.
        }

        self.apply_occupant_presence(id, &from, stanza);
        Claim::Claimed
    }

    fn apply_occupant_presence(&mut self, id: ChatroomId, from: &Address, stanza: &Stanza) {
        let Some(room) = self.rooms.get_mut(&id) else {
            return;
        };
        let Some(nick) = from.resource().map(str::to_string) else {
            // Presence from the bare room address carries no occupant.
            return;
        };

        let room_name = room.addr.to_bare();
        let (show, status) = presence_show(stanza);

        if stanza.type_attr() == Some("unavailable") {
            if room.occupants.remove(&nick).is_some() {
                emit(
                    self.event_bus.as_ref(),
                    "chatroom.occupant.left",
                    EventSource::Chatroom,
                    EventPayload::ChatroomOccupantLeft {
                        room_id: id.0,
                        room: room_name,
                        nick,
                    },
                );
            }
            return;
        }

        match room.occupants.get_mut(&nick) {
            Some(occupant) => {
                occupant.show = show;
                occupant.status = status.clone();
                emit(
                    self.event_bus.as_ref(),
                    "chatroom.occupant.updated",
                    EventSource::Chatroom,
                    EventPayload::ChatroomOccupantUpdated {
                        room_id: id.0,
                        room: room_name,
                        nick,
                        show,
                        status,
                    },
                );
            }
            None => {
                room.occupants.insert(
                    nick.clone(),
                    Occupant {
                        addr: from.clone(),
                        nick: nick.clone(),
                        show,
                        status,
                    },
                );
                emit(
                    self.event_bus.as_ref(),
                    "chatroom.occupant.joined",
                    EventSource::Chatroom,
                    EventPayload::ChatroomOccupantJoined {
                        room_id: id.0,
                        room: room_name,
                        nick,
                    },
                );
            }
        }
    }

    /// Route a message stanza. Only groupchat messages from known rooms are
    /// claimed; private messages from occupants flow on to the 1:1 handlers.
    pub fn handle_message(&mut self, stanza: &Stanza) -> Claim {
        if stanza.type_attr() != Some("groupchat") {
            return Claim::Pass;
        }
        let Some(from) = stanza.from_addr() else {
            return Claim::Pass;
        };
        let key = BareKey::from(&from);
        let Some(&id) = self.by_addr.get(&key) else {
            return Claim::Pass;
        };

        let room_name = key.as_str().to_string();
        let nick = from.resource().map(str::to_string);

        if let Some(subject) = stanza
            .payload("subject", ns::CLIENT)
            .map(Element::text)
        {
            match nick {
                Some(nick) => emit(
                    self.event_bus.as_ref(),
                    "chatroom.topic",
                    EventSource::Chatroom,
                    EventPayload::ChatroomTopicChanged {
                        room_id: id.0,
                        room: room_name,
                        nick,
                        topic: subject,
                    },
                ),
                // A topic with no author nick cannot be attributed; drop it.
                None => debug!(room = %key, "suppressing unattributed topic change"),
            }
            return Claim::Claimed;
        }

        let Some(body) = stanza.body() else {
            return Claim::Claimed;
        };

        match nick {
            Some(nick) => emit(
                self.event_bus.as_ref(),
                "chatroom.message",
                EventSource::Chatroom,
                EventPayload::ChatroomMessage {
                    room_id: id.0,
                    room: room_name,
                    nick,
                    body,
                },
            ),
            None => emit(
                self.event_bus.as_ref(),
                "chatroom.announcement",
                EventSource::Chatroom,
                EventPayload::ChatroomAnnouncement {
                    room_id: id.0,
                    room: room_name,
                    body,
                },
            ),
        }
        Claim::Claimed
    }

    /// Time out every join whose deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        let overdue: Vec<ChatroomId> = self
            .rooms
            .values()
            .filter(|room| {
                room.pending
                    .as_ref()
                    .is_some_and(|pending| pending.deadline <= now)
            })
            .map(|room| room.id)
            .collect();

        for id in overdue {
            if let Some(mut room) = self.remove_room(id) {
                warn!(room = %room.addr, %id, "join timed out");
                if let Some(pending) = room.pending.take() {
                    (pending.callback)(JoinOutcome::TimedOut, id);
                }
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.rooms
            .values()
            .filter_map(|room| room.pending.as_ref().map(|pending| pending.deadline))
            .min()
    }

    /// Drop every room, as on disconnect. Pending joins are canceled.
    pub fn clear(&mut self) {
        let ids: Vec<ChatroomId> = self.rooms.keys().copied().collect();
        for id in ids {
            if let Some(mut room) = self.remove_room(id) {
                if let Some(pending) = room.pending.take() {
                    (pending.callback)(JoinOutcome::Canceled, id);
                }
            }
        }
    }
}

pub(crate) fn apply_show(
    mut builder: PresenceBuilder,
    show: PresenceShow,
    status: Option<&str>,
) -> PresenceBuilder {
    builder = match show {
        PresenceShow::Chat => builder.show("chat"),
        PresenceShow::Away => builder.show("away"),
        PresenceShow::Xa => builder.show("xa"),
        PresenceShow::Dnd => builder.show("dnd"),
        PresenceShow::Available | PresenceShow::Unavailable => builder,
    };
    if let Some(status) = status {
        builder = builder.status(status);
    }
    builder
}
