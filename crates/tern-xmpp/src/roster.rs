use std::collections::HashMap;
use std::sync::Arc;

use minidom::Element;
use tern_core::event::{
    emit, ContactInfo, EventBus, EventPayload, EventSource, PresenceShow, Subscription,
};
use tracing::{debug, warn};

use crate::addr::{Address, BareKey};
use crate::dispatch::Claim;
use crate::stanza::{ns, Stanza};

/// A roster entry together with its last known presence.
#[derive(Debug, Clone)]
pub struct Contact {
    pub addr: Address,
    pub name: Option<String>,
    pub groups: Vec<String>,
    pub subscription: Subscription,
    pub show: PresenceShow,
    pub status: Option<String>,
}

impl Contact {
    fn info(&self) -> ContactInfo {
        ContactInfo {
            jid: self.addr.to_bare(),
            name: self.name.clone(),
            subscription: self.subscription,
            groups: self.groups.clone(),
        }
    }
}

/// Contact list synchronized from roster results and pushes.
pub struct ContactStore {
    contacts: HashMap<BareKey, Contact>,
    event_bus: Arc<dyn EventBus>,
}

impl ContactStore {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            contacts: HashMap::new(),
            event_bus,
        }
    }

    pub fn get(&self, key: &BareKey) -> Option<&Contact> {
        self.contacts.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn clear(&mut self) {
        self.contacts.clear();
    }

    /// Apply a roster query payload (initial result or push), raising exactly
    /// one contact event per item that actually changed something.
    pub fn apply_roster(&mut self, query: &Element) {
        for item in query.children().filter(|child| child.name() == "item") {
            self.apply_item(item);
        }
    }

    fn apply_item(&mut self, item: &Element) {
        let Some(raw_jid) = item.attr("jid") else {
            warn!("roster item without jid attribute");
            return;
        };
        let addr = match Address::parse(raw_jid) {
            Ok(addr) => addr.bare(),
            Err(error) => {
                warn!(jid = raw_jid, %error, "skipping unparseable roster item");
                return;
            }
        };
        let key = BareKey::from(&addr);

        let subscription: Subscription = item
            .attr("subscription")
            .unwrap_or("none")
            .parse()
            .unwrap_or(Subscription::None);

        if subscription == Subscription::Remove {
            if let Some(removed) = self.contacts.remove(&key) {
                debug!(jid = %key, "contact removed from roster");
                emit(
                    self.event_bus.as_ref(),
                    "contact.removed",
                    EventSource::Contact,
                    EventPayload::ContactRemoved {
                        jid: removed.addr.to_bare(),
                    },
                );
            }
            return;
        }

        let name = item
            .attr("name")
            .map(str::to_string)
            .filter(|name| !name.is_empty());
        let mut groups: Vec<String> = item
            .children()
            .filter(|child| child.name() == "group")
            .map(Element::text)
            .filter(|group| !group.is_empty())
            .collect();
        groups.sort();

        match self.contacts.get_mut(&key) {
            Some(existing) => {
                let changed = existing.name != name || existing.groups != groups;
                existing.name = name;
                existing.groups = groups;
                existing.subscription = subscription;
                if changed {
                    emit(
                        self.event_bus.as_ref(),
                        "contact.updated",
                        EventSource::Contact,
                        EventPayload::ContactUpdated {
                            contact: existing.info(),
                        },
                    );
                }
            }
            None => {
                let contact = Contact {
                    addr,
                    name,
                    groups,
                    subscription,
                    show: PresenceShow::Unavailable,
                    status: None,
                };
                emit(
                    self.event_bus.as_ref(),
                    "contact.added",
                    EventSource::Contact,
                    EventPayload::ContactAdded {
                        contact: contact.info(),
                    },
                );
                self.contacts.insert(key, contact);
            }
        }
    }

    /// Track a presence update for a contact. Always claims: by the time this
    /// handler runs, chatroom presences have already been taken out of the
    /// chain.
    pub fn apply_presence(&mut self, stanza: &Stanza) -> Claim {
        let Some(from) = stanza.from_addr() else {
            return Claim::Pass;
        };

        let (show, status) = presence_show(stanza);
        let key = BareKey::from(&from);

        if let Some(contact) = self.contacts.get_mut(&key) {
            contact.show = show;
            contact.status = status.clone();
        }

        emit(
            self.event_bus.as_ref(),
            "contact.presence",
            EventSource::Contact,
            EventPayload::ContactPresence {
                jid: from.to_bare(),
                show,
                status,
            },
        );
        Claim::Claimed
    }
}

/// Extract show and status from a presence stanza. An `unavailable` type
/// wins over any `<show/>` child.
pub(crate) fn presence_show(stanza: &Stanza) -> (PresenceShow, Option<String>) {
    let status = stanza
        .payload("status", ns::CLIENT)
        .map(Element::text)
        .filter(|status| !status.is_empty());

    if stanza.type_attr() == Some("unavailable") {
        return (PresenceShow::Unavailable, status);
    }

    let show = match stanza
        .payload("show", ns::CLIENT)
        .map(Element::text)
        .as_deref()
    {
        Some("chat") => PresenceShow::Chat,
        Some("away") => PresenceShow::Away,
        Some("xa") => PresenceShow::Xa,
        Some("dnd") => PresenceShow::Dnd,
        _ => PresenceShow::Available,
    };
    (show, status)
}
