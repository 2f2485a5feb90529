use std::collections::HashMap;
use std::time::Duration;

use minidom::Element;
use tracing::{debug, warn};

use crate::addr::{Address, BareKey};
use crate::stanza::{iq_get, new_id, ns, Stanza};

/// How long a browse may run before the caller is told it timed out.
pub const BROWSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Directory service that never answers info queries; asking it would stall
/// every browse of the public servers that still list it.
const UNRESPONSIVE_ITEM: &str = "users.jabber.org";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoIdentity {
    pub category: String,
    pub kind: String,
    pub name: Option<String>,
}

/// One service discovered under a browse target, enriched with the
/// identities and features its info reply reported.
#[derive(Debug, Clone)]
pub struct DiscoItem {
    pub addr: Address,
    pub name: Option<String>,
    pub identities: Vec<DiscoIdentity>,
    pub features: Vec<String>,
}

impl DiscoItem {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }
}

/// Invoked once per item as its info arrives. `last` marks the final call of
/// the browse; `timed_out` is set when the browse ended on the deadline
/// instead of a reply.
pub type DiscoCallback = Box<dyn FnMut(Option<&DiscoItem>, bool, bool) + Send>;

struct DiscoSession {
    target: Address,
    items: HashMap<BareKey, DiscoItem>,
    remaining: usize,
    callback: DiscoCallback,
}

/// Two-phase service browser: an items query fans out into one info query
/// per discovered item, and the caller hears about each item as its info
/// lands. One browse per target; a new browse of the same target supersedes
/// the old one.
#[derive(Default)]
pub struct DiscoManager {
    sessions: HashMap<BareKey, DiscoSession>,
    completed: HashMap<BareKey, Vec<DiscoItem>>,
}

impl DiscoManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start browsing a target. Returns the items query to send and its id.
    /// Any browse already running against the target is dropped silently;
    /// its outstanding replies must be discarded by the caller.
    pub fn request_items(&mut self, target: &Address, callback: DiscoCallback) -> (String, Element) {
        let key = BareKey::from(target);
        if self.sessions.remove(&key).is_some() {
            debug!(target = %key, "superseding browse in progress");
        }
        self.sessions.insert(
            key,
            DiscoSession {
                target: target.bare(),
                items: HashMap::new(),
                remaining: 0,
                callback,
            },
        );

        let id = new_id();
        let query = Element::builder("query", ns::DISCO_ITEMS).build();
        (id.clone(), iq_get(&id, Some(&target.bare()), query))
    }

    /// Whether a browse is currently running against the target.
    pub fn is_browsing(&self, target: &BareKey) -> bool {
        self.sessions.contains_key(target)
    }

    /// Handle the items reply for a browse. Returns the info queries to send,
    /// one per item worth asking about. An error-coded reply ends the browse
    /// as if the target had no items.
    pub fn on_items_reply(&mut self, target: &BareKey, stanza: &Stanza) -> Vec<(String, Element)> {
        let Some(mut session) = self.sessions.remove(target) else {
            return Vec::new();
        };

        if stanza.has_error() {
            warn!(target = %target, code = ?stanza.error_code(), "items query failed");
            (session.callback)(None, true, false);
            return Vec::new();
        }

        let mut requests = Vec::new();
        if let Some(query) = stanza.payload("query", ns::DISCO_ITEMS) {
            for item in query.children().filter(|child| child.name() == "item") {
                let Some(raw_jid) = item.attr("jid") else {
                    continue;
                };
                if raw_jid == UNRESPONSIVE_ITEM {
                    continue;
                }
                let Ok(addr) = Address::parse(raw_jid) else {
                    warn!(jid = raw_jid, "skipping item with unparseable jid");
                    continue;
                };
                let key = BareKey::from(&addr);
                if session.items.contains_key(&key) {
                    continue;
                }

                session.items.insert(
                    key,
                    DiscoItem {
                        addr: addr.clone(),
                        name: item.attr("name").map(str::to_string),
                        identities: Vec::new(),
                        features: Vec::new(),
                    },
                );

                let id = new_id();
                let query = Element::builder("query", ns::DISCO_INFO).build();
                requests.push((id.clone(), iq_get(&id, Some(&addr), query)));
            }
        }

        session.remaining = requests.len();
        if session.remaining == 0 {
            debug!(target = %target, "browse found nothing to ask about");
            (session.callback)(None, true, false);
            return requests;
        }

        self.sessions.insert(target.clone(), session);
        requests
    }

    /// Handle one info reply belonging to a browse. The item is reported even
    /// when the service answered with an error; it just stays bare.
    pub fn on_info_reply(&mut self, target: &BareKey, stanza: &Stanza) {
        let Some(session) = self.sessions.get_mut(target) else {
            return;
        };

        let item_key = stanza.from_addr().map(|from| BareKey::from(&from));
        if let (Some(item_key), Some(query), false) = (
            item_key.as_ref(),
            stanza.payload("query", ns::DISCO_INFO),
            stanza.has_error(),
        ) {
            if let Some(item) = session.items.get_mut(item_key) {
                for child in query.children() {
                    match child.name() {
                        "identity" => {
                            if let (Some(category), Some(kind)) =
                                (child.attr("category"), child.attr("type"))
                            {
                                item.identities.push(DiscoIdentity {
                                    category: category.to_string(),
                                    kind: kind.to_string(),
                                    name: child.attr("name").map(str::to_string),
                                });
                            }
                        }
                        "feature" => {
                            if let Some(var) = child.attr("var") {
                                item.features.push(var.to_string());
                            }
                        }
                        _ => {}
                    }
                }
            }
        }

        session.remaining = session.remaining.saturating_sub(1);
        let last = session.remaining == 0;
        let item = item_key.and_then(|key| session.items.get(&key).cloned());
        (session.callback)(item.as_ref(), last, false);

        if last {
            let session = self
                .sessions
                .remove(target)
                .expect("session present above");
            self.completed
                .insert(target.clone(), session.items.into_values().collect());
        }
    }

    /// End a browse whose items query never got an answer.
    pub fn on_items_timeout(&mut self, target: &BareKey) {
        if let Some(mut session) = self.sessions.remove(target) {
            warn!(target = %target, "browse timed out waiting for item list");
            (session.callback)(None, true, true);
        }
    }

    /// Count one info query as lost. Ends the browse when it was the final
    /// outstanding reply.
    pub fn on_info_timeout(&mut self, target: &BareKey) {
        let Some(session) = self.sessions.get_mut(target) else {
            return;
        };
        session.remaining = session.remaining.saturating_sub(1);
        let last = session.remaining == 0;
        (session.callback)(None, last, true);
        if last {
            let session = self
                .sessions
                .remove(target)
                .expect("session present above");
            self.completed
                .insert(target.clone(), session.items.into_values().collect());
        }
    }

    /// Drop a browse without notifying its callback.
    pub fn destroy(&mut self, target: &BareKey) {
        self.sessions.remove(target);
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
        self.completed.clear();
    }

    pub fn browse_target(&self, target: &BareKey) -> Option<&Address> {
        self.sessions.get(target).map(|session| &session.target)
    }

    /// Completed-browse items carrying an identity of the given category
    /// that also accept in-band registration.
    pub fn items_with_category(&self, category: &str) -> Vec<&DiscoItem> {
        self.completed
            .values()
            .flatten()
            .filter(|item| {
                item.identities.iter().any(|id| id.category == category)
                    && item.has_feature(ns::REGISTER)
            })
            .collect()
    }

    /// Completed-browse items of a category and type that also accept
    /// in-band registration. Used to offer only gateways one can sign up to.
    pub fn items_with_category_and_type(&self, category: &str, kind: &str) -> Vec<&DiscoItem> {
        self.completed
            .values()
            .flatten()
            .filter(|item| {
                item.identities
                    .iter()
                    .any(|id| id.category == category && id.kind == kind)
                    && item.has_feature(ns::REGISTER)
            })
            .collect()
    }
}
