use std::collections::HashMap;

use tokio::time::Instant;
use tracing::trace;

use crate::addr::BareKey;
use crate::stanza::{Stanza, StanzaKind};

/// Outcome of offering a stanza to one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The handler consumed the stanza; stop the chain.
    Claimed,
    /// Not for this handler; offer it to the next one.
    Pass,
}

pub type Handler<S> = Box<dyn FnMut(&mut S, &Stanza, Instant) -> Claim + Send>;

/// Ordered chain of named handlers. Handlers run in registration order and
/// the first claim short-circuits the rest, so registration order is the
/// priority order.
pub struct HandlerChain<S> {
    handlers: Vec<(&'static str, Handler<S>)>,
}

impl<S> HandlerChain<S> {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn register(&mut self, name: &'static str, handler: Handler<S>) {
        self.handlers.push((name, handler));
    }

    pub fn dispatch(&mut self, state: &mut S, stanza: &Stanza, now: Instant) -> Claim {
        for (name, handler) in &mut self.handlers {
            if handler(state, stanza, now) == Claim::Claimed {
                trace!(handler = *name, "stanza claimed");
                return Claim::Claimed;
            }
        }
        Claim::Pass
    }
}

impl<S> Default for HandlerChain<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// One chain per stanza kind.
pub struct Dispatcher<S> {
    pub message: HandlerChain<S>,
    pub presence: HandlerChain<S>,
    pub iq: HandlerChain<S>,
}

impl<S> Dispatcher<S> {
    pub fn new() -> Self {
        Self {
            message: HandlerChain::new(),
            presence: HandlerChain::new(),
            iq: HandlerChain::new(),
        }
    }

    pub fn dispatch(&mut self, state: &mut S, stanza: &Stanza, now: Instant) -> Claim {
        match stanza.kind() {
            StanzaKind::Message => self.message.dispatch(state, stanza, now),
            StanzaKind::Presence => self.presence.dispatch(state, stanza, now),
            StanzaKind::Iq => self.iq.dispatch(state, stanza, now),
        }
    }
}

impl<S> Default for Dispatcher<S> {
    fn default() -> Self {
        Self::new()
    }
}

/// What an outstanding iq request was for, so its reply can be routed to the
/// right subsystem without keeping a closure per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingKind {
    RosterPull,
    DiscoItems { target: BareKey },
    DiscoInfo { target: BareKey },
    Registration { target: BareKey },
    RegistrationSubmit { target: BareKey },
    VcardGet,
    VcardSet,
}

struct PendingEntry {
    kind: PendingKind,
    deadline: Option<Instant>,
}

/// Outstanding iq requests keyed by stanza id.
///
/// An entry leaves the registry exactly once: either claimed by the reply
/// that matches its id, or expired by the deadline sweep. A reply arriving
/// after expiry finds nothing and is treated as stale.
#[derive(Default)]
pub struct IqRegistry {
    pending: HashMap<String, PendingEntry>,
}

impl IqRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, id: String, kind: PendingKind, deadline: Option<Instant>) {
        self.pending.insert(id, PendingEntry { kind, deadline });
    }

    /// Remove and return the entry for a reply id, if still outstanding.
    pub fn claim(&mut self, id: &str) -> Option<PendingKind> {
        self.pending.remove(id).map(|entry| entry.kind)
    }

    /// Drop every entry matching the predicate, without running anything.
    /// Used when a request cycle is superseded and its replies must become
    /// stale.
    pub fn discard<F>(&mut self, predicate: F)
    where
        F: Fn(&PendingKind) -> bool,
    {
        self.pending.retain(|_, entry| !predicate(&entry.kind));
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending
            .values()
            .filter_map(|entry| entry.deadline)
            .min()
    }

    /// Remove and return every entry whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, PendingKind)> {
        let expired_ids: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.deadline.is_some_and(|deadline| deadline <= now))
            .map(|(id, _)| id.clone())
            .collect();

        expired_ids
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|entry| (id, entry.kind)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::addr::Address;

    fn key(text: &str) -> BareKey {
        BareKey::from(&Address::parse(text).expect("address should parse"))
    }

    fn stanza(xml: &str) -> Stanza {
        Stanza::parse(xml.as_bytes()).expect("stanza should parse")
    }

    #[test]
    fn claim_removes_entry_exactly_once() {
        let mut registry = IqRegistry::new();
        registry.register("a1".to_string(), PendingKind::RosterPull, None);

        assert_eq!(registry.claim("a1"), Some(PendingKind::RosterPull));
        assert_eq!(registry.claim("a1"), None);
    }

    #[test]
    fn claim_of_unknown_id_is_none() {
        let mut registry = IqRegistry::new();
        assert_eq!(registry.claim("nope"), None);
    }

    #[test]
    fn expire_removes_only_overdue_entries() {
        let mut registry = IqRegistry::new();
        let now = Instant::now();
        registry.register(
            "soon".to_string(),
            PendingKind::DiscoItems {
                target: key("conference.example.com"),
            },
            Some(now + Duration::from_secs(5)),
        );
        registry.register(
            "later".to_string(),
            PendingKind::DiscoItems {
                target: key("other.example.com"),
            },
            Some(now + Duration::from_secs(50)),
        );
        registry.register("never".to_string(), PendingKind::RosterPull, None);

        let expired = registry.expire(now + Duration::from_secs(10));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, "soon");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn expired_entry_cannot_be_claimed() {
        let mut registry = IqRegistry::new();
        let now = Instant::now();
        registry.register(
            "d1".to_string(),
            PendingKind::VcardGet,
            Some(now + Duration::from_secs(1)),
        );

        let expired = registry.expire(now + Duration::from_secs(2));
        assert_eq!(expired.len(), 1);
        assert_eq!(registry.claim("d1"), None);
    }

    #[test]
    fn next_deadline_is_earliest() {
        let mut registry = IqRegistry::new();
        let now = Instant::now();
        assert_eq!(registry.next_deadline(), None);

        registry.register(
            "b".to_string(),
            PendingKind::VcardSet,
            Some(now + Duration::from_secs(30)),
        );
        registry.register(
            "a".to_string(),
            PendingKind::VcardGet,
            Some(now + Duration::from_secs(10)),
        );
        registry.register("c".to_string(), PendingKind::RosterPull, None);

        assert_eq!(registry.next_deadline(), Some(now + Duration::from_secs(10)));
    }

    #[test]
    fn discard_drops_matching_entries() {
        let mut registry = IqRegistry::new();
        let target = key("conference.example.com");
        registry.register(
            "i1".to_string(),
            PendingKind::DiscoInfo {
                target: target.clone(),
            },
            None,
        );
        registry.register("r1".to_string(), PendingKind::RosterPull, None);

        registry.discard(|kind| matches!(kind, PendingKind::DiscoInfo { target: t } if *t == target));
        assert_eq!(registry.claim("i1"), None);
        assert_eq!(registry.claim("r1"), Some(PendingKind::RosterPull));
    }

    #[test]
    fn chain_runs_in_registration_order_and_short_circuits() {
        let mut chain: HandlerChain<Vec<&'static str>> = HandlerChain::new();
        chain.register(
            "first",
            Box::new(|log, _, _| {
                log.push("first");
                Claim::Pass
            }),
        );
        chain.register(
            "second",
            Box::new(|log, _, _| {
                log.push("second");
                Claim::Claimed
            }),
        );
        chain.register(
            "third",
            Box::new(|log, _, _| {
                log.push("third");
                Claim::Pass
            }),
        );

        let mut log = Vec::new();
        let result = chain.dispatch(
            &mut log,
            &stanza("<presence xmlns='jabber:client'/>"),
            Instant::now(),
        );

        assert_eq!(result, Claim::Claimed);
        assert_eq!(log, ["first", "second"]);
    }

    #[test]
    fn chain_passes_when_no_handler_claims() {
        let mut chain: HandlerChain<()> = HandlerChain::new();
        chain.register("only", Box::new(|_, _, _| Claim::Pass));

        let result = chain.dispatch(
            &mut (),
            &stanza("<presence xmlns='jabber:client'/>"),
            Instant::now(),
        );
        assert_eq!(result, Claim::Pass);
    }

    #[test]
    fn dispatcher_routes_by_stanza_kind() {
        let mut dispatcher: Dispatcher<Vec<&'static str>> = Dispatcher::new();
        dispatcher.message.register(
            "m",
            Box::new(|log, _, _| {
                log.push("message");
                Claim::Claimed
            }),
        );
        dispatcher.iq.register(
            "i",
            Box::new(|log, _, _| {
                log.push("iq");
                Claim::Claimed
            }),
        );

        let mut log = Vec::new();
        let now = Instant::now();
        dispatcher.dispatch(
            &mut log,
            &stanza("<message xmlns='jabber:client'><body>x</body></message>"),
            now,
        );
        dispatcher.dispatch(
            &mut log,
            &stanza("<iq xmlns='jabber:client' type='result' id='1'/>"),
            now,
        );

        assert_eq!(log, ["message", "iq"]);
    }
}
