use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tern_core::event::{emit, EventBus, EventPayload, EventSource};
use tokio::time::Instant;
use tracing::debug;

use crate::addr::BareKey;
use crate::dispatch::Claim;
use crate::stanza::{ns, Stanza};

/// A peer that says it is composing but then goes silent is considered to
/// have stopped after this long.
pub const COMPOSING_TIMEOUT: Duration = Duration::from_secs(45);

/// Tracks which 1:1 peers are currently typing, with a deadline per peer so
/// a client that crashes mid-sentence does not leave its indicator on
/// forever.
pub struct ComposingTracker {
    deadlines: HashMap<BareKey, Instant>,
    event_bus: Arc<dyn EventBus>,
}

impl ComposingTracker {
    pub fn new(event_bus: Arc<dyn EventBus>) -> Self {
        Self {
            deadlines: HashMap::new(),
            event_bus,
        }
    }

    /// Inspect a message for chat-state notifications. Never claims: the
    /// chat-state rides alongside content other handlers still need.
    pub fn handle_message(&mut self, stanza: &Stanza, now: Instant) -> Claim {
        if matches!(stanza.type_attr(), Some("groupchat") | Some("error")) {
            return Claim::Pass;
        }
        let Some(from) = stanza.from_addr() else {
            return Claim::Pass;
        };
        let key = BareKey::from(&from);

        if stanza.body().is_some() {
            // The delivered message supersedes any indicator; the message
            // event itself tells the UI the peer is done.
            self.deadlines.remove(&key);
            return Claim::Pass;
        }

        if stanza.payload("composing", ns::CHATSTATES).is_some() {
            self.deadlines.insert(key.clone(), now + COMPOSING_TIMEOUT);
            self.emit_indicator(&key, true);
        } else if has_other_chatstate(stanza) && self.deadlines.remove(&key).is_some() {
            self.emit_indicator(&key, false);
        }

        Claim::Pass
    }

    /// Turn off every indicator whose deadline has passed.
    pub fn expire(&mut self, now: Instant) {
        let overdue: Vec<BareKey> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        for key in overdue {
            debug!(peer = %key, "composing indicator timed out");
            self.deadlines.remove(&key);
            self.emit_indicator(&key, false);
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }

    pub fn is_composing(&self, key: &BareKey) -> bool {
        self.deadlines.contains_key(key)
    }

    fn emit_indicator(&self, key: &BareKey, active: bool) {
        emit(
            self.event_bus.as_ref(),
            "contact.composing",
            EventSource::Contact,
            EventPayload::Composing {
                from: key.as_str().to_string(),
                active,
            },
        );
    }
}

fn has_other_chatstate(stanza: &Stanza) -> bool {
    ["active", "paused", "inactive", "gone"]
        .iter()
        .any(|state| stanza.payload(state, ns::CHATSTATES).is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Address;
    use crate::testutil::RecordingBus;

    fn tracker() -> (ComposingTracker, Arc<RecordingBus>) {
        let bus = RecordingBus::new();
        (ComposingTracker::new(bus.clone()), bus)
    }

    fn message(xml: &str) -> Stanza {
        Stanza::parse(xml.as_bytes()).expect("message should parse")
    }

    fn alice() -> BareKey {
        BareKey::from(&Address::parse("alice@example.com").expect("parse"))
    }

    const COMPOSING: &str = "<message xmlns='jabber:client' type='chat' \
         from='alice@example.com/home'>\
         <composing xmlns='http://jabber.org/protocol/chatstates'/></message>";

    #[test]
    fn composing_notification_arms_indicator() {
        let (mut tracker, bus) = tracker();
        let now = Instant::now();

        let claim = tracker.handle_message(&message(COMPOSING), now);
        assert_eq!(claim, Claim::Pass);
        assert!(tracker.is_composing(&alice()));
        assert_eq!(tracker.next_deadline(), Some(now + COMPOSING_TIMEOUT));
        assert!(matches!(
            &bus.payloads()[0],
            EventPayload::Composing { from, active: true } if from == "alice@example.com"
        ));
    }

    #[test]
    fn paused_notification_turns_indicator_off() {
        let (mut tracker, bus) = tracker();
        let now = Instant::now();
        tracker.handle_message(&message(COMPOSING), now);
        bus.clear();

        tracker.handle_message(
            &message(
                "<message xmlns='jabber:client' type='chat' from='alice@example.com/home'>\
                 <paused xmlns='http://jabber.org/protocol/chatstates'/></message>",
            ),
            now,
        );

        assert!(!tracker.is_composing(&alice()));
        assert!(matches!(
            &bus.payloads()[0],
            EventPayload::Composing { active: false, .. }
        ));
    }

    #[test]
    fn stop_without_prior_start_emits_nothing() {
        let (mut tracker, bus) = tracker();
        tracker.handle_message(
            &message(
                "<message xmlns='jabber:client' type='chat' from='alice@example.com/home'>\
                 <active xmlns='http://jabber.org/protocol/chatstates'/></message>",
            ),
            Instant::now(),
        );
        assert!(bus.payloads().is_empty());
    }

    #[test]
    fn delivered_body_cancels_silently() {
        let (mut tracker, bus) = tracker();
        let now = Instant::now();
        tracker.handle_message(&message(COMPOSING), now);
        bus.clear();

        tracker.handle_message(
            &message(
                "<message xmlns='jabber:client' type='chat' from='alice@example.com/home'>\
                 <body>done typing</body>\
                 <active xmlns='http://jabber.org/protocol/chatstates'/></message>",
            ),
            now,
        );

        assert!(!tracker.is_composing(&alice()));
        assert!(bus.payloads().is_empty());
    }

    #[test]
    fn silence_times_the_indicator_out() {
        let (mut tracker, bus) = tracker();
        let now = Instant::now();
        tracker.handle_message(&message(COMPOSING), now);
        bus.clear();

        tracker.expire(now + COMPOSING_TIMEOUT);
        assert!(!tracker.is_composing(&alice()));
        assert!(matches!(
            &bus.payloads()[0],
            EventPayload::Composing { from, active: false } if from == "alice@example.com"
        ));
        assert_eq!(tracker.next_deadline(), None);
    }

    #[test]
    fn repeat_composing_extends_the_deadline() {
        let (mut tracker, _bus) = tracker();
        let now = Instant::now();
        tracker.handle_message(&message(COMPOSING), now);
        let later = now + Duration::from_secs(30);
        tracker.handle_message(&message(COMPOSING), later);

        assert_eq!(tracker.next_deadline(), Some(later + COMPOSING_TIMEOUT));
    }

    #[test]
    fn groupchat_and_error_messages_are_ignored() {
        let (mut tracker, bus) = tracker();
        let now = Instant::now();
        tracker.handle_message(
            &message(
                "<message xmlns='jabber:client' type='groupchat' from='room@muc.example.com/a'>\
                 <composing xmlns='http://jabber.org/protocol/chatstates'/></message>",
            ),
            now,
        );
        tracker.handle_message(
            &message(
                "<message xmlns='jabber:client' type='error' from='alice@example.com/home'>\
                 <composing xmlns='http://jabber.org/protocol/chatstates'/></message>",
            ),
            now,
        );
        assert!(bus.payloads().is_empty());
        assert_eq!(tracker.next_deadline(), None);
    }

    #[test]
    fn deadlines_are_tracked_per_peer() {
        let (mut tracker, _bus) = tracker();
        let now = Instant::now();
        tracker.handle_message(&message(COMPOSING), now);
        tracker.handle_message(
            &message(
                "<message xmlns='jabber:client' type='chat' from='bob@example.com/x'>\
                 <composing xmlns='http://jabber.org/protocol/chatstates'/></message>",
            ),
            now + Duration::from_secs(10),
        );

        tracker.expire(now + COMPOSING_TIMEOUT);
        assert!(!tracker.is_composing(&alice()));
        assert!(tracker.is_composing(&BareKey::from(
            &Address::parse("bob@example.com").expect("parse")
        )));
    }
}
