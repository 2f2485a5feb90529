use std::sync::{Arc, Mutex};

use tern_core::error::EventBusError;
use tern_core::event::{BroadcastEventBus, Event, EventBus, EventPayload, EventSubscription};

/// Event bus that records every published payload for assertions while
/// still delegating to a real broadcast bus.
pub struct RecordingBus {
    inner: BroadcastEventBus,
    events: Mutex<Vec<Event>>,
}

impl RecordingBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: BroadcastEventBus::default(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn payloads(&self) -> Vec<EventPayload> {
        self.events
            .lock()
            .expect("recording bus lock should not be poisoned")
            .iter()
            .map(|event| event.payload.clone())
            .collect()
    }

    pub fn channels(&self) -> Vec<String> {
        self.events
            .lock()
            .expect("recording bus lock should not be poisoned")
            .iter()
            .map(|event| event.channel.as_str().to_string())
            .collect()
    }

    pub fn clear(&self) {
        self.events
            .lock()
            .expect("recording bus lock should not be poisoned")
            .clear();
    }
}

impl EventBus for RecordingBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        self.events
            .lock()
            .expect("recording bus lock should not be poisoned")
            .push(event.clone());
        self.inner.publish(event)
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        self.inner.subscribe(pattern)
    }
}
