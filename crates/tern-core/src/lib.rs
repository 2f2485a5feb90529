//! Shared foundation for the Tern messaging engine: the typed event bus that
//! carries protocol events to the embedding application, the TOML
//! configuration layer, and the error types both of them use.

pub mod config;
pub mod error;
pub mod event;

pub use error::{ConfigError, EventBusError};
pub use event::{
    BroadcastEventBus, Channel, ContactInfo, Event, EventBus, EventPayload, EventSource,
    EventSubscription, PresenceShow, Subscription,
};
