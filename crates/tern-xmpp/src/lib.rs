//! XMPP protocol engine for Tern.
//!
//! The engine is built around a single [`session::Session`] task that owns the
//! transport and a set of synchronous subsystem managers (roster, chatrooms,
//! service discovery, gateway registration, profiles, typing notifications).
//! Inbound stanzas flow through ordered handler chains; everything the
//! application needs to know leaves through the `tern-core` event bus, and
//! request-scoped results are delivered through per-request callbacks.

pub mod addr;
pub mod composing;
pub mod disco;
pub mod dispatch;
pub mod error;
pub mod framer;
pub mod muc;
pub mod register;
pub mod roster;
pub mod session;
pub mod stanza;
pub mod transport;
pub mod vcard;

#[cfg(test)]
pub(crate) mod testutil;

pub use addr::{Address, AddressError, BareKey};
pub use error::{ConnectionError, SessionError, StanzaError};
pub use muc::{ChatroomDef, ChatroomId, ChatroomStatus, JoinOutcome};
pub use register::{RegistrationError, RegistrationField, RegistrationValues, Requirements};
pub use session::{CredentialSource, Session, SessionConfig, SessionState};
pub use transport::{TransportConfig, XmppTransport};
pub use vcard::{Avatar, Profile};
