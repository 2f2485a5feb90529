use std::str::FromStr;

use minidom::Element;
use thiserror::Error;
use uuid::Uuid;

use crate::addr::Address;

/// Namespaces the engine speaks.
pub mod ns {
    pub const CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const ROSTER: &str = "jabber:iq:roster";
    pub const REGISTER: &str = "jabber:iq:register";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const DISCO_INFO: &str = "http://jabber.org/protocol/disco#info";
    pub const VCARD: &str = "vcard-temp";
    pub const CHATSTATES: &str = "http://jabber.org/protocol/chatstates";
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid UTF-8 stanza bytes: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("stanza payload is empty")]
    Empty,

    #[error("failed to parse stanza XML: {0}")]
    InvalidXml(String),

    #[error("unsupported stanza element <{0}/>")]
    UnsupportedElement(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StanzaKind {
    Message,
    Presence,
    Iq,
}

/// A message, presence, or iq stanza kept in its wire form.
///
/// Subsystems pull what they need straight off the element; nothing in the
/// engine requires a fully typed model of every extension namespace, and the
/// legacy `<error code='...'/>` attribute is easier to reach this way.
#[derive(Debug, Clone, PartialEq)]
pub struct Stanza {
    element: Element,
}

impl Stanza {
    pub fn parse(raw: &[u8]) -> Result<Self, ParseError> {
        let xml = std::str::from_utf8(raw)?;
        let trimmed = xml.trim();
        if trimmed.is_empty() {
            return Err(ParseError::Empty);
        }

        let element =
            Element::from_str(trimmed).map_err(|error| ParseError::InvalidXml(error.to_string()))?;
        Self::from_element(element)
    }

    pub fn from_element(element: Element) -> Result<Self, ParseError> {
        match element.name() {
            "message" | "presence" | "iq" => Ok(Self { element }),
            other => Err(ParseError::UnsupportedElement(other.to_string())),
        }
    }

    pub fn kind(&self) -> StanzaKind {
        match self.element.name() {
            "message" => StanzaKind::Message,
            "presence" => StanzaKind::Presence,
            _ => StanzaKind::Iq,
        }
    }

    pub fn element(&self) -> &Element {
        &self.element
    }

    pub fn id(&self) -> Option<&str> {
        self.element.attr("id")
    }

    pub fn type_attr(&self) -> Option<&str> {
        self.element.attr("type")
    }

    pub fn from_addr(&self) -> Option<Address> {
        self.element
            .attr("from")
            .and_then(|raw| Address::parse(raw).ok())
    }

    pub fn to_addr(&self) -> Option<Address> {
        self.element
            .attr("to")
            .and_then(|raw| Address::parse(raw).ok())
    }

    /// The numeric code on a legacy `<error/>` child, if any.
    pub fn error_code(&self) -> Option<u16> {
        self.element
            .get_child("error", ns::CLIENT)
            .and_then(|error| error.attr("code"))
            .and_then(|code| code.parse().ok())
    }

    pub fn has_error(&self) -> bool {
        self.element.get_child("error", ns::CLIENT).is_some()
    }

    pub fn payload(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.element.get_child(name, namespace)
    }

    pub fn body(&self) -> Option<String> {
        self.element
            .get_child("body", ns::CLIENT)
            .map(Element::text)
            .filter(|body| !body.is_empty())
    }
}

/// Generate a fresh stanza id.
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

pub fn serialize(element: &Element) -> Vec<u8> {
    let mut payload = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = element.write_to(&mut payload);
    payload
}

// ── Builders ──────────────────────────────────────────────────────

pub fn iq_get(id: &str, to: Option<&Address>, payload: Element) -> Element {
    iq("get", id, to, Some(payload))
}

pub fn iq_set(id: &str, to: Option<&Address>, payload: Element) -> Element {
    iq("set", id, to, Some(payload))
}

pub fn iq_result(id: &str, to: Option<&Address>) -> Element {
    iq("result", id, to, None)
}

/// Reply to an unhandled iq request with the legacy service-unavailable code.
pub fn iq_unavailable(id: &str, to: Option<&Address>) -> Element {
    let error = Element::builder("error", ns::CLIENT)
        .attr("code", "503")
        .attr("type", "cancel")
        .build();
    let mut reply = iq("error", id, to, None);
    reply.append_child(error);
    reply
}

fn iq(kind: &str, id: &str, to: Option<&Address>, payload: Option<Element>) -> Element {
    let mut builder = Element::builder("iq", ns::CLIENT)
        .attr("type", kind)
        .attr("id", id);
    if let Some(to) = to {
        builder = builder.attr("to", to.to_full());
    }
    if let Some(payload) = payload {
        builder = builder.append(payload);
    }
    builder.build()
}

pub struct PresenceBuilder {
    element: Element,
}

impl PresenceBuilder {
    pub fn new() -> Self {
        Self {
            element: Element::builder("presence", ns::CLIENT).build(),
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.element.set_attr("id", id);
        self
    }

    pub fn to(mut self, to: &Address) -> Self {
        self.element.set_attr("to", to.to_full());
        self
    }

    pub fn kind(mut self, kind: &str) -> Self {
        self.element.set_attr("type", kind);
        self
    }

    pub fn show(mut self, show: &str) -> Self {
        self.element
            .append_child(Element::builder("show", ns::CLIENT).append(show).build());
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.element
            .append_child(Element::builder("status", ns::CLIENT).append(status).build());
        self
    }

    pub fn priority(mut self, priority: i8) -> Self {
        self.element.append_child(
            Element::builder("priority", ns::CLIENT)
                .append(priority.to_string())
                .build(),
        );
        self
    }

    pub fn build(self) -> Element {
        self.element
    }
}

impl Default for PresenceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub fn groupchat_message(to: &Address, body: &str) -> Element {
    Element::builder("message", ns::CLIENT)
        .attr("to", to.to_bare())
        .attr("type", "groupchat")
        .attr("id", new_id())
        .append(Element::builder("body", ns::CLIENT).append(body).build())
        .build()
}
