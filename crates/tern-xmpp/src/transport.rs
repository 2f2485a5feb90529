use std::collections::{HashSet, VecDeque};
use std::str::FromStr;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use minidom::Element;
use sasl::client::mechanisms::{Plain, Scram};
use sasl::client::Mechanism;
use sasl::common::scram::{Sha1, Sha256};
use sasl::common::{ChannelBinding, Credentials};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::addr::Address;
use crate::error::ConnectionError;
use crate::framer::{ensure_default_ns, FrameEvent, StanzaFramer};
use crate::stanza::ns;

pub const DEFAULT_PORT: u16 = 5222;
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 8192;
const BIND_REQUEST_ID: &str = "resource-bind";

/// Where and how a transport should connect.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// XMPP domain the stream is addressed to.
    pub domain: String,
    /// Host to dial; defaults to the domain.
    pub server: Option<String>,
    pub port: Option<u16>,
}

impl TransportConfig {
    pub fn host(&self) -> &str {
        self.server.as_deref().unwrap_or(&self.domain)
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }
}

/// Byte-level connection to an XMPP server.
///
/// `connect` establishes the link and performs the stream handshake;
/// `authenticate` runs SASL and resource binding and returns the address the
/// server bound. After that the transport only moves whole frames.
#[allow(async_fn_in_trait)]
pub trait XmppTransport: Send + 'static {
    async fn connect(config: &TransportConfig) -> Result<Self, ConnectionError>
    where
        Self: Sized;

    async fn authenticate(
        &mut self,
        jid: &Address,
        password: &str,
    ) -> Result<Address, ConnectionError>;

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError>;

    /// Wait for the next complete inbound frame.
    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError>;

    async fn close(&mut self) -> Result<(), ConnectionError>;
}

// ── SASL mechanism selection ──────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectedMechanism {
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SelectedMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SelectedMechanism::ScramSha256 => "SCRAM-SHA-256",
            SelectedMechanism::ScramSha1 => "SCRAM-SHA-1",
            SelectedMechanism::Plain => "PLAIN",
        }
    }
}

impl std::fmt::Display for SelectedMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

const MECHANISM_PREFERENCE: &[SelectedMechanism] = &[
    SelectedMechanism::ScramSha256,
    SelectedMechanism::ScramSha1,
    SelectedMechanism::Plain,
];

pub fn select_mechanism(server_mechanisms: &HashSet<String>) -> Option<SelectedMechanism> {
    MECHANISM_PREFERENCE
        .iter()
        .find(|m| server_mechanisms.contains(m.name()))
        .copied()
}

fn build_mechanism(
    selected: SelectedMechanism,
    credentials: &Credentials,
) -> Result<Box<dyn Mechanism + Send>, ConnectionError> {
    match selected {
        SelectedMechanism::ScramSha256 => Scram::<Sha256>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                ConnectionError::AuthFailed(format!("failed to initialize SCRAM-SHA-256: {e:?}"))
            }),
        SelectedMechanism::ScramSha1 => Scram::<Sha1>::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                ConnectionError::AuthFailed(format!("failed to initialize SCRAM-SHA-1: {e:?}"))
            }),
        SelectedMechanism::Plain => Plain::from_credentials(credentials.clone())
            .map(|m| Box::new(m) as Box<dyn Mechanism + Send>)
            .map_err(|e| {
                ConnectionError::AuthFailed(format!("failed to initialize PLAIN: {e:?}"))
            }),
    }
}

// ── TCP transport ─────────────────────────────────────────────────

/// Plain-TCP transport speaking the `jabber:client` stream protocol.
pub struct TcpTransport {
    stream: TcpStream,
    framer: StanzaFramer,
    pending: VecDeque<String>,
    features: Option<Element>,
    domain: String,
}

impl TcpTransport {
    async fn open_stream(&mut self) -> Result<(), ConnectionError> {
        let header = format!(
            "<?xml version='1.0'?><stream:stream to='{}' xmlns='{}' xmlns:stream='{}' version='1.0'>",
            self.domain,
            ns::CLIENT,
            ns::STREAM,
        );
        self.write_all(header.as_bytes()).await?;

        // The server answers with its own header followed by features.
        let mut opened = false;
        loop {
            for event in self.read_events().await? {
                match event {
                    FrameEvent::StreamOpen => opened = true,
                    FrameEvent::StreamClose => {
                        return Err(ConnectionError::Stream(
                            "server closed the stream during negotiation".to_string(),
                        ));
                    }
                    FrameEvent::Stanza(frame) => {
                        if !opened {
                            return Err(ConnectionError::Stream(format!(
                                "unexpected frame before stream header: {frame}"
                            )));
                        }
                        let element = parse_frame(&frame)?;
                        if element.name() == "features" || frame.starts_with("<stream:features") {
                            self.features = Some(element);
                            return Ok(());
                        }
                        trace!(frame, "ignoring pre-features frame");
                    }
                }
            }
        }
    }

    async fn next_frame(&mut self) -> Result<String, ConnectionError> {
        loop {
            if let Some(frame) = self.pending.pop_front() {
                return Ok(frame);
            }
            for event in self.read_events().await? {
                match event {
                    FrameEvent::Stanza(frame) => self.pending.push_back(frame),
                    FrameEvent::StreamClose => {
                        return Err(ConnectionError::Stream(
                            "stream closed by peer".to_string(),
                        ));
                    }
                    FrameEvent::StreamOpen => {}
                }
            }
        }
    }

    async fn read_events(&mut self) -> Result<Vec<FrameEvent>, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = self
            .stream
            .read(&mut chunk)
            .await
            .map_err(|error| ConnectionError::Transport(format!("read failed: {error}")))?;
        if n == 0 {
            return Err(ConnectionError::Transport(
                "connection closed by peer".to_string(),
            ));
        }
        self.framer.push(&chunk[..n])
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        let write = async {
            self.stream.write_all(data).await?;
            self.stream.flush().await
        };
        match tokio::time::timeout(WRITE_TIMEOUT, write).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(ConnectionError::Transport(format!("write failed: {error}"))),
            Err(_) => Err(ConnectionError::TimedOut),
        }
    }

    fn server_mechanisms(&self) -> HashSet<String> {
        self.features
            .as_ref()
            .and_then(|features| features.get_child("mechanisms", ns::SASL))
            .map(|mechanisms| {
                mechanisms
                    .children()
                    .filter(|child| child.name() == "mechanism")
                    .map(Element::text)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn restart_stream(&mut self) -> Result<(), ConnectionError> {
        self.framer.reset();
        self.pending.clear();
        self.features = None;
        self.open_stream().await
    }

    async fn bind_resource(&mut self, jid: &Address) -> Result<Address, ConnectionError> {
        let can_bind = self
            .features
            .as_ref()
            .is_some_and(|features| features.get_child("bind", ns::BIND).is_some());
        if !can_bind {
            return Ok(jid.clone());
        }

        let mut bind = Element::builder("bind", ns::BIND);
        if let Some(resource) = jid.resource() {
            bind = bind.append(
                Element::builder("resource", ns::BIND)
                    .append(resource)
                    .build(),
            );
        }
        let request = crate::stanza::iq_set(BIND_REQUEST_ID, None, bind.build());
        self.write_all(&crate::stanza::serialize(&request)).await?;

        loop {
            let frame = self.next_frame().await?;
            let element = parse_frame(&frame)?;
            if element.name() != "iq" || element.attr("id") != Some(BIND_REQUEST_ID) {
                // Not ours; keep it for the session.
                self.pending.push_back(frame);
                continue;
            }

            if element.attr("type") != Some("result") {
                return Err(ConnectionError::Stream(
                    "invalid response to resource binding".to_string(),
                ));
            }

            let bound = element
                .get_child("bind", ns::BIND)
                .and_then(|bind| bind.get_child("jid", ns::BIND))
                .map(Element::text);
            return match bound {
                Some(raw) => Address::parse(&raw).map_err(|error| {
                    ConnectionError::Stream(format!("invalid bound address: {error}"))
                }),
                None => Ok(jid.clone()),
            };
        }
    }
}

impl XmppTransport for TcpTransport {
    async fn connect(config: &TransportConfig) -> Result<Self, ConnectionError> {
        let host = config.host().to_string();
        let port = config.port();

        debug!(%host, port, "connecting");
        let stream = TcpStream::connect((host.as_str(), port))
            .await
            .map_err(|error| map_connect_error(&host, &error))?;

        let mut transport = Self {
            stream,
            framer: StanzaFramer::new(),
            pending: VecDeque::new(),
            features: None,
            domain: config.domain.clone(),
        };
        transport.open_stream().await?;
        Ok(transport)
    }

    async fn authenticate(
        &mut self,
        jid: &Address,
        password: &str,
    ) -> Result<Address, ConnectionError> {
        let username = jid.node().ok_or_else(|| {
            ConnectionError::InvalidUser(format!("{jid} has no user part to authenticate as"))
        })?;

        let server_mechanisms = self.server_mechanisms();
        debug!(mechanisms = ?server_mechanisms, "server advertised SASL mechanisms");

        let selected = select_mechanism(&server_mechanisms).ok_or_else(|| {
            ConnectionError::AuthFailed(format!(
                "no supported SASL mechanism found; server offers: {}",
                server_mechanisms
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;
        debug!(mechanism = %selected, "selected SASL mechanism");

        let credentials = Credentials::default()
            .with_username(username)
            .with_password(password)
            .with_channel_binding(ChannelBinding::Unsupported);
        let mut mechanism = build_mechanism(selected, &credentials)?;

        let initial = mechanism.initial();
        let auth = Element::builder("auth", ns::SASL)
            .attr("mechanism", selected.name())
            .append(BASE64.encode(&initial))
            .build();
        self.write_all(&crate::stanza::serialize(&auth)).await?;

        loop {
            let frame = self.next_frame().await?;
            let element = parse_frame(&frame)?;
            match element.name() {
                "challenge" => {
                    let challenge = decode_sasl_text(&element)?;
                    let response_data = mechanism.response(&challenge).map_err(|e| {
                        ConnectionError::AuthFailed(format!("SASL challenge-response failed: {e:?}"))
                    })?;
                    let response = Element::builder("response", ns::SASL)
                        .append(BASE64.encode(&response_data))
                        .build();
                    self.write_all(&crate::stanza::serialize(&response)).await?;
                }
                "success" => {
                    let data = decode_sasl_text(&element)?;
                    if let Err(e) = mechanism.success(&data) {
                        warn!(error = ?e, "server signature verification failed");
                        return Err(ConnectionError::AuthFailed(format!(
                            "server signature verification failed: {e:?}"
                        )));
                    }
                    debug!("SASL authentication succeeded");
                    break;
                }
                "failure" => {
                    let condition = element
                        .children()
                        .next()
                        .map(|child| child.name().to_string())
                        .unwrap_or_else(|| "unknown condition".to_string());
                    debug!(condition, "SASL authentication failed");
                    return Err(ConnectionError::AuthFailed(condition));
                }
                other => trace!(element = other, "ignoring frame during SASL negotiation"),
            }
        }

        self.restart_stream().await?;
        self.bind_resource(jid).await
    }

    async fn send(&mut self, data: &[u8]) -> Result<(), ConnectionError> {
        self.write_all(data).await
    }

    async fn recv(&mut self) -> Result<Vec<u8>, ConnectionError> {
        let frame = self.next_frame().await?;
        if frame.starts_with("<stream:") {
            return Err(ConnectionError::Stream(format!(
                "stream-level error: {frame}"
            )));
        }
        Ok(ensure_default_ns(&frame).into_bytes())
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        // Best effort; the peer may already be gone.
        let _ = self.write_all(b"</stream:stream>").await;
        self.stream
            .shutdown()
            .await
            .map_err(|error| ConnectionError::Transport(format!("shutdown failed: {error}")))
    }
}

fn map_connect_error(host: &str, error: &std::io::Error) -> ConnectionError {
    let text = error.to_string();
    let is_resolution_failure = matches!(
        error.kind(),
        std::io::ErrorKind::NotFound | std::io::ErrorKind::AddrNotAvailable
    ) || text.contains("failed to lookup")
        || text.contains("Name or service not known")
        || text.contains("nodename nor servname");

    if is_resolution_failure {
        ConnectionError::NoSuchHost(host.to_string())
    } else if error.kind() == std::io::ErrorKind::TimedOut {
        ConnectionError::TimedOut
    } else {
        ConnectionError::NoConnection(text)
    }
}

/// Parse a frame into a DOM element, restoring the default namespace the
/// envelope carried. `stream:features` is renamed on the way in because its
/// prefix is declared on the envelope root we never hand to the DOM parser.
fn parse_frame(frame: &str) -> Result<Element, ConnectionError> {
    let normalized = normalize_features(frame);
    let stamped = ensure_default_ns(&normalized);
    Element::from_str(&stamped)
        .map_err(|error| ConnectionError::Stream(format!("unparseable frame: {error}")))
}

fn normalize_features(frame: &str) -> String {
    if !frame.starts_with("<stream:features") {
        return frame.to_string();
    }
    frame
        .replacen("<stream:features", &format!("<features xmlns='{}'", ns::STREAM), 1)
        .replace("</stream:features>", "</features>")
}

fn decode_sasl_text(element: &Element) -> Result<Vec<u8>, ConnectionError> {
    let text = element.text();
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "=" {
        return Ok(Vec::new());
    }
    BASE64
        .decode(trimmed)
        .map_err(|error| ConnectionError::Stream(format!("invalid base64 in SASL frame: {error}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selects_scram_sha256_when_available() {
        let server = HashSet::from([
            "PLAIN".to_string(),
            "SCRAM-SHA-1".to_string(),
            "SCRAM-SHA-256".to_string(),
        ]);
        assert_eq!(
            select_mechanism(&server),
            Some(SelectedMechanism::ScramSha256)
        );
    }

    #[test]
    fn falls_back_to_scram_sha1() {
        let server = HashSet::from(["PLAIN".to_string(), "SCRAM-SHA-1".to_string()]);
        assert_eq!(select_mechanism(&server), Some(SelectedMechanism::ScramSha1));
    }

    #[test]
    fn falls_back_to_plain() {
        let server = HashSet::from(["PLAIN".to_string()]);
        assert_eq!(select_mechanism(&server), Some(SelectedMechanism::Plain));
    }

    #[test]
    fn returns_none_when_no_supported_mechanism() {
        let server = HashSet::from(["EXTERNAL".to_string(), "GSSAPI".to_string()]);
        assert_eq!(select_mechanism(&server), None);
    }

    #[test]
    fn build_mechanism_produces_each_variant() {
        let creds = Credentials::default()
            .with_username("alice")
            .with_password("secret")
            .with_channel_binding(ChannelBinding::Unsupported);
        for (selected, name) in [
            (SelectedMechanism::ScramSha256, "SCRAM-SHA-256"),
            (SelectedMechanism::ScramSha1, "SCRAM-SHA-1"),
            (SelectedMechanism::Plain, "PLAIN"),
        ] {
            let mechanism = build_mechanism(selected, &creds).expect("mechanism should build");
            assert_eq!(mechanism.name(), name);
        }
    }

    #[test]
    fn normalize_features_rewrites_prefixed_form() {
        let frame = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'>\
                     <mechanism>PLAIN</mechanism></mechanisms></stream:features>";
        let element = parse_frame(frame).expect("features should parse");
        assert_eq!(element.name(), "features");
        assert!(element.get_child("mechanisms", ns::SASL).is_some());
    }

    #[test]
    fn parse_frame_stamps_missing_default_ns() {
        let element = parse_frame("<presence from='a@b/c'/>").expect("should parse");
        assert_eq!(element.name(), "presence");
        assert_eq!(element.attr("from"), Some("a@b/c"));
    }

    #[test]
    fn decode_sasl_text_handles_empty_and_padding_markers() {
        let empty = Element::builder("success", ns::SASL).build();
        assert!(decode_sasl_text(&empty).expect("decode").is_empty());

        let marker = Element::builder("success", ns::SASL).append("=").build();
        assert!(decode_sasl_text(&marker).expect("decode").is_empty());

        let data = Element::builder("challenge", ns::SASL)
            .append(BASE64.encode(b"hello"))
            .build();
        assert_eq!(decode_sasl_text(&data).expect("decode"), b"hello");
    }

    #[test]
    fn connect_error_mapping() {
        let refused =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        assert!(matches!(
            map_connect_error("example.com", &refused),
            ConnectionError::NoConnection(_)
        ));

        let lookup = std::io::Error::other("failed to lookup address information");
        assert!(matches!(
            map_connect_error("example.com", &lookup),
            ConnectionError::NoSuchHost(host) if host == "example.com"
        ));

        let timed_out = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        assert!(matches!(
            map_connect_error("example.com", &timed_out),
            ConnectionError::TimedOut
        ));
    }

    #[test]
    fn transport_config_defaults() {
        let config = TransportConfig {
            domain: "example.com".to_string(),
            server: None,
            port: None,
        };
        assert_eq!(config.host(), "example.com");
        assert_eq!(config.port(), DEFAULT_PORT);

        let overridden = TransportConfig {
            domain: "example.com".to_string(),
            server: Some("talk.example.net".to_string()),
            port: Some(5223),
        };
        assert_eq!(overridden.host(), "talk.example.net");
        assert_eq!(overridden.port(), 5223);
    }
}
