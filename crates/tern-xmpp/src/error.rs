use thiserror::Error;

/// Failures while establishing or keeping a session.
#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("connection could not be established: {0}")]
    NoConnection(String),

    #[error("host could not be resolved: {0}")]
    NoSuchHost(String),

    #[error("connection attempt timed out")]
    TimedOut,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("account address is not usable: {0}")]
    InvalidUser(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream error: {0}")]
    Stream(String),
}

impl ConnectionError {
    /// Whether reconnecting with the same credentials could plausibly help.
    /// The engine never retries on its own; this is a hint for callers.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ConnectionError::AuthFailed(_) | ConnectionError::InvalidUser(_)
        )
    }
}

/// Peer-reported failures carried inside reply stanzas, classified from the
/// numeric code on the `<error/>` child. Absence of an error child always
/// means success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StanzaError {
    #[error("service unavailable")]
    Unavailable,

    #[error("reply could not be understood")]
    InvalidReply,

    #[error("unknown host")]
    UnknownHost,

    #[error("nickname already in use")]
    NickInUse,

    #[error("user already exists")]
    DuplicateUser,

    #[error("not authorized")]
    Unauthorized,

    #[error("peer reported error code {0}")]
    Specific(u16),

    #[error("unknown error")]
    Unknown,
}

/// Errors surfaced by session operations after login.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("operation requires an active session")]
    NotReady,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Registration(#[from] crate::register::RegistrationError),
}
