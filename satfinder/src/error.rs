//! Error taxonomy for the session orchestrator.
//!
//! Startup errors abort the whole run before any session exists; session
//! errors stay confined to the session that raised them and surface as a
//! degraded state in that session's report.

use thiserror::Error;

use satip_protocol::{ProtocolError, ValidationError};

/// Errors raised before any tuner session is created. Nothing is left
/// partially running when one of these is returned.
#[derive(Debug, Error)]
pub enum StartError {
    /// More tune requests than the server has tuners.
    #[error("not enough tuners on the server: requested {requested}, available {available}")]
    InsufficientTuners { requested: usize, available: usize },

    /// A tune request failed validation.
    #[error("invalid tune request: {0}")]
    Validation(#[from] ValidationError),

    /// No tune requests were given.
    #[error("at least one tune request is required")]
    NoTuneRequests,

    /// The deterministic port plan ran past the end of the port range.
    #[error("client port pair for session {index} exceeds the UDP port range")]
    PortRange { index: usize },

    /// A claimed status port pair could not be bound locally.
    #[error("failed to bind status ports {rtp}-{rtcp}: {source}")]
    PortBind {
        rtp: u16,
        rtcp: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Per-session errors. One session failing never tears down its siblings.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The server refused the SETUP request (all tuners busy, bad
    /// parameters on the server side, ...).
    #[error("server rejected SETUP with status {status}")]
    SetupRejected { status: u16 },

    /// The SETUP reply could not be parsed.
    #[error("malformed SETUP reply: {0}")]
    SetupMalformed(ProtocolError),

    /// Some other control reply could not be parsed.
    #[error("malformed control reply: {0}")]
    MalformedReply(#[from] ProtocolError),

    /// The server refused the PLAY request.
    #[error("server rejected PLAY with status {status}")]
    PlayRejected { status: u16 },

    /// The control connection failed at the socket level.
    #[error("control connection failed: {0}")]
    Control(#[from] std::io::Error),

    /// A control reply did not arrive within the reply timeout.
    #[error("control reply timed out")]
    ControlTimeout,

    /// Keep-alives failed consecutively up to the failure limit.
    #[error("keep-alive failed {failures} consecutive times")]
    KeepAliveFailure { failures: u32 },

    /// All reconnect attempts after a keep-alive failure were exhausted.
    #[error("reconnect budget exhausted after {attempts} attempts: {last}")]
    ReconnectExhausted {
        attempts: u32,
        #[source]
        last: Box<SessionError>,
    },
}
