//! Error types for the SAT>IP wire protocol.

use thiserror::Error;

/// Wire-level errors that can occur while parsing RTSP replies or RTCP
/// status datagrams.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// The RTSP status line did not start with `RTSP/1.0` or carried a
    /// non-numeric status code.
    #[error("Invalid RTSP status line: {0:?}")]
    InvalidStatusLine(String),

    /// An RTSP header line had no `name: value` shape.
    #[error("Invalid RTSP header line: {0:?}")]
    InvalidHeader(String),

    /// A header required by the exchange was absent from the reply.
    #[error("Missing RTSP header: {0}")]
    MissingHeader(&'static str),

    /// The `Session` header could not be split into id and timeout.
    #[error("Invalid Session header: {0:?}")]
    InvalidSessionHeader(String),

    /// The `com.ses.streamID` header was not an integer.
    #[error("Invalid com.ses.streamID header: {0:?}")]
    InvalidStreamId(String),

    /// An RTCP datagram ended before the advertised packet length.
    #[error("Truncated RTCP packet: expected {expected} bytes, got {actual}")]
    TruncatedRtcp { expected: usize, actual: usize },

    /// An RTCP packet carried a version other than 2.
    #[error("Invalid RTCP version: expected 2, got {0}")]
    InvalidRtcpVersion(u8),

    /// A SAT>IP APP record was structurally broken.
    #[error("Invalid SAT>IP APP record: {0}")]
    InvalidAppRecord(String),
}

/// Validation errors for tune requests. These are rejected before any
/// session is started.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// Frequency must be a positive number of MHz.
    #[error("Invalid frequency: {0} MHz")]
    InvalidFrequency(f64),

    /// Symbol rate must be a positive number of kSym/s.
    #[error("Invalid symbol rate: {0} kSym/s")]
    InvalidSymbolRate(u32),

    /// Polarisation must be one of h, v, l, r.
    #[error("Invalid polarisation: {0:?}")]
    InvalidPolarisation(String),

    /// Delivery system must be dvbs or dvbs2.
    #[error("Invalid delivery system: {0:?}")]
    InvalidDeliverySystem(String),

    /// FEC rate must be in the recognized set.
    #[error("Invalid FEC rate: {0:?}")]
    InvalidFecRate(String),

    /// A tune spec string did not have 5 or 6 comma-separated fields.
    #[error("Invalid tune spec {spec:?}: expected frequency,polarisation,system,symbol_rate,fec[,name]")]
    InvalidTuneSpec { spec: String },
}
