//! SAT>IP wire protocol definitions for satfinder.
//!
//! This crate defines the wire-facing half of the tool: validated tuning
//! parameter types, RTSP/1.0 control-channel formatting and parsing, and
//! the RTCP APP status-record decoder that carries per-tuner signal
//! telemetry.
//!
//! # Example
//!
//! ```rust
//! use satip_protocol::{Method, RtspRequest, RtspResponse, TuneRequest};
//!
//! // Parse a CLI tune spec and build the SETUP request for it.
//! let request: TuneRequest = "10817.5,v,dvbs2,23000,34,BBC1HD".parse().unwrap();
//! let setup = RtspRequest::new(
//!     Method::Setup,
//!     format!("rtsp://sat.local/{}", request.stream_query(&[0])),
//! )
//! .header("Transport", "RTP/AVP;unicast;client_port=57000-57001");
//! let wire = setup.encode(1);
//!
//! // Parse the reply.
//! let raw = b"RTSP/1.0 200 OK\r\nCSeq: 1\r\ncom.ses.streamID: 3\r\nSession: abc;timeout=30\r\n\r\n";
//! let (reply, _) = RtspResponse::decode(raw).unwrap().unwrap();
//! assert_eq!(reply.stream_id().unwrap(), 3);
//! assert!(!wire.is_empty());
//! ```

pub mod error;
pub mod rtcp;
pub mod rtsp;
pub mod types;

pub use error::{ProtocolError, ValidationError};
pub use rtcp::{first_app_status, TunerStatus, LEVEL_WIRE_MAX, QUALITY_WIRE_MAX};
pub use rtsp::{Method, RtspRequest, RtspResponse, SessionDescriptor};
pub use types::{
    DeliverySystem, FecRate, Polarisation, TuneRequest, TunerEndpoint, DEFAULT_RTSP_PORT,
};
