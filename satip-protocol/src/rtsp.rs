//! RTSP/1.0 request formatting and reply parsing.
//!
//! SAT>IP reuses plain RTSP for session control. Requests and replies are
//! CRLF-delimited text; replies may carry a body announced by
//! `Content-Length` (DESCRIBE does, the others do not).
//!
//! ```text
//! SETUP rtsp://host/?freq=... RTSP/1.0
//! CSeq: 2
//! Transport: RTP/AVP;unicast;client_port=57000-57001
//!
//! RTSP/1.0 200 OK
//! CSeq: 2
//! com.ses.streamID: 6
//! Session: 12345678;timeout=30
//! ```

use bytes::Bytes;

use crate::error::ProtocolError;

const RTSP_VERSION: &str = "RTSP/1.0";

/// Session id and keep-alive deadline returned by a SETUP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub id: String,
    /// Server-side idle timeout in seconds. The server defaults to 60
    /// when the header carries no `timeout` attribute.
    pub timeout_secs: u64,
}

/// RTSP request methods used by the tuner session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Describe,
    Setup,
    Play,
    Options,
    Teardown,
}

impl Method {
    pub fn as_str(self) -> &'static str {
        match self {
            Method::Describe => "DESCRIBE",
            Method::Setup => "SETUP",
            Method::Play => "PLAY",
            Method::Options => "OPTIONS",
            Method::Teardown => "TEARDOWN",
        }
    }
}

/// An outgoing RTSP request.
#[derive(Debug, Clone)]
pub struct RtspRequest {
    method: Method,
    uri: String,
    headers: Vec<(String, String)>,
}

impl RtspRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: Vec::new(),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Serialize with the given sequence number.
    pub fn encode(&self, cseq: u32) -> Bytes {
        let mut out = String::with_capacity(128);
        out.push_str(self.method.as_str());
        out.push(' ');
        out.push_str(&self.uri);
        out.push(' ');
        out.push_str(RTSP_VERSION);
        out.push_str("\r\n");
        out.push_str(&format!("CSeq: {}\r\n", cseq));
        for (name, value) in &self.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        Bytes::from(out)
    }
}

/// A parsed RTSP reply.
#[derive(Debug, Clone)]
pub struct RtspResponse {
    pub status: u16,
    pub reason: String,
    headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RtspResponse {
    /// Try to decode one reply from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// reply, otherwise the reply and the number of bytes it consumed.
    pub fn decode(buf: &[u8]) -> Result<Option<(RtspResponse, usize)>, ProtocolError> {
        let Some(header_end) = find_header_end(buf) else {
            return Ok(None);
        };

        let head = std::str::from_utf8(&buf[..header_end])
            .map_err(|_| ProtocolError::InvalidStatusLine(String::from_utf8_lossy(&buf[..header_end.min(64)]).into_owned()))?;
        let mut lines = head.split("\r\n");

        let status_line = lines.next().unwrap_or("");
        let (status, reason) = parse_status_line(status_line)?;

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| ProtocolError::InvalidHeader(line.to_string()))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let content_length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, v)| {
                v.parse::<usize>()
                    .map_err(|_| ProtocolError::InvalidHeader(format!("Content-Length: {}", v)))
            })
            .transpose()?
            .unwrap_or(0);

        let body_start = header_end + 4;
        let total = body_start + content_length;
        if buf.len() < total {
            return Ok(None);
        }

        let response = RtspResponse {
            status,
            reason,
            headers,
            body: Bytes::copy_from_slice(&buf[body_start..total]),
        };
        Ok(Some((response, total)))
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_ok(&self) -> bool {
        self.status == 200
    }

    /// The echoed `CSeq` header, when present and numeric.
    pub fn cseq(&self) -> Option<u32> {
        self.header("CSeq").and_then(|v| v.trim().parse().ok())
    }

    /// The SAT>IP stream identifier assigned by SETUP.
    pub fn stream_id(&self) -> Result<u32, ProtocolError> {
        let value = self
            .header("com.ses.streamID")
            .ok_or(ProtocolError::MissingHeader("com.ses.streamID"))?;
        value
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidStreamId(value.to_string()))
    }

    /// The session id and advertised timeout from the `Session` header.
    pub fn session(&self) -> Result<SessionDescriptor, ProtocolError> {
        let value = self
            .header("Session")
            .ok_or(ProtocolError::MissingHeader("Session"))?;

        let mut parts = value.split(';');
        let id = parts
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ProtocolError::InvalidSessionHeader(value.to_string()))?
            .to_string();

        let mut timeout_secs = 60;
        for attr in parts {
            let attr = attr.trim();
            if let Some(raw) = attr.strip_prefix("timeout=") {
                timeout_secs = raw
                    .parse()
                    .map_err(|_| ProtocolError::InvalidSessionHeader(value.to_string()))?;
            }
        }
        if timeout_secs == 0 {
            timeout_secs = 60;
        }

        Ok(SessionDescriptor { id, timeout_secs })
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(line: &str) -> Result<(u16, String), ProtocolError> {
    let rest = line
        .strip_prefix(RTSP_VERSION)
        .ok_or_else(|| ProtocolError::InvalidStatusLine(line.to_string()))?
        .trim_start();
    let (code, reason) = match rest.split_once(' ') {
        Some((code, reason)) => (code, reason),
        None => (rest, ""),
    };
    let status = code
        .parse()
        .map_err(|_| ProtocolError::InvalidStatusLine(line.to_string()))?;
    Ok((status, reason.trim().to_string()))
}
