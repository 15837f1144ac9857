//! RTSP control-channel transport.
//!
//! One TCP connection per tuner session. RTSP is strictly
//! request/response on this channel, so the connection performs one
//! exchange at a time with a per-reply timeout; there is no pipelining.

use std::time::Duration;

use bytes::BytesMut;
use log::{debug, trace};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use satip_protocol::{Method, RtspRequest, RtspResponse, TunerEndpoint};

use crate::error::SessionError;

const USER_AGENT: &str = concat!("satfinder/", env!("CARGO_PKG_VERSION"));

/// A sequential RTSP exchange channel to the server.
pub struct ControlConnection {
    stream: TcpStream,
    read_buf: BytesMut,
    base_uri: String,
    cseq: u32,
    session_id: Option<String>,
    reply_timeout: Duration,
}

impl ControlConnection {
    /// Open the control connection, bounded by `connect_timeout`.
    pub async fn connect(
        endpoint: &TunerEndpoint,
        connect_timeout: Duration,
        reply_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let addr = endpoint.control_addr();
        debug!("Connecting control channel to {}", addr);
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| SessionError::ControlTimeout)??;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            base_uri: endpoint.base_uri(),
            cseq: 0,
            session_id: None,
            reply_timeout,
        })
    }

    /// `rtsp://host[:port]/`
    pub fn base_uri(&self) -> &str {
        &self.base_uri
    }

    /// Attach the session id returned by SETUP; subsequent requests carry
    /// it in a `Session` header.
    pub fn set_session(&mut self, id: String) {
        self.session_id = Some(id);
    }

    /// Perform one request/reply exchange.
    ///
    /// `uri_part` is appended to the base URI (`""` targets the server
    /// itself, as OPTIONS does).
    pub async fn exchange(
        &mut self,
        method: Method,
        uri_part: &str,
        extra_headers: &[(&str, String)],
    ) -> Result<RtspResponse, SessionError> {
        self.cseq += 1;

        let mut request = RtspRequest::new(method, format!("{}{}", self.base_uri, uri_part))
            .header("User-Agent", USER_AGENT);
        if let Some(id) = &self.session_id {
            request = request.header("Session", id.clone());
        }
        for (name, value) in extra_headers {
            request = request.header(*name, value.clone());
        }

        let encoded = request.encode(self.cseq);
        trace!("Control request: {} {}{}", method.as_str(), self.base_uri, uri_part);
        self.stream.write_all(&encoded).await?;

        let response = tokio::time::timeout(self.reply_timeout, self.read_response(self.cseq))
            .await
            .map_err(|_| SessionError::ControlTimeout)??;
        trace!(
            "Control reply: {} {} (cseq={})",
            response.status,
            response.reason,
            self.cseq
        );
        Ok(response)
    }

    /// Read replies until one matches `cseq`. A reply carrying a
    /// different sequence number is the late answer to a timed-out
    /// exchange and is discarded.
    async fn read_response(&mut self, cseq: u32) -> Result<RtspResponse, SessionError> {
        loop {
            if let Some((response, consumed)) = RtspResponse::decode(&self.read_buf)? {
                let _ = self.read_buf.split_to(consumed);
                match response.cseq() {
                    Some(seq) if seq != cseq => {
                        debug!("Discarding stale reply with CSeq {} (expected {})", seq, cseq);
                        continue;
                    }
                    _ => return Ok(response),
                }
            }
            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(SessionError::Control(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "control connection closed by server",
                )));
            }
        }
    }
}
