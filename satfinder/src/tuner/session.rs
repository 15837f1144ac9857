//! Tuner session: drives one tuner end-to-end from a validated tune
//! request to a continuous stream of metrics snapshots.
//!
//! Each session runs two tasks. The control task owns the RTSP
//! connection and walks the lifecycle (describe, setup, play, keep-alive
//! cycle, teardown); the status listener owns the session's UDP port pair
//! and folds RTCP status records into the published snapshot. The two
//! communicate only through the atomically replaced snapshot.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use satip_protocol::{first_app_status, Method, TuneRequest, TunerEndpoint};

use crate::error::SessionError;
use crate::tuner::control::ControlConnection;
use crate::tuner::metrics::MetricsSnapshot;

/// PIDs requested at SETUP. The tool never demultiplexes the transport
/// stream, so the PAT alone keeps the server's sender happy.
const SETUP_PIDS: &[u16] = &[0];

/// PIDs added at PLAY.
const PLAY_ADDPIDS: &[u16] = &[1];

/// Pause between reconnect attempts.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet talking to the server.
    Idle,
    /// Best-effort capability query in flight.
    Describing,
    /// SETUP exchange in flight.
    SettingUp,
    /// Streaming; keep-alives cycle in this state.
    Playing,
    /// Shutdown requested, teardown in flight.
    TearingDown,
    /// Torn down cleanly.
    Closed,
    /// Failed; entered from any non-terminal state.
    Errored,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Errored)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Describing => "describing",
            SessionState::SettingUp => "setting-up",
            SessionState::Playing => "playing",
            SessionState::TearingDown => "tearing-down",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Per-session tunables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// TCP connect timeout for the control channel.
    pub connect_timeout: Duration,
    /// Timeout for a single control reply.
    pub reply_timeout: Duration,
    /// How far below the server-advertised session timeout keep-alives
    /// are scheduled.
    pub keepalive_margin: Duration,
    /// Consecutive keep-alive failures before the session reconnects.
    pub keepalive_failure_limit: u32,
    /// Reconnect (setup + play) attempts before the session is fatal.
    pub reconnect_limit: u32,
    /// How long the status listener waits without any datagram before
    /// reporting a stall.
    pub status_idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(4),
            keepalive_margin: Duration::from_secs(2),
            keepalive_failure_limit: 3,
            reconnect_limit: 2,
            status_idle_timeout: Duration::from_secs(10),
        }
    }
}

/// Keep-alive period for a server-advertised session timeout: the margin
/// below it, floored at one second but always strictly shorter than the
/// timeout itself.
fn keepalive_period(server_timeout_secs: u64, margin: Duration) -> Duration {
    let timeout = Duration::from_secs(server_timeout_secs);
    let ceiling = timeout
        .saturating_sub(Duration::from_secs(1))
        .max(Duration::from_millis(500));
    timeout
        .saturating_sub(margin)
        .max(Duration::from_secs(1))
        .min(ceiling)
}

/// Handle to a running session, held by the pool.
#[derive(Debug)]
pub struct SessionHandle {
    pub index: usize,
    label: String,
    snapshot_rx: watch::Receiver<MetricsSnapshot>,
    state_rx: watch::Receiver<SessionState>,
    dropped: Arc<AtomicU64>,
    control_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// The latest published snapshot. Never blocks.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Malformed status records dropped so far.
    pub fn dropped_records(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Wait for both tasks to unwind, bounded by `timeout`. Returns false
    /// (after aborting the tasks) when they did not make it in time.
    pub(crate) async fn finish(mut self, timeout: Duration) -> bool {
        let joined = tokio::time::timeout(timeout, async {
            let _ = (&mut self.control_task).await;
            let _ = (&mut self.listener_task).await;
        })
        .await;

        match joined {
            Ok(()) => true,
            Err(_) => {
                self.control_task.abort();
                self.listener_task.abort();
                false
            }
        }
    }
}

/// Spawn the two tasks for one session. The UDP sockets must already be
/// bound to the given port pair; the pool claims all pairs before any
/// session starts.
#[allow(clippy::too_many_arguments)]
pub(crate) fn spawn(
    index: usize,
    request: TuneRequest,
    endpoint: TunerEndpoint,
    config: SessionConfig,
    cancel: CancellationToken,
    rtp_port: u16,
    rtcp_port: u16,
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
) -> SessionHandle {
    let label = request.display_name();
    let (snapshot_tx, snapshot_rx) = watch::channel(MetricsSnapshot::placeholder(&label));
    let (state_tx, state_rx) = watch::channel(SessionState::Idle);
    let dropped = Arc::new(AtomicU64::new(0));

    let listener_task = tokio::spawn(status_listener(
        index,
        label.clone(),
        rtp_socket,
        rtcp_socket,
        snapshot_tx,
        Arc::clone(&dropped),
        config.status_idle_timeout,
        cancel.clone(),
    ));

    let session = TunerSession {
        index,
        label: label.clone(),
        request,
        endpoint,
        config,
        cancel,
        rtp_port,
        rtcp_port,
        stream_id: None,
        state_tx,
    };
    let control_task = tokio::spawn(session.run());

    SessionHandle {
        index,
        label,
        snapshot_rx,
        state_rx,
        dropped,
        control_task,
        listener_task,
    }
}

/// The control task's state.
struct TunerSession {
    index: usize,
    label: String,
    request: TuneRequest,
    endpoint: TunerEndpoint,
    config: SessionConfig,
    cancel: CancellationToken,
    rtp_port: u16,
    rtcp_port: u16,
    stream_id: Option<u32>,
    state_tx: watch::Sender<SessionState>,
}

impl TunerSession {
    async fn run(mut self) {
        match self.drive().await {
            Ok(()) => info!("Session {} ({}): closed", self.index, self.label),
            Err(e) if self.cancel.is_cancelled() => {
                debug!(
                    "Session {} ({}): shutdown while recovering: {}",
                    self.index, self.label, e
                );
                self.set_state(SessionState::Closed);
            }
            Err(e) => {
                error!("Session {} ({}): fatal: {}", self.index, self.label, e);
                self.set_state(SessionState::Errored);
            }
        }
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let cancel = self.cancel.clone();
        let opened = tokio::select! {
            _ = cancel.cancelled() => {
                self.set_state(SessionState::Closed);
                return Ok(());
            }
            opened = self.open_session() => opened,
        };
        let (mut conn, mut keepalive_every) = match opened {
            Ok(opened) => opened,
            Err(e) => self.reconnect(e).await?,
        };

        let mut failures = 0u32;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.teardown(&mut conn).await;
                    return Ok(());
                }
                _ = tokio::time::sleep(keepalive_every) => {
                    match conn.exchange(Method::Options, "", &[]).await {
                        Ok(reply) if reply.is_ok() => {
                            failures = 0;
                            trace!("Session {}: keep-alive ok", self.index);
                        }
                        Ok(reply) => {
                            failures += 1;
                            warn!(
                                "Session {}: keep-alive returned {} ({}/{})",
                                self.index, reply.status, failures,
                                self.config.keepalive_failure_limit
                            );
                        }
                        Err(e) => {
                            failures += 1;
                            warn!(
                                "Session {}: keep-alive failed: {} ({}/{})",
                                self.index, e, failures, self.config.keepalive_failure_limit
                            );
                        }
                    }

                    if failures >= self.config.keepalive_failure_limit {
                        self.set_state(SessionState::Errored);
                        self.release_stream(&mut conn).await;
                        let cause = SessionError::KeepAliveFailure { failures };
                        let (fresh, period) = self.reconnect(cause).await?;
                        conn = fresh;
                        keepalive_every = period;
                        failures = 0;
                    }
                }
            }
        }
    }

    async fn open_control(&self) -> Result<ControlConnection, SessionError> {
        ControlConnection::connect(
            &self.endpoint,
            self.config.connect_timeout,
            self.config.reply_timeout,
        )
        .await
    }

    /// First-time bring-up: connect, best-effort describe, then
    /// setup/play.
    async fn open_session(&mut self) -> Result<(ControlConnection, Duration), SessionError> {
        let mut conn = self.open_control().await?;
        self.describe(&mut conn).await;
        let period = self.setup_and_play(&mut conn).await?;
        Ok((conn, period))
    }

    /// Best-effort capability query; failure falls back to request-only
    /// parameters.
    async fn describe(&mut self, conn: &mut ControlConnection) {
        self.set_state(SessionState::Describing);
        let query = self.request.stream_query(SETUP_PIDS);
        let accept = [("Accept", "application/sdp".to_string())];
        match conn.exchange(Method::Describe, &query, &accept).await {
            Ok(reply) if reply.is_ok() => {
                debug!(
                    "Session {}: DESCRIBE ok, {} bytes of SDP",
                    self.index,
                    reply.body.len()
                );
            }
            Ok(reply) => {
                debug!(
                    "Session {}: DESCRIBE returned {}, using request parameters",
                    self.index, reply.status
                );
            }
            Err(e) => {
                debug!(
                    "Session {}: DESCRIBE failed ({}), using request parameters",
                    self.index, e
                );
            }
        }
    }

    /// SETUP then PLAY; returns the keep-alive period derived from the
    /// server-advertised session timeout.
    async fn setup_and_play(
        &mut self,
        conn: &mut ControlConnection,
    ) -> Result<Duration, SessionError> {
        self.set_state(SessionState::SettingUp);

        let transport = format!(
            "RTP/AVP;unicast;client_port={}-{}",
            self.rtp_port, self.rtcp_port
        );
        let query = self.request.stream_query(SETUP_PIDS);
        let reply = conn
            .exchange(Method::Setup, &query, &[("Transport", transport)])
            .await?;
        if !reply.is_ok() {
            return Err(SessionError::SetupRejected {
                status: reply.status,
            });
        }

        let descriptor = reply.session().map_err(SessionError::SetupMalformed)?;
        let stream_id = reply.stream_id().map_err(SessionError::SetupMalformed)?;
        conn.set_session(descriptor.id.clone());
        // The stream is the server's from here on; it must be handed back
        // even when PLAY never succeeds.
        self.stream_id = Some(stream_id);
        info!(
            "Session {} ({}): stream {} allocated, server timeout {}s",
            self.index, self.label, stream_id, descriptor.timeout_secs
        );

        let addpids = PLAY_ADDPIDS
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let play_uri = format!("stream={}?addpids={}", stream_id, addpids);
        let reply = match conn.exchange(Method::Play, &play_uri, &[]).await {
            Ok(reply) => reply,
            Err(e) => {
                self.release_stream(conn).await;
                return Err(e);
            }
        };
        if !reply.is_ok() {
            self.release_stream(conn).await;
            return Err(SessionError::PlayRejected {
                status: reply.status,
            });
        }

        self.set_state(SessionState::Playing);
        Ok(keepalive_period(
            descriptor.timeout_secs,
            self.config.keepalive_margin,
        ))
    }

    /// Bounded reconnect after a recoverable failure. On success a fresh
    /// connection and the new keep-alive period are returned; on
    /// exhaustion the session is fatal.
    async fn reconnect(
        &mut self,
        cause: SessionError,
    ) -> Result<(ControlConnection, Duration), SessionError> {
        let cancel = self.cancel.clone();
        let mut last = cause;

        for attempt in 1..=self.config.reconnect_limit {
            if cancel.is_cancelled() {
                return Err(last);
            }
            info!(
                "Session {} ({}): reconnect attempt {}/{} after: {}",
                self.index, self.label, attempt, self.config.reconnect_limit, last
            );
            // Every step of an attempt can block for a full I/O timeout,
            // so the whole attempt races against shutdown.
            tokio::select! {
                _ = cancel.cancelled() => return Err(last),
                outcome = self.reopen() => match outcome {
                    Ok(opened) => return Ok(opened),
                    Err(e) => last = e,
                }
            }
        }

        Err(SessionError::ReconnectExhausted {
            attempts: self.config.reconnect_limit,
            last: Box::new(last),
        })
    }

    /// One reconnect attempt: pause, fresh control connection, setup and
    /// play.
    async fn reopen(&mut self) -> Result<(ControlConnection, Duration), SessionError> {
        tokio::time::sleep(RECONNECT_DELAY).await;
        let mut conn = self.open_control().await?;
        let period = self.setup_and_play(&mut conn).await?;
        Ok((conn, period))
    }

    /// Best-effort teardown notification on shutdown; failures are
    /// logged, never propagated.
    async fn teardown(&mut self, conn: &mut ControlConnection) {
        self.set_state(SessionState::TearingDown);
        self.release_stream(conn).await;
        self.set_state(SessionState::Closed);
    }

    /// Hand the allocated stream back with a best-effort TEARDOWN. Also
    /// used outside the shutdown path: a stream left allocated after a
    /// failure would keep its tuner busy until the server times it out.
    async fn release_stream(&mut self, conn: &mut ControlConnection) {
        let Some(stream_id) = self.stream_id.take() else {
            return;
        };
        let uri = format!("stream={}", stream_id);
        match conn.exchange(Method::Teardown, &uri, &[]).await {
            Ok(reply) if reply.is_ok() => {
                debug!("Session {}: stream {} released", self.index, stream_id);
            }
            Ok(reply) => {
                warn!(
                    "Session {}: stream {} release returned {}",
                    self.index, stream_id, reply.status
                );
            }
            Err(e) => {
                debug!(
                    "Session {}: stream {} release failed: {}",
                    self.index, stream_id, e
                );
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        if *self.state_tx.borrow() != state {
            debug!("Session {} ({}): -> {}", self.index, self.label, state);
            let _ = self.state_tx.send(state);
        }
    }
}

/// The status listener: drains the RTP leg and folds RTCP APP records
/// into the published snapshot. Malformed records are dropped and
/// counted; an idle stretch is logged as a stall but the listener keeps
/// listening, since satellite signal can legitimately drop and resume.
#[allow(clippy::too_many_arguments)]
async fn status_listener(
    index: usize,
    label: String,
    rtp_socket: UdpSocket,
    rtcp_socket: UdpSocket,
    snapshot_tx: watch::Sender<MetricsSnapshot>,
    dropped: Arc<AtomicU64>,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut rtp_buf = vec![0u8; 4096];
    let mut rtcp_buf = vec![0u8; 4096];
    let mut sequence = 0u64;
    let mut rtp_packets = 0u64;
    let mut last_rx = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            received = rtcp_socket.recv_from(&mut rtcp_buf) => match received {
                Ok((n, _)) => {
                    last_rx = Instant::now();
                    match first_app_status(&rtcp_buf[..n]) {
                        Ok(Some(status)) => {
                            sequence += 1;
                            let snapshot =
                                MetricsSnapshot::from_status(&label, sequence, &status);
                            let _ = snapshot_tx.send(snapshot);
                        }
                        Ok(None) => {
                            trace!("Session {}: RTCP datagram without APP packet", index);
                        }
                        Err(e) => {
                            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            debug!(
                                "Session {}: dropped malformed status record #{}: {}",
                                index, total, e
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!("Session {}: RTCP receive error: {}", index, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },

            received = rtp_socket.recv_from(&mut rtp_buf) => match received {
                Ok(_) => {
                    last_rx = Instant::now();
                    rtp_packets += 1;
                    if rtp_packets % 1000 == 0 {
                        trace!("Session {}: {} RTP packets received", index, rtp_packets);
                    }
                }
                Err(e) => {
                    warn!("Session {}: RTP receive error: {}", index, e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },

            _ = tokio::time::sleep_until(last_rx + idle_timeout) => {
                warn!(
                    "Session {} ({}): no datagrams for {:?}, still listening",
                    index, label, idle_timeout
                );
                // Rearm so the stall is logged once per idle interval.
                last_rx = Instant::now();
            }
        }
    }

    debug!(
        "Session {}: status listener exited ({} RTP packets, {} status records, {} dropped)",
        index,
        rtp_packets,
        sequence,
        dropped.load(Ordering::Relaxed)
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn keepalive_period_stays_under_server_timeout() {
        assert_eq!(
            keepalive_period(30, Duration::from_secs(2)),
            Duration::from_secs(28)
        );
        assert_eq!(
            keepalive_period(60, Duration::from_secs(2)),
            Duration::from_secs(58)
        );
    }

    #[test]
    fn keepalive_period_is_floored_but_stays_below_the_timeout() {
        assert_eq!(keepalive_period(2, Duration::from_secs(2)), Duration::from_secs(1));
        assert_eq!(keepalive_period(3, Duration::from_secs(2)), Duration::from_secs(1));
        // A 1s advertised timeout cannot fit the one-second floor.
        assert_eq!(
            keepalive_period(1, Duration::from_secs(2)),
            Duration::from_millis(500)
        );
    }

    #[tokio::test]
    async fn shutdown_mid_reconnect_is_observed_promptly() {
        // Drop the first connection to push the session into its
        // reconnect loop; hold later connections open without replying.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(first);
            let mut held = Vec::new();
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => held.push(socket),
                    Err(_) => return,
                }
            }
        });

        let rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rtcp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let rtp_port = rtp.local_addr().unwrap().port();
        let rtcp_port = rtcp.local_addr().unwrap().port();

        let request: TuneRequest = "10817.5,v,dvbs2,23000,34,BBC1HD".parse().unwrap();
        let endpoint = TunerEndpoint::new(addr.ip().to_string(), addr.port(), rtp_port);
        let config = SessionConfig {
            reply_timeout: Duration::from_secs(10),
            reconnect_limit: 5,
            ..SessionConfig::default()
        };

        let cancel = CancellationToken::new();
        let handle = spawn(
            0,
            request,
            endpoint,
            config,
            cancel.clone(),
            rtp_port,
            rtcp_port,
            rtp,
            rtcp,
        );

        // Let the first bring-up fail and a reconnect attempt wedge in
        // its SETUP exchange against the silent server.
        tokio::time::sleep(Duration::from_millis(800)).await;
        cancel.cancel();

        let deadline = Instant::now() + Duration::from_secs(1);
        while !handle.state().is_terminal() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(handle.state(), SessionState::Closed);
        assert!(handle.finish(Duration::from_secs(1)).await);
    }

    #[test]
    fn terminal_states() {
        assert!(SessionState::Closed.is_terminal());
        assert!(SessionState::Errored.is_terminal());
        assert!(!SessionState::Playing.is_terminal());
        assert!(!SessionState::Idle.is_terminal());
    }
}
