//! Session pool: owns one session per tune request and the shared
//! shutdown token.
//!
//! Startup is all-or-nothing. Validation and the full port plan are
//! settled before the first session task spawns, so a refused request or
//! an occupied port never leaves a half-started pool behind.

use std::time::Duration;

use log::{info, warn};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use satip_protocol::{TuneRequest, TunerEndpoint};

use crate::error::StartError;
use crate::tuner::metrics::MetricsSnapshot;
use crate::tuner::session::{self, SessionConfig, SessionHandle, SessionState};

/// Pool-level tunables on top of the per-session ones.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub session: SessionConfig,
    /// Total budget for shutdown across all sessions.
    pub shutdown_timeout: Duration,
    /// Snapshot age past which a report is flagged stale.
    pub staleness_threshold: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            shutdown_timeout: Duration::from_secs(5),
            staleness_threshold: Duration::from_secs(5),
        }
    }
}

/// One tuner's row in the aggregate view.
#[derive(Debug, Clone)]
pub struct TunerReport {
    pub index: usize,
    pub label: String,
    pub state: SessionState,
    pub snapshot: MetricsSnapshot,
    /// Whether the snapshot carries data older than the staleness
    /// threshold.
    pub stale: bool,
    /// Malformed status records dropped by this session so far.
    pub dropped_records: u64,
}

/// The running set of tuner sessions.
#[derive(Debug)]
pub struct SessionPool {
    sessions: Vec<SessionHandle>,
    cancel: CancellationToken,
    config: PoolConfig,
}

impl SessionPool {
    /// Validate the requests, claim every status port pair, then spawn
    /// one session per request.
    pub async fn start(
        endpoint: TunerEndpoint,
        requests: Vec<TuneRequest>,
        available_tuners: usize,
        config: PoolConfig,
    ) -> Result<Self, StartError> {
        if requests.is_empty() {
            return Err(StartError::NoTuneRequests);
        }
        if requests.len() > available_tuners {
            return Err(StartError::InsufficientTuners {
                requested: requests.len(),
                available: available_tuners,
            });
        }
        for request in &requests {
            request.validate()?;
        }

        // Claim the whole port plan before any session starts.
        let mut sockets = Vec::with_capacity(requests.len());
        for index in 0..requests.len() {
            let (rtp_port, rtcp_port) = endpoint
                .port_pair(index)
                .ok_or(StartError::PortRange { index })?;
            let rtp = bind_status_port(rtp_port, (rtp_port, rtcp_port)).await?;
            let rtcp = bind_status_port(rtcp_port, (rtp_port, rtcp_port)).await?;
            sockets.push((rtp_port, rtcp_port, rtp, rtcp));
        }

        let cancel = CancellationToken::new();
        let sessions = requests
            .into_iter()
            .zip(sockets)
            .enumerate()
            .map(|(index, (request, (rtp_port, rtcp_port, rtp, rtcp)))| {
                info!(
                    "Starting session {} for {} on ports {}-{}",
                    index,
                    request.display_name(),
                    rtp_port,
                    rtcp_port
                );
                session::spawn(
                    index,
                    request,
                    endpoint.clone(),
                    config.session.clone(),
                    cancel.child_token(),
                    rtp_port,
                    rtcp_port,
                    rtp,
                    rtcp,
                )
            })
            .collect();

        Ok(Self {
            sessions,
            cancel,
            config,
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Display labels in session order.
    pub fn labels(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.label().to_string()).collect()
    }

    /// Current view of every session. Never blocks; a wedged session
    /// simply keeps reporting its last published snapshot.
    pub fn snapshot_all(&self) -> Vec<TunerReport> {
        self.sessions
            .iter()
            .map(|session| {
                let snapshot = session.snapshot();
                TunerReport {
                    index: session.index,
                    label: session.label().to_string(),
                    state: session.state(),
                    stale: snapshot.is_stale(self.config.staleness_threshold),
                    dropped_records: session.dropped_records(),
                    snapshot,
                }
            })
            .collect()
    }

    /// Cancel every session, then wait for them within the shutdown
    /// budget. Sessions that miss the deadline are aborted and reported.
    pub async fn shutdown(self) {
        info!("Shutting down {} sessions", self.sessions.len());
        self.cancel.cancel();

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        for session in self.sessions {
            let label = session.label().to_string();
            let remaining = deadline
                .saturating_duration_since(tokio::time::Instant::now())
                .max(Duration::from_millis(10));
            if !session.finish(remaining).await {
                warn!(
                    "Session for {} did not acknowledge shutdown in time, aborted",
                    label
                );
            }
        }
    }
}

async fn bind_status_port(port: u16, pair: (u16, u16)) -> Result<UdpSocket, StartError> {
    UdpSocket::bind(("0.0.0.0", port))
        .await
        .map_err(|source| StartError::PortBind {
            rtp: pair.0,
            rtcp: pair.1,
            source,
        })
}
