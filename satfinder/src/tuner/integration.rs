//! Pool tests against an in-process SAT>IP server.
//!
//! The mock speaks just enough RTSP to allocate streams and feeds RTCP
//! APP status datagrams back to the client port pair it sees in SETUP.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use satip_protocol::{DeliverySystem, FecRate, Polarisation, TuneRequest, TunerEndpoint};

use crate::tuner::pool::{PoolConfig, SessionPool};
use crate::tuner::session::{SessionConfig, SessionState};

/// How the mock behaves after the initial SETUP/PLAY.
#[derive(Clone, Copy, PartialEq)]
enum ServerMode {
    /// Answer everything, keep feeding status.
    Steady,
    /// Close the control connection right after PLAY and refuse any later
    /// SETUP with 503.
    FailAfterPlay,
    /// Allocate streams normally but refuse every PLAY with 503.
    RejectPlay,
}

#[derive(Clone)]
struct MockServer {
    mode: ServerMode,
    session_timeout_secs: u64,
    next_stream_id: Arc<AtomicU32>,
    saw_setup_retry: Arc<AtomicBool>,
    saw_teardown: Arc<AtomicBool>,
}

impl MockServer {
    fn new(mode: ServerMode, session_timeout_secs: u64) -> Self {
        Self {
            mode,
            session_timeout_secs,
            next_stream_id: Arc::new(AtomicU32::new(1)),
            saw_setup_retry: Arc::new(AtomicBool::new(false)),
            saw_teardown: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn spawn(self) -> (std::net::SocketAddr, Self) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let (socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let server = server.clone();
                tokio::spawn(server.handle_connection(socket));
            }
        });
        (addr, self)
    }

    async fn handle_connection(self, mut socket: TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 2048];

        loop {
            let n = match socket.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            buf.extend_from_slice(&chunk[..n]);

            while let Some(end) = find_request_end(&buf) {
                let request = String::from_utf8_lossy(&buf[..end]).into_owned();
                buf.drain(..end);

                let reply = match request.split(' ').next() {
                    Some("SETUP") => {
                        if self.mode == ServerMode::FailAfterPlay
                            && self.next_stream_id.load(Ordering::SeqCst) > 1
                        {
                            // A reconnect attempt on a fresh connection.
                            self.saw_setup_retry.store(true, Ordering::SeqCst);
                            "RTSP/1.0 503 Service Unavailable\r\n\r\n".to_string()
                        } else {
                            let stream_id = self.next_stream_id.fetch_add(1, Ordering::SeqCst);
                            let rtcp_port = client_rtcp_port(&request);
                            // In the failure mode the feeder dries up so
                            // the last reading can go stale.
                            let budget = match self.mode {
                                ServerMode::Steady => None,
                                ServerMode::FailAfterPlay => Some(40),
                                // Nothing plays, so nothing is fed.
                                ServerMode::RejectPlay => Some(0),
                            };
                            tokio::spawn(feed_status(rtcp_port, budget));
                            format!(
                                "RTSP/1.0 200 OK\r\ncom.ses.streamID: {}\r\nSession: mock{};timeout={}\r\n\r\n",
                                stream_id, stream_id, self.session_timeout_secs
                            )
                        }
                    }
                    Some("TEARDOWN") => {
                        self.saw_teardown.store(true, Ordering::SeqCst);
                        "RTSP/1.0 200 OK\r\n\r\n".to_string()
                    }
                    Some("PLAY") if self.mode == ServerMode::RejectPlay => {
                        "RTSP/1.0 503 Service Unavailable\r\n\r\n".to_string()
                    }
                    // DESCRIBE, PLAY, OPTIONS
                    _ => "RTSP/1.0 200 OK\r\n\r\n".to_string(),
                };

                if socket.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }

                if self.mode == ServerMode::FailAfterPlay && request.starts_with("PLAY") {
                    // Drop the control connection; the next keep-alive
                    // will hit EOF.
                    return;
                }
            }
        }
    }
}

fn find_request_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// `client_port=A-B` out of a SETUP request.
fn client_rtcp_port(request: &str) -> u16 {
    let after_rtp = request
        .split("client_port=")
        .nth(1)
        .and_then(|rest| rest.split_once('-'))
        .map(|(_, rtcp)| rtcp)
        .unwrap();
    let digits: String = after_rtp
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().unwrap()
}

/// Send locked-signal status records to the client's RTCP port, forever
/// or for a bounded number of datagrams.
async fn feed_status(rtcp_port: u16, budget: Option<u32>) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let datagram = app_datagram(200, true, 12);
    let mut sent = 0u32;
    loop {
        if let Some(limit) = budget {
            if sent >= limit {
                return;
            }
        }
        let _ = socket.send_to(&datagram, ("127.0.0.1", rtcp_port)).await;
        sent += 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn app_datagram(level: u8, lock: bool, quality: u8) -> Vec<u8> {
    let text = format!(
        "ver=1.0;src=1;tuner=1,{},{},{},10817.5,v,dvbs2,8psk,on,0.35,23000,34;pids=0",
        level, lock as u8, quality
    );
    let mut payload = Vec::new();
    payload.extend_from_slice(b"SES1");
    payload.extend_from_slice(&0u16.to_be_bytes());
    payload.extend_from_slice(&(text.len() as u16).to_be_bytes());
    payload.extend_from_slice(text.as_bytes());
    while payload.len() % 4 != 0 {
        payload.push(0);
    }
    let mut packet = vec![0x80, 204];
    packet.extend_from_slice(&(((payload.len() + 4) / 4) as u16).to_be_bytes());
    packet.extend_from_slice(&[0, 0, 0, 1]);
    packet.extend_from_slice(&payload);
    packet
}

fn request(frequency_mhz: f64, label: &str) -> TuneRequest {
    TuneRequest::new(
        frequency_mhz,
        Polarisation::Vertical,
        DeliverySystem::Dvbs2,
        23000,
        FecRate::Rate3of4,
        Some(label.to_string()),
    )
    .unwrap()
}

fn test_config(staleness: Duration) -> PoolConfig {
    PoolConfig {
        session: SessionConfig {
            connect_timeout: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(1),
            keepalive_margin: Duration::from_secs(2),
            keepalive_failure_limit: 3,
            reconnect_limit: 2,
            status_idle_timeout: Duration::from_secs(10),
        },
        shutdown_timeout: Duration::from_secs(3),
        staleness_threshold: staleness,
    }
}

async fn wait_for(pool: &SessionPool, budget: Duration, ok: impl Fn(&SessionPool) -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    while tokio::time::Instant::now() < deadline {
        if ok(pool) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    ok(pool)
}

#[tokio::test]
async fn two_sessions_stream_status_and_tear_down() {
    let (addr, server) = MockServer::new(ServerMode::Steady, 30).spawn().await;
    let endpoint = TunerEndpoint::new("127.0.0.1".to_string(), addr.port(), 58700);

    let pool = SessionPool::start(
        endpoint,
        vec![request(10817.5, "BBC1HD"), request(11097.0, "ITVBe")],
        2,
        test_config(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    let locked = wait_for(&pool, Duration::from_secs(5), |pool| {
        pool.snapshot_all().iter().all(|report| {
            report.state == SessionState::Playing && report.snapshot.lock && !report.stale
        })
    })
    .await;
    assert!(locked, "both sessions should reach lock");

    let reports = pool.snapshot_all();
    assert_eq!(reports.len(), 2);
    for report in &reports {
        // level 200 of 255, quality 12 of 15, scaled to percent.
        assert_eq!(report.snapshot.signal, 78);
        assert_eq!(report.snapshot.quality, 80);
        assert!(report.snapshot.has_data());
        assert_eq!(report.dropped_records, 0);
    }
    assert_eq!(reports[0].label, "10817.5/v|BBC1HD");
    assert_eq!(reports[1].label, "11097/v|ITVBe");

    pool.shutdown().await;
    assert!(server.saw_teardown.load(Ordering::SeqCst));
}

#[tokio::test]
async fn malformed_status_records_are_counted_not_fatal() {
    let (addr, _server) = MockServer::new(ServerMode::Steady, 30).spawn().await;
    let endpoint = TunerEndpoint::new("127.0.0.1".to_string(), addr.port(), 58720);

    let pool = SessionPool::start(
        endpoint,
        vec![request(10817.5, "BBC1HD")],
        1,
        test_config(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    let locked = wait_for(&pool, Duration::from_secs(5), |pool| {
        pool.snapshot_all()[0].snapshot.lock
    })
    .await;
    assert!(locked);

    // Inject a truncated RTCP packet alongside the server's good ones.
    let poison = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    poison
        .send_to(&app_datagram(1, false, 1)[..10], ("127.0.0.1", 58721))
        .await
        .unwrap();

    let counted = wait_for(&pool, Duration::from_secs(3), |pool| {
        pool.snapshot_all()[0].dropped_records == 1
    })
    .await;
    assert!(counted, "the truncated record should be dropped and counted");
    // The stream of good records keeps flowing.
    assert!(pool.snapshot_all()[0].snapshot.lock);

    pool.shutdown().await;
}

#[tokio::test]
async fn rejected_play_releases_the_allocated_stream() {
    let (addr, server) = MockServer::new(ServerMode::RejectPlay, 30).spawn().await;
    let endpoint = TunerEndpoint::new("127.0.0.1".to_string(), addr.port(), 58760);

    let pool = SessionPool::start(
        endpoint,
        vec![request(10817.5, "BBC1HD")],
        1,
        test_config(Duration::from_secs(5)),
    )
    .await
    .unwrap();

    // The initial attempt and every reconnect get their PLAY refused;
    // each allocated stream must be handed back before the session
    // finally fails.
    let failed = wait_for(&pool, Duration::from_secs(10), |pool| {
        pool.snapshot_all()[0].state == SessionState::Errored
    })
    .await;
    assert!(failed, "rejected PLAYs should exhaust the session");
    assert!(server.saw_teardown.load(Ordering::SeqCst));
    assert!(!pool.snapshot_all()[0].snapshot.has_data());

    pool.shutdown().await;
}

#[tokio::test]
async fn lost_server_exhausts_reconnects_and_keeps_last_reading() {
    // Session timeout 3s gives a 1s keep-alive period, so the dead
    // connection is noticed quickly.
    let (addr, server) = MockServer::new(ServerMode::FailAfterPlay, 3).spawn().await;
    let endpoint = TunerEndpoint::new("127.0.0.1".to_string(), addr.port(), 58740);

    let pool = SessionPool::start(
        endpoint,
        vec![request(10817.5, "BBC1HD")],
        1,
        test_config(Duration::from_millis(500)),
    )
    .await
    .unwrap();

    let locked = wait_for(&pool, Duration::from_secs(5), |pool| {
        pool.snapshot_all()[0].snapshot.lock
    })
    .await;
    assert!(locked, "the session should lock before the server dies");

    let failed = wait_for(&pool, Duration::from_secs(15), |pool| {
        pool.snapshot_all()[0].state == SessionState::Errored
    })
    .await;
    assert!(failed, "reconnects should be exhausted after the server dies");
    assert!(server.saw_setup_retry.load(Ordering::SeqCst));

    // The last reading survives the failure and is eventually stale.
    let report = &pool.snapshot_all()[0];
    assert!(report.snapshot.has_data());
    let stale = wait_for(&pool, Duration::from_secs(3), |pool| {
        pool.snapshot_all()[0].stale
    })
    .await;
    assert!(stale);

    pool.shutdown().await;
}
