//! Pilot center client
//!
//! Keeps one WebSocket open to the pilot control plane:
//! - registers the server and its candidates on every connect
//! - sends a heartbeat with room and session counts every 15 seconds
//! - hands every inbound directive, in arrival order, to the notifier
//! - forwards membership reports queued through a [`PilotLink`]
//!
//! Reports are never queued across a disconnect. The pilot center resends
//! its state after a reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

use rtcpilot_core::{CandidateDescriptor, PilotCenterConfig};
use rtcpilot_signal::{CandidateInfo, PilotDirective, PilotNotification, PilotReport};

/// Interval between heartbeats
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Timeout for the WebSocket handshake
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reports buffered while connected before new ones are dropped
const REPORT_QUEUE: usize = 256;

type PilotStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Error, Debug)]
pub enum PilotError {
    #[error("pilot center is disabled or incomplete")]
    NotConfigured,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid pilot URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("connection timed out")]
    Timeout,
}

/// Automatic reconnection settings
#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    pub enabled: bool,
    /// Initial delay before first reconnect attempt
    pub initial_delay: Duration,
    /// Maximum delay between reconnect attempts
    pub max_delay: Duration,
    /// Maximum number of reconnection attempts (0 = unlimited)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0, // Unlimited
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based), doubling each time
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Sending half handed to the room manager
#[derive(Clone, Debug)]
pub struct PilotLink {
    connected: Arc<AtomicBool>,
    tx: mpsc::Sender<PilotReport>,
}

impl PilotLink {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Queue a report. Dropped (returns false) while disconnected.
    pub fn send(&self, report: PilotReport) -> bool {
        if !self.is_connected() {
            debug!("Pilot center disconnected, dropping {:?}", report);
            return false;
        }
        match self.tx.try_send(report) {
            Ok(()) => true,
            Err(e) => {
                warn!("Pilot report dropped: {}", e);
                false
            }
        }
    }
}

/// Client for the pilot control plane
pub struct PilotClient {
    url: String,
    server_id: String,
    candidates: Vec<CandidateInfo>,
    notifier: Arc<dyn PilotNotification>,
    reconnect: ReconnectConfig,
    heartbeat: Duration,
    link: PilotLink,
    reports: mpsc::Receiver<PilotReport>,
}

impl PilotClient {
    pub fn new(
        url: impl Into<String>,
        server_id: impl Into<String>,
        candidates: &[CandidateDescriptor],
        notifier: Arc<dyn PilotNotification>,
    ) -> Self {
        let (tx, reports) = mpsc::channel(REPORT_QUEUE);
        Self {
            url: url.into(),
            server_id: server_id.into(),
            candidates: candidates
                .iter()
                .map(|c| CandidateInfo {
                    nettype: c.net_type.as_str().to_string(),
                    ip: c.candidate_ip.clone(),
                    port: c.port,
                })
                .collect(),
            notifier,
            reconnect: ReconnectConfig::default(),
            heartbeat: HEARTBEAT_INTERVAL,
            link: PilotLink {
                connected: Arc::new(AtomicBool::new(false)),
                tx,
            },
            reports,
        }
    }

    /// Build from configuration, refusing a disabled or incomplete section
    pub fn from_config(
        config: &PilotCenterConfig,
        server_id: impl Into<String>,
        candidates: &[CandidateDescriptor],
        notifier: Arc<dyn PilotNotification>,
    ) -> Result<Self, PilotError> {
        if !config.enable || !config.is_complete() {
            return Err(PilotError::NotConfigured);
        }
        let url = Url::parse(&config.url())?;
        Ok(Self::new(url, server_id, candidates, notifier))
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn link(&self) -> PilotLink {
        self.link.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Connect and keep reconnecting until the attempt limit is reached
    pub async fn run(mut self) {
        let mut attempt: u32 = 0;
        loop {
            match self.connect().await {
                Ok(ws) => {
                    attempt = 0;
                    info!("Connected to pilot center {}", self.url);
                    match self.serve(ws).await {
                        Ok(()) => info!("Pilot center {} closed the connection", self.url),
                        Err(e) => warn!("Pilot center connection lost: {}", e),
                    }
                }
                Err(e) => warn!("Failed to connect to pilot center {}: {}", self.url, e),
            }

            self.link.connected.store(false, Ordering::Release);
            while self.reports.try_recv().is_ok() {}

            if !self.reconnect.enabled {
                break;
            }
            attempt += 1;
            if self.reconnect.max_attempts > 0 && attempt > self.reconnect.max_attempts {
                error!(
                    "Giving up on pilot center {} after {} attempts",
                    self.url, self.reconnect.max_attempts
                );
                break;
            }
            let delay = self.reconnect.delay_for(attempt);
            info!(
                "Reconnecting to pilot center in {:?} (attempt {})",
                delay, attempt
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect(&self) -> Result<PilotStream, PilotError> {
        match timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str())).await {
            Ok(Ok((ws, _))) => Ok(ws),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(PilotError::Timeout),
        }
    }

    async fn serve(&mut self, ws: PilotStream) -> Result<(), PilotError> {
        let (mut write, mut read) = ws.split();

        let register = PilotReport::Register {
            server_id: self.server_id.clone(),
            candidates: self.candidates.clone(),
        };
        write.send(Message::Text(register.to_json()?)).await?;
        self.link.connected.store(true, Ordering::Release);
        debug!("Registered with pilot center as {}", self.server_id);

        let mut heartbeat = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => dispatch(self.notifier.as_ref(), &text),
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                Some(report) = self.reports.recv() => {
                    write.send(Message::Text(report.to_json()?)).await?;
                }
                _ = heartbeat.tick() => {
                    let stats = self.notifier.stats();
                    let beat = PilotReport::Heartbeat {
                        timestamp: chrono::Utc::now().timestamp().max(0) as u64,
                        rooms: stats.rooms,
                        sessions: stats.sessions,
                    };
                    write.send(Message::Text(beat.to_json()?)).await?;
                }
            }
        }
    }
}

/// Parse one inbound message and hand it to the notifier
fn dispatch(notifier: &dyn PilotNotification, text: &str) {
    match PilotDirective::from_json(text) {
        Ok(directive) => {
            debug!(
                "Pilot directive {} for room {}",
                directive.kind(),
                directive.room_id()
            );
            notifier.on_directive(directive);
        }
        Err(e) => warn!("Invalid pilot message: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rtcpilot_core::NetType;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, String)>>,
    }

    impl PilotNotification for Recorder {
        fn on_directive(&self, directive: PilotDirective) {
            self.seen
                .lock()
                .push((directive.kind().to_string(), directive.room_id().to_string()));
        }
    }

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            ..ReconnectConfig::default()
        }
    }

    async fn wait_for(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_reconnect_backoff() {
        let config = ReconnectConfig::default();
        assert!(config.enabled);
        assert_eq!(config.max_attempts, 0);
        let delays: Vec<u64> = (1..=8).map(|a| config.delay_for(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(config.delay_for(1000), Duration::from_secs(60));
    }

    #[test]
    fn test_not_configured() {
        let notifier: Arc<dyn PilotNotification> = Arc::new(Recorder::default());
        let config = PilotCenterConfig {
            enable: true,
            host: "pilot.local".into(),
            port: 8443,
            subpath: String::new(),
        };
        assert!(matches!(
            PilotClient::from_config(&config, "s1", &[], notifier.clone()),
            Err(PilotError::NotConfigured)
        ));

        let config = PilotCenterConfig {
            subpath: "/pilot/ws".into(),
            ..config
        };
        let client = PilotClient::from_config(&config, "s1", &[], notifier).unwrap();
        assert_eq!(client.url, "ws://pilot.local:8443/pilot/ws");
    }

    #[tokio::test]
    async fn test_link_drops_while_disconnected() {
        let notifier: Arc<dyn PilotNotification> = Arc::new(Recorder::default());
        let client = PilotClient::new("ws://127.0.0.1:1/pilot", "s1", &[], notifier);
        let link = client.link();
        assert!(!link.is_connected());
        assert!(!link.send(PilotReport::RoomClosed {
            room_id: "room-1".into(),
        }));
    }

    #[tokio::test]
    async fn test_register_dispatch_and_reports() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/pilot", listener.local_addr().unwrap());

        let recorder = Arc::new(Recorder::default());
        let candidates = [CandidateDescriptor::new(
            NetType::Udp,
            "1.2.3.4",
            "0.0.0.0",
            9000,
        )];
        let client = PilotClient::new(url, "server-a", &candidates, recorder.clone())
            .with_reconnect(fast_reconnect());
        let link = client.link();
        let task = client.spawn();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        let Some(Ok(Message::Text(register))) = ws.next().await else {
            panic!("expected register");
        };
        let register: serde_json::Value = serde_json::from_str(&register).unwrap();
        assert_eq!(register["type"], "register");
        assert_eq!(register["server_id"], "server-a");
        assert_eq!(register["candidates"][0]["ip"], "1.2.3.4");
        assert_eq!(register["candidates"][0]["port"], 9000);

        for msg in [
            r#"{"type":"room_create","room_id":"r1"}"#,
            r#"{"type":"room_update","room_id":"r1","payload":{"k":1}}"#,
            "garbage",
            r#"{"type":"room_rename","room_id":"r1"}"#,
            r#"{"type":"room_destroy","room_id":"r1"}"#,
        ] {
            ws.send(Message::Text(msg.to_string())).await.unwrap();
        }
        wait_for(|| recorder.seen.lock().len() == 4).await;
        let kinds: Vec<String> = recorder.seen.lock().iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            kinds,
            vec!["room_create", "room_update", "room_rename", "room_destroy"]
        );

        wait_for(|| link.is_connected()).await;
        assert!(link.send(PilotReport::MemberJoined {
            room_id: "r1".into(),
            user_id: "alice".into(),
        }));
        let Some(Ok(Message::Text(report))) = ws.next().await else {
            panic!("expected report");
        };
        assert!(report.contains("member_joined"));

        // Server goes away: the link stops accepting reports
        drop(ws);
        wait_for(|| !link.is_connected()).await;
        assert!(!link.send(PilotReport::RoomClosed {
            room_id: "r1".into(),
        }));

        // And the client comes back with a fresh register
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let Some(Ok(Message::Text(register))) = ws.next().await else {
            panic!("expected register after reconnect");
        };
        assert!(register.contains("\"register\""));

        task.abort();
    }

    #[tokio::test]
    async fn test_heartbeat_carries_stats() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/pilot", listener.local_addr().unwrap());

        let client = PilotClient::new(url, "server-b", &[], Arc::new(Recorder::default()))
            .with_heartbeat(Duration::from_millis(50));
        let task = client.spawn();

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _register = ws.next().await;
        let Some(Ok(Message::Text(beat))) = ws.next().await else {
            panic!("expected heartbeat");
        };
        let beat: serde_json::Value = serde_json::from_str(&beat).unwrap();
        assert_eq!(beat["type"], "heartbeat");
        assert_eq!(beat["rooms"], 0);

        task.abort();
    }
}
