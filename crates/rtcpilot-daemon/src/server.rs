//! Server bootstrap
//!
//! Startup order:
//! 1. validate and dump the configuration
//! 2. load the certificate and key, convert them for DTLS
//! 3. SRTP self-test
//! 4. relay port range (pilot mode only)
//! 5. room manager, candidate listeners and the session timer
//! 6. pilot client (when configured)
//! 7. signaling server
//!
//! Any failure before the listeners run aborts startup.

use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use rtcpilot_core::{CertStore, Config, ConfigError, CryptoError, StreamServerConfig};
use rtcpilot_signal::SignalServer;

use crate::dtls::{DtlsError, DtlsIdentity};
use crate::listener::{spawn_session_timer, start_candidate_listeners, ListenerError};
use crate::media::{MediaSink, NullMediaSink};
use crate::pilot::{PilotClient, PilotError};
use crate::port_alloc::{PortAllocator, PortError};
use crate::room_manager::{RelayPool, RoomManager, RoomSettings};
use crate::srtp::{self, SrtpError};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("certificate error: {0}")]
    Cert(#[from] CryptoError),

    #[error("DTLS identity: {0}")]
    Dtls(#[from] DtlsError),

    #[error("system entropy source unavailable: {0}")]
    Entropy(#[from] getrandom::Error),

    #[error("SRTP initialization failed: {0}")]
    Srtp(#[from] SrtpError),

    #[error("relay port range: {0}")]
    Relay(#[from] PortError),

    #[error("pilot client: {0}")]
    Pilot(#[from] PilotError),

    #[error("listener error: {0}")]
    Listener(#[from] ListenerError),

    #[error("failed to bind signaling server on {addr}: {source}")]
    SignalBind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// A running server
pub struct RtcPilotServer {
    rooms: Arc<RoomManager>,
    signal_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl RtcPilotServer {
    /// Start with the default media sink
    pub async fn start(config: Config) -> Result<Self, ServerError> {
        Self::start_with_sink(config, Arc::new(NullMediaSink::default())).await
    }

    pub async fn start_with_sink(
        config: Config,
        sink: Arc<dyn MediaSink>,
    ) -> Result<Self, ServerError> {
        config.validate()?;
        info!("Configuration:\n{}", config.dump());

        let cert = Arc::new(CertStore::init(
            Path::new(&config.cert_path),
            Path::new(&config.key_path),
        )?);
        let identity = Arc::new(DtlsIdentity::new(cert)?);

        srtp::global_init()?;

        let relay = if config.relay_enabled() {
            let relay = &config.rtc_relay;
            let allocator = PortAllocator::initialize(relay.relay_udp_start, relay.relay_udp_end)?;
            info!(
                "Relay ports {}-{} advertised as {}",
                relay.relay_udp_start, relay.relay_udp_end, relay.relay_server_ip
            );
            Some(RelayPool {
                allocator: Arc::new(allocator),
                public_ip: relay.relay_server_ip.clone(),
            })
        } else {
            info!("Relay disabled");
            None
        };

        report_stream_server("rtmp_server", &config.rtmp_server);
        report_stream_server("httpflv_server", &config.httpflv_server);
        report_stream_server("ws_stream_server", &config.ws_stream_server);

        let rooms = RoomManager::new(RoomSettings::from_config(&config), identity, relay, sink);
        let ctx = rooms.listener_context();
        let mut tasks = start_candidate_listeners(&config.candidates, ctx.clone()).await?;
        tasks.push(spawn_session_timer(ctx));

        if config.pilot_enabled() {
            let client = PilotClient::from_config(
                &config.pilot_center,
                server_id()?,
                &config.candidates,
                rooms.clone(),
            )?;
            rooms.set_pilot_link(client.link());
            info!("Pilot center {}", config.pilot_center.url());
            tasks.push(client.spawn());
        } else {
            info!("Pilot center disabled, rooms follow direct joins only");
        }

        let ws = &config.websocket_server;
        let addr = format!("{}:{}", ws.listen_ip, ws.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::SignalBind {
                addr: addr.clone(),
                source,
            })?;
        let signal_addr = listener
            .local_addr()
            .map_err(|source| ServerError::SignalBind { addr, source })?;
        let signal = SignalServer::new(rooms.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = signal.serve_listener(listener).await {
                error!("Signal server stopped: {}", e);
            }
        }));

        info!("RTCPilot started");
        Ok(Self {
            rooms,
            signal_addr,
            tasks,
        })
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub fn signal_addr(&self) -> SocketAddr {
        self.signal_addr
    }

    /// Stop every task, close every room and drop SRTP state
    pub fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.rooms.close_all();
        srtp::cleanup_global();
        info!("RTCPilot stopped");
    }
}

fn report_stream_server(name: &str, config: &StreamServerConfig) {
    if config.enable {
        info!(
            "{} {}:{} enabled, served by the external stream manager",
            name, config.listen_ip, config.port
        );
    } else {
        info!("{} disabled", name);
    }
}

/// Identity announced to the pilot center
fn server_id() -> Result<String, ServerError> {
    let mut bytes = [0u8; 4];
    getrandom::getrandom(&mut bytes)?;
    Ok(format!("rtcpilot-{}", hex::encode(bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use rtcpilot_core::GeneratedCert;
    use tokio_tungstenite::{connect_async, tungstenite::Message};

    fn write_cert(dir: &Path) -> (String, String) {
        let cert_path = dir.join("server.crt");
        let key_path = dir.join("server.key");
        let generated: GeneratedCert =
            CertStore::generate_self_signed(vec!["localhost".into()]).unwrap();
        generated.write_to(&cert_path, &key_path).unwrap();
        (
            cert_path.to_string_lossy().into_owned(),
            key_path.to_string_lossy().into_owned(),
        )
    }

    fn config_with_cert(cert_path: String, key_path: String) -> Config {
        let yaml = format!(
            "websocket_server:\n  listen_ip: 127.0.0.1\n  port: 0\n\
             cert_path: {}\nkey_path: {}\n",
            cert_path, key_path
        );
        Config::from_yaml(&yaml).unwrap()
    }

    #[test]
    fn test_server_id() {
        let id = server_id().unwrap();
        assert!(id.starts_with("rtcpilot-"));
        assert_eq!(id.len(), "rtcpilot-".len() + 8);
        assert_ne!(id, server_id().unwrap());
    }

    #[tokio::test]
    async fn test_missing_certificate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cert_path = dir.path().join("none.crt").to_string_lossy().into_owned();
        config.key_path = dir.path().join("none.key").to_string_lossy().into_owned();
        assert!(matches!(
            RtcPilotServer::start(config).await,
            Err(ServerError::Cert(_))
        ));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_cert(dir.path());
        let server = RtcPilotServer::start(config_with_cert(cert_path, key_path))
            .await
            .unwrap();

        let url = format!("ws://{}/", server.signal_addr());
        let (mut ws, _) = connect_async(url.as_str()).await.unwrap();
        ws.send(Message::Text(r#"{"type":"ping","timestamp":7}"#.into()))
            .await
            .unwrap();
        let Some(Ok(Message::Text(reply))) = ws.next().await else {
            panic!("expected pong");
        };
        assert!(reply.contains("pong"));

        assert_eq!(server.rooms().room_count(), 0);
        server.shutdown();
    }
}
