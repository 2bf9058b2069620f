//! Configuration system for RTCPilot
//!
//! The server is started with a single YAML file. Every section is
//! optional and falls back to the defaults below; the result is treated as
//! read-only for the lifetime of the process.
//!
//! ```yaml
//! log:
//!   log_path: /var/log/rtcpilot/server.log
//!   log_level: info
//! websocket_server:
//!   listen_ip: 0.0.0.0
//!   port: 5555
//! cert_path: certs/server.crt
//! key_path: certs/server.key
//! candidates:
//!   - nettype: udp
//!     candidate_ip: 1.2.3.4
//!     listen_ip: 0.0.0.0
//!     port: 9000
//! pilot_center:
//!   enable: true
//!   host: pilot.internal
//!   port: 7000
//!   subpath: /pilot/ws
//! rtc_relay:
//!   relay_server_ip: 1.2.3.4
//!   relay_udp_start: 40000
//!   relay_udp_end: 40100
//! ```

use std::fmt::Write as _;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ConfigError;
use crate::types::{CandidateDescriptor, DiscardPolicy};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    /// WebRTC signaling endpoint
    pub websocket_server: WsServerConfig,
    pub cert_path: String,
    pub key_path: String,
    pub downlink_discard_percent: u32,
    pub uplink_discard_percent: u32,
    pub candidates: Vec<CandidateDescriptor>,
    pub pilot_center: PilotCenterConfig,
    pub rtc_relay: RelayConfig,
    pub session: SessionConfig,
    pub rtmp_server: StreamServerConfig,
    pub httpflv_server: StreamServerConfig,
    pub ws_stream_server: StreamServerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            websocket_server: WsServerConfig::default(),
            cert_path: String::new(),
            key_path: String::new(),
            downlink_discard_percent: 0,
            uplink_discard_percent: 0,
            candidates: Vec::new(),
            pilot_center: PilotCenterConfig::default(),
            rtc_relay: RelayConfig::default(),
            session: SessionConfig::default(),
            rtmp_server: StreamServerConfig::with_port(1935),
            httpflv_server: StreamServerConfig::with_port(8080),
            ws_stream_server: StreamServerConfig::with_port(8443),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log file prefix; a timestamp suffix is appended at startup
    pub log_path: String,
    /// debug | info | warn | error
    pub log_level: String,
    /// Mirror log output to stdout
    pub log_console: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_path: String::new(),
            log_level: "info".into(),
            log_console: false,
        }
    }
}

/// WebSocket signaling listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WsServerConfig {
    pub listen_ip: String,
    pub port: u16,
}

impl Default for WsServerConfig {
    fn default() -> Self {
        Self {
            listen_ip: "0.0.0.0".into(),
            port: 5555,
        }
    }
}

/// Pilot control plane connection
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PilotCenterConfig {
    pub enable: bool,
    pub host: String,
    pub port: u16,
    pub subpath: String,
}

impl PilotCenterConfig {
    /// Host, port and subpath are all present
    pub fn is_complete(&self) -> bool {
        !self.host.is_empty() && self.port != 0 && !self.subpath.is_empty()
    }

    /// WebSocket URL of the pilot center
    pub fn url(&self) -> String {
        format!(
            "ws://{}:{}/{}",
            self.host,
            self.port,
            self.subpath.trim_start_matches('/')
        )
    }
}

/// Relay port range and relay traffic shaping
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub relay_server_ip: String,
    pub relay_udp_start: u16,
    pub relay_udp_end: u16,
    pub send_discard_percent: u32,
    pub recv_discard_percent: u32,
}

impl RelayConfig {
    pub fn is_complete(&self) -> bool {
        !self.relay_server_ip.is_empty() && self.relay_udp_start != 0 && self.relay_udp_end != 0
    }

    /// Discard policy applied to sessions reached through a relay port
    pub fn discard_policy(&self) -> DiscardPolicy {
        DiscardPolicy {
            uplink_percent: self.recv_discard_percent,
            downlink_percent: self.send_discard_percent,
        }
    }
}

/// Per-session limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Handshake must complete within this many seconds
    pub handshake_timeout_secs: u64,
    /// Consecutive auth/decrypt failures before the session is torn down
    pub max_consecutive_packet_failures: u32,
    /// An Established session with no authenticated traffic for this many
    /// seconds is torn down
    pub idle_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 30,
            max_consecutive_packet_failures: 64,
            idle_timeout_secs: 30,
        }
    }
}

/// RTMP / HTTP-FLV / WS-stream ingest listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamServerConfig {
    pub enable: bool,
    pub listen_ip: String,
    pub port: u16,
}

impl StreamServerConfig {
    fn with_port(port: u16) -> Self {
        Self {
            enable: true,
            listen_ip: "0.0.0.0".into(),
            port,
        }
    }
}

impl Default for StreamServerConfig {
    fn default() -> Self {
        Self::with_port(0)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_yaml(&content)?;
        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        let percents = [
            ("uplink_discard_percent", self.uplink_discard_percent),
            ("downlink_discard_percent", self.downlink_discard_percent),
            ("rtc_relay.send_discard_percent", self.rtc_relay.send_discard_percent),
            ("rtc_relay.recv_discard_percent", self.rtc_relay.recv_discard_percent),
        ];
        for (name, value) in percents {
            if value > 100 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be within 0..=100, got {}",
                    name, value
                )));
            }
        }

        for candidate in &self.candidates {
            if candidate.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "candidate {} has no port",
                    candidate.candidate_ip
                )));
            }
        }

        if self.session.idle_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "session.idle_timeout_secs must be at least 1".into(),
            ));
        }

        if self.rtc_relay.is_complete() && self.rtc_relay.relay_udp_start > self.rtc_relay.relay_udp_end {
            return Err(ConfigError::Invalid(format!(
                "relay_udp_start {} is greater than relay_udp_end {}",
                self.rtc_relay.relay_udp_start, self.rtc_relay.relay_udp_end
            )));
        }

        Ok(())
    }

    /// Pilot integration is enabled and fully configured
    pub fn pilot_enabled(&self) -> bool {
        self.pilot_center.enable && self.pilot_center.is_complete()
    }

    /// Relay ports are handed out only when the pilot drives rooms
    pub fn relay_enabled(&self) -> bool {
        self.pilot_enabled() && self.rtc_relay.is_complete()
    }

    /// Discard policy for sessions on the configured candidates
    pub fn discard_policy(&self) -> DiscardPolicy {
        DiscardPolicy {
            uplink_percent: self.uplink_discard_percent,
            downlink_percent: self.downlink_discard_percent,
        }
    }

    /// Human readable dump, logged once at startup
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "log_path: {}", self.log.log_path);
        let _ = writeln!(out, "log_level: {}", self.log.log_level);
        let _ = writeln!(out, "log_console: {}", self.log.log_console);
        let _ = writeln!(
            out,
            "websocket_server: {}:{}",
            self.websocket_server.listen_ip, self.websocket_server.port
        );
        let _ = writeln!(out, "cert_path: {}", self.cert_path);
        let _ = writeln!(out, "key_path: {}", self.key_path);
        let _ = writeln!(out, "candidates:");
        for candidate in &self.candidates {
            let _ = writeln!(out, "  - nettype: {}", candidate.net_type);
            let _ = writeln!(out, "    candidate ip: {}", candidate.candidate_ip);
            let _ = writeln!(out, "    listen ip: {}", candidate.listen_ip);
            let _ = writeln!(out, "    port: {}", candidate.port);
        }
        let _ = writeln!(out, "downlink_discard_percent: {}", self.downlink_discard_percent);
        let _ = writeln!(out, "uplink_discard_percent: {}", self.uplink_discard_percent);

        if self.pilot_center.is_complete() {
            let p = &self.pilot_center;
            let _ = writeln!(out, "pilot_center:");
            let _ = writeln!(out, "  enable: {}", p.enable);
            let _ = writeln!(out, "  host: {}", p.host);
            let _ = writeln!(out, "  port: {}", p.port);
            let _ = writeln!(out, "  subpath: {}", p.subpath);
        } else {
            let _ = writeln!(out, "pilot_center: null");
        }

        if self.rtc_relay.is_complete() {
            let r = &self.rtc_relay;
            let _ = writeln!(out, "rtc_relay:");
            let _ = writeln!(out, "  relay_server_ip: {}", r.relay_server_ip);
            let _ = writeln!(out, "  relay_udp_start: {}", r.relay_udp_start);
            let _ = writeln!(out, "  relay_udp_end: {}", r.relay_udp_end);
            let _ = writeln!(out, "  send_discard_percent: {}", r.send_discard_percent);
            let _ = writeln!(out, "  recv_discard_percent: {}", r.recv_discard_percent);
        } else {
            let _ = writeln!(out, "rtc_relay: null");
        }

        for (name, server) in [
            ("rtmp_server", &self.rtmp_server),
            ("httpflv_server", &self.httpflv_server),
            ("ws_stream_server", &self.ws_stream_server),
        ] {
            let _ = writeln!(out, "{}:", name);
            let _ = writeln!(out, "  enable: {}", server.enable);
            let _ = writeln!(out, "  listen_ip: {}", server.listen_ip);
            let _ = writeln!(out, "  port: {}", server.port);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NetType;

    const SAMPLE: &str = r#"
log:
  log_path: /tmp/rtcpilot.log
  log_level: debug
websocket_server:
  listen_ip: 127.0.0.1
  port: 5555
cert_path: certs/server.crt
key_path: certs/server.key
uplink_discard_percent: 5
candidates:
  - nettype: udp
    candidate_ip: 1.2.3.4
    listen_ip: 0.0.0.0
    port: 9000
  - nettype: tcp
    candidate_ip: 1.2.3.4
    listen_ip: 0.0.0.0
    port: 9001
pilot_center:
  enable: true
  host: pilot.local
  port: 7000
  subpath: /pilot/ws
rtc_relay:
  relay_server_ip: 5.6.7.8
  relay_udp_start: 40000
  relay_udp_end: 40010
rtmp_server:
  enable: false
"#;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.rtmp_server.port, 1935);
        assert_eq!(config.httpflv_server.port, 8080);
        assert_eq!(config.ws_stream_server.port, 8443);
        assert!(config.rtmp_server.enable);
        assert!(!config.pilot_enabled());
        assert_eq!(config.session.handshake_timeout_secs, 30);
        assert_eq!(config.session.idle_timeout_secs, 30);
    }

    #[test]
    fn test_session_idle_timeout_override() {
        let config = Config::from_yaml("session:\n  idle_timeout_secs: 5\n").unwrap();
        assert_eq!(config.session.idle_timeout_secs, 5);
        assert_eq!(config.session.handshake_timeout_secs, 30);
        assert!(Config::from_yaml("session:\n  idle_timeout_secs: 0\n").is_err());
    }

    #[test]
    fn test_parse_sample() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.log.log_level, "debug");
        assert_eq!(config.candidates.len(), 2);
        assert_eq!(config.candidates[0].net_type, NetType::Udp);
        assert_eq!(config.candidates[1].net_type, NetType::Tcp);
        assert_eq!(config.uplink_discard_percent, 5);
        assert!(config.pilot_enabled());
        assert!(config.relay_enabled());
        assert_eq!(config.pilot_center.url(), "ws://pilot.local:7000/pilot/ws");
        // Sections not present keep defaults
        assert!(!config.rtmp_server.enable);
        assert_eq!(config.rtmp_server.port, 1935);
        assert!(config.httpflv_server.enable);
    }

    #[test]
    fn test_unknown_nettype_rejected() {
        let yaml = r#"
candidates:
  - nettype: sctp
    candidate_ip: 1.2.3.4
    listen_ip: 0.0.0.0
    port: 9000
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_discard_percent_bounds() {
        let yaml = "uplink_discard_percent: 101\n";
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_inverted_relay_range_rejected() {
        let yaml = r#"
rtc_relay:
  relay_server_ip: 5.6.7.8
  relay_udp_start: 40010
  relay_udp_end: 40000
"#;
        assert!(matches!(Config::from_yaml(yaml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_pilot_incomplete_disables_relay() {
        let yaml = r#"
pilot_center:
  enable: true
  host: pilot.local
rtc_relay:
  relay_server_ip: 5.6.7.8
  relay_udp_start: 40000
  relay_udp_end: 40010
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert!(!config.pilot_enabled());
        assert!(!config.relay_enabled());
    }

    #[test]
    fn test_dump() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let dump = config.dump();
        assert!(dump.contains("candidate ip: 1.2.3.4"));
        assert!(dump.contains("subpath: /pilot/ws"));
        assert!(dump.contains("relay_udp_start: 40000"));

        let dump = Config::default().dump();
        assert!(dump.contains("pilot_center: null"));
        assert!(dump.contains("rtc_relay: null"));
    }

    #[test]
    fn test_config_load_missing() {
        let err = Config::load_from(Path::new("/nonexistent/rtcpilot.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_config_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtcpilot.yaml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.websocket_server.port, 5555);
    }
}
