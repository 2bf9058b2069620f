//! RTCPilot Core - Shared types, configuration, certificates and SDP handling
//!
//! This crate contains the foundational pieces used by the signaling and
//! media components. It has no networking code.

pub mod config;
pub mod crypto;
pub mod error;
pub mod sdp;
pub mod types;

pub use config::{
    Config, LogConfig, PilotCenterConfig, RelayConfig, SessionConfig, StreamServerConfig,
    WsServerConfig,
};
pub use crypto::{CertFingerprint, CertStore, GeneratedCert};
pub use error::*;
pub use sdp::{
    AdvertisedCandidate, AnswerParams, MediaSection, MediaSectionExt, SessionDescription,
};
pub use types::*;

/// Default path of the YAML configuration file
pub const DEFAULT_CONFIG_PATH: &str = "rtcpilot.yaml";

/// Default signaling port
pub const DEFAULT_SIGNAL_PORT: u16 = 5555;
