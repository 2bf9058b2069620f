//! Error types shared across RTCPilot crates
//!
//! Startup errors (`ConfigError`, `CryptoError`) are fatal: the process
//! exits before any listener starts. `SdpError` is session-fatal for the
//! peer that sent the description.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(e: serde_yaml::Error) -> Self {
        ConfigError::Parse(e.to_string())
    }
}

/// Certificate / key store errors
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("failed to read {path:?}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("malformed PEM: {0}")]
    Pem(String),

    #[error("no certificate found in PEM input")]
    NoCertificate,

    #[error("no private key found in PEM input")]
    NoPrivateKey,

    #[error("unsupported key: {0}")]
    UnsupportedKey(String),

    #[error("certificate public key does not match private key")]
    KeyMismatch,

    #[error("certificate generation failed: {0}")]
    Generate(String),
}

impl From<sdp::Error> for SdpError {
    fn from(e: sdp::Error) -> Self {
        SdpError::Parse(e.to_string())
    }
}

impl From<pem::PemError> for CryptoError {
    fn from(e: pem::PemError) -> Self {
        CryptoError::Pem(e.to_string())
    }
}

/// Session description errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("empty session description")]
    Empty,

    #[error("malformed session description: {0}")]
    Parse(String),

    #[error("session description has no media section")]
    NoMedia,

    #[error("missing attribute: {0}")]
    MissingAttribute(&'static str),
}
