//! DTLS for WebRTC
//!
//! The record layer and handshake come from `webrtc::dtls`. Each session
//! runs a server-side `DTLSConn` in its own task, fed with the datagrams
//! the listener demultiplexes to it. This module adds the pieces around
//! it: the long-lived identity, pinning the peer certificate to the SDP
//! fingerprint, the overall handshake deadline and SRTP key export.
//!
//! # State machine
//!
//! ```text
//! Idle ──start()──▶ Handshaking ──▶ Established ──▶ Closed
//!                        │
//!                        └──(timeout | protocol | verification)──▶ Failed ──reset()──▶ Idle
//! ```

mod conn;
mod identity;
mod session;

use std::time::Duration;

use thiserror::Error;
use webrtc::srtp::config::SessionKeys;
use webrtc::srtp::protection_profile::ProtectionProfile;

pub use conn::SessionConn;
pub use identity::DtlsIdentity;
pub use session::{HandshakeEvent, HandshakeSession};

#[cfg(test)]
pub(crate) use session::negotiated_keys;

/// Handshake errors
///
/// Any of these while Handshaking fails the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DtlsError {
    #[error("DTLS certificate unusable: {0}")]
    Certificate(String),

    #[error("DTLS handshake failed: {0}")]
    Protocol(String),

    #[error("SRTP key export failed: {0}")]
    Export(String),

    #[error("no supported SRTP protection profile negotiated")]
    UnsupportedProfile,

    #[error("peer did not present a certificate")]
    NoCertificate,

    #[error("peer certificate does not match the SDP fingerprint")]
    FingerprintMismatch,

    #[error("handshake input queue exceeded")]
    BufferExceeded,

    #[error("handshake timed out")]
    Timeout,

    #[error("invalid handshake state: {0}")]
    InvalidState(&'static str),
}

/// Handshake lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    Handshaking,
    Established,
    Failed,
    Closed,
}

/// SRTP master keys exported from an Established handshake
///
/// Only [`HandshakeSession::export_keys`] can produce one, which is what
/// ties SRTP setup to a completed handshake.
#[derive(Clone)]
pub struct ExportedKeys {
    pub profile: ProtectionProfile,
    pub local_key: Vec<u8>,
    pub local_salt: Vec<u8>,
    pub remote_key: Vec<u8>,
    pub remote_salt: Vec<u8>,
    _sealed: (),
}

impl ExportedKeys {
    fn from_session_keys(profile: ProtectionProfile, keys: SessionKeys) -> Self {
        Self {
            profile,
            local_key: keys.local_master_key,
            local_salt: keys.local_master_salt,
            remote_key: keys.remote_master_key,
            remote_salt: keys.remote_master_salt,
            _sealed: (),
        }
    }

    /// Keys for the opposite direction, as the peer would hold them
    #[cfg(test)]
    pub(crate) fn mirrored(&self) -> Self {
        Self {
            profile: self.profile,
            local_key: self.remote_key.clone(),
            local_salt: self.remote_salt.clone(),
            remote_key: self.local_key.clone(),
            remote_salt: self.local_salt.clone(),
            _sealed: (),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        Self {
            profile: ProtectionProfile::AeadAes128Gcm,
            local_key: vec![0x11; 16],
            local_salt: vec![0x22; 12],
            remote_key: vec![0x33; 16],
            remote_salt: vec![0x44; 12],
            _sealed: (),
        }
    }
}

impl std::fmt::Debug for ExportedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportedKeys")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// Retransmission and timeout settings
#[derive(Clone, Copy, Debug)]
pub struct HandshakeTimeouts {
    /// Flight retransmission interval
    pub initial_retransmit: Duration,
    /// Overall limit from `start()` to Established
    pub handshake_timeout: Duration,
}

impl Default for HandshakeTimeouts {
    fn default() -> Self {
        Self {
            initial_retransmit: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl HandshakeTimeouts {
    pub fn with_handshake_timeout(secs: u64) -> Self {
        Self {
            handshake_timeout: Duration::from_secs(secs),
            ..Self::default()
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;

    use rtcpilot_core::CertStore;
    use webrtc::dtls::config::{Config, ExtendedMasterSecretType};
    use webrtc::dtls::extension::extension_use_srtp::SrtpProtectionProfile;

    pub(crate) fn test_identity() -> Arc<DtlsIdentity> {
        let store = CertStore::generate_self_signed(vec!["rtcpilot".into()])
            .unwrap()
            .into_store()
            .unwrap();
        Arc::new(DtlsIdentity::new(Arc::new(store)).unwrap())
    }

    /// Config a browser-like client would use against us
    pub(crate) fn client_config(identity: &DtlsIdentity) -> Config {
        Config {
            certificates: vec![identity.certificate().clone()],
            srtp_protection_profiles: vec![SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm],
            extended_master_secret: ExtendedMasterSecretType::Require,
            insecure_skip_verify: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_exported_keys_debug_hides_material() {
        let keys = ExportedKeys::for_test();
        let text = format!("{:?}", keys);
        assert!(text.contains("AeadAes128Gcm"));
        assert!(!text.contains("17"));
        assert_eq!(keys.mirrored().local_key, keys.remote_key);
    }
}
