//! SRTP/SRTCP media protection
//!
//! Contexts come from `webrtc::srtp`, keyed with the material an
//! Established DTLS handshake exported. A [`SrtpSession`] can only be built
//! from such a handshake. Inbound contexts carry replay windows; outbound
//! RTP goes through an [`OutboundGuard`] so a sequence number is never
//! protected twice.

pub mod replay;

use std::sync::atomic::{AtomicBool, Ordering};

use rand::Rng;
use thiserror::Error;
use tracing::{debug, info};
use webrtc::srtp::context::Context;
use webrtc::srtp::option::{srtcp_replay_protection, srtp_replay_protection};
use webrtc::srtp::protection_profile::ProtectionProfile;

use rtcpilot_core::{DiscardPolicy, MediaKind};

use crate::dtls::{ExportedKeys, HandshakeSession, HandshakeState};

pub use replay::OutboundGuard;

/// Inbound replay window, in packets
const REPLAY_WINDOW: usize = 64;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SrtpError {
    #[error("invalid SRTP keying material: {0}")]
    Setup(String),

    #[error("protect failed: {0}")]
    Protect(String),

    #[error("unprotect failed: {0}")]
    Unprotect(String),

    #[error("replayed or too old packet")]
    Replay,

    #[error("media session requires an established handshake")]
    ContractViolation,

    #[error("SRTP self-test failed")]
    SelfTest,
}

impl SrtpError {
    /// Counts toward the consecutive failure limit of a session
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, SrtpError::Unprotect(_))
    }

    fn inbound(e: webrtc::srtp::Error) -> Self {
        match e {
            webrtc::srtp::Error::SrtpSsrcDuplicated(..)
            | webrtc::srtp::Error::SrtcpSsrcDuplicated(..) => SrtpError::Replay,
            other => SrtpError::Unprotect(other.to_string()),
        }
    }
}

/// Roll the dice for a discard percentage
fn should_discard(percent: u32) -> bool {
    match percent {
        0 => false,
        p if p >= 100 => true,
        p => rand::thread_rng().gen_range(0..100u32) < p,
    }
}

/// Inbound and outbound contexts for one peer
pub struct SrtpSession {
    profile: ProtectionProfile,
    outbound: Context,
    inbound: Context,
    guard: OutboundGuard,
    discard: DiscardPolicy,
}

impl SrtpSession {
    /// Build from the keys an Established handshake exported
    pub fn new(keys: ExportedKeys, discard: DiscardPolicy) -> Result<Self, SrtpError> {
        let outbound = Context::new(
            &keys.local_key,
            &keys.local_salt,
            keys.profile,
            None,
            None,
        )
        .map_err(|e| SrtpError::Setup(e.to_string()))?;
        let inbound = Context::new(
            &keys.remote_key,
            &keys.remote_salt,
            keys.profile,
            Some(srtp_replay_protection(REPLAY_WINDOW)),
            Some(srtcp_replay_protection(REPLAY_WINDOW)),
        )
        .map_err(|e| SrtpError::Setup(e.to_string()))?;
        Ok(Self {
            profile: keys.profile,
            outbound,
            inbound,
            guard: OutboundGuard::new(),
            discard,
        })
    }

    pub fn from_handshake(
        handshake: &HandshakeSession,
        discard: DiscardPolicy,
    ) -> Result<Self, SrtpError> {
        if handshake.state() != HandshakeState::Established {
            return Err(SrtpError::ContractViolation);
        }
        let keys = handshake
            .export_keys()
            .ok_or(SrtpError::ContractViolation)?;
        debug!("SRTP session created with {:?}", keys.profile);
        Self::new(keys, discard)
    }

    pub fn profile(&self) -> ProtectionProfile {
        self.profile
    }

    /// Protect an RTP packet. A sequence number already protected on its
    /// SSRC is refused with [`SrtpError::Replay`].
    pub fn protect(&mut self, rtp: &[u8]) -> Result<Vec<u8>, SrtpError> {
        let outbound = &mut self.outbound;
        self.guard.admit(rtp, |rtp| {
            outbound
                .encrypt_rtp(rtp)
                .map(|b| b.to_vec())
                .map_err(|e| SrtpError::Protect(e.to_string()))
        })
    }

    /// Protect an RTCP packet. The SRTCP index is assigned here, so a
    /// resent packet never reuses a nonce.
    pub fn protect_rtcp(&mut self, rtcp: &[u8]) -> Result<Vec<u8>, SrtpError> {
        self.outbound
            .encrypt_rtcp(rtcp)
            .map(|b| b.to_vec())
            .map_err(|e| SrtpError::Protect(e.to_string()))
    }

    pub fn unprotect(&mut self, srtp: &[u8]) -> Result<Vec<u8>, SrtpError> {
        self.inbound
            .decrypt_rtp(srtp)
            .map(|b| b.to_vec())
            .map_err(SrtpError::inbound)
    }

    pub fn unprotect_rtcp(&mut self, srtcp: &[u8]) -> Result<Vec<u8>, SrtpError> {
        self.inbound
            .decrypt_rtcp(srtcp)
            .map(|b| b.to_vec())
            .map_err(SrtpError::inbound)
    }

    /// Protect an outbound RTP or RTCP packet, `None` when discarded
    ///
    /// Discarded packets never reach the cipher, so sequence and index
    /// state is untouched.
    pub fn protect_outbound(
        &mut self,
        kind: MediaKind,
        packet: &[u8],
    ) -> Result<Option<Vec<u8>>, SrtpError> {
        if should_discard(self.discard.downlink_percent) {
            return Ok(None);
        }
        match kind {
            MediaKind::Rtp => self.protect(packet).map(Some),
            MediaKind::Rtcp => self.protect_rtcp(packet).map(Some),
        }
    }

    /// Unprotect an inbound SRTP or SRTCP packet, `None` when discarded
    pub fn unprotect_inbound(&mut self, packet: &[u8]) -> Result<Option<Vec<u8>>, SrtpError> {
        let plain = if is_rtcp(packet) {
            self.unprotect_rtcp(packet)?
        } else {
            self.unprotect(packet)?
        };
        if should_discard(self.discard.uplink_percent) {
            return Ok(None);
        }
        Ok(Some(plain))
    }
}

/// RTCP and RTP share a port (RFC 5761): payload types 192..=223 are RTCP
pub fn is_rtcp(packet: &[u8]) -> bool {
    matches!(packet.get(1), Some(192..=223))
}

/// Process-wide SRTP self-test, run once at startup
pub fn global_init() -> Result<(), SrtpError> {
    if INITIALIZED.load(Ordering::Acquire) {
        return Ok(());
    }

    let packet = [
        0x80, 0x60, 0x00, 0x01, 0x00, 0x00, 0x00, 0x10, 0xCA, 0xFE, 0xBA, 0xBE, 0x01, 0x02,
    ];
    for profile in [
        ProtectionProfile::AeadAes128Gcm,
        ProtectionProfile::Aes128CmHmacSha1_80,
    ] {
        let (key, salt) = match profile {
            ProtectionProfile::AeadAes128Gcm => (vec![0x3c; 16], vec![0x5a; 12]),
            _ => (vec![0x3c; 16], vec![0x5a; 14]),
        };
        let setup = |e: webrtc::srtp::Error| SrtpError::Setup(e.to_string());
        let mut out = Context::new(&key, &salt, profile, None, None).map_err(setup)?;
        let mut inb = Context::new(&key, &salt, profile, None, None).map_err(setup)?;
        let protected = out
            .encrypt_rtp(&packet)
            .map_err(|e| SrtpError::Protect(e.to_string()))?;
        if protected[12..14] == packet[12..] {
            return Err(SrtpError::SelfTest);
        }
        let plain = inb.decrypt_rtp(&protected).map_err(SrtpError::inbound)?;
        if plain[..] != packet[..] {
            return Err(SrtpError::SelfTest);
        }
    }

    INITIALIZED.store(true, Ordering::Release);
    info!("SRTP initialized");
    Ok(())
}

/// Drop process-wide SRTP state. Safe to call repeatedly or without init.
pub fn cleanup_global() {
    if INITIALIZED.swap(false, Ordering::AcqRel) {
        info!("SRTP cleaned up");
    }
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}
