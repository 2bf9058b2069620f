//! Outbound replay guard
//!
//! Protecting two different payloads under the same SSRC and sequence
//! number reuses the AEAD nonce. Every outbound RTP packet passes through a
//! per-SSRC sliding window first; a sequence number already protected, or
//! one that fell out of the window, is refused.

use std::collections::HashMap;

use webrtc::util::replay_detector::{ReplayDetector, WrappedSlidingWindowDetector};

use super::SrtpError;

/// Packets more than this many sequence numbers behind the highest are refused
pub const WINDOW_SIZE: usize = 64;

const MAX_SEQUENCE_NUMBER: u64 = 0xFFFF;

const RTP_HEADER_LEN: usize = 12;

/// Replay windows for every SSRC a session has sent on
#[derive(Default)]
pub struct OutboundGuard {
    windows: HashMap<u32, WrappedSlidingWindowDetector>,
}

impl OutboundGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `protect` on an RTP packet whose sequence number is fresh
    ///
    /// The sequence number is recorded only once `protect` succeeded.
    pub fn admit<F>(&mut self, rtp: &[u8], protect: F) -> Result<Vec<u8>, SrtpError>
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, SrtpError>,
    {
        if rtp.len() < RTP_HEADER_LEN {
            return Err(SrtpError::Protect("RTP packet shorter than its header".into()));
        }
        let seq = u16::from_be_bytes([rtp[2], rtp[3]]);
        let ssrc = u32::from_be_bytes([rtp[8], rtp[9], rtp[10], rtp[11]]);

        let window = self
            .windows
            .entry(ssrc)
            .or_insert_with(|| WrappedSlidingWindowDetector::new(WINDOW_SIZE, MAX_SEQUENCE_NUMBER));
        if !window.check(u64::from(seq)) {
            return Err(SrtpError::Replay);
        }
        let protected = protect(rtp)?;
        window.accept();
        Ok(protected)
    }

    pub fn ssrc_count(&self) -> usize {
        self.windows.len()
    }
}
