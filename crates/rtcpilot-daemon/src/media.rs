//! Hand-off point between the session layer and the media stream manager
//!
//! Decrypted RTP/RTCP leaves the session layer through a [`MediaSink`].
//! Stream fan-out, ingest and recording live behind this trait and are
//! not part of this crate.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use rtcpilot_core::{MediaKind, RoomId, SessionHandle};

/// One decrypted media packet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaPacket {
    pub kind: MediaKind,
    pub payload: Bytes,
}

impl MediaPacket {
    pub fn new(kind: MediaKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }
}

/// Receives media from every established session
///
/// Called from listener tasks; implementations must not block.
pub trait MediaSink: Send + Sync {
    fn on_media(&self, room_id: &RoomId, session: SessionHandle, packet: MediaPacket);
}

/// Default sink: counts and drops
#[derive(Debug, Default)]
pub struct NullMediaSink {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl NullMediaSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

impl MediaSink for NullMediaSink {
    fn on_media(&self, _room_id: &RoomId, _session: SessionHandle, packet: MediaPacket) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes
            .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sink_counts() {
        let sink = NullMediaSink::new();
        let room: RoomId = "room-1".into();
        sink.on_media(
            &room,
            SessionHandle::new(0, 1),
            MediaPacket::new(MediaKind::Rtp, vec![0u8; 100]),
        );
        sink.on_media(
            &room,
            SessionHandle::new(0, 1),
            MediaPacket::new(MediaKind::Rtcp, vec![0u8; 28]),
        );
        assert_eq!(sink.packets(), 2);
        assert_eq!(sink.bytes(), 128);
    }
}
