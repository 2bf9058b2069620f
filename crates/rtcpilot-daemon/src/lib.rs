//! RTCPilot Daemon - WebRTC sessions, rooms and the pilot link
//!
//! This crate provides:
//! - ICE-lite candidate listeners (UDP and RFC 4571 TCP)
//! - DTLS handshake (server role) and SRTP/SRTCP protection over `webrtc`
//! - Room orchestration driven by browsers and the pilot center
//! - Relay port allocation
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐        ┌──────────────────────┐
//! │   Signaling server   │        │    Pilot client      │
//! │  (join / leave)      │        │  (directives)        │
//! └──────────┬───────────┘        └──────────┬───────────┘
//!            │ JoinHandler                   │ PilotNotification
//!            ▼                               ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      RoomManager                        │
//! │  rooms (DashMap) → session arena (slab) → PeerSession   │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ SessionObserver
//! ┌──────────────────────────┴──────────────────────────────┐
//! │   Candidate listeners: STUN │ DTLS │ SRTP demux         │
//! │   one task per candidate and per relay port             │
//! └──────────────────────────┬──────────────────────────────┘
//!                            │ MediaSink
//!                            ▼
//!                   external stream manager
//! ```

pub mod dtls;
pub mod listener;
pub mod logging;
pub mod media;
pub mod pilot;
pub mod port_alloc;
pub mod room_manager;
pub mod server;
pub mod session;
pub mod srtp;
pub mod stun;

pub use dtls::{DtlsError, DtlsIdentity, HandshakeSession, HandshakeState, HandshakeTimeouts};
pub use listener::{ListenerContext, ListenerError, SessionObserver};
pub use media::{MediaPacket, MediaSink, NullMediaSink};
pub use pilot::{PilotClient, PilotError, PilotLink, ReconnectConfig};
pub use port_alloc::{PortAllocator, PortError, PortLease};
pub use room_manager::{RelayPool, RoomManager, RoomSettings};
pub use server::{RtcPilotServer, ServerError};
pub use session::{PeerSession, SessionError, SessionRegistry, SessionState};
pub use srtp::{SrtpError, SrtpSession};
pub use stun::StunError;
