//! RTCPilot Signal
//!
//! Browser signaling and pilot control-plane messages.
//!
//! # Protocol
//!
//! 1. Browser connects to the signaling WebSocket
//! 2. Browser sends `join` with its SDP offer
//! 3. Server replies `joined` with an ICE-lite answer
//! 4. Media flows over ICE/DTLS/SRTP to the advertised candidates
//! 5. `leave` or disconnect removes the member from the room

pub mod messages;
pub mod room;
pub mod server;

pub use messages::{
    CandidateInfo, ErrorCode, PilotDirective, PilotNotification, PilotReport, SignalError,
    SignalMessage,
};
pub use room::{Room, RoomError, RoomState};
pub use server::{JoinHandler, ServerStats, SignalServer};

/// Maximum members per room
pub const MAX_MEMBERS_PER_ROOM: usize = 64;
