//! Core type definitions for RTCPilot
//!
//! These types are shared by the signaling, room and media layers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque, externally assigned room identifier
pub type RoomId = String;

/// Member (user) identifier within a room
pub type MemberId = String;

/// Index of a candidate listener inside the process
pub type ListenerId = u32;

/// Transport of a network candidate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    Tcp,
    Udp,
}

impl NetType {
    pub fn as_str(self) -> &'static str {
        match self {
            NetType::Tcp => "tcp",
            NetType::Udp => "udp",
        }
    }
}

impl fmt::Display for NetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(NetType::Tcp),
            "udp" => Ok(NetType::Udp),
            other => Err(format!("Unknown nettype: {}", other)),
        }
    }
}

/// A configured network candidate: where we listen and what we advertise
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    #[serde(rename = "nettype")]
    pub net_type: NetType,
    /// Address advertised to peers in SDP
    pub candidate_ip: String,
    /// Local address the listener binds
    pub listen_ip: String,
    pub port: u16,
}

impl CandidateDescriptor {
    pub fn new(
        net_type: NetType,
        candidate_ip: impl Into<String>,
        listen_ip: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            net_type,
            candidate_ip: candidate_ip.into(),
            listen_ip: listen_ip.into(),
            port,
        }
    }

    /// `listen_ip:port`, suitable for binding
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_ip, self.port)
    }
}

impl fmt::Display for CandidateDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} (listen {})",
            self.net_type, self.candidate_ip, self.port, self.listen_ip
        )
    }
}

/// Endpoint advertised for a peer whose media goes through a relay port
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub ip: String,
    pub port: u16,
}

/// Stable handle to a peer session stored in the session arena
///
/// The generation guards against a recycled arena slot being mistaken for
/// the session that used to live there.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionHandle {
    pub key: u32,
    pub generation: u32,
}

impl SessionHandle {
    pub const fn new(key: u32, generation: u32) -> Self {
        Self { key, generation }
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}.{}", self.key, self.generation)
    }
}

/// Local ICE credentials issued to one peer
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IceCredentials {
    pub ufrag: String,
    pub pwd: String,
}

const ICE_CHARS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

impl IceCredentials {
    /// Generate a random ufrag (8 chars) and password (24 chars)
    ///
    /// # Panics
    /// Panics if the system random number generator fails (extremely rare).
    /// Use `try_generate` if you need to handle this case.
    pub fn generate() -> Self {
        Self::try_generate().expect("RNG failed - system entropy source unavailable")
    }

    /// Try to generate credentials, returning an error if RNG fails
    pub fn try_generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes)?;
        let mut chars = bytes
            .iter()
            .map(|b| ICE_CHARS[*b as usize % ICE_CHARS.len()] as char);
        let ufrag: String = chars.by_ref().take(8).collect();
        let pwd: String = chars.take(24).collect();
        Ok(Self { ufrag, pwd })
    }
}

/// Kind of media packet on the data path
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Rtp,
    Rtcp,
}

/// Traffic-shaping knobs for synthetic loss testing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DiscardPolicy {
    /// Percent of inbound packets dropped after decryption
    pub uplink_percent: u32,
    /// Percent of outbound packets dropped before encryption
    pub downlink_percent: u32,
}

impl DiscardPolicy {
    pub const fn none() -> Self {
        Self {
            uplink_percent: 0,
            downlink_percent: 0,
        }
    }
}
