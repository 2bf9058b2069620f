//! Room manager
//!
//! Owns every room and drives membership. Rooms are created on demand by a
//! join or by the pilot center and are destroyed when their last member
//! leaves or when the pilot asks for it.
//!
//! Locks are always taken in the order rooms, session arena, session, and
//! none of them is held across an await point.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

use rtcpilot_core::crypto::parse_fingerprint;
use rtcpilot_core::sdp::advertised_candidates;
use rtcpilot_core::{
    AnswerParams, CandidateDescriptor, Config, DiscardPolicy, IceCredentials, MediaKind, MemberId,
    RelayEndpoint, RoomId, SessionDescription, SessionHandle,
};
use rtcpilot_signal::{
    ErrorCode, JoinHandler, PilotDirective, PilotNotification, PilotReport, Room, RoomError,
    RoomState, ServerStats, SignalError,
};

use crate::dtls::{DtlsIdentity, HandshakeTimeouts};
use crate::listener::{ListenerContext, SessionObserver, UdpCandidateListener};
use crate::media::MediaSink;
use crate::pilot::PilotLink;
use crate::port_alloc::PortAllocator;
use crate::session::{PeerSession, RelayBinding, SessionError, SessionParams, SessionRegistry};

/// Relay ports tried per join before giving up
const MAX_RELAY_BIND_ATTEMPTS: usize = 8;

/// Per-session settings taken from the configuration
#[derive(Clone, Debug)]
pub struct RoomSettings {
    pub candidates: Vec<CandidateDescriptor>,
    /// Discard policy on the configured candidates
    pub discard: DiscardPolicy,
    /// Discard policy on relay ports
    pub relay_discard: DiscardPolicy,
    pub timeouts: HandshakeTimeouts,
    pub idle_timeout: Duration,
    pub max_packet_failures: u32,
}

impl RoomSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            candidates: config.candidates.clone(),
            discard: config.discard_policy(),
            relay_discard: config.rtc_relay.discard_policy(),
            timeouts: HandshakeTimeouts::with_handshake_timeout(
                config.session.handshake_timeout_secs,
            ),
            idle_timeout: Duration::from_secs(config.session.idle_timeout_secs),
            max_packet_failures: config.session.max_consecutive_packet_failures,
        }
    }
}

/// Relay ports handed out to joining peers
pub struct RelayPool {
    pub allocator: Arc<PortAllocator>,
    /// Address advertised for relay candidates
    pub public_ip: String,
}

/// Rooms, their members and the sessions behind them
pub struct RoomManager {
    settings: RoomSettings,
    rooms: DashMap<RoomId, Room>,
    registry: Arc<SessionRegistry>,
    identity: Arc<DtlsIdentity>,
    relay: Option<RelayPool>,
    ctx: Arc<ListenerContext>,
    pilot: RwLock<Option<PilotLink>>,
    next_sdp_session: AtomicU64,
}

impl RoomManager {
    pub fn new(
        settings: RoomSettings,
        identity: Arc<DtlsIdentity>,
        relay: Option<RelayPool>,
        sink: Arc<dyn MediaSink>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<RoomManager>| {
            let registry = Arc::new(SessionRegistry::new());
            let observer: Weak<dyn SessionObserver> = weak.clone();
            let ctx = Arc::new(ListenerContext::new(registry.clone(), sink, observer));
            Self {
                settings,
                rooms: DashMap::new(),
                registry,
                identity,
                relay,
                ctx,
                pilot: RwLock::new(None),
                next_sdp_session: AtomicU64::new(u64::from(rand::random::<u32>())),
            }
        })
    }

    /// Context every candidate listener must share with this manager
    pub fn listener_context(&self) -> Arc<ListenerContext> {
        self.ctx.clone()
    }

    pub fn set_pilot_link(&self, link: PilotLink) {
        *self.pilot.write() = Some(link);
    }

    fn report(&self, report: PilotReport) {
        if let Some(link) = self.pilot.read().as_ref() {
            link.send(report);
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    pub fn member_count(&self, room_id: &str) -> Option<usize> {
        self.rooms.get(room_id).map(|room| room.member_count())
    }

    pub fn room_state(&self, room_id: &str) -> Option<RoomState> {
        self.rooms.get(room_id).map(|room| room.state())
    }

    pub fn room_attributes(&self, room_id: &str) -> Option<Value> {
        self.rooms.get(room_id)?.attributes().cloned()
    }

    /// Session currently bound to a member
    pub fn member_session(&self, room_id: &str, member_id: &str) -> Option<SessionHandle> {
        self.rooms.get(room_id)?.member(member_id)
    }

    /// Create a room. Returns false if it already exists.
    pub fn create_room(&self, room_id: &str) -> bool {
        let mut created = false;
        self.rooms.entry(room_id.to_string()).or_insert_with(|| {
            created = true;
            Room::new(room_id)
        });
        if created {
            info!("Room {} created", room_id);
        }
        created
    }

    /// Close every session of a room and drop it
    pub fn destroy_room(&self, room_id: &str) -> bool {
        let members = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return false;
            };
            if room.state() == RoomState::Closing {
                return false;
            }
            room.begin_close()
        };
        self.finish_close(room_id, members);
        true
    }

    /// Destroy a room only if it is still abandoned
    ///
    /// Emptiness is re-checked under the room guard, so a member that
    /// joined after the last one left keeps the room alive.
    pub fn destroy_if_abandoned(&self, room_id: &str) -> bool {
        let members = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return false;
            };
            if room.state() == RoomState::Closing || !room.is_abandoned() {
                return false;
            }
            room.begin_close()
        };
        self.finish_close(room_id, members);
        true
    }

    fn finish_close(&self, room_id: &str, members: Vec<(MemberId, SessionHandle)>) {
        for (member, handle) in &members {
            self.close_session(*handle);
            self.report(PilotReport::MemberLeft {
                room_id: room_id.to_string(),
                user_id: member.clone(),
            });
        }

        if let Some((_, mut room)) = self
            .rooms
            .remove_if(room_id, |_, room| room.state() == RoomState::Closing)
        {
            room.mark_closed();
            info!(
                "Room {} destroyed after {}s, idle {}s ({} members closed)",
                room_id,
                room.age_secs(),
                room.idle_secs(),
                members.len()
            );
        }
        self.report(PilotReport::RoomClosed {
            room_id: room_id.to_string(),
        });
    }

    /// Register `member_id` in a room with an existing session
    ///
    /// A member id that is already present has its old session closed.
    pub fn add_member(
        &self,
        room_id: &str,
        member_id: &str,
        session: SessionHandle,
    ) -> Result<(), RoomError> {
        let replaced = {
            let mut room = self
                .rooms
                .entry(room_id.to_string())
                .or_insert_with(|| Room::new(room_id));
            room.add_member(member_id, session)?
        };
        if let Some(old) = replaced {
            debug!("Member {} rejoined room {}, closing {}", member_id, room_id, old);
            self.close_session(old);
        }
        Ok(())
    }

    /// Remove a member and close its session. Returns false if unknown.
    pub fn remove_member(&self, room_id: &str, member_id: &str) -> bool {
        let handle = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return false;
            };
            let Some(handle) = room.remove_member(member_id) else {
                return false;
            };
            handle
        };

        self.close_session(handle);
        info!("Member {} left room {}", member_id, room_id);
        self.report(PilotReport::MemberLeft {
            room_id: room_id.to_string(),
            user_id: member_id.to_string(),
        });
        self.destroy_if_abandoned(room_id);
        true
    }

    /// Join with an SDP offer and return the answer text
    pub fn join(
        &self,
        room_id: &str,
        member_id: &str,
        offer_sdp: &str,
    ) -> Result<String, SignalError> {
        let offer = SessionDescription::parse(offer_sdp)
            .map_err(|e| SignalError::new(ErrorCode::InvalidSdp, e.to_string()))?;
        let remote_ice = offer.ice_credentials().ok_or_else(|| {
            SignalError::new(ErrorCode::InvalidSdp, "offer has no ICE credentials")
        })?;
        let remote_fingerprint = match offer.fingerprint() {
            Some((alg, value)) if alg == "sha-256" => parse_fingerprint(&value),
            _ => None,
        }
        .ok_or_else(|| {
            SignalError::new(ErrorCode::InvalidSdp, "offer has no sha-256 fingerprint")
        })?;

        if self.room_state(room_id) == Some(RoomState::Closing) {
            return Err(SignalError::new(
                ErrorCode::RoomUnavailable,
                format!("room {} is closing", room_id),
            ));
        }

        let discard = if self.relay.is_some() {
            self.settings.relay_discard
        } else {
            self.settings.discard
        };

        let local_ice = IceCredentials::generate();
        let params = SessionParams {
            room_id: room_id.to_string(),
            member_id: member_id.to_string(),
            identity: self.identity.clone(),
            remote_fingerprint: Some(remote_fingerprint),
            remote_ice: Some(remote_ice),
            discard,
            timeouts: self.settings.timeouts,
            idle_timeout: self.settings.idle_timeout,
            max_packet_failures: self.settings.max_packet_failures,
        };
        let (handle, session) = self
            .registry
            .insert_with(|handle| PeerSession::new(handle, local_ice.clone(), params));

        // The relay listener needs the handle it serves, so it binds second
        let relay_endpoint = match &self.relay {
            Some(pool) => match self.bind_relay(pool, handle) {
                Ok(binding) => {
                    let endpoint = RelayEndpoint {
                        ip: pool.public_ip.clone(),
                        port: binding.port(),
                    };
                    session.lock().attach_relay(binding);
                    Some(endpoint)
                }
                Err(e) => {
                    self.close_session(handle);
                    return Err(e);
                }
            },
            None => None,
        };

        let answer_params = AnswerParams {
            ice_ufrag: local_ice.ufrag,
            ice_pwd: local_ice.pwd,
            fingerprint: self.identity.fingerprint_sdp(),
            candidates: advertised_candidates(&self.settings.candidates, relay_endpoint.as_ref()),
        };
        let session_id = self.next_sdp_session.fetch_add(1, Ordering::Relaxed);
        let answer = match SessionDescription::build_answer(&offer, &answer_params, session_id) {
            Ok(answer) => answer,
            Err(e) => {
                self.close_session(handle);
                return Err(SignalError::new(ErrorCode::InvalidSdp, e.to_string()));
            }
        };

        if let Err(e) = self.add_member(room_id, member_id, handle) {
            self.close_session(handle);
            return Err(SignalError::new(ErrorCode::RoomUnavailable, e.to_string()));
        }

        info!(
            "Member {} joined room {} with session {}",
            member_id, room_id, handle
        );
        self.report(PilotReport::MemberJoined {
            room_id: room_id.to_string(),
            user_id: member_id.to_string(),
        });
        Ok(answer.to_string())
    }

    pub fn leave(&self, room_id: &str, member_id: &str) {
        if !self.remove_member(room_id, member_id) {
            debug!("Leave for unknown member {} in room {}", member_id, room_id);
        }
    }

    /// Send a media packet to one member. Returns false if the packet was
    /// discarded or could not be queued.
    pub fn send_media(
        &self,
        room_id: &str,
        member_id: &str,
        kind: MediaKind,
        payload: &[u8],
    ) -> Result<bool, SessionError> {
        let handle = self
            .member_session(room_id, member_id)
            .ok_or(SessionError::Closed)?;
        let session = self.registry.get(handle).ok_or(SessionError::Closed)?;
        let mut session = session.lock();
        session.send_media(kind, payload)
    }

    /// Close every room, used on shutdown
    pub fn close_all(&self) {
        let ids: Vec<RoomId> = self.rooms.iter().map(|room| room.key().clone()).collect();
        for id in ids {
            self.destroy_room(&id);
        }
    }

    /// Remove and close a session without notifying the observer
    fn close_session(&self, handle: SessionHandle) {
        if let Some(session) = self.registry.remove(handle) {
            session.lock().close();
        }
    }

    fn bind_relay(
        &self,
        pool: &RelayPool,
        owner: SessionHandle,
    ) -> Result<RelayBinding, SignalError> {
        let attempts = pool.allocator.capacity().min(MAX_RELAY_BIND_ATTEMPTS);
        for _ in 0..attempts {
            let lease = pool
                .allocator
                .lease()
                .map_err(|e| SignalError::new(ErrorCode::SessionUnavailable, e.to_string()))?;
            match UdpCandidateListener::bind_relay(lease.port(), self.ctx.clone(), owner) {
                Ok(listener) => {
                    let mut binding = RelayBinding::new(lease);
                    binding.set_task(tokio::spawn(listener.run()));
                    return Ok(binding);
                }
                Err(e) => warn!("Relay port {} unavailable: {}", lease.port(), e),
            }
        }
        Err(SignalError::new(
            ErrorCode::SessionUnavailable,
            "no relay port could be bound",
        ))
    }
}

impl SessionObserver for RoomManager {
    fn on_session_closed(&self, handle: SessionHandle, room_id: &RoomId) {
        let member = {
            let Some(mut room) = self.rooms.get_mut(room_id) else {
                return;
            };
            let Some(member) = room.remove_session(handle) else {
                return;
            };
            member
        };

        info!("Member {} dropped from room {}", member, room_id);
        self.report(PilotReport::MemberLeft {
            room_id: room_id.clone(),
            user_id: member,
        });
        self.destroy_if_abandoned(room_id);
    }
}

impl PilotNotification for RoomManager {
    fn on_directive(&self, directive: PilotDirective) {
        match directive {
            PilotDirective::RoomCreate { room_id, payload } => {
                self.create_room(&room_id);
                if !payload.is_null() {
                    if let Some(mut room) = self.rooms.get_mut(&room_id) {
                        room.set_attributes(payload);
                    }
                }
            }
            PilotDirective::RoomDestroy { room_id, .. } => {
                if !self.destroy_room(&room_id) {
                    debug!("Pilot destroy for unknown room {}", room_id);
                }
            }
            PilotDirective::RoomUpdate { room_id, payload } => {
                let mut room = self
                    .rooms
                    .entry(room_id.clone())
                    .or_insert_with(|| Room::new(room_id.as_str()));
                room.set_attributes(payload);
                debug!("Room {} attributes updated", room_id);
            }
            PilotDirective::Unknown { kind, room_id, .. } => {
                warn!("Ignoring pilot directive {} for room {}", kind, room_id);
            }
        }
    }

    fn stats(&self) -> ServerStats {
        ServerStats {
            rooms: self.room_count(),
            sessions: self.session_count(),
        }
    }
}

impl JoinHandler for RoomManager {
    fn join(&self, room_id: &str, user_id: &str, offer_sdp: &str) -> Result<String, SignalError> {
        RoomManager::join(self, room_id, user_id, offer_sdp)
    }

    fn leave(&self, room_id: &str, user_id: &str) {
        RoomManager::leave(self, room_id, user_id)
    }

    fn stats(&self) -> ServerStats {
        PilotNotification::stats(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtls::tests::test_identity;
    use crate::media::NullMediaSink;
    use crate::session::SessionState;
    use rtcpilot_core::NetType;
    use serde_json::json;

    const OFFER: &str = "v=0\r\n\
o=- 1 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:RmTe\r\n\
a=ice-pwd:Qm3QpvEzRgBw0Ow3hoFYWGle\r\n\
a=fingerprint:sha-256 AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtcp-mux\r\n\
a=rtpmap:111 opus/48000/2\r\n";

    fn settings() -> RoomSettings {
        RoomSettings {
            candidates: vec![CandidateDescriptor::new(
                NetType::Udp,
                "1.2.3.4",
                "0.0.0.0",
                9000,
            )],
            discard: DiscardPolicy::none(),
            relay_discard: DiscardPolicy::none(),
            timeouts: HandshakeTimeouts::default(),
            idle_timeout: Duration::from_secs(30),
            max_packet_failures: 64,
        }
    }

    fn manager(relay: Option<RelayPool>) -> Arc<RoomManager> {
        RoomManager::new(
            settings(),
            test_identity(),
            relay,
            Arc::new(NullMediaSink::default()),
        )
    }

    #[test]
    fn test_create_room_idempotent() {
        let rooms = manager(None);
        assert!(rooms.create_room("room-1"));
        assert!(!rooms.create_room("room-1"));
        assert_eq!(rooms.room_count(), 1);
        assert!(rooms.destroy_room("room-1"));
        assert!(!rooms.destroy_room("room-1"));
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_join_answer_advertises_candidate() {
        let rooms = manager(None);
        let answer = rooms.join("room-1", "alice", OFFER).unwrap();
        assert!(answer.contains("1.2.3.4 9000 typ host"));
        assert!(answer.contains("a=ice-lite"));
        assert!(answer.contains("a=setup:passive"));
        assert!(answer.contains(&rooms.identity.fingerprint_sdp()));
        assert_eq!(rooms.member_count("room-1"), Some(1));
        assert_eq!(rooms.session_count(), 1);
        assert_eq!(rooms.room_state("room-1"), Some(RoomState::Active));
    }

    #[tokio::test]
    async fn test_join_rejects_bad_offer() {
        let rooms = manager(None);
        let err = rooms.join("room-1", "alice", "not sdp").unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSdp);

        let no_fingerprint: String = OFFER
            .lines()
            .filter(|l| !l.starts_with("a=fingerprint"))
            .map(|l| format!("{}\r\n", l))
            .collect();
        let err = rooms.join("room-1", "alice", &no_fingerprint).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidSdp);
        assert_eq!(rooms.session_count(), 0);
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_rejoin_replaces_session() {
        let rooms = manager(None);
        rooms.join("room-1", "alice", OFFER).unwrap();
        let first = rooms.member_session("room-1", "alice").unwrap();
        let first_session = rooms.registry.get(first).unwrap();

        rooms.join("room-1", "alice", OFFER).unwrap();
        let second = rooms.member_session("room-1", "alice").unwrap();
        assert_ne!(first, second);
        assert_eq!(first_session.lock().state(), SessionState::Closed);
        assert_eq!(rooms.session_count(), 1);
        assert_eq!(rooms.member_count("room-1"), Some(1));
    }

    #[tokio::test]
    async fn test_last_leave_destroys_room() {
        let rooms = manager(None);
        rooms.join("room-1", "alice", OFFER).unwrap();
        rooms.join("room-1", "bob", OFFER).unwrap();

        rooms.leave("room-1", "alice");
        assert_eq!(rooms.member_count("room-1"), Some(1));
        rooms.leave("room-1", "alice");
        rooms.leave("room-1", "bob");
        assert_eq!(rooms.room_count(), 0);
        assert_eq!(rooms.session_count(), 0);
    }

    #[tokio::test]
    async fn test_join_after_last_leave_keeps_room() {
        let rooms = manager(None);
        rooms.join("room-1", "alice", OFFER).unwrap();

        // Alice is gone but the follow-up destroy has not run yet
        let alice = rooms
            .rooms
            .get_mut("room-1")
            .unwrap()
            .remove_member("alice")
            .unwrap();
        rooms.close_session(alice);
        rooms.join("room-1", "bob", OFFER).unwrap();

        assert!(!rooms.destroy_if_abandoned("room-1"));
        assert_eq!(rooms.room_state("room-1"), Some(RoomState::Active));
        assert_eq!(rooms.member_count("room-1"), Some(1));
        let bob = rooms.member_session("room-1", "bob").unwrap();
        assert!(!rooms.registry.get(bob).unwrap().lock().is_closed());

        rooms.leave("room-1", "bob");
        assert_eq!(rooms.room_count(), 0);
        assert!(!rooms.destroy_if_abandoned("room-1"));
    }

    #[tokio::test]
    async fn test_listener_teardown_updates_room() {
        let rooms = manager(None);
        rooms.join("room-1", "alice", OFFER).unwrap();
        rooms.join("room-1", "bob", OFFER).unwrap();
        let alice = rooms.member_session("room-1", "alice").unwrap();

        rooms.listener_context().teardown(alice, "test");
        assert_eq!(rooms.member_session("room-1", "alice"), None);
        assert_eq!(rooms.member_count("room-1"), Some(1));

        let bob = rooms.member_session("room-1", "bob").unwrap();
        rooms.listener_context().teardown(bob, "test");
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn test_pilot_destroy_closes_sessions_and_releases_ports() {
        let allocator = Arc::new(PortAllocator::initialize(46200, 46263).unwrap());
        let rooms = manager(Some(RelayPool {
            allocator: allocator.clone(),
            public_ip: "5.6.7.8".into(),
        }));

        rooms.on_directive(PilotDirective::RoomCreate {
            room_id: "room-1".into(),
            payload: Value::Null,
        });
        assert_eq!(rooms.room_state("room-1"), Some(RoomState::Creating));

        let mut sessions = Vec::new();
        for member in ["a", "b", "c"] {
            let answer = rooms.join("room-1", member, OFFER).unwrap();
            let handle = rooms.member_session("room-1", member).unwrap();
            let session = rooms.registry.get(handle).unwrap();
            let port = session.lock().relay_port().unwrap();
            assert!(answer.contains(&format!("5.6.7.8 {} typ host", port)));
            assert!(!answer.contains("1.2.3.4 9000"));
            sessions.push(session);
        }
        assert_eq!(allocator.in_use(), 3);
        assert_eq!(rooms.member_count("room-1"), Some(3));

        rooms.on_directive(PilotDirective::RoomDestroy {
            room_id: "room-1".into(),
            payload: Value::Null,
        });
        assert_eq!(rooms.room_count(), 0);
        assert_eq!(rooms.session_count(), 0);
        assert_eq!(allocator.in_use(), 0);
        for session in sessions {
            assert_eq!(session.lock().state(), SessionState::Closed);
        }
    }

    #[test]
    fn test_room_update_stores_attributes() {
        let rooms = manager(None);
        rooms.on_directive(PilotDirective::RoomUpdate {
            room_id: "room-2".into(),
            payload: json!({"title": "standup"}),
        });
        assert_eq!(
            rooms.room_attributes("room-2"),
            Some(json!({"title": "standup"}))
        );
        rooms.on_directive(PilotDirective::Unknown {
            kind: "room_rename".into(),
            room_id: "room-2".into(),
            payload: Value::Null,
        });
        assert_eq!(rooms.room_count(), 1);
        assert_eq!(PilotNotification::stats(&*rooms).rooms, 1);
    }

    #[tokio::test]
    async fn test_send_media_requires_established() {
        let rooms = manager(None);
        rooms.join("room-1", "alice", OFFER).unwrap();
        assert!(matches!(
            rooms.send_media("room-1", "alice", MediaKind::Rtp, &[0x80, 0, 0, 1]),
            Err(SessionError::NotEstablished)
        ));
        assert!(matches!(
            rooms.send_media("room-1", "nobody", MediaKind::Rtp, &[0x80]),
            Err(SessionError::Closed)
        ));
    }
}
