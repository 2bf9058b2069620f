//! Peer sessions and the session arena
//!
//! A [`PeerSession`] is one browser peer inside one room: ICE credentials,
//! the transport the peer bound through, the DTLS handshake, the SRTP
//! contexts once the handshake is Established, and an optional relay port.
//!
//! Sessions live in a [`SessionRegistry`], a slab keyed by
//! [`SessionHandle`]. Handles carry a generation so a recycled slot is
//! never confused with the session that used to occupy it.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use slab::Slab;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rtcpilot_core::{
    CertFingerprint, DiscardPolicy, IceCredentials, ListenerId, MediaKind, MemberId, RoomId,
    SessionHandle,
};

use crate::dtls::{
    DtlsError, DtlsIdentity, HandshakeEvent, HandshakeSession, HandshakeState, HandshakeTimeouts,
};
use crate::media::MediaPacket;
use crate::port_alloc::{PortError, PortLease};
use crate::srtp::{self, SrtpError, SrtpSession};

/// Session-fatal errors
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("session already bound to {0}")]
    AlreadyBound(SocketAddr),

    #[error("session is not established")]
    NotEstablished,

    #[error("session is closed")]
    Closed,

    #[error("handshake failed: {0}")]
    Handshake(#[from] DtlsError),

    #[error("media security setup failed: {0}")]
    Srtp(#[from] SrtpError),

    #[error("{0} consecutive packet failures")]
    TooManyFailures(u32),

    #[error("peer closed the session")]
    PeerClosed,

    #[error("no ICE binding within {0:?}")]
    BindTimeout(Duration),

    #[error("no traffic for {0:?}")]
    IdleTimeout(Duration),

    #[error("relay port unavailable: {0}")]
    Port(#[from] PortError),

    #[error("relay bind failed: {0}")]
    RelayBind(#[from] std::io::Error),
}

/// Session lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// Created by a join, waiting for an ICE connectivity check
    Pending,
    /// ICE bound, DTLS in progress
    Handshaking,
    /// Media flowing
    Established,
    Closed,
}

/// Where a session's packets go out
#[derive(Clone, Debug)]
pub enum TransportHandle {
    Udp {
        socket: Arc<UdpSocket>,
        remote: SocketAddr,
    },
    /// Frames are queued to the connection's writer task
    Tcp {
        tx: mpsc::Sender<Bytes>,
        local: SocketAddr,
        remote: SocketAddr,
    },
}

impl TransportHandle {
    pub fn remote(&self) -> SocketAddr {
        match self {
            TransportHandle::Udp { remote, .. } | TransportHandle::Tcp { remote, .. } => *remote,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            TransportHandle::Udp { socket, .. } => socket.local_addr(),
            TransportHandle::Tcp { local, .. } => Ok(*local),
        }
    }

    /// Send, waiting for socket or queue capacity
    pub async fn send_async(&self, data: &[u8]) -> io::Result<usize> {
        match self {
            TransportHandle::Udp { socket, remote } => socket.send_to(data, *remote).await,
            TransportHandle::Tcp { tx, .. } => tx
                .send(Bytes::copy_from_slice(data))
                .await
                .map(|()| data.len())
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "TCP connection closed")),
        }
    }

    /// Send without blocking. Returns false if the packet was dropped.
    pub fn send(&self, data: &[u8]) -> bool {
        match self {
            TransportHandle::Udp { socket, remote } => match socket.try_send_to(data, *remote) {
                Ok(_) => true,
                Err(e) => {
                    debug!("UDP send to {} dropped: {}", remote, e);
                    false
                }
            },
            TransportHandle::Tcp { tx, remote, .. } => {
                if tx.try_send(Bytes::copy_from_slice(data)).is_err() {
                    debug!("TCP send queue to {} full or closed, dropping", remote);
                    return false;
                }
                true
            }
        }
    }
}

/// A relay port leased for one session and the listener bound on it
///
/// Dropping it stops the listener and returns the port.
pub struct RelayBinding {
    lease: PortLease,
    task: Option<JoinHandle<()>>,
}

impl RelayBinding {
    pub fn new(lease: PortLease) -> Self {
        Self { lease, task: None }
    }

    pub fn port(&self) -> u16 {
        self.lease.port()
    }

    pub fn set_task(&mut self, task: JoinHandle<()>) {
        if let Some(old) = self.task.replace(task) {
            old.abort();
        }
    }
}

impl Drop for RelayBinding {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        debug!("Relay port {} released", self.lease.port());
    }
}

impl std::fmt::Debug for RelayBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBinding")
            .field("port", &self.lease.port())
            .finish()
    }
}

/// Everything needed to create a session
pub struct SessionParams {
    pub room_id: RoomId,
    pub member_id: MemberId,
    pub identity: Arc<DtlsIdentity>,
    /// From the offer's `a=fingerprint`
    pub remote_fingerprint: Option<CertFingerprint>,
    /// From the offer's `a=ice-ufrag` / `a=ice-pwd`
    pub remote_ice: Option<(String, String)>,
    pub discard: DiscardPolicy,
    pub timeouts: HandshakeTimeouts,
    /// Established sessions with no authenticated traffic for this long close
    pub idle_timeout: Duration,
    pub max_packet_failures: u32,
}

/// One peer in one room
pub struct PeerSession {
    handle: SessionHandle,
    room_id: RoomId,
    member_id: MemberId,
    state: SessionState,
    local_ice: IceCredentials,
    remote_ice: Option<(String, String)>,
    listener: Option<ListenerId>,
    transport: Option<TransportHandle>,
    handshake: HandshakeSession,
    srtp: Option<SrtpSession>,
    discard: DiscardPolicy,
    relay: Option<RelayBinding>,
    consecutive_failures: u32,
    max_packet_failures: u32,
    bind_timeout: Duration,
    idle_timeout: Duration,
    created_at: Instant,
    last_activity: Instant,
}

impl PeerSession {
    pub fn new(handle: SessionHandle, local_ice: IceCredentials, params: SessionParams) -> Self {
        let now = Instant::now();
        Self {
            handle,
            room_id: params.room_id,
            member_id: params.member_id,
            state: SessionState::Pending,
            local_ice,
            remote_ice: params.remote_ice,
            listener: None,
            transport: None,
            handshake: HandshakeSession::new(
                params.identity,
                params.remote_fingerprint,
                params.timeouts,
            ),
            srtp: None,
            discard: params.discard,
            relay: None,
            consecutive_failures: 0,
            max_packet_failures: params.max_packet_failures,
            bind_timeout: params.timeouts.handshake_timeout,
            idle_timeout: params.idle_timeout,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.handshake.state()
    }

    pub fn local_ice(&self) -> &IceCredentials {
        &self.local_ice
    }

    pub fn remote_ice(&self) -> Option<&(String, String)> {
        self.remote_ice.as_ref()
    }

    pub fn listener(&self) -> Option<ListenerId> {
        self.listener
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(TransportHandle::remote)
    }

    pub fn relay_port(&self) -> Option<u16> {
        self.relay.as_ref().map(RelayBinding::port)
    }

    pub fn relay_mut(&mut self) -> Option<&mut RelayBinding> {
        self.relay.as_mut()
    }

    /// Hand the session its relay port. A closed session drops it at once.
    pub fn attach_relay(&mut self, relay: RelayBinding) {
        if self.state == SessionState::Closed {
            return;
        }
        self.relay = Some(relay);
    }

    /// Record authenticated traffic from the peer
    pub fn touch(&mut self, now: Instant) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// ICE connectivity check succeeded: bind the transport and start DTLS
    pub fn bind_transport(
        &mut self,
        listener: ListenerId,
        transport: TransportHandle,
        now: Instant,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if let Some(existing) = &self.transport {
            return Err(SessionError::AlreadyBound(existing.remote()));
        }
        info!(
            "Session {} ({}/{}) bound to {} on listener {}",
            self.handle,
            self.room_id,
            self.member_id,
            transport.remote(),
            listener
        );
        self.handshake.start(transport.clone(), now)?;
        self.listener = Some(listener);
        self.transport = Some(transport);
        self.state = SessionState::Handshaking;
        self.touch(now);
        Ok(())
    }

    /// Feed a DTLS datagram. An error is session-fatal.
    pub fn handle_dtls(&mut self, data: &[u8], now: Instant) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        self.handshake.handle_datagram(data)?;
        self.touch(now);
        self.poll_handshake(now)
    }

    /// Pick up handshake progress made by the DTLS task
    pub fn poll_handshake(&mut self, now: Instant) -> Result<(), SessionError> {
        match self.handshake.poll(now) {
            Some(HandshakeEvent::Established) if self.srtp.is_none() => {
                let srtp = SrtpSession::from_handshake(&self.handshake, self.discard)?;
                info!(
                    "Session {} established ({:?})",
                    self.handle,
                    srtp.profile()
                );
                self.srtp = Some(srtp);
                self.state = SessionState::Established;
                self.touch(now);
                Ok(())
            }
            Some(HandshakeEvent::Failed(e)) => Err(e.into()),
            Some(HandshakeEvent::Closed) => Err(SessionError::PeerClosed),
            _ => Ok(()),
        }
    }

    /// Feed an SRTP/SRTCP packet
    ///
    /// Returns the decrypted packet, or `None` for packets that are dropped
    /// without consequence (replays, discards, media before Established).
    /// Errors once the consecutive failure limit is exceeded.
    pub fn handle_media(
        &mut self,
        data: &[u8],
        now: Instant,
    ) -> Result<Option<MediaPacket>, SessionError> {
        if self.srtp.is_none() && self.state == SessionState::Handshaking {
            // Media can race the timer that notices Established
            self.poll_handshake(now)?;
        }
        let Some(srtp) = self.srtp.as_mut() else {
            debug!("Session {} dropping media before Established", self.handle);
            return Ok(None);
        };
        let kind = if srtp::is_rtcp(data) {
            MediaKind::Rtcp
        } else {
            MediaKind::Rtp
        };
        match srtp.unprotect_inbound(data) {
            Ok(plain) => {
                self.consecutive_failures = 0;
                self.touch(now);
                Ok(plain.map(|payload| MediaPacket::new(kind, payload)))
            }
            Err(SrtpError::Replay) => {
                debug!("Session {} dropped replayed packet", self.handle);
                Ok(None)
            }
            Err(e) if e.is_auth_failure() => {
                self.consecutive_failures += 1;
                debug!(
                    "Session {} packet failure {}/{}: {}",
                    self.handle, self.consecutive_failures, self.max_packet_failures, e
                );
                if self.consecutive_failures > self.max_packet_failures {
                    return Err(SessionError::TooManyFailures(self.consecutive_failures));
                }
                Ok(None)
            }
            Err(e) => {
                debug!("Session {} dropped packet: {}", self.handle, e);
                Ok(None)
            }
        }
    }

    /// Protect and transmit one outbound packet
    ///
    /// Returns false when the packet was discarded or the transport dropped it.
    pub fn send_media(&mut self, kind: MediaKind, payload: &[u8]) -> Result<bool, SessionError> {
        let srtp = self.srtp.as_mut().ok_or(SessionError::NotEstablished)?;
        let transport = self.transport.as_ref().ok_or(SessionError::NotEstablished)?;
        match srtp.protect_outbound(kind, payload)? {
            Some(protected) => Ok(transport.send(&protected)),
            None => Ok(false),
        }
    }

    /// Drive bind, handshake and idle timeouts. An error is session-fatal.
    pub fn poll_timer(&mut self, now: Instant) -> Result<(), SessionError> {
        match self.state {
            SessionState::Pending => {
                let waited = now.saturating_duration_since(self.created_at);
                if waited >= self.bind_timeout {
                    return Err(SessionError::BindTimeout(self.bind_timeout));
                }
                Ok(())
            }
            SessionState::Handshaking => self.poll_handshake(now),
            SessionState::Established => {
                self.poll_handshake(now)?;
                let idle = now.saturating_duration_since(self.last_activity);
                if idle >= self.idle_timeout {
                    return Err(SessionError::IdleTimeout(self.idle_timeout));
                }
                Ok(())
            }
            SessionState::Closed => Ok(()),
        }
    }

    /// Tear the session down: close_notify, drop crypto, release the relay port
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.handshake.close();
        self.srtp = None;
        self.relay = None;
        self.transport = None;
        self.state = SessionState::Closed;
        debug!("Session {} closed", self.handle);
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            warn!("Session {} dropped without close", self.handle);
            self.close();
        }
    }
}

/// Shared, lockable session
pub type SharedSession = Arc<Mutex<PeerSession>>;

struct Slot {
    generation: u32,
    ufrag: String,
    session: SharedSession,
}

#[derive(Default)]
struct RegistryInner {
    slots: Slab<Slot>,
    by_ufrag: HashMap<String, usize>,
    next_generation: u32,
}

/// Arena of live sessions
#[derive(Default)]
pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle and store the session `build` creates for it
    pub fn insert_with<F>(&self, build: F) -> (SessionHandle, SharedSession)
    where
        F: FnOnce(SessionHandle) -> PeerSession,
    {
        let mut inner = self.inner.lock();
        inner.next_generation = inner.next_generation.wrapping_add(1);
        let generation = inner.next_generation;

        let entry = inner.slots.vacant_entry();
        let key = entry.key();
        let handle = SessionHandle::new(key as u32, generation);
        let session = build(handle);
        let ufrag = session.local_ice().ufrag.clone();
        let shared = Arc::new(Mutex::new(session));
        entry.insert(Slot {
            generation,
            ufrag: ufrag.clone(),
            session: shared.clone(),
        });
        inner.by_ufrag.insert(ufrag, key);
        (handle, shared)
    }

    pub fn get(&self, handle: SessionHandle) -> Option<SharedSession> {
        let inner = self.inner.lock();
        inner
            .slots
            .get(handle.key as usize)
            .filter(|slot| slot.generation == handle.generation)
            .map(|slot| slot.session.clone())
    }

    /// Session whose local ufrag is `ufrag`
    pub fn find_by_ufrag(&self, ufrag: &str) -> Option<(SessionHandle, SharedSession)> {
        let inner = self.inner.lock();
        let key = *inner.by_ufrag.get(ufrag)?;
        let slot = inner.slots.get(key)?;
        Some((
            SessionHandle::new(key as u32, slot.generation),
            slot.session.clone(),
        ))
    }

    /// Remove a session. Returns `None` if it was already removed.
    pub fn remove(&self, handle: SessionHandle) -> Option<SharedSession> {
        let mut inner = self.inner.lock();
        let key = handle.key as usize;
        match inner.slots.get(key) {
            Some(slot) if slot.generation == handle.generation => {}
            _ => return None,
        }
        let slot = inner.slots.remove(key);
        inner.by_ufrag.remove(&slot.ufrag);
        Some(slot.session)
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .map(|(key, slot)| SessionHandle::new(key as u32, slot.generation))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
