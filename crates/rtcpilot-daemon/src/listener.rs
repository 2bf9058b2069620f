//! Candidate listeners
//!
//! One listener per configured candidate (UDP or TCP), plus one UDP
//! listener per leased relay port. Every packet is demultiplexed by its
//! first byte (RFC 7983):
//!
//! | first byte | protocol |
//! |---|---|
//! | 0..=3 | STUN |
//! | 20..=63 | DTLS |
//! | 128..=191 | SRTP / SRTCP |
//!
//! A STUN Binding Request carrying valid short-term credentials binds the
//! remote endpoint to the session that issued those credentials. After that
//! every DTLS and media packet from the endpoint is routed to that session.
//! A session binds at most one endpoint.
//!
//! TCP candidates use RFC 4571 framing (16-bit length prefix); each
//! connection carries exactly one session.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use rtcpilot_core::{CandidateDescriptor, ListenerId, NetType, RoomId, SessionHandle};

use crate::media::MediaSink;
use crate::session::{SessionRegistry, TransportHandle};
use crate::stun::{BindingRequest, ErrorCode, StunError, CODE_BAD_REQUEST, CODE_UNAUTHORIZED};

/// Timer resolution for handshake retransmission and timeouts
pub const TIMER_TICK: Duration = Duration::from_millis(50);

/// How often a UDP listener forgets endpoints whose session is gone
const PEER_PRUNE_INTERVAL: Duration = Duration::from_secs(5);

/// Frames queued per TCP connection before new ones are dropped
const TCP_SEND_QUEUE: usize = 256;

const MAX_DATAGRAM: usize = 65536;

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Notified when a listener tears a session down
pub trait SessionObserver: Send + Sync {
    fn on_session_closed(&self, handle: SessionHandle, room_id: &RoomId);
}

/// Packet class by first byte
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketClass {
    Stun,
    Dtls,
    Media,
    Unknown,
}

pub fn classify(data: &[u8]) -> PacketClass {
    match data.first() {
        Some(0..=3) => PacketClass::Stun,
        Some(20..=63) => PacketClass::Dtls,
        Some(128..=191) => PacketClass::Media,
        _ => PacketClass::Unknown,
    }
}

/// State shared by every listener and the session timer
pub struct ListenerContext {
    registry: Arc<SessionRegistry>,
    sink: Arc<dyn MediaSink>,
    observer: Weak<dyn SessionObserver>,
    next_listener_id: AtomicU32,
}

impl ListenerContext {
    pub fn new(
        registry: Arc<SessionRegistry>,
        sink: Arc<dyn MediaSink>,
        observer: Weak<dyn SessionObserver>,
    ) -> Self {
        Self {
            registry,
            sink,
            observer,
            next_listener_id: AtomicU32::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn allocate_listener_id(&self) -> ListenerId {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Remove a session, close it and tell the observer. Logged once.
    pub fn teardown(&self, handle: SessionHandle, reason: &str) {
        let Some(session) = self.registry.remove(handle) else {
            return;
        };
        let room_id = {
            let mut s = session.lock();
            s.close();
            s.room_id().clone()
        };
        warn!("Session {} in room {} torn down: {}", handle, room_id, reason);
        if let Some(observer) = self.observer.upgrade() {
            observer.on_session_closed(handle, &room_id);
        }
    }

    /// Drive timers of every live session
    pub fn tick(&self, now: Instant) {
        for handle in self.registry.handles() {
            let Some(session) = self.registry.get(handle) else {
                continue;
            };
            let result = session.lock().poll_timer(now);
            if let Err(e) = result {
                self.teardown(handle, &e.to_string());
            }
        }
    }

    /// Handle a STUN message arriving on `transport`
    ///
    /// `owner` is set on relay ports: only that session may bind through
    /// them. Returns the session the endpoint is bound to when the request
    /// was valid and answered.
    pub fn handle_stun(
        &self,
        listener: ListenerId,
        data: &[u8],
        current: Option<SessionHandle>,
        owner: Option<SessionHandle>,
        transport: TransportHandle,
    ) -> Option<SessionHandle> {
        let remote = transport.remote();
        let mut request = match BindingRequest::decode(data) {
            Ok(request) => request,
            Err(StunError::NotBindingRequest) => return None,
            Err(e) => {
                debug!("Dropping malformed STUN from {}: {}", remote, e);
                return None;
            }
        };
        let Some(ufrag) = request.local_ufrag().map(str::to_owned) else {
            reply_error(&request, &transport, CODE_BAD_REQUEST, "Bad Request");
            return None;
        };
        let Some((handle, session)) = self.registry.find_by_ufrag(&ufrag) else {
            debug!("Binding request from {} for unknown ufrag {}", remote, ufrag);
            reply_error(&request, &transport, CODE_UNAUTHORIZED, "Unauthorized");
            return None;
        };
        if let Some(owner) = owner {
            if owner != handle {
                debug!(
                    "Relay port of session {} refusing check from {} for session {}",
                    owner, remote, handle
                );
                reply_error(&request, &transport, CODE_UNAUTHORIZED, "Unauthorized");
                return None;
            }
        }
        if let Some(existing) = current {
            if existing != handle && self.registry.get(existing).is_some() {
                debug!(
                    "{} already belongs to session {}, ignoring check for {}",
                    remote, existing, handle
                );
                return None;
            }
        }

        let mut s = session.lock();
        let pwd = s.local_ice().pwd.clone();
        if let Err(e) = request.verify(&pwd) {
            drop(s);
            debug!("Binding request from {} rejected: {}", remote, e);
            reply_error(&request, &transport, CODE_UNAUTHORIZED, "Unauthorized");
            return None;
        }

        match s.remote_addr() {
            None => {
                if let Err(e) = s.bind_transport(listener, transport.clone(), Instant::now()) {
                    drop(s);
                    self.teardown(handle, &e.to_string());
                    return None;
                }
            }
            // Consent refresh
            Some(addr) if addr == remote && s.listener() == Some(listener) => {
                s.touch(Instant::now());
            }
            Some(addr) => {
                debug!(
                    "Session {} already bound to {}, ignoring check from {}",
                    handle, addr, remote
                );
                return None;
            }
        }
        drop(s);

        match request.success(remote, &pwd) {
            Ok(response) => {
                transport.send(&response);
            }
            Err(e) => warn!("Failed to encode Binding response for {}: {}", remote, e),
        }
        Some(handle)
    }

    /// Route a DTLS or media packet to a bound session
    ///
    /// Returns false once the session is gone.
    pub fn handle_session_packet(&self, handle: SessionHandle, data: &[u8]) -> bool {
        let Some(session) = self.registry.get(handle) else {
            return false;
        };
        let mut s = session.lock();
        match classify(data) {
            PacketClass::Dtls => match s.handle_dtls(data, Instant::now()) {
                Ok(()) => true,
                Err(e) => {
                    drop(s);
                    self.teardown(handle, &e.to_string());
                    false
                }
            },
            PacketClass::Media => match s.handle_media(data, Instant::now()) {
                Ok(Some(packet)) => {
                    let room_id = s.room_id().clone();
                    drop(s);
                    self.sink.on_media(&room_id, handle, packet);
                    true
                }
                Ok(None) => true,
                Err(e) => {
                    drop(s);
                    self.teardown(handle, &e.to_string());
                    false
                }
            },
            _ => true,
        }
    }
}

fn reply_error(request: &BindingRequest, transport: &TransportHandle, code: ErrorCode, reason: &str) {
    match request.error(code, reason) {
        Ok(response) => {
            transport.send(&response);
        }
        Err(e) => debug!("Failed to encode Binding error: {}", e),
    }
}

/// Tick every session's timers until the task is aborted
pub fn spawn_session_timer(ctx: Arc<ListenerContext>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TIMER_TICK);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            ctx.tick(Instant::now());
        }
    })
}

/// UDP candidate (or relay port) listener
pub struct UdpCandidateListener {
    id: ListenerId,
    socket: Arc<UdpSocket>,
    ctx: Arc<ListenerContext>,
    /// Set on relay ports, which serve exactly one session
    owner: Option<SessionHandle>,
    peers: HashMap<SocketAddr, SessionHandle>,
}

impl UdpCandidateListener {
    pub async fn bind(addr: &str, ctx: Arc<ListenerContext>) -> Result<Self, ListenerError> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self::with_socket(socket, ctx, None))
    }

    /// Bind `owner`'s relay port on all interfaces, synchronously
    pub fn bind_relay(
        port: u16,
        ctx: Arc<ListenerContext>,
        owner: SessionHandle,
    ) -> Result<Self, ListenerError> {
        let addr = format!("0.0.0.0:{}", port);
        let std_socket =
            std::net::UdpSocket::bind(&addr).map_err(|source| ListenerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        Ok(Self::with_socket(socket, ctx, Some(owner)))
    }

    fn with_socket(
        socket: UdpSocket,
        ctx: Arc<ListenerContext>,
        owner: Option<SessionHandle>,
    ) -> Self {
        Self {
            id: ctx.allocate_listener_id(),
            socket: Arc::new(socket),
            ctx,
            owner,
            peers: HashMap::new(),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Endpoints currently mapped to a session
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub async fn run(mut self) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut prune = tokio::time::interval(PEER_PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => match result {
                    Ok((n, from)) => self.handle_datagram(&buf[..n], from),
                    Err(e) => debug!("UDP listener {} receive error: {}", self.id, e),
                },
                _ = prune.tick() => {
                    self.prune_peers();
                }
            }
        }
    }

    /// Forget endpoints whose session was torn down elsewhere
    pub fn prune_peers(&mut self) -> usize {
        let registry = self.ctx.registry();
        let before = self.peers.len();
        self.peers.retain(|_, handle| registry.get(*handle).is_some());
        let pruned = before - self.peers.len();
        if pruned > 0 {
            debug!("UDP listener {} forgot {} stale endpoints", self.id, pruned);
        }
        pruned
    }

    fn handle_datagram(&mut self, data: &[u8], from: SocketAddr) {
        match classify(data) {
            PacketClass::Stun => {
                let transport = TransportHandle::Udp {
                    socket: self.socket.clone(),
                    remote: from,
                };
                let current = self.peers.get(&from).copied();
                if let Some(handle) =
                    self.ctx
                        .handle_stun(self.id, data, current, self.owner, transport)
                {
                    self.peers.insert(from, handle);
                }
            }
            PacketClass::Dtls | PacketClass::Media => {
                let Some(&handle) = self.peers.get(&from) else {
                    debug!("Dropping packet from unbound endpoint {}", from);
                    return;
                };
                if !self.ctx.handle_session_packet(handle, data) {
                    self.peers.remove(&from);
                }
            }
            PacketClass::Unknown => {
                debug!("Dropping unclassified packet from {}", from);
            }
        }
    }
}

/// TCP candidate listener
pub struct TcpCandidateListener {
    id: ListenerId,
    listener: TcpListener,
    ctx: Arc<ListenerContext>,
}

impl TcpCandidateListener {
    pub async fn bind(addr: &str, ctx: Arc<ListenerContext>) -> Result<Self, ListenerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self {
            id: ctx.allocate_listener_id(),
            listener,
            ctx,
        })
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, remote)) => {
                    debug!("TCP candidate {} accepted {}", self.id, remote);
                    tokio::spawn(serve_tcp_connection(
                        self.id,
                        stream,
                        remote,
                        self.ctx.clone(),
                    ));
                }
                Err(e) => warn!("TCP candidate {} accept error: {}", self.id, e),
            }
        }
    }
}

/// Read one RFC 4571 frame. `Ok(None)` on clean EOF.
pub async fn read_frame(reader: &mut OwnedReadHalf) -> io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u16().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "zero-length frame"));
    }
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    Ok(Some(frame))
}

/// Prefix `payload` with its RFC 4571 length
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    let len = u16::try_from(payload.len()).ok()?;
    let mut out = Vec::with_capacity(payload.len() + 2);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Some(out)
}

async fn serve_tcp_connection(
    id: ListenerId,
    stream: TcpStream,
    remote: SocketAddr,
    ctx: Arc<ListenerContext>,
) {
    let local = match stream.local_addr() {
        Ok(local) => local,
        Err(e) => {
            debug!("TCP connection {} has no local address: {}", remote, e);
            return;
        }
    };
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Bytes>(TCP_SEND_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            let Some(frame) = encode_frame(&payload) else {
                debug!("Dropping oversized frame to {}", remote);
                continue;
            };
            if let Err(e) = writer.write_all(&frame).await {
                debug!("TCP write to {} failed: {}", remote, e);
                break;
            }
        }
    });

    let mut bound: Option<SessionHandle> = None;
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => {
                debug!("TCP connection {} failed: {}", remote, e);
                break;
            }
        };
        match classify(&frame) {
            PacketClass::Stun => {
                let transport = TransportHandle::Tcp {
                    tx: tx.clone(),
                    local,
                    remote,
                };
                if let Some(handle) = ctx.handle_stun(id, &frame, bound, None, transport) {
                    bound = Some(handle);
                }
            }
            PacketClass::Dtls | PacketClass::Media => {
                let Some(handle) = bound else {
                    debug!("Dropping packet from unbound TCP peer {}", remote);
                    continue;
                };
                if !ctx.handle_session_packet(handle, &frame) {
                    bound = None;
                    break;
                }
            }
            PacketClass::Unknown => {
                debug!("Dropping unclassified frame from {}", remote);
            }
        }
    }

    if let Some(handle) = bound {
        ctx.teardown(handle, "TCP connection closed");
    }
    writer_task.abort();
}

/// Bind every configured candidate and spawn its listener task
///
/// Any bind failure is returned; listeners already started keep running
/// until their handles are aborted.
pub async fn start_candidate_listeners(
    candidates: &[CandidateDescriptor],
    ctx: Arc<ListenerContext>,
) -> Result<Vec<JoinHandle<()>>, ListenerError> {
    let mut tasks = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let addr = candidate.listen_addr();
        match candidate.net_type {
            NetType::Udp => {
                let listener = UdpCandidateListener::bind(&addr, ctx.clone()).await?;
                info!(
                    "UDP candidate {} listening on {} (advertised {}:{})",
                    listener.id(),
                    listener.local_addr()?,
                    candidate.candidate_ip,
                    candidate.port
                );
                tasks.push(tokio::spawn(listener.run()));
            }
            NetType::Tcp => {
                let listener = TcpCandidateListener::bind(&addr, ctx.clone()).await?;
                info!(
                    "TCP candidate {} listening on {} (advertised {}:{})",
                    listener.id(),
                    listener.local_addr()?,
                    candidate.candidate_ip,
                    candidate.port
                );
                tasks.push(tokio::spawn(listener.run()));
            }
        }
    }
    Ok(tasks)
}
