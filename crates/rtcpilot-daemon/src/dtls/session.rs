//! Per-peer DTLS handshake
//!
//! [`HandshakeSession`] owns a task running a server-side `DTLSConn` over
//! a [`SessionConn`]. The session lock is never held across the task's
//! awaits: datagrams go in through a bounded queue and results come back
//! as events that [`HandshakeSession::poll`] drains from the session timer.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::dtls::config::Config;
use webrtc::dtls::conn::DTLSConn;
use webrtc::dtls::extension::extension_use_srtp::SrtpProtectionProfile;
use webrtc::srtp::protection_profile::ProtectionProfile;

use rtcpilot_core::{crypto, CertFingerprint};

use super::{
    DtlsError, DtlsIdentity, ExportedKeys, HandshakeState, HandshakeTimeouts, SessionConn,
};
use crate::session::TransportHandle;

/// Datagrams queued for the handshake task before input counts as a flood
const INBOUND_QUEUE: usize = 64;

const READ_BUFFER: usize = 8192;

/// What [`HandshakeSession::poll`] reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeEvent {
    Established,
    Failed(DtlsError),
    /// Peer sent close_notify or the connection ended after Established
    Closed,
}

#[derive(Debug)]
enum TaskEvent {
    Established(ExportedKeys),
    Failed(DtlsError),
    Closed,
}

pub struct HandshakeSession {
    identity: Arc<DtlsIdentity>,
    remote_fingerprint: Option<CertFingerprint>,
    timeouts: HandshakeTimeouts,
    state: HandshakeState,
    deadline: Option<Instant>,
    inbound: Option<mpsc::Sender<Bytes>>,
    events: Option<mpsc::UnboundedReceiver<TaskEvent>>,
    close_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    keys: Option<ExportedKeys>,
}

impl HandshakeSession {
    pub fn new(
        identity: Arc<DtlsIdentity>,
        remote_fingerprint: Option<CertFingerprint>,
        timeouts: HandshakeTimeouts,
    ) -> Self {
        Self {
            identity,
            remote_fingerprint,
            timeouts,
            state: HandshakeState::Idle,
            deadline: None,
            inbound: None,
            events: None,
            close_tx: None,
            task: None,
            keys: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    pub fn profile(&self) -> Option<ProtectionProfile> {
        self.keys.as_ref().map(|keys| keys.profile)
    }

    /// Start the handshake over `transport`. Must be called from within a
    /// tokio runtime.
    pub fn start(&mut self, transport: TransportHandle, now: Instant) -> Result<(), DtlsError> {
        if self.state != HandshakeState::Idle {
            return Err(DtlsError::InvalidState("start requires Idle"));
        }
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = oneshot::channel();

        let remote = transport.remote();
        let conn = Arc::new(SessionConn::new(transport, inbound_rx));
        let config = self.identity.server_config(&self.timeouts);
        self.task = Some(tokio::spawn(drive(
            conn,
            config,
            self.remote_fingerprint,
            events_tx,
            close_rx,
        )));

        self.inbound = Some(inbound_tx);
        self.events = Some(events_rx);
        self.close_tx = Some(close_tx);
        self.deadline = Some(now + self.timeouts.handshake_timeout);
        self.state = HandshakeState::Handshaking;
        debug!("DTLS handshake with {} started", remote);
        Ok(())
    }

    /// Queue one inbound DTLS datagram for the handshake task
    pub fn handle_datagram(&mut self, data: &[u8]) -> Result<(), DtlsError> {
        match self.state {
            HandshakeState::Handshaking | HandshakeState::Established => {}
            HandshakeState::Closed => return Err(DtlsError::InvalidState("closed")),
            HandshakeState::Idle | HandshakeState::Failed => {
                return Err(DtlsError::InvalidState("not started"))
            }
        }
        let Some(inbound) = &self.inbound else {
            return Ok(());
        };
        match inbound.try_send(Bytes::copy_from_slice(data)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) if self.state == HandshakeState::Handshaking => {
                self.fail(DtlsError::BufferExceeded);
                Err(DtlsError::BufferExceeded)
            }
            Err(TrySendError::Full(_)) => {
                debug!("DTLS input queue full, dropping record");
                Ok(())
            }
            // Task already finished; poll() reports why
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Collect the task's progress and enforce the handshake deadline
    ///
    /// `Failed` is reported exactly once.
    pub fn poll(&mut self, now: Instant) -> Option<HandshakeEvent> {
        while let Some(event) = self.events.as_mut().and_then(|rx| rx.try_recv().ok()) {
            match (event, self.state) {
                (TaskEvent::Established(keys), HandshakeState::Handshaking) => {
                    info!("DTLS established ({:?})", keys.profile);
                    self.keys = Some(keys);
                    self.deadline = None;
                    self.state = HandshakeState::Established;
                    return Some(HandshakeEvent::Established);
                }
                (TaskEvent::Failed(e), HandshakeState::Handshaking) => {
                    self.fail(e.clone());
                    return Some(HandshakeEvent::Failed(e));
                }
                (TaskEvent::Closed, HandshakeState::Established) => {
                    self.shutdown();
                    return Some(HandshakeEvent::Closed);
                }
                (event, state) => debug!("Ignoring {:?} in {:?}", event, state),
            }
        }

        if self.state == HandshakeState::Handshaking && self.deadline.is_some_and(|d| now >= d) {
            self.fail(DtlsError::Timeout);
            return Some(HandshakeEvent::Failed(DtlsError::Timeout));
        }
        None
    }

    /// SRTP keys, only once Established
    pub fn export_keys(&self) -> Option<ExportedKeys> {
        match self.state {
            HandshakeState::Established => self.keys.clone(),
            _ => None,
        }
    }

    /// Stop the handshake. An Established connection sends close_notify.
    pub fn close(&mut self) {
        if self.state == HandshakeState::Closed {
            return;
        }
        if let Some(close) = self.close_tx.take() {
            if close.send(()).is_err() {
                debug!("DTLS task already finished");
            }
        }
        self.shutdown();
    }

    /// Failed back to Idle so the handshake can be retried
    pub fn reset(&mut self) -> Result<(), DtlsError> {
        if self.state != HandshakeState::Failed {
            return Err(DtlsError::InvalidState("reset requires Failed"));
        }
        self.state = HandshakeState::Idle;
        Ok(())
    }

    fn fail(&mut self, error: DtlsError) {
        warn!("DTLS handshake failed: {}", error);
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.release();
        self.state = HandshakeState::Failed;
    }

    fn shutdown(&mut self) {
        // Detached: the task exits once close_notify is out or its queue ends
        self.task = None;
        self.release();
        self.state = HandshakeState::Closed;
    }

    fn release(&mut self) {
        self.inbound = None;
        self.events = None;
        self.close_tx = None;
        self.deadline = None;
        self.keys = None;
    }
}

impl Drop for HandshakeSession {
    fn drop(&mut self) {
        if self.state == HandshakeState::Handshaking {
            if let Some(task) = self.task.take() {
                task.abort();
            }
        }
    }
}

fn report(events: &mpsc::UnboundedSender<TaskEvent>, event: TaskEvent) {
    if events.send(event).is_err() {
        debug!("Handshake session gone, dropping task event");
    }
}

async fn drive(
    conn: Arc<SessionConn>,
    config: Config,
    expected: Option<CertFingerprint>,
    events: mpsc::UnboundedSender<TaskEvent>,
    mut close: oneshot::Receiver<()>,
) {
    let dtls = tokio::select! {
        result = DTLSConn::new(conn, config, false, None) => match result {
            Ok(dtls) => dtls,
            Err(e) => {
                report(&events, TaskEvent::Failed(DtlsError::Protocol(e.to_string())));
                return;
            }
        },
        _ = &mut close => return,
    };

    match negotiated_keys(&dtls, expected.as_ref(), false).await {
        Ok(keys) => report(&events, TaskEvent::Established(keys)),
        Err(e) => {
            close_conn(&dtls).await;
            report(&events, TaskEvent::Failed(e));
            return;
        }
    }

    // Application data is never expected; reading surfaces close_notify
    let mut buf = vec![0u8; READ_BUFFER];
    loop {
        tokio::select! {
            result = dtls.read(&mut buf, None) => match result {
                Ok(n) => debug!("Ignoring {} bytes of DTLS application data", n),
                Err(e) => {
                    debug!("DTLS connection ended: {}", e);
                    break;
                }
            },
            _ = &mut close => {
                close_conn(&dtls).await;
                return;
            }
        }
    }
    report(&events, TaskEvent::Closed);
}

async fn close_conn(dtls: &DTLSConn) {
    if let Err(e) = dtls.close().await {
        debug!("DTLS close: {}", e);
    }
}

/// Check the peer certificate and export SRTP keys for our side
pub(crate) async fn negotiated_keys(
    dtls: &DTLSConn,
    expected: Option<&CertFingerprint>,
    is_client: bool,
) -> Result<ExportedKeys, DtlsError> {
    let profile = match dtls.selected_srtpprotection_profile() {
        SrtpProtectionProfile::Srtp_Aead_Aes_128_Gcm => ProtectionProfile::AeadAes128Gcm,
        SrtpProtectionProfile::Srtp_Aes128_Cm_Hmac_Sha1_80 => {
            ProtectionProfile::Aes128CmHmacSha1_80
        }
        _ => return Err(DtlsError::UnsupportedProfile),
    };

    let state = dtls.connection_state().await;
    let leaf = state
        .peer_certificates
        .first()
        .ok_or(DtlsError::NoCertificate)?;
    if let Some(expected) = expected {
        if crypto::fingerprint(leaf) != *expected {
            return Err(DtlsError::FingerprintMismatch);
        }
    }

    let mut srtp_config = webrtc::srtp::config::Config {
        profile,
        ..Default::default()
    };
    srtp_config
        .extract_session_keys_from_dtls(state, is_client)
        .await
        .map_err(|e| DtlsError::Export(e.to_string()))?;
    Ok(ExportedKeys::from_session_keys(profile, srtp_config.keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtls::tests::{client_config, test_identity};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    async fn udp_pair() -> (Arc<UdpSocket>, UdpSocket) {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.connect(server.local_addr().unwrap()).await.unwrap();
        (server, client)
    }

    fn transport(server: &Arc<UdpSocket>, client: &UdpSocket) -> TransportHandle {
        TransportHandle::Udp {
            socket: server.clone(),
            remote: client.local_addr().unwrap(),
        }
    }

    /// Feed the server side until it reports an event
    async fn pump(handshake: &mut HandshakeSession, server: &UdpSocket) -> HandshakeEvent {
        let mut buf = vec![0u8; 2048];
        let run = async {
            loop {
                if let Some(event) = handshake.poll(Instant::now()) {
                    return event;
                }
                tokio::select! {
                    result = server.recv_from(&mut buf) => {
                        let (n, _) = result.unwrap();
                        handshake.handle_datagram(&buf[..n]).unwrap();
                    }
                    _ = tokio::time::sleep(Duration::from_millis(10)) => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(10), run)
            .await
            .expect("handshake did not finish")
    }

    #[test]
    fn test_datagram_before_start() {
        let mut handshake =
            HandshakeSession::new(test_identity(), None, HandshakeTimeouts::default());
        assert_eq!(
            handshake.handle_datagram(&[22, 254, 253]),
            Err(DtlsError::InvalidState("not started"))
        );
        assert!(handshake.poll(Instant::now()).is_none());
        assert!(handshake.export_keys().is_none());
    }

    #[tokio::test]
    async fn test_timeout_fails_once() {
        let (server, client) = udp_pair().await;
        let mut handshake =
            HandshakeSession::new(test_identity(), None, HandshakeTimeouts::default());
        let now = Instant::now();
        handshake.start(transport(&server, &client), now).unwrap();
        assert_eq!(
            handshake.start(transport(&server, &client), now),
            Err(DtlsError::InvalidState("start requires Idle"))
        );

        assert!(handshake.poll(now).is_none());
        let later = now + Duration::from_secs(31);
        assert_eq!(
            handshake.poll(later),
            Some(HandshakeEvent::Failed(DtlsError::Timeout))
        );
        assert!(handshake.poll(later).is_none());
        assert_eq!(handshake.state(), HandshakeState::Failed);

        handshake.reset().unwrap();
        assert_eq!(handshake.state(), HandshakeState::Idle);
        assert!(handshake.reset().is_err());
    }

    #[tokio::test]
    async fn test_flood_while_handshaking_fails() {
        let (server, client) = udp_pair().await;
        let mut handshake =
            HandshakeSession::new(test_identity(), None, HandshakeTimeouts::default());
        handshake
            .start(transport(&server, &client), Instant::now())
            .unwrap();

        // Current-thread runtime: the task cannot drain the queue until we yield
        for _ in 0..INBOUND_QUEUE {
            handshake.handle_datagram(&[22, 254, 253, 0]).unwrap();
        }
        assert_eq!(
            handshake.handle_datagram(&[22, 254, 253, 0]),
            Err(DtlsError::BufferExceeded)
        );
        assert_eq!(handshake.state(), HandshakeState::Failed);
        assert!(handshake.poll(Instant::now()).is_none());
    }

    #[tokio::test]
    async fn test_full_handshake_exports_matching_keys() {
        let server_identity = test_identity();
        let client_identity = test_identity();
        let (server, client) = udp_pair().await;

        let mut handshake = HandshakeSession::new(
            server_identity.clone(),
            Some(*client_identity.store().fingerprint()),
            HandshakeTimeouts::default(),
        );
        handshake
            .start(transport(&server, &client), Instant::now())
            .unwrap();

        let config = client_config(&client_identity);
        let peer = tokio::spawn(async move {
            DTLSConn::new(Arc::new(client), config, true, None).await.unwrap()
        });

        assert_eq!(
            pump(&mut handshake, &server).await,
            HandshakeEvent::Established
        );
        assert_eq!(handshake.state(), HandshakeState::Established);
        assert!(matches!(handshake.profile(), Some(ProtectionProfile::AeadAes128Gcm)));

        let peer = peer.await.unwrap();
        let theirs = negotiated_keys(&peer, Some(server_identity.store().fingerprint()), true)
            .await
            .unwrap();
        let ours = handshake.export_keys().unwrap();
        assert_eq!(ours.local_key, theirs.remote_key);
        assert_eq!(ours.remote_salt, theirs.local_salt);

        handshake.close();
        assert_eq!(handshake.state(), HandshakeState::Closed);
        assert!(handshake.export_keys().is_none());
        assert!(handshake.handle_datagram(&[21]).is_err());
    }

    #[tokio::test]
    async fn test_fingerprint_mismatch_fails() {
        let (server, client) = udp_pair().await;
        let mut handshake =
            HandshakeSession::new(test_identity(), Some([0u8; 32]), HandshakeTimeouts::default());
        handshake
            .start(transport(&server, &client), Instant::now())
            .unwrap();

        let config = client_config(&test_identity());
        let peer = tokio::spawn(async move {
            let _ = DTLSConn::new(Arc::new(client), config, true, None).await;
        });

        assert_eq!(
            pump(&mut handshake, &server).await,
            HandshakeEvent::Failed(DtlsError::FingerprintMismatch)
        );
        assert_eq!(handshake.state(), HandshakeState::Failed);
        peer.abort();
    }
}
