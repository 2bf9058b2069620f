//! WebSocket signaling server
//!
//! Browsers connect, send `join` with an SDP offer and receive the answer.
//! Plain `GET /health` requests on the same port return room and session
//! counts.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::messages::{ErrorCode, SignalError, SignalMessage};

/// Counts reported by `/health`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub rooms: usize,
    pub sessions: usize,
}

/// Backend the signaling server forwards joins and leaves to
pub trait JoinHandler: Send + Sync + 'static {
    /// Join `room_id` as `user_id` with an SDP offer, returning the answer
    fn join(&self, room_id: &str, user_id: &str, offer_sdp: &str) -> Result<String, SignalError>;

    /// Leave a room. Unknown memberships are ignored.
    fn leave(&self, room_id: &str, user_id: &str);

    fn stats(&self) -> ServerStats;
}

/// Signal server state
pub struct SignalServer {
    handler: Arc<dyn JoinHandler>,
}

impl SignalServer {
    pub fn new(handler: Arc<dyn JoinHandler>) -> Self {
        Self { handler }
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve_listener(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        info!("Signal server listening on {}", listener.local_addr()?);

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let handler = self.handler.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }
}

/// Handle a single connection (HTTP or WebSocket)
async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<dyn JoinHandler>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Peek at the first bytes to tell a health check from a WS upgrade
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await?;
    if peek_buf[..n].starts_with(b"GET /health") {
        return handle_http_request(&mut stream, handler.stats()).await;
    }

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let conn_id = generate_connection_id()?;
    debug!("New signaling connection from {} as {}", peer_addr, conn_id);

    // Memberships joined over this connection
    let mut joined: Vec<(String, String)> = Vec::new();

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => {
                if !send_pong(&mut ws_sender, data).await {
                    break;
                }
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {:?}", e);
                break;
            }
        };

        let response = match SignalMessage::from_json(&msg) {
            Ok(request) => handle_message(request, &conn_id, handler.as_ref(), &mut joined),
            Err(e) => Some(SignalMessage::error(
                ErrorCode::InvalidMessage,
                format!("Invalid JSON: {}", e),
            )),
        };

        if let Some(response) = response {
            let json = response.to_json()?;
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    }

    // Disconnect leaves every room joined on this connection
    for (room_id, user_id) in joined.drain(..) {
        handler.leave(&room_id, &user_id);
    }

    debug!("Signaling connection closed: {}", conn_id);
    Ok(())
}

/// Answer a WebSocket ping. False once the peer can no longer be written to.
async fn send_pong<S>(sender: &mut S, data: Vec<u8>) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    match sender.send(Message::Pong(data)).await {
        Ok(()) => true,
        Err(e) => {
            debug!("Pong send failed, closing connection: {:?}", e);
            false
        }
    }
}

/// Handle an HTTP health request
async fn handle_http_request(
    stream: &mut TcpStream,
    stats: ServerStats,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; 1024];
    let _ = stream.read(&mut buf).await?;

    let body = format!(
        r#"{{"status":"healthy","rooms":{},"sessions":{}}}"#,
        stats.rooms, stats.sessions
    );
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Handle a single message
fn handle_message(
    msg: SignalMessage,
    conn_id: &str,
    handler: &dyn JoinHandler,
    joined: &mut Vec<(String, String)>,
) -> Option<SignalMessage> {
    match msg {
        SignalMessage::Join {
            room_id,
            user_id,
            sdp,
        } => match handler.join(&room_id, &user_id, &sdp) {
            Ok(answer) => {
                info!("{} joined room {} as {}", conn_id, room_id, user_id);
                let membership = (room_id.clone(), user_id.clone());
                if !joined.contains(&membership) {
                    joined.push(membership);
                }
                Some(SignalMessage::Joined {
                    room_id,
                    user_id,
                    sdp: answer,
                })
            }
            Err(e) => {
                warn!("Join {}/{} rejected: {}", room_id, user_id, e);
                Some(e.into())
            }
        },

        SignalMessage::Leave { room_id, user_id } => {
            let membership = (room_id, user_id);
            match joined.iter().position(|m| *m == membership) {
                Some(idx) => {
                    joined.swap_remove(idx);
                    let (room_id, user_id) = membership;
                    handler.leave(&room_id, &user_id);
                    info!("{} left room {}", user_id, room_id);
                    Some(SignalMessage::Left { room_id, user_id })
                }
                None => Some(SignalMessage::error(
                    ErrorCode::NotJoined,
                    format!("{} is not in room {}", membership.1, membership.0),
                )),
            }
        }

        SignalMessage::Ping { timestamp } => Some(SignalMessage::Pong { timestamp }),

        _ => Some(SignalMessage::error(
            ErrorCode::InvalidMessage,
            "Unhandled message type",
        )),
    }
}

/// Generate a unique connection ID
fn generate_connection_id() -> Result<String, getrandom::Error> {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes)?;
    Ok(hex::encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct MockHandler {
        left: Mutex<Vec<(String, String)>>,
    }

    impl JoinHandler for MockHandler {
        fn join(&self, room_id: &str, user_id: &str, offer: &str) -> Result<String, SignalError> {
            if offer.is_empty() {
                return Err(SignalError::new(ErrorCode::InvalidSdp, "empty offer"));
            }
            Ok(format!("answer:{}:{}", room_id, user_id))
        }

        fn leave(&self, room_id: &str, user_id: &str) {
            self.left.lock().push((room_id.into(), user_id.into()));
        }

        fn stats(&self) -> ServerStats {
            ServerStats {
                rooms: 1,
                sessions: 2,
            }
        }
    }

    fn join(room: &str, user: &str, sdp: &str) -> SignalMessage {
        SignalMessage::Join {
            room_id: room.into(),
            user_id: user.into(),
            sdp: sdp.into(),
        }
    }

    #[test]
    fn test_join_and_leave() {
        let handler = MockHandler::default();
        let mut joined = Vec::new();

        match handle_message(join("r", "alice", "v=0"), "c1", &handler, &mut joined) {
            Some(SignalMessage::Joined { sdp, .. }) => assert_eq!(sdp, "answer:r:alice"),
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(joined.len(), 1);

        let leave = SignalMessage::Leave {
            room_id: "r".into(),
            user_id: "alice".into(),
        };
        assert!(matches!(
            handle_message(leave.clone(), "c1", &handler, &mut joined),
            Some(SignalMessage::Left { .. })
        ));
        assert!(joined.is_empty());
        assert_eq!(handler.left.lock().len(), 1);

        // Second leave is rejected
        assert!(matches!(
            handle_message(leave, "c1", &handler, &mut joined),
            Some(SignalMessage::Error {
                code: ErrorCode::NotJoined,
                ..
            })
        ));
    }

    #[test]
    fn test_join_error_forwarded() {
        let handler = MockHandler::default();
        let mut joined = Vec::new();
        match handle_message(join("r", "bob", ""), "c1", &handler, &mut joined) {
            Some(SignalMessage::Error { code, .. }) => assert_eq!(code, ErrorCode::InvalidSdp),
            other => panic!("unexpected response: {:?}", other),
        }
        assert!(joined.is_empty());
    }

    /// Sink whose peer has gone away
    struct ClosedSink;

    impl Sink<Message> for ClosedSink {
        type Error = tokio_tungstenite::tungstenite::Error;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _: Message) -> Result<(), Self::Error> {
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_pong_failure_ends_connection() {
        let mut sent: Vec<Message> = Vec::new();
        assert!(send_pong(&mut sent, vec![1, 2]).await);
        assert_eq!(sent, vec![Message::Pong(vec![1, 2])]);

        assert!(!send_pong(&mut ClosedSink, vec![1, 2]).await);
    }

    #[test]
    fn test_ping() {
        let handler = MockHandler::default();
        let mut joined = Vec::new();
        assert!(matches!(
            handle_message(SignalMessage::Ping { timestamp: 7 }, "c1", &handler, &mut joined),
            Some(SignalMessage::Pong { timestamp: 7 })
        ));
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = generate_connection_id().unwrap();
        let id2 = generate_connection_id().unwrap();
        assert_eq!(id1.len(), 16);
        assert_ne!(id1, id2);
    }

    #[tokio::test]
    async fn test_websocket_join_and_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handler = Arc::new(MockHandler::default());
        let server = SignalServer::new(handler.clone());
        tokio::spawn(async move { server.serve_listener(listener).await });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}", addr))
            .await
            .unwrap();
        let request = join("room-1", "alice", "v=0").to_json().unwrap();
        ws.send(Message::Text(request)).await.unwrap();

        let reply = loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => break SignalMessage::from_json(&text).unwrap(),
                _ => continue,
            }
        };
        assert!(matches!(reply, SignalMessage::Joined { .. }));

        ws.close(None).await.unwrap();
        drop(ws);

        for _ in 0..50 {
            if !handler.left.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(
            handler.left.lock().as_slice(),
            &[("room-1".to_string(), "alice".to_string())]
        );
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SignalServer::new(Arc::new(MockHandler::default()));
        tokio::spawn(async move { server.serve_listener(listener).await });

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();
        assert!(body.starts_with("HTTP/1.1 200 OK"));
        assert!(body.contains(r#""rooms":1"#));
        assert!(body.contains(r#""sessions":2"#));
    }
}
