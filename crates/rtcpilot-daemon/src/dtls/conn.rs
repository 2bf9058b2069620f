//! Datagram connection handed to `DTLSConn`
//!
//! Reads come from the queue the listener feeds after demultiplexing;
//! writes go straight out through the session's transport.

use std::any::Any;
use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use webrtc::util::Conn;

use crate::session::TransportHandle;

type ConnResult<T> = Result<T, webrtc::util::Error>;

pub struct SessionConn {
    transport: TransportHandle,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
}

impl SessionConn {
    pub fn new(transport: TransportHandle, inbound: mpsc::Receiver<Bytes>) -> Self {
        Self {
            transport,
            inbound: Mutex::new(inbound),
        }
    }
}

fn closed() -> webrtc::util::Error {
    webrtc::util::Error::from(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "session closed",
    ))
}

#[async_trait]
impl Conn for SessionConn {
    async fn connect(&self, _addr: SocketAddr) -> ConnResult<()> {
        Err(webrtc::util::Error::Other("session transport is already connected".into()))
    }

    async fn recv(&self, buf: &mut [u8]) -> ConnResult<usize> {
        let datagram = self.inbound.lock().await.recv().await.ok_or_else(closed)?;
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> ConnResult<(usize, SocketAddr)> {
        let n = self.recv(buf).await?;
        Ok((n, self.transport.remote()))
    }

    async fn send(&self, buf: &[u8]) -> ConnResult<usize> {
        self.transport
            .send_async(buf)
            .await
            .map_err(webrtc::util::Error::from)
    }

    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> ConnResult<usize> {
        self.send(buf).await
    }

    fn local_addr(&self) -> ConnResult<SocketAddr> {
        self.transport
            .local_addr()
            .map_err(webrtc::util::Error::from)
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.transport.remote())
    }

    /// The inbound queue ends when the session drops its sender. A reader
    /// may be parked on it, so the queue lock is not taken here.
    async fn close(&self) -> ConnResult<()> {
        Ok(())
    }

    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}
