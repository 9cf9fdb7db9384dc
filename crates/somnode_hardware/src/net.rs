// TCP implementation of the network stack on tokio::net.

use crate::{NetworkStack, StreamSocket};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, trace};

/// Resolves with the system resolver and opens plain TCP sockets.
#[derive(Debug, Clone)]
pub struct TcpStack {
    io_timeout: Duration,
}

impl TcpStack {
    /// `io_timeout` bounds every connect and read.
    pub fn new(io_timeout: Duration) -> Self {
        Self { io_timeout }
    }
}

#[async_trait]
impl NetworkStack for TcpStack {
    type Socket = TcpSocketHandle;

    async fn resolve(&self, host: &str, port: u16) -> io::Result<SocketAddr> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
        trace!(host, candidates = addrs.len(), "Resolved host");
        // IPv4 first; the remote service is only known to answer there.
        addrs
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no addresses for {}", host)))
    }

    fn allocate(&self, addr: &SocketAddr) -> io::Result<TcpSocketHandle> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        Ok(TcpSocketHandle {
            state: SocketState::Allocated(socket),
            io_timeout: self.io_timeout,
        })
    }
}

enum SocketState {
    Allocated(TcpSocket),
    Connected(TcpStream),
    Closed,
}

/// An owned TCP socket. The OS handle is closed when this value is dropped.
pub struct TcpSocketHandle {
    state: SocketState,
    io_timeout: Duration,
}

impl TcpSocketHandle {
    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        match &mut self.state {
            SocketState::Connected(stream) => Ok(stream),
            _ => Err(io::Error::new(io::ErrorKind::NotConnected, "socket is not connected")),
        }
    }
}

#[async_trait]
impl StreamSocket for TcpSocketHandle {
    async fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        let socket = match std::mem::replace(&mut self.state, SocketState::Closed) {
            SocketState::Allocated(socket) => socket,
            other => {
                self.state = other;
                return Err(io::Error::new(io::ErrorKind::AlreadyExists, "socket already used"));
            }
        };
        // On failure or timeout the TcpSocket is dropped inside the connect future.
        let stream = timeout(self.io_timeout, socket.connect(addr))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {} timed out", addr)))??;
        debug!(%addr, "TCP connection established");
        self.state = SocketState::Connected(stream);
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let stream = self.stream()?;
        stream.write_all(bytes).await?;
        Ok(bytes.len())
    }

    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let io_timeout = self.io_timeout;
        let stream = self.stream()?;
        timeout(io_timeout, stream.read(buf))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "read timed out"))?
    }

    async fn close(&mut self) -> io::Result<()> {
        if let SocketState::Connected(stream) = &mut self.state {
            stream.shutdown().await?;
        }
        self.state = SocketState::Closed;
        Ok(())
    }
}
