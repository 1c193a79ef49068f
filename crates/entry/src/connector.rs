//! Exit connection capabilities
//!
//! A [`Connector`] produces a fresh [`ServerLink`] to an exit: the raw TCP
//! connection the session is layered on, the metadata the exit advertised,
//! and optionally a datagram channel for tagged UDP traffic.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use tollway_core::{read_metadata, ServiceMetadata};

use crate::{EntryError, Result};

/// Largest datagram read from a UDP socket
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Datagram channel to an exit. Each datagram carries the 4-byte header.
#[async_trait]
pub trait DatagramLink: Send + Sync {
    async fn send(&self, datagram: &[u8]) -> io::Result<()>;

    async fn recv(&self) -> io::Result<Vec<u8>>;
}

/// Everything needed to run a session against one exit
pub struct ServerLink {
    pub conn: TcpStream,
    pub metadata: ServiceMetadata,
    pub datagrams: Option<Arc<dyn DatagramLink>>,
}

impl std::fmt::Debug for ServerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerLink")
            .field("peer", &self.conn.peer_addr().ok())
            .field("metadata", &self.metadata)
            .field("datagrams", &self.datagrams.is_some())
            .finish()
    }
}

/// Produces links to an exit on demand
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<ServerLink>;
}

/// Dials a known exit address and reads its metadata.
///
/// The exit writes its length-prefixed metadata as soon as the TCP
/// connection is up. When it advertises a UDP port, a UDP socket connected
/// to that port on the same host carries tagged datagrams.
#[derive(Debug, Clone)]
pub struct DirectConnector {
    addr: String,
    dial_timeout: Option<Duration>,
}

impl DirectConnector {
    pub fn new(addr: impl Into<String>, dial_timeout: Option<Duration>) -> Self {
        Self {
            addr: addr.into(),
            dial_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn dial(&self) -> Result<ServerLink> {
        let mut conn = TcpStream::connect(&self.addr).await?;
        conn.set_nodelay(true)?;
        let metadata = read_metadata(&mut conn).await?;

        let datagrams = if metadata.udp_port > 0 {
            let target = SocketAddr::new(conn.peer_addr()?.ip(), metadata.udp_port);
            let link = UdpDatagramLink::connect(target).await?;
            Some(Arc::new(link) as Arc<dyn DatagramLink>)
        } else {
            None
        };

        debug!(
            "Connected to {} (service {}, {} tcp / {} udp ports)",
            self.addr,
            metadata.service_id,
            metadata.service_tcp.len(),
            metadata.service_udp.len()
        );
        Ok(ServerLink {
            conn,
            metadata,
            datagrams,
        })
    }
}

#[async_trait]
impl Connector for DirectConnector {
    async fn connect(&self) -> Result<ServerLink> {
        match self.dial_timeout {
            Some(limit) => tokio::time::timeout(limit, self.dial())
                .await
                .map_err(|_| EntryError::DialTimeout(limit))?,
            None => self.dial().await,
        }
    }
}

/// Datagram link over a UDP socket connected to the exit
#[derive(Debug)]
pub struct UdpDatagramLink {
    socket: UdpSocket,
}

impl UdpDatagramLink {
    pub async fn connect(target: SocketAddr) -> io::Result<Self> {
        let local: SocketAddr = if target.is_ipv4() {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(target).await?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DatagramLink for UdpDatagramLink {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send(datagram).await.map(|_| ())
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let n = self.socket.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}
