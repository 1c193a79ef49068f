//! Reverse mode
//!
//! Exits that cannot accept inbound connections dial a reverse entry
//! instead. The entry listens on a public TCP port and a public UDP port;
//! each exit that connects sends its metadata first, then the connection
//! carries a normal session with the entry as the mux client. Tagged
//! datagrams from all exits arrive on the one UDP socket and are routed by
//! source address.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tollway_core::{read_metadata, Configuration, ServiceMetadata};

use crate::pipe::is_closed_socket_error;
use crate::{
    DatagramLink, EntryError, PaymentWallet, Result, ServerLink, SessionManager, TunnelEntry,
    MAX_DATAGRAM_SIZE,
};

/// Service name of every entry started by the reverse server
pub const REVERSE_SERVICE_NAME: &str = "reverse";
/// Service id the reverse server advertises for itself
pub const REVERSE_SERVICE_ID: u8 = 255;

const ROUTE_QUEUE: usize = 1024;

static NEXT_ROUTE_ID: AtomicU64 = AtomicU64::new(1);

/// Inbound queue of the exit connection that registered it
struct Route {
    id: u64,
    tx: mpsc::Sender<Vec<u8>>,
}

type Routes = Arc<RwLock<HashMap<SocketAddr, Route>>>;

/// Route datagrams from `from` to `tx`, replacing any earlier exit at the
/// same address. Returns the id needed to remove it.
fn add_route(routes: &Routes, from: SocketAddr, tx: mpsc::Sender<Vec<u8>>) -> u64 {
    let id = NEXT_ROUTE_ID.fetch_add(1, Ordering::Relaxed);
    if routes.write().insert(from, Route { id, tx }).is_some() {
        debug!("Exit at {} replaced an earlier route", from);
    }
    id
}

/// Remove the route for `from` only if it is still the one added as `id`
fn remove_route(routes: &Routes, from: SocketAddr, id: u64) {
    let mut routes = routes.write();
    if routes.get(&from).is_some_and(|route| route.id == id) {
        routes.remove(&from);
    }
}

/// Datagram link to one exit over the shared reverse UDP socket
struct ReverseDatagramLink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
}

#[async_trait]
impl DatagramLink for ReverseDatagramLink {
    async fn send(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.peer).await.map(|_| ())
    }

    async fn recv(&self) -> io::Result<Vec<u8>> {
        self.inbound.lock().await.recv().await.ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "reverse datagram route closed")
        })
    }
}

pub struct ReverseServer {
    config: Arc<Configuration>,
    wallet: Arc<dyn PaymentWallet>,
    listener: TcpListener,
    socket: Arc<UdpSocket>,
    routes: Routes,
}

impl ReverseServer {
    /// Bind the reverse TCP and UDP ports on all interfaces
    pub async fn bind(config: Configuration, wallet: Arc<dyn PaymentWallet>) -> Result<Self> {
        let ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self::bind_on(ip, config, wallet).await
    }

    pub async fn bind_on(
        ip: IpAddr,
        config: Configuration,
        wallet: Arc<dyn PaymentWallet>,
    ) -> Result<Self> {
        let tcp_addr = SocketAddr::new(ip, config.reverse_tcp);
        let listener = TcpListener::bind(tcp_addr)
            .await
            .map_err(|source| EntryError::Bind {
                addr: tcp_addr,
                source,
            })?;
        let udp_addr = SocketAddr::new(ip, config.reverse_udp);
        let socket = UdpSocket::bind(udp_addr)
            .await
            .map_err(|source| EntryError::Bind {
                addr: udp_addr,
                source,
            })?;
        info!(
            "Reverse entry listening on tcp {} udp {}",
            listener.local_addr()?,
            socket.local_addr()?
        );

        Ok(Self {
            config: Arc::new(config),
            wallet,
            listener,
            socket: Arc::new(socket),
            routes: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    pub fn tcp_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn udp_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// What this server offers to exits looking for a reverse entry
    pub fn advertised_metadata(&self) -> io::Result<ServiceMetadata> {
        Ok(ServiceMetadata {
            tcp_port: self.tcp_addr()?.port(),
            udp_port: self.udp_addr()?.port(),
            service_id: REVERSE_SERVICE_ID,
            price: self.config.reverse_price.clone(),
            ..Default::default()
        })
    }

    /// Serve exits until the task is dropped
    pub async fn run(self) -> Result<()> {
        let udp_reader = tokio::spawn(route_datagrams(self.socket.clone(), self.routes.clone()));
        let _udp_reader = AbortOnDrop(udp_reader);

        loop {
            match self.listener.accept().await {
                Ok((conn, peer)) => {
                    debug!("Exit connected from {}", peer);
                    let config = self.config.clone();
                    let wallet = self.wallet.clone();
                    let socket = self.socket.clone();
                    let routes = self.routes.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_exit(conn, peer, config, wallet, socket, routes).await
                        {
                            warn!("Reverse entry for {} stopped: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    warn!("Couldn't accept exit connection: {}", e);
                    if is_closed_socket_error(&e) {
                        return Err(e.into());
                    }
                }
            }
        }
    }
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn serve_exit(
    mut conn: TcpStream,
    peer: SocketAddr,
    config: Arc<Configuration>,
    wallet: Arc<dyn PaymentWallet>,
    socket: Arc<UdpSocket>,
    routes: Routes,
) -> Result<()> {
    let metadata = match config.dial_timeout() {
        Some(limit) => tokio::time::timeout(limit, read_metadata(&mut conn))
            .await
            .map_err(|_| EntryError::DialTimeout(limit))??,
        None => read_metadata(&mut conn).await?,
    };

    let route = if metadata.udp_port > 0 {
        let exit_udp = SocketAddr::new(peer.ip(), metadata.udp_port);
        let (tx, rx) = mpsc::channel(ROUTE_QUEUE);
        let route_id = add_route(&routes, exit_udp, tx);
        let link = ReverseDatagramLink {
            socket,
            peer: exit_udp,
            inbound: tokio::sync::Mutex::new(rx),
        };
        Some((exit_udp, route_id, Arc::new(link) as Arc<dyn DatagramLink>))
    } else {
        None
    };

    let link = ServerLink {
        conn,
        metadata,
        datagrams: route.as_ref().map(|(_, _, link)| link.clone()),
    };
    let manager = SessionManager::reverse(REVERSE_SERVICE_NAME, link);
    let result = match TunnelEntry::new(manager, &config, wallet) {
        Ok(entry) => entry.start().await,
        Err(e) => Err(e),
    };

    if let Some((exit_udp, route_id, _)) = route {
        remove_route(&routes, exit_udp, route_id);
    }
    debug!("Exit {} disconnected", peer);
    result
}

/// Single reader for the shared reverse UDP socket
async fn route_datagrams(socket: Arc<UdpSocket>, routes: Routes) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Couldn't receive data from server: {}", e);
                if is_closed_socket_error(&e) {
                    // Dropping the senders ends every link's recv
                    routes.write().clear();
                    return;
                }
                continue;
            }
        };

        let route = routes.read().get(&from).map(|route| route.tx.clone());
        match route {
            Some(tx) => {
                if tx.try_send(buf[..n].to_vec()).is_err() {
                    debug!("Dropping datagram from {}: route busy or gone", from);
                }
            }
            None => debug!("Dropping datagram from unknown exit {}", from),
        }
    }
}
