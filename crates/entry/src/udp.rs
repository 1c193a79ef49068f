//! UDP port forwarding
//!
//! Local service ports are bound with one socket each. Datagrams from
//! local clients are prefixed with the 4-byte header (client port as
//! connection id, service id, port id) and sent on the session's datagram
//! link. Datagrams coming back are routed by port id to the local socket
//! and by connection id to the client address last seen from that port.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use tollway_core::{encode_datagram, split_datagram, DatagramHeader};

use crate::{ByteCounters, EntryError, Result, SessionManager, TtlCache, MAX_DATAGRAM_SIZE};

/// How often expired client addresses are swept
pub const CLIENT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Pause after a failed receive before reading the link again
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Client addresses keyed by source port
pub type ClientAddrs = TtlCache<u16, SocketAddr>;

/// Bound local UDP sockets for one entry
pub struct UdpForwarder {
    manager: Arc<SessionManager>,
    counters: Arc<ByteCounters>,
    sockets: Arc<HashMap<u16, Arc<UdpSocket>>>,
    clients: Arc<ClientAddrs>,
}

impl UdpForwarder {
    /// Bind every port on `ip`. Any failure is fatal.
    pub async fn bind(
        manager: Arc<SessionManager>,
        counters: Arc<ByteCounters>,
        ip: IpAddr,
        ports: &[u16],
        client_timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut sockets = HashMap::with_capacity(ports.len());
        for &port in ports {
            let addr = SocketAddr::new(ip, port);
            let socket = UdpSocket::bind(addr)
                .await
                .map_err(|source| EntryError::Bind { addr, source })?;
            info!("Listening for UDP on {}", addr);
            sockets.insert(port, Arc::new(socket));
        }

        Ok(Self {
            manager,
            counters,
            sockets: Arc::new(sockets),
            clients: Arc::new(TtlCache::new(client_timeout)),
        })
    }

    /// Bind every port on all interfaces
    pub async fn bind_all(
        manager: Arc<SessionManager>,
        counters: Arc<ByteCounters>,
        ports: &[u16],
        client_timeout: Option<Duration>,
    ) -> Result<Self> {
        let ip = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        Self::bind(manager, counters, ip, ports, client_timeout).await
    }

    pub fn clients(&self) -> &Arc<ClientAddrs> {
        &self.clients
    }

    /// Spawn the dispatch, per-socket and sweep tasks, all owned by the
    /// session manager
    pub fn start(self) {
        if self.sockets.is_empty() {
            return;
        }

        let manager = self.manager.clone();
        manager.register_task(self.clients.spawn_janitor(CLIENT_SWEEP_INTERVAL));
        manager.register_task(tokio::spawn(dispatch_remote(
            self.manager.clone(),
            self.counters.clone(),
            self.sockets.clone(),
            self.clients.clone(),
        )));
        for (&port, socket) in self.sockets.iter() {
            manager.register_task(tokio::spawn(forward_local(
                self.manager.clone(),
                port,
                socket.clone(),
                self.clients.clone(),
            )));
        }
    }
}

/// Remote → local: route datagrams from the current link to clients
async fn dispatch_remote(
    manager: Arc<SessionManager>,
    counters: Arc<ByteCounters>,
    sockets: Arc<HashMap<u16, Arc<UdpSocket>>>,
    clients: Arc<ClientAddrs>,
) {
    let mut links = manager.subscribe_datagrams();
    loop {
        let current = links.borrow_and_update().clone();
        let Some(link) = current else {
            if links.changed().await.is_err() {
                return;
            }
            continue;
        };

        tokio::select! {
            changed = links.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            received = link.recv() => match received {
                Ok(data) => deliver(&manager, &counters, &sockets, &clients, &data).await,
                Err(e) => {
                    debug!("Couldn't receive datagram from {}: {}", manager.service_name(), e);
                    // Back off briefly, then read from whatever link is current
                    tokio::select! {
                        changed = links.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = tokio::time::sleep(RECV_RETRY_DELAY) => {}
                    }
                }
            },
        }
    }
}

async fn deliver(
    manager: &SessionManager,
    counters: &ByteCounters,
    sockets: &HashMap<u16, Arc<UdpSocket>>,
    clients: &ClientAddrs,
    data: &[u8],
) {
    let (header, payload) = match split_datagram(data) {
        Ok(parts) => parts,
        Err(e) => {
            debug!("Dropping datagram: {}", e);
            return;
        }
    };

    let Some(port) = manager
        .metadata()
        .and_then(|m| m.udp_port(header.port_id))
    else {
        warn!("Couldn't get service port for port id {}", header.port_id);
        return;
    };
    let Some(socket) = sockets.get(&port) else {
        warn!("Couldn't get service conn for port: {}", port);
        return;
    };
    let client_port = header.client_port();
    let Some(client) = clients.get(&client_port) else {
        warn!("Couldn't get client address for: {}", client_port);
        return;
    };

    match socket.send_to(payload, client).await {
        Ok(n) => counters.add_bytes_in(n as u64),
        Err(e) => warn!("Couldn't send data to client {}: {}", client, e),
    }
}

/// Local → remote: tag client datagrams and send them to the exit
async fn forward_local(
    manager: Arc<SessionManager>,
    port: u16,
    socket: Arc<UdpSocket>,
    clients: Arc<ClientAddrs>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("Couldn't receive data from local port {}: {}", port, e);
                continue;
            }
        };
        clients.insert(from.port(), from);

        let Some(link) = manager.datagram_link() else {
            warn!("Couldn't get remote connection for {}", manager.service_name());
            continue;
        };
        let Some(metadata) = manager.metadata() else {
            continue;
        };
        let Some(port_id) = metadata.udp_port_id(port) else {
            warn!("Port {} is not served by {}", port, manager.service_name());
            continue;
        };

        let header = DatagramHeader::for_client(from.port(), metadata.service_id, port_id);
        if let Err(e) = link.send(&encode_datagram(&header, &buf[..n])).await {
            warn!("Couldn't send datagram to {}: {}", manager.service_name(), e);
        }
    }
}
