//! TCP port forwarding
//!
//! Every service TCP port the exit advertises is bound locally on the same
//! port number. Each accepted connection gets its own stream tagged with
//! the service id and the port's id, and bytes are spliced both ways.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use tollway_mux::StreamTag;

use crate::pipe::{is_closed_socket_error, splice};
use crate::{ByteCounters, EntryError, Result, SessionManager};

/// Bind one listener per port on `ip`. Any failure is fatal.
pub async fn bind_listeners(ip: IpAddr, ports: &[u16]) -> Result<Vec<(u16, TcpListener)>> {
    let mut listeners = Vec::with_capacity(ports.len());
    for &port in ports {
        let addr = SocketAddr::new(ip, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EntryError::Bind { addr, source })?;
        info!("Listening for TCP on {}", addr);
        listeners.push((port, listener));
    }
    Ok(listeners)
}

/// Bind every port on all interfaces
pub async fn bind_all(ports: &[u16]) -> Result<Vec<(u16, TcpListener)>> {
    bind_listeners(IpAddr::V4(Ipv4Addr::UNSPECIFIED), ports).await
}

/// Accept connections on `listener` until it fails for good.
///
/// A listener that is gone tears the whole entry down; other accept errors
/// are logged and serving continues.
pub async fn serve(
    manager: Arc<SessionManager>,
    counters: Arc<ByteCounters>,
    port: u16,
    listener: TcpListener,
) {
    loop {
        match listener.accept().await {
            Ok((conn, peer)) => {
                debug!("TCP connection from {} on port {}", peer, port);
                let manager = manager.clone();
                let counters = counters.clone();
                tokio::spawn(async move {
                    forward(manager, counters, port, conn).await;
                });
            }
            Err(e) => {
                warn!("Couldn't accept connection on port {}: {}", port, e);
                if is_closed_socket_error(&e) {
                    manager.close();
                    return;
                }
            }
        }
    }
}

async fn forward(
    manager: Arc<SessionManager>,
    counters: Arc<ByteCounters>,
    port: u16,
    conn: TcpStream,
) {
    let tag = match manager.metadata() {
        Some(metadata) => match metadata.tcp_port_id(port) {
            Some(port_id) => StreamTag::new(metadata.service_id, port_id),
            None => {
                warn!("Port {} is not served by {}", port, manager.service_name());
                return;
            }
        },
        None => {
            warn!("No exit metadata for {}", manager.service_name());
            return;
        }
    };

    match manager.open_stream(Some(tag), false).await {
        Ok(stream) => splice(conn, stream, counters),
        Err(e) => warn!("Couldn't open stream for port {}: {}", port, e),
    }
}
