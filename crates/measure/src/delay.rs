//! Connect latency probe

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tracing::debug;

use crate::{with_deadline, MeasureError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl FromStr for Network {
    type Err = MeasureError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Network::Tcp),
            "udp" => Ok(Network::Udp),
            other => Err(MeasureError::UnsupportedNetwork(other.to_string())),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Time taken to establish a connection to `address`.
///
/// On failure the error carries the time spent before giving up (see
/// [`MeasureError::elapsed`]). A `timeout` of `None` waits for the OS.
pub async fn delay_measurement(
    network: Network,
    address: &str,
    timeout: Option<Duration>,
) -> Result<Duration> {
    let start = Instant::now();
    let connect = async {
        match network {
            Network::Tcp => {
                TcpStream::connect(address).await?;
            }
            Network::Udp => {
                let target = resolve(address).await?;
                let local: SocketAddr = if target.is_ipv4() {
                    "0.0.0.0:0".parse().map_err(invalid_input)?
                } else {
                    "[::]:0".parse().map_err(invalid_input)?
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(target).await?;
            }
        }
        Ok::<(), MeasureError>(())
    };

    let result = with_deadline(start, timeout, connect).await;
    let elapsed = start.elapsed();
    match result {
        Ok(()) => {
            debug!("{} connect to {} took {:?}", network, address, elapsed);
            Ok(elapsed)
        }
        Err(MeasureError::Io(source)) => Err(MeasureError::Connect { elapsed, source }),
        Err(e) => Err(e),
    }
}

async fn resolve(address: &str) -> std::io::Result<SocketAddr> {
    tokio::net::lookup_host(address).await?.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no address for {}", address),
        )
    })
}

fn invalid_input(e: std::net::AddrParseError) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
}
