//! Tollway Entry
//!
//! The entry side of a paid tunnel. An entry keeps one multiplexed session
//! to an exit node and forwards local ports through it:
//!
//! - [`SessionManager`] owns the session, rebuilds it on failure and tears
//!   everything down on close
//! - [`tcp`] and [`udp`] forwarders bind the exit's advertised service ports
//!   locally and relay traffic over the session
//! - [`PaymentMeter`] counts downstream bytes and periodically pays for them
//!   over a payment channel
//! - [`ReverseServer`] accepts connections from exits that cannot be dialed
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use tollway_core::Configuration;
//! use tollway_entry::{ClaimWallet, DirectConnector, SessionManager, TunnelEntry};
//!
//! # async fn example() -> tollway_entry::Result<()> {
//! let config = Configuration::default();
//! let wallet = Arc::new(ClaimWallet::from_seed(&"11".repeat(32))?);
//! let connector = Arc::new(DirectConnector::new("203.0.113.7:30020", config.dial_timeout()));
//! let manager = SessionManager::dial("web", connector, None);
//!
//! let entry = TunnelEntry::new(manager, &config, wallet)?;
//! entry.start().await?;
//! # Ok(())
//! # }
//! ```

mod connector;
mod entry;
mod payment;
mod pipe;
mod reverse;
mod session;
pub mod tcp;
mod ttl_cache;
pub mod udp;

pub use connector::{
    Connector, DatagramLink, DirectConnector, ServerLink, UdpDatagramLink, MAX_DATAGRAM_SIZE,
};
pub use entry::{TunnelEntry, CONNECT_RETRY_INTERVAL};
pub use payment::{
    ByteCounters, ClaimWallet, PaymentChannel, PaymentClaim, PaymentMeter, PaymentTransaction,
    PaymentWallet, Settlement, PAYMENT_INTERVAL,
};
pub use reverse::{ReverseServer, REVERSE_SERVICE_ID, REVERSE_SERVICE_NAME};
pub use session::{PaymentTerms, SessionManager, SessionState};
pub use ttl_cache::TtlCache;

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tollway_core::{Amount, TollwayError};
use tollway_mux::MuxError;

#[derive(Error, Debug)]
pub enum EntryError {
    #[error("Not connected to an exit")]
    NotConnected,

    #[error("Entry closed")]
    Closed,

    #[error("Reverse connection to service is dead")]
    ReverseSessionDead,

    #[error("Price {price} exceeds max price {max_price}")]
    PriceTooHigh { price: Amount, max_price: Amount },

    #[error("Dial timed out after {0:?}")]
    DialTimeout(Duration),

    #[error("Couldn't bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Payment error: {0}")]
    Payment(String),

    #[error("Invalid account seed: {0}")]
    InvalidSeed(String),

    #[error("{0}")]
    Core(#[from] TollwayError),

    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EntryError {
    /// Errors that a reconnect may fix
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            EntryError::NotConnected
                | EntryError::DialTimeout(_)
                | EntryError::Mux(_)
                | EntryError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EntryError>;
