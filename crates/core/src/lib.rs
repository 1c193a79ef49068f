//! Tollway Core Types
//!
//! This crate defines the fundamental data structures shared by the entry,
//! the multiplexer and the node-quality store: configuration, service
//! metadata, fixed-point amounts and the tagged UDP datagram header.

mod amount;
mod config;
mod error;
mod metadata;
mod wire;

pub use amount::{Amount, AMOUNT_DECIMALS, BYTES_PER_MEBIBYTE};
pub use config::{Configuration, ServiceInfo, DEFAULT_SUBSCRIPTION_PREFIX};
pub use error::*;
pub use metadata::{read_metadata, write_metadata, ServiceMetadata, MAX_METADATA_SIZE};
pub use wire::{
    conn_id_from_port, encode_datagram, port_from_conn_id, split_datagram, DatagramHeader,
    DATAGRAM_HEADER_LEN,
};
