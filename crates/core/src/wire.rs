//! Tagged UDP datagram header
//!
//! ```text
//! byte 0-1: connection id (client source port, little-endian)
//! byte 2:   service id
//! byte 3:   port id
//! ```

use crate::{Result, TollwayError};

pub const DATAGRAM_HEADER_LEN: usize = 4;

/// Connection id bytes for a client source port
pub fn conn_id_from_port(port: u16) -> [u8; 2] {
    port.to_le_bytes()
}

/// Inverse of [`conn_id_from_port`]
pub fn port_from_conn_id(conn_id: [u8; 2]) -> u16 {
    u16::from_le_bytes(conn_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramHeader {
    pub conn_id: [u8; 2],
    pub service_id: u8,
    pub port_id: u8,
}

impl DatagramHeader {
    pub fn for_client(client_port: u16, service_id: u8, port_id: u8) -> Self {
        Self {
            conn_id: conn_id_from_port(client_port),
            service_id,
            port_id,
        }
    }

    /// Client source port this datagram belongs to
    pub fn client_port(&self) -> u16 {
        port_from_conn_id(self.conn_id)
    }

    pub fn encode(&self) -> [u8; DATAGRAM_HEADER_LEN] {
        [self.conn_id[0], self.conn_id[1], self.service_id, self.port_id]
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        match data {
            [c0, c1, service_id, port_id, ..] => Ok(Self {
                conn_id: [*c0, *c1],
                service_id: *service_id,
                port_id: *port_id,
            }),
            _ => Err(TollwayError::DatagramTooShort(data.len())),
        }
    }
}

/// Header followed by payload
pub fn encode_datagram(header: &DatagramHeader, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(DATAGRAM_HEADER_LEN + payload.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(payload);
    out
}

pub fn split_datagram(data: &[u8]) -> Result<(DatagramHeader, &[u8])> {
    let header = DatagramHeader::decode(data)?;
    Ok((header, &data[DATAGRAM_HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conn_id_round_trips_every_port() {
        for port in 0..=u16::MAX {
            let header = DatagramHeader::for_client(port, 1, 2);
            let decoded = DatagramHeader::decode(&header.encode()).unwrap();
            assert_eq!(decoded.client_port(), port);
        }
    }

    #[test]
    fn test_conn_id_is_little_endian() {
        assert_eq!(conn_id_from_port(0x1234), [0x34, 0x12]);
        assert_eq!(port_from_conn_id([0x34, 0x12]), 0x1234);
    }

    #[test]
    fn test_split_datagram() {
        let header = DatagramHeader::for_client(5353, 7, 1);
        let data = encode_datagram(&header, b"payload");
        let (decoded, payload) = split_datagram(&data).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(matches!(
            split_datagram(&[1, 2, 3]),
            Err(TollwayError::DatagramTooShort(3))
        ));
        let (_, payload) = split_datagram(&[1, 2, 3, 4]).unwrap();
        assert!(payload.is_empty());
    }
}
