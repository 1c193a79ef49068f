//! Service metadata advertised by an exit
//!
//! An exit describes what it serves when a connection is established: its
//! service id, the TCP/UDP ports it exposes and the price it charges. The
//! port id of a port is its index in the corresponding port list.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Amount, Result, TollwayError};

/// Upper bound on an encoded metadata document
pub const MAX_METADATA_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceMetadata {
    pub ip: String,
    pub tcp_port: u16,
    /// Exit UDP port for tagged datagrams (0 = no UDP)
    pub udp_port: u16,
    pub service_id: u8,
    pub service_tcp: Vec<u16>,
    pub service_udp: Vec<u16>,
    /// Price per MiB of downstream traffic
    pub price: String,
    pub beneficiary_addr: String,
}

impl ServiceMetadata {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let metadata: ServiceMetadata = serde_json::from_slice(data)
            .map_err(|e| TollwayError::MalformedMetadata(e.to_string()))?;
        metadata.check()?;
        Ok(metadata)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TollwayError::MalformedMetadata(e.to_string()))
    }

    fn check(&self) -> Result<()> {
        // port ids are a single byte on the wire
        if self.service_tcp.len() > 256 || self.service_udp.len() > 256 {
            return Err(TollwayError::MalformedMetadata(format!(
                "too many ports: {} tcp, {} udp",
                self.service_tcp.len(),
                self.service_udp.len()
            )));
        }
        self.price()?;
        Ok(())
    }

    pub fn price(&self) -> Result<Amount> {
        if self.price.trim().is_empty() {
            return Ok(Amount::ZERO);
        }
        self.price.parse()
    }

    pub fn tcp_port_id(&self, port: u16) -> Option<u8> {
        position(&self.service_tcp, port)
    }

    pub fn udp_port_id(&self, port: u16) -> Option<u8> {
        position(&self.service_udp, port)
    }

    pub fn udp_port(&self, port_id: u8) -> Option<u16> {
        self.service_udp.get(usize::from(port_id)).copied()
    }
}

fn position(ports: &[u16], port: u16) -> Option<u8> {
    ports
        .iter()
        .position(|p| *p == port)
        .and_then(|i| u8::try_from(i).ok())
}

/// Write metadata as `[len: u32 BE][json]`
pub async fn write_metadata<W>(writer: &mut W, metadata: &ServiceMetadata) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let json = metadata.to_json()?;
    if json.len() > MAX_METADATA_SIZE {
        return Err(TollwayError::MetadataTooLarge(json.len()));
    }
    writer.write_all(&(json.len() as u32).to_be_bytes()).await?;
    writer.write_all(&json).await?;
    writer.flush().await?;
    Ok(())
}

/// Read metadata framed by [`write_metadata`]
pub async fn read_metadata<R>(reader: &mut R) -> Result<ServiceMetadata>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_METADATA_SIZE {
        return Err(TollwayError::MetadataTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    ServiceMetadata::from_json(&buf)
}
