//! Frame codec

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{MuxError, Result};

/// Protocol version carried in every frame header
pub const VERSION: u8 = 1;

/// Encoded header size
pub const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Syn = 0,
    Fin = 1,
    Psh = 2,
    Nop = 3,
    Upd = 4,
}

impl TryFrom<u8> for Cmd {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Cmd::Syn),
            1 => Ok(Cmd::Fin),
            2 => Ok(Cmd::Psh),
            3 => Ok(Cmd::Nop),
            4 => Ok(Cmd::Upd),
            other => Err(MuxError::UnknownCommand(other)),
        }
    }
}

/// Identifies which forwarded service and port a stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamTag {
    pub service_id: u8,
    pub port_id: u8,
}

impl StreamTag {
    pub fn new(service_id: u8, port_id: u8) -> Self {
        Self { service_id, port_id }
    }

    fn from_syn_payload(payload: &[u8]) -> Result<Option<Self>> {
        match payload {
            [] => Ok(None),
            [service_id, port_id] => Ok(Some(Self::new(*service_id, *port_id))),
            other => Err(MuxError::InvalidTag(other.len())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub cmd: Cmd,
    pub length: u16,
    pub stream_id: u32,
}

impl FrameHeader {
    pub fn decode(buf: &[u8; HEADER_LEN]) -> Result<Self> {
        if buf[0] != VERSION {
            return Err(MuxError::UnsupportedVersion(buf[0]));
        }
        Ok(Self {
            cmd: Cmd::try_from(buf[1])?,
            length: u16::from_le_bytes([buf[2], buf[3]]),
            stream_id: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub cmd: Cmd,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn syn(stream_id: u32, tag: Option<StreamTag>) -> Self {
        let payload = match tag {
            Some(tag) => Bytes::copy_from_slice(&[tag.service_id, tag.port_id]),
            None => Bytes::new(),
        };
        Self {
            cmd: Cmd::Syn,
            stream_id,
            payload,
        }
    }

    pub fn fin(stream_id: u32) -> Self {
        Self {
            cmd: Cmd::Fin,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// Data frame; callers keep `payload` within `u16::MAX` bytes
    pub fn psh(stream_id: u32, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= usize::from(u16::MAX));
        Self {
            cmd: Cmd::Psh,
            stream_id,
            payload,
        }
    }

    pub fn nop() -> Self {
        Self {
            cmd: Cmd::Nop,
            stream_id: 0,
            payload: Bytes::new(),
        }
    }

    /// Window update: the receiver has consumed `consumed` more bytes
    pub fn upd(stream_id: u32, consumed: u32) -> Self {
        Self {
            cmd: Cmd::Upd,
            stream_id,
            payload: Bytes::copy_from_slice(&consumed.to_le_bytes()),
        }
    }

    /// Bytes returned to the sender by an `UPD` frame
    pub fn consumed(&self) -> Result<u32> {
        match self.payload[..] {
            [a, b, c, d] => Ok(u32::from_le_bytes([a, b, c, d])),
            _ => Err(MuxError::InvalidUpdate(self.payload.len())),
        }
    }

    /// Tag carried by a `SYN` frame
    pub fn tag(&self) -> Result<Option<StreamTag>> {
        StreamTag::from_syn_payload(&self.payload)
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_LEN + self.payload.len());
        dst.put_u8(VERSION);
        dst.put_u8(self.cmd as u8);
        dst.put_u16_le(self.payload.len() as u16);
        dst.put_u32_le(self.stream_id);
        dst.extend_from_slice(&self.payload);
    }
}

pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let header = FrameHeader::decode(&header)?;

    let mut payload = vec![0u8; usize::from(header.length)];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        cmd: header.cmd,
        stream_id: header.stream_id,
        payload: Bytes::from(payload),
    })
}

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(HEADER_LEN + frame.payload.len());
    frame.encode(&mut buf);
    writer.write_all(&buf).await?;
    Ok(())
}
