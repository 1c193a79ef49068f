//! Logical stream handle

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

use crate::StreamTag;

/// One bidirectional byte stream inside a [`Session`](crate::Session).
///
/// Shutting down the write side sends `FIN` to the peer; reads return EOF
/// once the peer has sent `FIN` or the session is gone.
#[derive(Debug)]
pub struct Stream {
    id: u32,
    tag: Option<StreamTag>,
    io: DuplexStream,
}

impl Stream {
    pub(crate) fn new(id: u32, tag: Option<StreamTag>, io: DuplexStream) -> Self {
        Self { id, tag, io }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Service/port tag given when the stream was opened
    pub fn tag(&self) -> Option<StreamTag> {
        self.tag
    }

    /// Half-close and release the stream
    pub async fn close(mut self) -> io::Result<()> {
        self.io.shutdown().await
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
