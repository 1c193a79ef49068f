//! Byte splicing between local connections and session streams

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use tollway_mux::Stream;

use crate::ByteCounters;

const PIPE_BUFFER_SIZE: usize = 32 * 1024;

/// Copy `reader` into `writer` until EOF, then half-close `writer`.
///
/// When `counters` is given, every byte successfully written is added to
/// its `bytes_in`.
pub(crate) async fn pipe<R, W>(
    mut reader: R,
    mut writer: W,
    counters: Option<Arc<ByteCounters>>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
        if let Some(counters) = &counters {
            counters.add_bytes_in(n as u64);
        }
    }
    writer.shutdown().await?;
    Ok(total)
}

/// Relay a local TCP connection and a session stream in both directions.
///
/// Only bytes flowing from the stream to the local connection are counted.
pub(crate) fn splice(conn: TcpStream, stream: Stream, counters: Arc<ByteCounters>) {
    let peer = conn.peer_addr().ok();
    let stream_id = stream.id();
    let (conn_read, conn_write) = conn.into_split();
    let (stream_read, stream_write) = tokio::io::split(stream);

    tokio::spawn(async move {
        if let Err(e) = pipe(conn_read, stream_write, None).await {
            debug!("Upstream {:?} -> stream {} ended: {}", peer, stream_id, e);
        }
    });
    tokio::spawn(async move {
        if let Err(e) = pipe(stream_read, conn_write, Some(counters)).await {
            debug!("Downstream stream {} -> {:?} ended: {}", stream_id, peer, e);
        }
    });
}

/// Whether an accept/recv error means the socket itself is gone
pub(crate) fn is_closed_socket_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::InvalidInput
    )
}
