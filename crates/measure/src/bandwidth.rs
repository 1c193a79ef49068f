//! Bandwidth probe
//!
//! The server side writes a fixed number of random bytes; the client side
//! reads them and reports throughput twice: over the whole transfer, and
//! over the part after the first byte arrived, which isolates steady-state
//! throughput from connection setup latency.

use std::io;
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::debug;

use crate::{with_deadline, MeasureError, Result};

pub const READ_BUFFER_SIZE: usize = 1024;
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// Elapsed times are floored to this before dividing
const MIN_ELAPSED: Duration = Duration::from_micros(1);

/// Throughput in bytes per second
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bandwidth {
    /// Bytes over time from start to last byte
    pub total_bps: f32,
    /// Bytes over time from first byte to last byte
    pub steady_bps: f32,
}

impl Bandwidth {
    fn from_timings(bytes: usize, first_byte: Duration, last_byte: Duration) -> Self {
        if bytes == 0 {
            return Self {
                total_bps: 0.0,
                steady_bps: 0.0,
            };
        }

        let total_bps = bytes as f32 / last_byte.max(MIN_ELAPSED).as_secs_f32();
        // Everything arrived in one read: no steady-state window to measure
        let steady_bps = match last_byte.checked_sub(first_byte) {
            Some(window) if !window.is_zero() => bytes as f32 / window.as_secs_f32(),
            _ => total_bps,
        };

        Self {
            total_bps,
            steady_bps,
        }
    }
}

/// Read exactly `bytes` bytes from `conn` and report the throughput.
pub async fn bandwidth_measurement_client<R>(
    conn: &mut R,
    bytes: usize,
    timeout: Option<Duration>,
) -> Result<Bandwidth>
where
    R: AsyncRead + Unpin,
{
    let start = Instant::now();

    let transfer = async {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut bytes_read = 0usize;
        let mut first_byte = None;

        while bytes_read < bytes {
            let n = (bytes - bytes_read).min(buf.len());
            let m = conn.read(&mut buf[..n]).await?;
            if m == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed after {} of {} bytes", bytes_read, bytes),
                )
                .into());
            }
            if first_byte.is_none() {
                first_byte = Some(start.elapsed());
            }
            bytes_read += m;
        }

        Ok::<_, MeasureError>(first_byte.unwrap_or_default())
    };

    let first_byte = with_deadline(start, timeout, transfer).await?;
    let last_byte = start.elapsed();
    let bandwidth = Bandwidth::from_timings(bytes, first_byte, last_byte);

    debug!(
        "Read {} bytes, first byte {:?}, last byte {:?}, {:.0} B/s ({:.0} B/s steady)",
        bytes, first_byte, last_byte, bandwidth.total_bps, bandwidth.steady_bps
    );
    Ok(bandwidth)
}

/// Write `bytes` pseudo-random bytes to `conn` in bounded chunks.
pub async fn bandwidth_measurement_server<W>(
    conn: &mut W,
    bytes: usize,
    timeout: Option<Duration>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let start = Instant::now();

    let transfer = async {
        let mut buf = [0u8; WRITE_BUFFER_SIZE];
        let mut bytes_written = 0usize;

        while bytes_written < bytes {
            let n = (bytes - bytes_written).min(buf.len());
            rand::thread_rng().fill_bytes(&mut buf[..n]);
            conn.write_all(&buf[..n]).await?;
            bytes_written += n;
        }
        conn.flush().await?;
        Ok::<(), MeasureError>(())
    };

    with_deadline(start, timeout, transfer).await
}
