//! Tollway Measurement Probes
//!
//! Latency and bandwidth sampling of relay peers. Results feed the node
//! quality store, which an external selection policy consults when choosing
//! the next peer to connect to.
//!
//! All probes run under caller-supplied deadlines and fail rather than hang
//! once a deadline passes.

mod bandwidth;
mod delay;

pub use bandwidth::{
    bandwidth_measurement_client, bandwidth_measurement_server, Bandwidth, READ_BUFFER_SIZE,
    WRITE_BUFFER_SIZE,
};
pub use delay::{delay_measurement, Network};

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum MeasureError {
    #[error("Connect failed after {elapsed:?}: {source}")]
    Connect {
        elapsed: Duration,
        #[source]
        source: std::io::Error,
    },

    #[error("Deadline exceeded after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeasureError {
    /// Wall-clock time spent before the probe failed, when known
    pub fn elapsed(&self) -> Option<Duration> {
        match self {
            Self::Connect { elapsed, .. } | Self::Timeout { elapsed } => Some(*elapsed),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, MeasureError>;

/// Run `fut`, failing with [`MeasureError::Timeout`] once `limit` has passed
async fn with_deadline<T, F>(start: Instant, limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| MeasureError::Timeout {
                elapsed: start.elapsed(),
            })?,
        None => fut.await,
    }
}
