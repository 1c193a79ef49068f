//! Tollway Mux
//!
//! A compact stream multiplexer: many independent, tagged byte streams over
//! one underlying connection.
//!
//! ## Frame layout
//!
//! ```text
//! version: u8 | cmd: u8 | length: u16 LE | stream_id: u32 LE | payload
//! ```
//!
//! - `SYN` opens a stream; its payload is empty (untagged) or
//!   `[service_id, port_id]`
//! - `PSH` carries stream data
//! - `FIN` half-closes a stream
//! - `NOP` is a keepalive
//! - `UPD` returns receive window: `consumed: u32 LE` bytes were taken by
//!   the reader and may be sent again
//!
//! ## Flow control
//!
//! Each direction of a stream has a fixed window (both ends use the same
//! [`MuxConfig::stream_window`]). A sender never has more than a window of
//! unacknowledged `PSH` bytes in flight, so a stream nobody reads stalls on
//! its own without holding up the rest of the session. A peer that overruns
//! the window is a protocol error.
//!
//! Clients allocate odd stream ids, servers even ones, so both sides may
//! open streams without coordination.

mod frame;
mod session;
mod stream;

pub use frame::{read_frame, write_frame, Cmd, Frame, FrameHeader, StreamTag, HEADER_LEN, VERSION};
pub use session::{MuxConfig, Session};
pub use stream::Stream;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum MuxError {
    #[error("Session closed")]
    SessionClosed,

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    #[error("Invalid stream tag length: {0}")]
    InvalidTag(usize),

    #[error("Invalid window update length: {0}")]
    InvalidUpdate(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MuxError>;
