//! Tollway Node Quality Store
//!
//! Remembers which relay peers performed well ("favorite" nodes) and which
//! performed badly ("avoid" nodes), so that a selection policy can prefer
//! the former and skip whole subnets of the latter.
//!
//! ## Documents
//!
//! Two JSON documents live in the storage directory:
//!
//! - `favorite-node.json`: key → [`FavoriteNode`]
//! - `avoid-node.json`: subnet CIDR → IP → [`AvoidNode`]
//!
//! Both are loaded at startup (created empty when missing or unreadable)
//! and rewritten on every mutation.
//!
//! ## Usage
//!
//! ```no_run
//! use tollway_storage::{FavoriteNode, MeasureStorage};
//!
//! let store = MeasureStorage::new("/var/lib/tollway");
//! store.load()?;
//!
//! let node = FavoriteNode {
//!     ip: "203.0.113.7".to_string(),
//!     min_bandwidth: 1_500_000.0,
//!     ..Default::default()
//! };
//! store.add_favorite_node("203.0.113.7:30020", node)?;
//! # Ok::<(), tollway_storage::StorageError>(())
//! ```

mod node;
mod store;

pub use node::{AvoidNode, FavoriteNode};
pub use store::{
    MeasureStorage, AVOID_CIDR_MIN_IP, AVOID_EXPIRY, AVOID_FILE_NAME, DEFAULT_MASK_SIZE,
    FAVORITE_EXPIRY, FAVORITE_FILE_NAME, MAX_FAVORITE_NODES,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to read node document: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write node document: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to create storage directory: {0}")]
    CreateDirError(std::io::Error),

    #[error("Failed to encode node document: {0}")]
    ParseError(serde_json::Error),

    #[error("Invalid mask size /{0}")]
    InvalidMask(u8),
}

pub type Result<T> = std::result::Result<T, StorageError>;
