//! Persisted node records

use serde::{Deserialize, Serialize};

/// A measured relay peer worth reconnecting to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FavoriteNode {
    pub ip: String,
    pub address: String,
    /// Raw metadata the peer advertised when measured
    pub metadata: String,
    /// Connect latency in milliseconds
    pub delay: f32,
    /// Worst observed throughput, bytes/second
    pub min_bandwidth: f32,
    /// Best observed throughput, bytes/second
    pub max_bandwidth: f32,
    /// Unix seconds; 0 means "use the default expiry" on insert
    #[serde(alias = "expiredAt")]
    pub expires_at: i64,
}

/// A peer that performed badly, grouped by subnet in the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AvoidNode {
    pub ip: String,
    /// Prefix length of the subnet this IP counts against; 0 means default
    pub mask_size: u8,
    pub address: String,
    #[serde(alias = "expiredAt")]
    pub expires_at: i64,
}
