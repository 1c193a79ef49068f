//! File-backed favorite/avoid caches

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ipnet::IpNet;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{AvoidNode, FavoriteNode, Result, StorageError};

/// Favorite set capacity
pub const MAX_FAVORITE_NODES: usize = 10;
/// Default subnet prefix an avoided IP counts against
pub const DEFAULT_MASK_SIZE: u8 = 16;
pub const FAVORITE_EXPIRY: Duration = Duration::from_secs(14 * 24 * 60 * 60);
pub const AVOID_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
/// A subnet is avoided once it holds more than this many IPs
pub const AVOID_CIDR_MIN_IP: usize = 3;

pub const FAVORITE_FILE_NAME: &str = "favorite-node.json";
pub const AVOID_FILE_NAME: &str = "avoid-node.json";

type FavoriteNodes = BTreeMap<String, FavoriteNode>;
/// subnet CIDR → IP → record
type AvoidNodes = BTreeMap<String, BTreeMap<String, AvoidNode>>;

/// Node quality store.
///
/// The in-memory maps and the files backing them have separate locks: a
/// save holds only its file lock while writing, so readers of either map
/// are never blocked by disk I/O, and the favorite and avoid documents
/// never wait on each other.
pub struct MeasureStorage {
    dir: PathBuf,
    favorite_path: PathBuf,
    avoid_path: PathBuf,

    favorites: RwLock<FavoriteNodes>,
    avoids: RwLock<AvoidNodes>,

    favorite_file: Mutex<()>,
    avoid_file: Mutex<()>,
}

impl MeasureStorage {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            favorite_path: dir.join(FAVORITE_FILE_NAME),
            avoid_path: dir.join(AVOID_FILE_NAME),
            dir,
            favorites: RwLock::new(BTreeMap::new()),
            avoids: RwLock::new(BTreeMap::new()),
            favorite_file: Mutex::new(()),
            avoid_file: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load both documents, creating or resetting them as needed, then
    /// sweep expired entries.
    pub fn load(&self) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).map_err(StorageError::CreateDirError)?;
        }

        let favorites: FavoriteNodes = load_document(&self.favorite_path)?;
        let avoids: AvoidNodes = load_document(&self.avoid_path)?;
        info!(
            "Loaded {} favorite nodes and {} avoided subnets from {:?}",
            favorites.len(),
            avoids.len(),
            self.dir
        );
        *self.favorites.write() = favorites;
        *self.avoids.write() = avoids;

        self.clear_favorite_expired()?;
        self.clear_avoid_expired()?;
        Ok(())
    }

    /// Offer a measured node for the favorite set.
    ///
    /// With room left the node is always stored, replacing any entry under
    /// the same key. With the set full it must beat the smallest
    /// `min_bandwidth` held, re-measured keys included. An admitted node is
    /// inserted first and the entry with the earliest expiry is evicted
    /// afterwards, so a newcomer that expires soonest is dropped again.
    /// Returns whether the set changed.
    pub fn add_favorite_node(&self, key: &str, mut node: FavoriteNode) -> Result<bool> {
        if node.expires_at == 0 {
            node.expires_at = expiry_from_now(FAVORITE_EXPIRY);
        }

        let admitted = admit_favorite(&mut self.favorites.write(), key, node);
        if admitted {
            debug!("Favorite node {} admitted", key);
            self.save_favorite_nodes()?;
        }
        Ok(admitted)
    }

    /// Record a badly performing IP under its subnet.
    pub fn add_avoid_node(&self, ip: IpAddr, mut node: AvoidNode) -> Result<()> {
        if node.expires_at == 0 {
            node.expires_at = expiry_from_now(AVOID_EXPIRY);
        }
        if node.mask_size == 0 {
            node.mask_size = DEFAULT_MASK_SIZE;
        }
        if node.ip.is_empty() {
            node.ip = ip.to_string();
        }

        let subnet = IpNet::new(ip, node.mask_size)
            .map_err(|_| StorageError::InvalidMask(node.mask_size))?
            .trunc();

        self.avoids
            .write()
            .entry(subnet.to_string())
            .or_default()
            .insert(ip.to_string(), node);
        debug!("Avoid node {} recorded under {}", ip, subnet);

        self.save_avoid_nodes()
    }

    /// Subnets holding more than [`AVOID_CIDR_MIN_IP`] avoided IPs
    pub fn get_avoid_cidr(&self) -> Vec<IpNet> {
        self.avoids
            .read()
            .iter()
            .filter(|(_, nodes)| nodes.len() > AVOID_CIDR_MIN_IP)
            .filter_map(|(cidr, _)| match cidr.parse::<IpNet>() {
                Ok(net) => Some(net),
                Err(e) => {
                    warn!("Skipping unparsable subnet {}: {}", cidr, e);
                    None
                }
            })
            .collect()
    }

    /// Whether `ip` falls in any subnet returned by [`get_avoid_cidr`](Self::get_avoid_cidr)
    pub fn is_avoided(&self, ip: IpAddr) -> bool {
        self.get_avoid_cidr().iter().any(|net| net.contains(&ip))
    }

    /// Drop favorites past their expiry and persist. Returns how many went.
    pub fn clear_favorite_expired(&self) -> Result<usize> {
        self.sweep_favorites(now_unix())
    }

    /// Drop avoided IPs past their expiry, and subnets left empty, then
    /// persist. Returns how many IPs went.
    pub fn clear_avoid_expired(&self) -> Result<usize> {
        self.sweep_avoids(now_unix())
    }

    pub fn favorite_nodes(&self) -> BTreeMap<String, FavoriteNode> {
        self.favorites.read().clone()
    }

    pub fn avoid_nodes(&self) -> BTreeMap<String, BTreeMap<String, AvoidNode>> {
        self.avoids.read().clone()
    }

    pub fn favorite_count(&self) -> usize {
        self.favorites.read().len()
    }

    pub(crate) fn sweep_favorites(&self, now: i64) -> Result<usize> {
        let removed = {
            let mut favorites = self.favorites.write();
            let before = favorites.len();
            favorites.retain(|_, node| node.expires_at >= now);
            before - favorites.len()
        };
        if removed > 0 {
            info!("Removed {} expired favorite nodes", removed);
        }
        self.save_favorite_nodes()?;
        Ok(removed)
    }

    pub(crate) fn sweep_avoids(&self, now: i64) -> Result<usize> {
        let mut removed = 0;
        {
            let mut avoids = self.avoids.write();
            for nodes in avoids.values_mut() {
                let before = nodes.len();
                nodes.retain(|_, node| node.expires_at >= now);
                removed += before - nodes.len();
            }
            avoids.retain(|_, nodes| !nodes.is_empty());
        }
        if removed > 0 {
            info!("Removed {} expired avoid nodes", removed);
        }
        self.save_avoid_nodes()?;
        Ok(removed)
    }

    fn save_favorite_nodes(&self) -> Result<()> {
        // Snapshot under the file lock so the last writer saves the newest state
        let _file = self.favorite_file.lock();
        let snapshot = self.favorites.read().clone();
        write_document(&self.favorite_path, &snapshot)
    }

    fn save_avoid_nodes(&self) -> Result<()> {
        let _file = self.avoid_file.lock();
        let snapshot = self.avoids.read().clone();
        write_document(&self.avoid_path, &snapshot)
    }
}

fn admit_favorite(favorites: &mut FavoriteNodes, key: &str, node: FavoriteNode) -> bool {
    if favorites.len() >= MAX_FAVORITE_NODES {
        let min_bandwidth = favorites
            .values()
            .map(|n| n.min_bandwidth)
            .fold(f32::INFINITY, f32::min);
        if node.min_bandwidth <= min_bandwidth {
            return false;
        }
    }

    let held = favorites.contains_key(key);
    favorites.insert(key.to_string(), node);

    let mut changed = true;
    while favorites.len() > MAX_FAVORITE_NODES {
        let oldest = favorites
            .iter()
            .min_by_key(|(_, n)| n.expires_at)
            .map(|(k, _)| k.clone());
        let Some(oldest) = oldest else { break };
        favorites.remove(&oldest);
        if oldest == key && !held {
            changed = false;
        }
    }
    changed
}

fn load_document<T>(path: &Path) -> Result<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    if path.exists() {
        let content = std::fs::read_to_string(path).map_err(StorageError::ReadError)?;
        match serde_json::from_str(&content) {
            Ok(doc) => return Ok(doc),
            Err(e) => warn!("Resetting unreadable {:?}: {}", path, e),
        }
    }

    let doc = T::default();
    write_document(path, &doc)?;
    Ok(doc)
}

fn write_document<T: Serialize>(path: &Path, doc: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(doc).map_err(StorageError::ParseError)?;
    std::fs::write(path, content).map_err(StorageError::WriteError)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn expiry_from_now(ttl: Duration) -> i64 {
    now_unix() + ttl.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn loaded_store() -> (TempDir, MeasureStorage) {
        let dir = TempDir::new().unwrap();
        let store = MeasureStorage::new(dir.path());
        store.load().unwrap();
        (dir, store)
    }

    fn favorite(min_bandwidth: f32, expires_at: i64) -> FavoriteNode {
        FavoriteNode {
            min_bandwidth,
            max_bandwidth: min_bandwidth * 2.0,
            expires_at,
            ..Default::default()
        }
    }

    fn fill_favorites(store: &MeasureStorage) -> i64 {
        // Bandwidths 10..=19, expiries base+100..base+109
        let base = now_unix() + 1_000;
        for i in 0..MAX_FAVORITE_NODES {
            let node = favorite(10.0 + i as f32, base + 100 + i as i64);
            assert!(store.add_favorite_node(&format!("n{}", i), node).unwrap());
        }
        base
    }

    #[test]
    fn test_load_creates_documents() {
        let (dir, store) = loaded_store();
        let favorite = std::fs::read_to_string(dir.path().join(FAVORITE_FILE_NAME)).unwrap();
        let avoid = std::fs::read_to_string(dir.path().join(AVOID_FILE_NAME)).unwrap();
        assert_eq!(favorite.trim(), "{}");
        assert_eq!(avoid.trim(), "{}");
        assert_eq!(store.favorite_count(), 0);
    }

    #[test]
    fn test_load_resets_corrupt_documents() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(FAVORITE_FILE_NAME), "not json").unwrap();
        std::fs::write(dir.path().join(AVOID_FILE_NAME), "[1, 2").unwrap();

        let store = MeasureStorage::new(dir.path());
        store.load().unwrap();
        assert!(store.favorite_nodes().is_empty());
        assert!(store.avoid_nodes().is_empty());

        let favorite = std::fs::read_to_string(dir.path().join(FAVORITE_FILE_NAME)).unwrap();
        assert_eq!(favorite.trim(), "{}");
    }

    #[test]
    fn test_favorite_capacity_never_exceeded() {
        let (_dir, store) = loaded_store();
        let base = now_unix() + 1_000;
        for i in 0..50u32 {
            // Mix of rising and falling bandwidths so both branches run
            let bw = if i % 3 == 0 { i as f32 } else { 100.0 - i as f32 };
            store
                .add_favorite_node(&format!("k{}", i), favorite(bw, base + (i as i64 * 7) % 13))
                .unwrap();
            assert!(store.favorite_count() <= MAX_FAVORITE_NODES);
        }
        assert_eq!(store.favorite_count(), MAX_FAVORITE_NODES);
    }

    #[test]
    fn test_full_favorite_set_rejects_not_greater() {
        let (_dir, store) = loaded_store();
        let base = fill_favorites(&store);
        let before = store.favorite_nodes();

        // Equal to the minimum is not enough
        let admitted = store
            .add_favorite_node("equal", favorite(10.0, base + 500))
            .unwrap();
        assert!(!admitted);
        assert_eq!(store.favorite_nodes(), before);

        let admitted = store
            .add_favorite_node("lower", favorite(1.0, base + 500))
            .unwrap();
        assert!(!admitted);
        assert_eq!(store.favorite_nodes(), before);
    }

    #[test]
    fn test_full_favorite_set_evicts_earliest_expiry() {
        let (_dir, store) = loaded_store();
        let base = fill_favorites(&store);

        // Barely above the minimum still qualifies
        let admitted = store
            .add_favorite_node("better", favorite(10.5, base + 500))
            .unwrap();
        assert!(admitted);

        let nodes = store.favorite_nodes();
        assert_eq!(nodes.len(), MAX_FAVORITE_NODES);
        assert!(nodes.contains_key("better"));
        // n0 had the earliest expiry
        assert!(!nodes.contains_key("n0"));
        for i in 1..MAX_FAVORITE_NODES {
            assert!(nodes.contains_key(&format!("n{}", i)));
        }
    }

    #[test]
    fn test_short_lived_newcomer_evicts_itself() {
        let (_dir, store) = loaded_store();
        let base = fill_favorites(&store);
        let before = store.favorite_nodes();

        // Fastest node seen, but it expires before everything held
        let admitted = store
            .add_favorite_node("brief", favorite(100.0, base + 50))
            .unwrap();
        assert!(!admitted);
        assert_eq!(store.favorite_nodes(), before);
    }

    #[test]
    fn test_existing_favorite_updated_below_capacity() {
        let (_dir, store) = loaded_store();
        store.add_favorite_node("a", favorite(20.0, 0)).unwrap();

        let admitted = store.add_favorite_node("a", favorite(1.0, 0)).unwrap();
        assert!(admitted);
        assert_eq!(store.favorite_count(), 1);
        assert_eq!(store.favorite_nodes()["a"].min_bandwidth, 1.0);
    }

    #[test]
    fn test_full_set_gates_remeasured_favorite() {
        let (_dir, store) = loaded_store();
        let base = fill_favorites(&store);
        let before = store.favorite_nodes();

        // Degraded below the slowest held node: keep the old record
        let admitted = store
            .add_favorite_node("n3", favorite(1.0, base + 900))
            .unwrap();
        assert!(!admitted);
        assert_eq!(store.favorite_nodes(), before);

        // Improved: replaced in place, nothing else evicted
        let admitted = store
            .add_favorite_node("n3", favorite(50.0, base + 900))
            .unwrap();
        assert!(admitted);
        let nodes = store.favorite_nodes();
        assert_eq!(nodes.len(), MAX_FAVORITE_NODES);
        assert_eq!(nodes["n3"].min_bandwidth, 50.0);
        assert_eq!(nodes["n3"].expires_at, base + 900);
        assert!(nodes.contains_key("n0"));
    }

    #[test]
    fn test_default_expiry_applied() {
        let (_dir, store) = loaded_store();
        store.add_favorite_node("a", favorite(1.0, 0)).unwrap();
        store
            .add_avoid_node("192.0.2.1".parse().unwrap(), AvoidNode::default())
            .unwrap();

        let now = now_unix();
        let fav = &store.favorite_nodes()["a"];
        assert!(fav.expires_at >= now + FAVORITE_EXPIRY.as_secs() as i64 - 5);

        let avoids = store.avoid_nodes();
        let node = &avoids["192.0.0.0/16"]["192.0.2.1"];
        assert_eq!(node.mask_size, DEFAULT_MASK_SIZE);
        assert_eq!(node.ip, "192.0.2.1");
        assert!(node.expires_at >= now + AVOID_EXPIRY.as_secs() as i64 - 5);
    }

    #[test]
    fn test_avoid_cidr_threshold() {
        let (_dir, store) = loaded_store();
        let ips = ["10.1.0.1", "10.1.2.3", "10.1.200.7"];
        for ip in ips {
            store
                .add_avoid_node(ip.parse().unwrap(), AvoidNode::default())
                .unwrap();
        }
        // Re-recording an IP does not count twice
        store
            .add_avoid_node("10.1.0.1".parse().unwrap(), AvoidNode::default())
            .unwrap();
        assert!(store.get_avoid_cidr().is_empty());
        assert!(!store.is_avoided("10.1.50.50".parse().unwrap()));

        store
            .add_avoid_node("10.1.99.99".parse().unwrap(), AvoidNode::default())
            .unwrap();
        let cidrs = store.get_avoid_cidr();
        assert_eq!(cidrs, vec!["10.1.0.0/16".parse::<IpNet>().unwrap()]);
        assert!(store.is_avoided("10.1.50.50".parse().unwrap()));
        assert!(!store.is_avoided("10.2.0.1".parse().unwrap()));
    }

    #[test]
    fn test_avoid_custom_mask() {
        let (_dir, store) = loaded_store();
        let node = AvoidNode {
            mask_size: 24,
            ..Default::default()
        };
        store
            .add_avoid_node("198.51.100.9".parse().unwrap(), node)
            .unwrap();
        assert!(store.avoid_nodes().contains_key("198.51.100.0/24"));

        let bad = AvoidNode {
            mask_size: 40,
            ..Default::default()
        };
        assert!(matches!(
            store.add_avoid_node("198.51.100.9".parse().unwrap(), bad),
            Err(StorageError::InvalidMask(40))
        ));
    }

    #[test]
    fn test_sweep_removes_exactly_expired() {
        let (_dir, store) = loaded_store();
        let now = now_unix();

        store.add_favorite_node("past", favorite(1.0, now - 1)).unwrap();
        store.add_favorite_node("edge", favorite(1.0, now)).unwrap();
        store.add_favorite_node("future", favorite(1.0, now + 1)).unwrap();

        let avoid = |expires_at| AvoidNode {
            expires_at,
            ..Default::default()
        };
        store
            .add_avoid_node("10.9.0.1".parse().unwrap(), avoid(now - 1))
            .unwrap();
        store
            .add_avoid_node("10.9.0.2".parse().unwrap(), avoid(now + 10))
            .unwrap();
        store
            .add_avoid_node("10.8.0.1".parse().unwrap(), avoid(now - 10))
            .unwrap();

        assert_eq!(store.sweep_favorites(now).unwrap(), 1);
        assert_eq!(store.sweep_avoids(now).unwrap(), 2);

        let favorites = store.favorite_nodes();
        assert!(!favorites.contains_key("past"));
        assert!(favorites.contains_key("edge"));
        assert!(favorites.contains_key("future"));

        let avoids = store.avoid_nodes();
        // Emptied subnet is dropped
        assert!(!avoids.contains_key("10.8.0.0/16"));
        assert_eq!(avoids["10.9.0.0/16"].len(), 1);
        assert!(avoids["10.9.0.0/16"].contains_key("10.9.0.2"));

        // Second run at the same instant changes nothing
        let favorites_before = store.favorite_nodes();
        let avoids_before = store.avoid_nodes();
        assert_eq!(store.sweep_favorites(now).unwrap(), 0);
        assert_eq!(store.sweep_avoids(now).unwrap(), 0);
        assert_eq!(store.favorite_nodes(), favorites_before);
        assert_eq!(store.avoid_nodes(), avoids_before);
    }

    #[test]
    fn test_persisted_across_reload() {
        let dir = TempDir::new().unwrap();
        let future = now_unix() + 3_600;
        {
            let store = MeasureStorage::new(dir.path());
            store.load().unwrap();
            store.add_favorite_node("a", favorite(5.0, future)).unwrap();
            store
                .add_avoid_node(
                    "203.0.113.5".parse().unwrap(),
                    AvoidNode {
                        expires_at: future,
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        let store = MeasureStorage::new(dir.path());
        store.load().unwrap();
        assert_eq!(store.favorite_nodes()["a"].min_bandwidth, 5.0);
        assert!(store.avoid_nodes()["203.0.0.0/16"].contains_key("203.0.113.5"));
    }

    #[test]
    fn test_load_sweeps_legacy_document() {
        let dir = TempDir::new().unwrap();
        let future = now_unix() + 3_600;
        let doc = format!(
            r#"{{"old":{{"ip":"1.2.3.4","minBandwidth":1,"expiredAt":1}},
                "new":{{"ip":"1.2.3.5","minBandwidth":2,"expiredAt":{}}}}}"#,
            future
        );
        std::fs::write(dir.path().join(FAVORITE_FILE_NAME), doc).unwrap();

        let store = MeasureStorage::new(dir.path());
        store.load().unwrap();
        let nodes = store.favorite_nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes["new"].expires_at, future);

        // Rewritten with the current key name
        let saved = std::fs::read_to_string(dir.path().join(FAVORITE_FILE_NAME)).unwrap();
        assert!(saved.contains("expiresAt"));
        assert!(!saved.contains("expiredAt"));
    }
}
