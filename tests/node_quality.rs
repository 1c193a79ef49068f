//! Probing nodes and remembering the results
//!
//! Runs the delay and bandwidth probes against local listeners, feeds the
//! numbers into the node-quality store and checks that what was learned
//! survives a restart.

use std::net::IpAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use tollway_measure::{
    bandwidth_measurement_client, bandwidth_measurement_server, delay_measurement, Network,
};
use tollway_storage::{AvoidNode, FavoriteNode, MeasureStorage, MAX_FAVORITE_NODES};

/// Bandwidth endpoint that sends `bytes` to every connection
async fn spawn_bandwidth_server(bytes: usize) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut conn, _)) = listener.accept().await {
            tokio::spawn(async move {
                let _ = bandwidth_measurement_server(&mut conn, bytes, None).await;
            });
        }
    });
    addr.to_string()
}

async fn probe(addr: &str, bytes: usize) -> FavoriteNode {
    let delay = delay_measurement(Network::Tcp, addr, Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let mut conn = TcpStream::connect(addr).await.unwrap();
    let bandwidth = bandwidth_measurement_client(&mut conn, bytes, Some(Duration::from_secs(10)))
        .await
        .unwrap();
    assert!(bandwidth.total_bps > 0.0);
    assert!(bandwidth.steady_bps > 0.0);

    FavoriteNode {
        ip: "127.0.0.1".to_string(),
        address: addr.to_string(),
        delay: delay.as_secs_f32() * 1000.0,
        min_bandwidth: bandwidth.total_bps.min(bandwidth.steady_bps),
        max_bandwidth: bandwidth.total_bps.max(bandwidth.steady_bps),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_probed_node_is_remembered() {
    let dir = tempfile::tempdir().unwrap();
    let addr = spawn_bandwidth_server(256 * 1024).await;

    let node = probe(&addr, 256 * 1024).await;
    let store = MeasureStorage::new(dir.path());
    store.load().unwrap();
    assert!(store.add_favorite_node(&addr, node.clone()).unwrap());

    let reloaded = MeasureStorage::new(dir.path());
    reloaded.load().unwrap();
    let favorites = reloaded.favorite_nodes();
    let stored = favorites.get(&addr).unwrap();
    assert_eq!(stored.address, addr);
    assert_eq!(stored.min_bandwidth, node.min_bandwidth);
    assert!(stored.expires_at > 0);
}

#[tokio::test]
async fn test_full_store_keeps_the_fastest() {
    let dir = tempfile::tempdir().unwrap();
    let store = MeasureStorage::new(dir.path());
    store.load().unwrap();

    // Synthetic entries expire within the hour, ahead of any fresh measurement
    let soon = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
        + 3600;
    for i in 0..MAX_FAVORITE_NODES {
        let node = FavoriteNode {
            ip: format!("198.51.100.{}", i),
            min_bandwidth: 1000.0 + i as f32,
            expires_at: soon + i as i64,
            ..Default::default()
        };
        assert!(store
            .add_favorite_node(&format!("198.51.100.{}:30020", i), node)
            .unwrap());
    }

    // A real measurement over loopback beats every synthetic entry
    let addr = spawn_bandwidth_server(128 * 1024).await;
    let fast = probe(&addr, 128 * 1024).await;
    assert!(fast.min_bandwidth > 1000.0 + MAX_FAVORITE_NODES as f32);
    assert!(store.add_favorite_node(&addr, fast).unwrap());
    assert_eq!(store.favorite_count(), MAX_FAVORITE_NODES);
    assert!(store.favorite_nodes().contains_key(&addr));

    // And a slow one is turned away
    let slow = FavoriteNode {
        min_bandwidth: 1.0,
        ..Default::default()
    };
    assert!(!store.add_favorite_node("203.0.113.1:30020", slow).unwrap());
}

#[tokio::test]
async fn test_unreachable_nodes_block_their_subnet() {
    let dir = tempfile::tempdir().unwrap();
    let store = MeasureStorage::new(dir.path());
    store.load().unwrap();

    // A closed port fails the probe
    let closed = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let err = delay_measurement(Network::Tcp, &closed, Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert!(err.elapsed().is_some());

    for host in 1..=4u8 {
        let ip: IpAddr = format!("10.20.30.{}", host).parse().unwrap();
        store
            .add_avoid_node(
                ip,
                AvoidNode {
                    ip: ip.to_string(),
                    address: format!("{}:30020", ip),
                    ..Default::default()
                },
            )
            .unwrap();
        // Blocking only starts past the threshold
        assert_eq!(store.is_avoided("10.20.99.1".parse().unwrap()), host == 4);
    }

    let reloaded = MeasureStorage::new(dir.path());
    reloaded.load().unwrap();
    let cidrs = reloaded.get_avoid_cidr();
    assert_eq!(cidrs.len(), 1);
    assert_eq!(cidrs[0].to_string(), "10.20.0.0/16");
    assert!(!reloaded.is_avoided("10.21.0.1".parse().unwrap()));
}
