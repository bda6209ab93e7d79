use std::time::Duration;

use hkv_client::{ClientTtl, KVClient};
use hkv_common::config::NodeConfig;
use hkv_server::node::Node;
use hkv_server::server;
use tokio::net::TcpListener;

fn single_node_config(node_id: &str, data_dir: &std::path::Path) -> NodeConfig {
    let text = format!(
        r#"
        [node]
        id = "{node_id}"
        data_dir = "{data_dir}"
        advertise_addr = "127.0.0.1"

        [network]
        resp_bind_addr = "127.0.0.1"
        resp_port = 0
        http_bind_addr = "127.0.0.1"
        http_port = 0
        gossip_port = 0

        [[cache.stores]]
        name = "default"
        max_memory = 16777216
        "#,
        node_id = node_id,
        data_dir = data_dir.display(),
    );
    toml::from_str(&text).expect("valid single-node config")
}

/// Boots a real node, serves RESP off an OS-assigned port, and returns a
/// client already connected to it. The node is leaked for the test's
/// lifetime; its background threads are daemon-like and exit with the
/// process.
async fn spawn_node() -> (std::net::SocketAddr, std::sync::Arc<Node>) {
    let dir = tempfile::tempdir().expect("tempdir").into_path();
    let config = single_node_config("test-node", &dir);
    let node = Node::bootstrap(config).expect("bootstrap");

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind resp listener");
    let addr = listener.local_addr().expect("local addr");

    let serve_node = node.clone();
    tokio::spawn(async move {
        let _ = server::serve_listener(serve_node, listener).await;
    });

    (addr, node)
}

#[tokio::test]
async fn set_get_delete_round_trip() {
    let (addr, _node) = spawn_node().await;
    let client = KVClient::connect(addr.to_string()).expect("connect");

    client.set(b"foo", b"bar").expect("set");
    let value = client.get(b"foo").expect("get");
    assert_eq!(value, Some(b"bar".to_vec()));

    let removed = client.delete(b"foo").expect("delete");
    assert!(removed);

    let value = client.get(b"foo").expect("get after delete");
    assert_eq!(value, None);
}

#[tokio::test]
async fn set_with_ttl_expires() {
    let (addr, _node) = spawn_node().await;
    let client = KVClient::connect(addr.to_string()).expect("connect");

    client.set_with_ttl(b"session", b"data", Duration::from_millis(50)).expect("set with ttl");
    match client.ttl(b"session").expect("ttl") {
        ClientTtl::ExpiresIn(remaining) => assert!(remaining <= Duration::from_secs(1)),
        other => panic!("expected a live ttl, got {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let value = client.get(b"session").expect("get after expiry");
    assert_eq!(value, None);
}

#[tokio::test]
async fn store_reflects_writes_made_over_resp() {
    let (addr, node) = spawn_node().await;
    let client = KVClient::connect(addr.to_string()).expect("connect");

    client.set(b"a", b"1").expect("set a");
    client.set(b"b", b"2").expect("set b");

    let store = node.coordinator.store(&node.primary_store).expect("store");
    assert_eq!(store.stats().entry_count, 2);

    client.ping(None).expect("ping");
    assert_eq!(client.get(b"a").expect("get a"), Some(b"1".to_vec()));
    assert_eq!(client.get(b"b").expect("get b"), Some(b"2".to_vec()));

    client.delete(b"a").expect("delete a");
    assert_eq!(store.stats().entry_count, 1);
}
