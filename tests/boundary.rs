//! Tests for the process-wide start / send_gossip boundary.
//!
//! The boundary holds global state, so its whole lifecycle runs inside a
//! single test.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use murmur::{GossipConfig, GossipError, NetworkConfig, Node};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    timeout(TEST_TIMEOUT, async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

#[test]
fn bad_arguments_fail_without_starting() {
    let result = murmur::start_until(
        ["murmur", "--port", "not-a-port"],
        |_: &str, _: &[u8]| {},
        async {},
    );
    assert!(matches!(result, Err(GossipError::StartupFailure(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn boundary_lifecycle() {
    // Nothing running yet: dropped without effect.
    murmur::send_gossip("alpha", b"into the void");

    let inbox: Arc<Mutex<Vec<Vec<u8>>>> = Arc::default();
    let sink = inbox.clone();
    let peer = Node::start(
        NetworkConfig {
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            boot_nodes: Vec::new(),
            topics: vec!["alpha".into()],
            gossip: GossipConfig {
                heartbeat_interval: Duration::from_millis(50),
                ..GossipConfig::default()
            },
        },
        move |_: &str, payload: &[u8]| sink.lock().push(payload.to_vec()),
    )
    .await
    .unwrap();

    let boot = peer.local_addr().to_string();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let host = thread::spawn(move || {
        murmur::start_until(
            [
                "murmur",
                "--listen-address",
                "127.0.0.1",
                "--port",
                "0",
                "--boot-nodes",
                &boot,
                "--topics",
                "alpha",
                "--heartbeat-ms",
                "50",
            ],
            |_: &str, _: &[u8]| {},
            async {
                let _ = stop_rx.await;
            },
        )
    });

    assert!(wait_for(murmur::is_running).await, "boundary node never started");
    assert!(wait_for(|| !peer.mesh_peers("alpha").is_empty()).await, "boundary node never joined the mesh");

    // A second node in the same process is refused.
    let second = thread::spawn(|| {
        murmur::start_until(["murmur", "--listen-address", "127.0.0.1", "--port", "0"], |_: &str, _: &[u8]| {}, async {})
    });
    let second = tokio::task::spawn_blocking(move || second.join().unwrap()).await.unwrap();
    assert!(matches!(second, Err(GossipError::StartupFailure(_))));
    assert!(murmur::is_running());

    murmur::send_gossip("alpha", b"from the host");
    assert!(wait_for(|| inbox.lock().iter().any(|p| p == b"from the host")).await);

    stop_tx.send(()).unwrap();
    let result = tokio::task::spawn_blocking(move || host.join().unwrap()).await.unwrap();
    assert!(result.is_ok());
    assert!(!murmur::is_running());

    peer.shutdown().await;
}
