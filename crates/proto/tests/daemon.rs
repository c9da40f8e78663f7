//! Two daemons connected through in-memory transports

#![cfg(feature = "ipsec")]

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use ikev2d_platform::SecurityModule;
use ikev2d_proto::ipsec::{
    config::{DaemonConfig, PeerConfig},
    credentials::PskCredentials,
    ikev2::payload::Identity,
    kernel::MemoryKernel,
    transport::{Datagram, MemoryTransport},
    Daemon, SaCommand,
};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};

struct Node {
    daemon: Arc<Daemon>,
    kernel: Arc<MemoryKernel>,
}

fn node(
    addr: &str,
    local_id: Identity,
    peer: PeerConfig,
) -> (Node, UnboundedReceiver<Datagram>) {
    let (transport, rx) = MemoryTransport::new(addr.parse().unwrap());
    let kernel = Arc::new(MemoryKernel::new());
    let credentials = PskCredentials::new(local_id).with_default_key(PSK);
    let mut daemon = Daemon::new(
        DaemonConfig::default().with_peer(peer),
        Arc::new(transport),
        kernel.clone(),
        Arc::new(credentials),
    )
    .unwrap();
    daemon.init().unwrap();
    (
        Node {
            daemon: Arc::new(daemon),
            kernel,
        },
        rx,
    )
}

/// Deliver everything sent on `rx` to each of `to`
fn forward(mut rx: UnboundedReceiver<Datagram>, to: Vec<Arc<Daemon>>) {
    tokio::spawn(async move {
        while let Some(d) = rx.recv().await {
            for daemon in &to {
                daemon.dispatch(&d.packet, d.from, d.to);
            }
        }
    });
}

/// Alice and Bob with their outputs cross-wired
fn pair() -> (Node, Node) {
    let (alice, alice_rx) = node(ALICE_ADDR, alice_id(), alice_config());
    let (bob, bob_rx) = node(BOB_ADDR, bob_id(), bob_config());
    forward(alice_rx, vec![bob.daemon.clone()]);
    forward(bob_rx, vec![alice.daemon.clone()]);
    (alice, bob)
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let polled = timeout(Duration::from_secs(5), async {
        while !done() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {}", what);
}

fn established(node: &Node) -> u64 {
    node.daemon.metrics().ike_sa_established
}

#[tokio::test]
async fn test_daemons_establish() {
    let (alice, bob) = pair();

    let spi = alice.daemon.initiate("bob").unwrap();
    wait_until("both ends established", || {
        established(&alice) == 1 && established(&bob) == 1
    })
    .await;
    wait_until("CHILD_SAs installed", || {
        alice.kernel.installed_count() == 2 && bob.kernel.installed_count() == 2
    })
    .await;

    assert_eq!(alice.daemon.sa_count(), 1);
    assert_eq!(bob.daemon.sa_count(), 1);
    assert_eq!(bob.daemon.half_open(), 0);
    assert_eq!(bob.daemon.find_by_identity(&alice_id()).len(), 1);
    assert_eq!(alice.daemon.find_by_identity(&bob_id()), vec![spi]);
}

#[tokio::test]
async fn test_terminate_removes_both_ends() {
    let (alice, bob) = pair();

    let spi = alice.daemon.initiate("bob").unwrap();
    wait_until("established", || established(&bob) == 1).await;

    alice.daemon.terminate(&spi).unwrap();
    wait_until("both registries empty", || {
        alice.daemon.sa_count() == 0 && bob.daemon.sa_count() == 0
    })
    .await;
    assert_eq!(alice.kernel.installed_count(), 0);
    assert_eq!(bob.kernel.installed_count(), 0);
    assert!(alice.daemon.terminate(&spi).is_err());
}

#[tokio::test]
async fn test_second_sa_to_same_peer_kept_on_both_ends() {
    let (alice, bob) = pair();

    let first = alice.daemon.initiate("bob").unwrap();
    wait_until("first IKE_SA", || established(&alice) == 1 && established(&bob) == 1).await;
    let second = alice.daemon.initiate("bob").unwrap();
    wait_until("second IKE_SA", || established(&alice) == 2 && established(&bob) == 2).await;
    wait_until("second CHILD_SA pair", || {
        alice.kernel.installed_count() == 4 && bob.kernel.installed_count() == 4
    })
    .await;

    // No INITIAL_CONTACT the second time, so Bob drops nothing
    sleep(Duration::from_millis(50)).await;
    assert_eq!(alice.daemon.sa_count(), 2);
    assert_eq!(bob.daemon.sa_count(), 2);
    assert_eq!(alice.kernel.installed_count(), 4);
    assert_eq!(bob.kernel.installed_count(), 4);
    let mut alice_sas = alice.daemon.find_by_identity(&bob_id());
    alice_sas.sort();
    let mut expected = vec![first, second];
    expected.sort();
    assert_eq!(alice_sas, expected);
    assert_eq!(bob.daemon.find_by_identity(&alice_id()).len(), 2);
}

#[tokio::test]
async fn test_initial_contact_after_peer_restart() {
    let (alice, alice_rx) = node(ALICE_ADDR, alice_id(), alice_config());
    let (restarted, restarted_rx) = node(ALICE_ADDR, alice_id(), alice_config());
    let (bob, bob_rx) = node(BOB_ADDR, bob_id(), bob_config());
    forward(alice_rx, vec![bob.daemon.clone()]);
    forward(restarted_rx, vec![bob.daemon.clone()]);
    forward(bob_rx, vec![alice.daemon.clone(), restarted.daemon.clone()]);

    alice.daemon.initiate("bob").unwrap();
    wait_until("first IKE_SA", || established(&bob) == 1).await;

    // The restarted daemon has no contact with Bob, who still holds the
    // IKE_SA of the previous incarnation
    restarted.daemon.initiate("bob").unwrap();
    wait_until("stale SA replaced", || {
        established(&restarted) == 1 && established(&bob) == 2 && bob.daemon.sa_count() == 1
    })
    .await;
    assert_eq!(bob.daemon.find_by_identity(&alice_id()).len(), 1);
    wait_until("stale CHILD_SA removed", || bob.kernel.installed_count() == 2).await;
    assert_eq!(restarted.kernel.installed_count(), 2);
}

#[tokio::test]
async fn test_create_child_through_daemon() {
    let (alice, bob) = pair();

    let spi = alice.daemon.initiate("bob").unwrap();
    wait_until("CHILD_SA installed", || bob.kernel.installed_count() == 2).await;

    alice.daemon.command(&spi, SaCommand::CreateChild).unwrap();
    wait_until("second CHILD_SA", || {
        alice.kernel.installed_count() == 4 && bob.kernel.installed_count() == 4
    })
    .await;
    assert_eq!(alice.daemon.metrics().child_sa_installed, 2);
}

#[tokio::test]
async fn test_shutdown_clears_registry() {
    let (alice, bob) = pair();

    alice.daemon.initiate("bob").unwrap();
    wait_until("established", || established(&bob) == 1).await;

    alice.daemon.close();
    assert_eq!(alice.daemon.sa_count(), 0);
    assert!(!alice.daemon.is_running());
    assert!(alice.daemon.initiate("bob").is_err());

    wait_until("local CHILD_SAs removed", || alice.kernel.installed_count() == 0).await;
}

#[tokio::test]
async fn test_datagram_for_unknown_sa_ignored() {
    let (_alice, bob) = pair();
    let from: SocketAddr = ALICE_ADDR.parse().unwrap();
    let to: SocketAddr = BOB_ADDR.parse().unwrap();

    bob.daemon.dispatch(&[0u8; 28], from, to);
    bob.daemon.dispatch(b"not ike", from, to);
    assert_eq!(bob.daemon.sa_count(), 0);
    assert_eq!(bob.daemon.half_open(), 0);
}
