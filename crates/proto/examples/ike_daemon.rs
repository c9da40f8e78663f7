//! IKEv2 Daemon Example
//!
//! Runs the negotiation engine against one peer over UDP, with an
//! in-memory kernel that just records the CHILD_SAs it would install.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example ike_daemon -- <bind_ip> <local_id> <peer_ip> <peer_id> <psk> <local_net> <remote_net> [--initiate]
//! ```
//!
//! # Example
//!
//! ```bash
//! cargo run --example ike_daemon -- 192.0.2.1 gw1.example.com 192.0.2.2 gw2.example.com "secret" 10.1.0.0/16 10.2.0.0/16 --initiate
//! ```
//!
//! **Note**: Binding to ports 500 and 4500 requires root/administrator privileges.

use ikev2d_platform::SecurityModule;
use ikev2d_proto::ipsec::{
    config::{DaemonConfig, PeerConfig},
    credentials::PskCredentials,
    ikev2::payload::{Identity, TrafficSelector},
    kernel::MemoryKernel,
    nat::{IKE_PORT, NAT_T_PORT},
    transport::UdpTransport,
    Daemon,
};
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

fn parse_subnet(s: &str) -> Result<TrafficSelector, Box<dyn std::error::Error>> {
    let (addr, prefix) = s.split_once('/').ok_or("subnet must be ADDR/PREFIX")?;
    Ok(TrafficSelector::subnet(addr.parse()?, prefix.parse()?)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 8 {
        eprintln!(
            "Usage: {} <bind_ip> <local_id> <peer_ip> <peer_id> <psk> <local_net> <remote_net> [--initiate]",
            args[0]
        );
        eprintln!();
        eprintln!("Environment variables:");
        eprintln!("  RUST_LOG=debug    Enable debug logging");
        std::process::exit(1);
    }

    let bind_ip: IpAddr = args[1].parse()?;
    let local_id = Identity::fqdn(&args[2]);
    let peer_addr = SocketAddr::new(args[3].parse()?, IKE_PORT);
    let peer_id = Identity::fqdn(&args[4]);
    let psk = args[5].as_bytes();
    let initiate = args.iter().any(|a| a == "--initiate");

    let peer = PeerConfig::builder("peer")
        .with_local_id(local_id.clone())
        .with_remote_id(peer_id)
        .with_remote_addr(peer_addr)
        .with_local_ts(parse_subnet(&args[6])?)
        .with_remote_ts(parse_subnet(&args[7])?)
        .build()?;

    let transport = Arc::new(
        UdpTransport::bind(
            SocketAddr::new(bind_ip, IKE_PORT),
            Some(SocketAddr::new(bind_ip, NAT_T_PORT)),
        )
        .await?,
    );
    let kernel = Arc::new(MemoryKernel::new());
    let mut daemon = Daemon::new(
        DaemonConfig::default().with_peer(peer),
        transport.clone(),
        kernel.clone(),
        Arc::new(PskCredentials::new(local_id).with_default_key(psk)),
    )?;
    daemon.init()?;
    let daemon = Arc::new(daemon);

    let server = tokio::spawn(transport.clone().serve(daemon.clone()));

    if initiate {
        let spi = daemon.initiate("peer")?;
        println!("Initiating IKE_SA {}", hex::encode(spi));
    }

    // Report progress until Ctrl+C
    let mut ticker = tokio::time::interval(Duration::from_secs(10));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let m = daemon.metrics();
                println!(
                    "IKE_SAs: {} (established {}, failed {}), CHILD_SAs in kernel: {}",
                    daemon.sa_count(),
                    m.ike_sa_established,
                    m.ike_handshake_failures,
                    kernel.installed_count() / 2,
                );
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!("Shutting down");
    daemon.close();
    server.abort();
    Ok(())
}
