//! IKEv2 Performance Benchmarks
//!
//! Benchmarks for full handshake latency, key exchange and message parsing.
//!
//! Run with: `cargo bench --bench ike_bench`

#![cfg(feature = "ipsec")]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ikev2d_proto::ipsec::{
    config::{DaemonConfig, PeerConfig},
    credentials::PskCredentials,
    crypto::{generate_keypair, CryptoBackend, DefaultCrypto},
    ike_sa::{Effect, IkeSa, Services},
    ikev2::{
        message::{decode_header, IkeMessage},
        payload::{Identity, TrafficSelector},
        proposal::DhTransformId,
    },
    kernel::MemoryKernel,
    manager::{SpiAllocator, SpiTable},
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

const PSK: &[u8] = b"benchmark pre-shared key";

fn addr(last: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, last)), 500)
}

fn subnet(n: u8) -> TrafficSelector {
    TrafficSelector::subnet(IpAddr::V4(Ipv4Addr::new(10, n, 0, 0)), 16).unwrap()
}

fn peer(name: &str, local: &str, remote: &str, remote_addr: SocketAddr, ts: (u8, u8)) -> Arc<PeerConfig> {
    Arc::new(
        PeerConfig::builder(name)
            .with_local_id(Identity::fqdn(local))
            .with_remote_id(Identity::fqdn(remote))
            .with_remote_addr(remote_addr)
            .with_local_ts(subnet(ts.0))
            .with_remote_ts(subnet(ts.1))
            .build()
            .unwrap(),
    )
}

fn services(local: &str) -> Services {
    Services::new(
        Arc::new(DefaultCrypto),
        Arc::new(MemoryKernel::new()),
        Arc::new(PskCredentials::new(Identity::fqdn(local)).with_default_key(PSK)),
        Arc::new(SpiTable::new()),
    )
}

fn sent(sa: &mut IkeSa) -> Vec<Vec<u8>> {
    sa.take_effects()
        .into_iter()
        .filter_map(|effect| match effect {
            Effect::Send { packet, .. } => Some(packet),
            _ => None,
        })
        .collect()
}

fn initiator(settings: &Arc<DaemonConfig>) -> IkeSa {
    let services = services("a.example.com");
    let spi = services.spis.allocate().unwrap();
    let config = peer("b", "a.example.com", "b.example.com", addr(2), (1, 2));
    IkeSa::new_initiator(config, settings.clone(), services, spi, addr(1)).unwrap()
}

/// IKE_SA_INIT and IKE_AUTH between two in-memory SAs
fn handshake(settings: &Arc<DaemonConfig>) -> (IkeSa, IkeSa) {
    let mut alice = initiator(settings);
    alice.initiate();
    let mut outbox = sent(&mut alice);

    let header = decode_header(&outbox[0]).unwrap();
    let services = services("b.example.com");
    let spi_r = services.spis.allocate().unwrap();
    let config = peer("a", "b.example.com", "a.example.com", addr(1), (2, 1));
    let mut bob = IkeSa::new_responder(
        config,
        settings.clone(),
        services,
        header.initiator_spi,
        spi_r,
        addr(2),
        addr(1),
        None,
    );

    while !outbox.is_empty() {
        let mut replies = Vec::new();
        for packet in outbox {
            let _ = bob.handle_packet(&packet, addr(1), addr(2));
            for reply in sent(&mut bob) {
                let _ = alice.handle_packet(&reply, addr(2), addr(1));
                replies.extend(sent(&mut alice));
            }
        }
        outbox = replies;
    }
    (alice, bob)
}

fn bench_handshake(c: &mut Criterion) {
    let settings = Arc::new(DaemonConfig::default());
    let mut group = c.benchmark_group("ike_handshake");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("init_auth_curve25519", |b| {
        b.iter(|| {
            let (alice, bob) = handshake(&settings);
            black_box((alice.state(), bob.state()))
        });
    });

    group.finish();
}

fn bench_key_exchange(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_exchange");

    for dh in [DhTransformId::Curve25519, DhTransformId::Modp2048] {
        group.bench_function(format!("keypair_agree_{:?}", dh), |b| {
            let (peer_public, _) = generate_keypair(dh).unwrap();
            b.iter(|| {
                let (public, secret) = DefaultCrypto.generate_dh_keypair(dh).unwrap();
                let shared = secret.agree(black_box(&peer_public)).unwrap();
                black_box((public, shared))
            });
        });
    }

    group.finish();
}

fn bench_message_codec(c: &mut Criterion) {
    let settings = Arc::new(DaemonConfig::default());
    let mut sa = initiator(&settings);
    sa.initiate();
    let init = sent(&mut sa).remove(0);

    let mut group = c.benchmark_group("ike_message");

    group.bench_function("decode_header", |b| {
        b.iter(|| decode_header(black_box(&init)).unwrap());
    });

    group.bench_function("decode_ike_sa_init", |b| {
        b.iter(|| IkeMessage::decode(black_box(&init), None).unwrap());
    });

    let message = IkeMessage::decode(&init, None).unwrap();
    group.bench_function("encode_ike_sa_init", |b| {
        b.iter(|| black_box(&message).encode(None).unwrap());
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_handshake,
    bench_key_exchange,
    bench_message_codec
);
criterion_main!(benches);
