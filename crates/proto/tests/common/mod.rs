//! Back-to-back harness: two IKE_SAs exchanging packets in memory
//!
//! Each [`Side`] owns one `IkeSa` and applies its effects the way the
//! daemon would, except that timers only fire when a test fires them and
//! datagrams only move when a test pumps them.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use ikev2d_proto::ipsec::{
    config::{DaemonConfig, PeerConfig},
    credentials::PskCredentials,
    crypto::DefaultCrypto,
    ike_sa::{DestroyCause, Effect, IkeSa, SaCommand, Services, Timer},
    ikev2::{
        message::decode_header,
        payload::{Identity, TrafficSelector},
    },
    kernel::MemoryKernel,
    manager::{ContactIndex, HalfOpenTicket, NoContacts, SpiAllocator, SpiTable},
    metrics::IpsecMetrics,
    Result,
};

pub const ALICE_ADDR: &str = "192.0.2.1:500";
pub const BOB_ADDR: &str = "192.0.2.2:500";
pub const PSK: &[u8] = b"correct horse battery staple";

pub fn alice_id() -> Identity {
    Identity::fqdn("alice.example.com")
}

pub fn bob_id() -> Identity {
    Identity::fqdn("bob.example.com")
}

pub fn subnet(second_octet: u8) -> TrafficSelector {
    TrafficSelector::subnet(IpAddr::V4(Ipv4Addr::new(10, second_octet, 0, 0)), 16).unwrap()
}

/// Alice protects 10.1/16 and talks to Bob's 10.2/16
pub fn alice_config() -> PeerConfig {
    PeerConfig::builder("bob")
        .with_local_id(alice_id())
        .with_remote_id(bob_id())
        .with_remote_addr(BOB_ADDR.parse().unwrap())
        .with_local_ts(subnet(1))
        .with_remote_ts(subnet(2))
        .build()
        .unwrap()
}

pub fn bob_config() -> PeerConfig {
    PeerConfig::builder("alice")
        .with_local_id(bob_id())
        .with_remote_id(alice_id())
        .with_remote_addr(ALICE_ADDR.parse().unwrap())
        .with_local_ts(subnet(2))
        .with_remote_ts(subnet(1))
        .build()
        .unwrap()
}

pub struct Side {
    pub sa: IkeSa,
    pub kernel: Arc<MemoryKernel>,
    pub spis: Arc<SpiTable>,
    pub metrics: IpsecMetrics,
    pub settings: Arc<DaemonConfig>,
    pub timers: HashMap<Timer, u64>,
    pub outbox: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub spawned: Vec<IkeSa>,
    pub authenticated: Vec<(Identity, bool)>,
    pub destroyed: Option<DestroyCause>,
}

fn services(
    local: Identity,
    psk: &[u8],
    kernel: Arc<MemoryKernel>,
    spis: Arc<SpiTable>,
) -> Services {
    let credentials = PskCredentials::new(local).with_default_key(psk);
    Services::new(Arc::new(DefaultCrypto), kernel, Arc::new(credentials), spis)
}

impl Side {
    fn wrap(
        sa: IkeSa,
        kernel: Arc<MemoryKernel>,
        spis: Arc<SpiTable>,
        metrics: IpsecMetrics,
        settings: Arc<DaemonConfig>,
    ) -> Side {
        let mut side = Side {
            sa,
            kernel,
            spis,
            metrics,
            settings,
            timers: HashMap::new(),
            outbox: VecDeque::new(),
            sent: Vec::new(),
            spawned: Vec::new(),
            authenticated: Vec::new(),
            destroyed: None,
        };
        side.collect();
        side
    }

    /// Initiator that has not sent anything yet
    pub fn initiator(config: PeerConfig, settings: DaemonConfig) -> Side {
        Side::initiator_with_contacts(config, settings, Arc::new(NoContacts))
    }

    /// Initiator that looks up existing IKE_SAs in `contacts`
    pub fn initiator_with_contacts(
        config: PeerConfig,
        settings: DaemonConfig,
        contacts: Arc<dyn ContactIndex>,
    ) -> Side {
        let kernel = Arc::new(MemoryKernel::new());
        let spis = Arc::new(SpiTable::new());
        let services = services(config.local_id.clone(), PSK, kernel.clone(), spis.clone())
            .with_contacts(contacts);
        let metrics = services.metrics.clone();
        let settings = Arc::new(settings);
        let spi_i = spis.allocate().unwrap();
        let sa = IkeSa::new_initiator(
            Arc::new(config),
            settings.clone(),
            services,
            spi_i,
            ALICE_ADDR.parse().unwrap(),
        )
        .unwrap();
        Side::wrap(sa, kernel, spis, metrics, settings)
    }

    /// Responder for the IKE_SA_INIT request `init`
    pub fn responder(
        config: PeerConfig,
        settings: DaemonConfig,
        init: &[u8],
        ticket: Option<HalfOpenTicket>,
    ) -> Side {
        Side::responder_with_psk(config, settings, init, ticket, PSK)
    }

    pub fn responder_with_psk(
        config: PeerConfig,
        settings: DaemonConfig,
        init: &[u8],
        ticket: Option<HalfOpenTicket>,
        psk: &[u8],
    ) -> Side {
        let header = decode_header(init).unwrap();
        let kernel = Arc::new(MemoryKernel::new());
        let spis = Arc::new(SpiTable::new());
        let services = services(config.local_id.clone(), psk, kernel.clone(), spis.clone());
        let metrics = services.metrics.clone();
        let settings = Arc::new(settings);
        let spi_r = spis.allocate().unwrap();
        let sa = IkeSa::new_responder(
            Arc::new(config),
            settings.clone(),
            services,
            header.initiator_spi,
            spi_r,
            BOB_ADDR.parse().unwrap(),
            ALICE_ADDR.parse().unwrap(),
            ticket,
        );
        Side::wrap(sa, kernel, spis, metrics, settings)
    }

    /// Successor IKE_SA produced by a rekey, sharing this side's kernel
    pub fn successor(&mut self) -> Side {
        let sa = self.spawned.remove(0);
        Side::wrap(
            sa,
            self.kernel.clone(),
            self.spis.clone(),
            self.metrics.clone(),
            self.settings.clone(),
        )
    }

    /// Apply pending effects
    pub fn collect(&mut self) {
        for effect in self.sa.take_effects() {
            match effect {
                Effect::Send { packet, .. } => {
                    self.sent.push(packet.clone());
                    self.outbox.push_back(packet);
                }
                Effect::Schedule {
                    timer, generation, ..
                } => {
                    self.timers.insert(timer, generation);
                }
                Effect::Cancel { timer } => {
                    self.timers.remove(&timer);
                }
                Effect::Spawn(successor) => self.spawned.push(*successor),
                Effect::Authenticated {
                    remote_id,
                    initial_contact,
                } => self.authenticated.push((remote_id, initial_contact)),
                Effect::Destroyed { cause } => self.destroyed = Some(cause),
            }
        }
    }

    pub fn initiate(&mut self) {
        self.sa.initiate();
        self.collect();
    }

    pub fn receive(&mut self, packet: &[u8]) -> Result<()> {
        let from = self.sa.remote_addr();
        let to = self.sa.local_addr();
        let result = self.sa.handle_packet(packet, from, to);
        self.collect();
        result
    }

    pub fn command(&mut self, command: SaCommand) -> Result<()> {
        let result = self.sa.handle_command(command);
        self.collect();
        result
    }

    /// Fire a pending timer; `false` if none is armed
    pub fn fire(&mut self, timer: Timer) -> bool {
        match self.timers.remove(&timer) {
            Some(generation) => {
                self.sa.handle_timer(timer, generation);
                self.collect();
                true
            }
            None => false,
        }
    }

    /// Discard everything waiting to be sent
    pub fn drop_outbox(&mut self) -> usize {
        let n = self.outbox.len();
        self.outbox.clear();
        n
    }

    pub fn children(&self) -> usize {
        self.sa.children().len()
    }
}

/// Move packets back and forth until both sides are quiet
pub fn pump(a: &mut Side, b: &mut Side) -> usize {
    let mut moved = 0;
    loop {
        let mut progress = false;
        while let Some(packet) = a.outbox.pop_front() {
            let _ = b.receive(&packet);
            moved += 1;
            progress = true;
        }
        while let Some(packet) = b.outbox.pop_front() {
            let _ = a.receive(&packet);
            moved += 1;
            progress = true;
        }
        if !progress {
            return moved;
        }
    }
}

/// Alice initiates, Bob answers, both run to completion
pub fn connect(alice: PeerConfig, bob: PeerConfig) -> (Side, Side) {
    let mut alice = Side::initiator(alice, DaemonConfig::default());
    alice.initiate();
    let init = alice.outbox.front().cloned().unwrap();
    let mut bob = Side::responder(bob, DaemonConfig::default(), &init, None);
    pump(&mut alice, &mut bob);
    (alice, bob)
}

pub fn established() -> (Side, Side) {
    connect(alice_config(), bob_config())
}
