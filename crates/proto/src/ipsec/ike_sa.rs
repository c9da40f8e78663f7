//! IKE Security Association
//!
//! An [`IkeSa`] is a pure state machine. It never performs I/O: every entry
//! point ([`IkeSa::handle_packet`], [`IkeSa::handle_timer`],
//! [`IkeSa::handle_command`]) mutates the SA and records what the outside
//! world should do as [`Effect`]s, collected with [`IkeSa::take_effects`].
//! The runtime owns one SA per actor, so events for the same SA are
//! serialized by construction.
//!
//! # States
//!
//! ```text
//! CONNECTING --(IKE_AUTH ok)--> ESTABLISHED <--> REKEYING
//!      |                            |               |
//!      +----------------------------+---------------+--> DELETING --> DESTROYED
//! ```
//!
//! Any state may jump to DESTROYED on a fatal error, a half-open timeout or an
//! exhausted retransmission budget.
//!
//! # Timers
//!
//! Timers are identified by [`Timer`] and carry a generation. Rescheduling or
//! cancelling a timer bumps its generation, so a timer event that was already
//! in flight when the SA moved on is recognized as stale and ignored.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use super::child_sa::{ChildSa, Endpoints};
use super::config::{DaemonConfig, PeerConfig};
use super::credentials::CredentialStore;
use super::crypto::{CryptoBackend, IkeSuite, KeyMaterial};
use super::dpd::DpdState;
use super::ikev2::{
    constants::{ExchangeType, IkeFlags},
    message::{decode_header, IkeMessage, SkKey},
    payload::Identity,
    proposal::Proposal,
};
use super::kernel::KernelInterface;
use super::logging;
use super::manager::{ContactIndex, HalfOpenTicket, NoContacts, SpiAllocator};
use super::metrics::IpsecMetrics;
use super::nat::{NatStatus, IKE_PORT, NAT_T_PORT};
use super::task::{ChildCreate, ChildDelete, ChildRekey, IkeDelete, IkeDpd, IkeRekey, Task};
use super::task_manager::TaskManager;
use super::{Error, Result};

/// IKE_SA state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IkeSaState {
    /// IKE_SA_INIT and IKE_AUTH in progress
    Connecting,

    /// Authenticated, CHILD_SAs can be negotiated
    Established,

    /// An IKE_SA rekey is in flight
    Rekeying,

    /// A delete exchange is in progress
    Deleting,

    /// Torn down, keys released
    Destroyed,
}

impl IkeSaState {
    /// Check if `next` is a valid successor state
    pub fn can_transition_to(self, next: IkeSaState) -> bool {
        use IkeSaState::*;

        match (self, next) {
            (s1, s2) if s1 == s2 => s1 != Destroyed,
            (Connecting, Established) => true,
            (Established, Rekeying) | (Rekeying, Established) => true,
            (Connecting | Established | Rekeying, Deleting) => true,
            (_, Destroyed) => true,
            _ => false,
        }
    }

    /// Check if the SA is authenticated and usable
    pub fn is_established(self) -> bool {
        matches!(self, IkeSaState::Established | IkeSaState::Rekeying)
    }
}

impl fmt::Display for IkeSaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IkeSaState::Connecting => "CONNECTING",
            IkeSaState::Established => "ESTABLISHED",
            IkeSaState::Rekeying => "REKEYING",
            IkeSaState::Deleting => "DELETING",
            IkeSaState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

/// SPI pair and role of an IKE_SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IkeSaId {
    /// Initiator's SPI
    pub spi_i: [u8; 8],
    /// Responder's SPI (zero until learned)
    pub spi_r: [u8; 8],
    /// Whether we are the original initiator
    pub initiator: bool,
}

impl IkeSaId {
    /// SPI chosen by us
    pub fn local_spi(&self) -> [u8; 8] {
        if self.initiator {
            self.spi_i
        } else {
            self.spi_r
        }
    }

    /// SPI chosen by the peer
    pub fn remote_spi(&self) -> [u8; 8] {
        if self.initiator {
            self.spi_r
        } else {
            self.spi_i
        }
    }
}

impl fmt::Display for IkeSaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mark_i, mark_r) = if self.initiator { ("*", "") } else { ("", "*") };
        write!(
            f,
            "{}_i{} {}_r{}",
            hex::encode(self.spi_i),
            mark_i,
            hex::encode(self.spi_r),
            mark_r
        )
    }
}

/// Timers an IKE_SA may have pending
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Timer {
    /// Retransmit the outstanding request
    Retransmit,
    /// Liveness check
    Dpd,
    /// IKE_SA soft lifetime
    RekeyIke,
    /// IKE_SA hard lifetime
    ExpireIke,
    /// CHILD_SA soft lifetime (inbound SPI)
    RekeyChild(u32),
    /// CHILD_SA hard lifetime (inbound SPI)
    ExpireChild(u32),
    /// IKE_AUTH did not complete in time
    HalfOpenTimeout,
    /// Delete exchange did not complete in time
    DeleteTimeout,
}

/// Why an IKE_SA was destroyed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyCause {
    /// Deleted locally
    Deleted,
    /// Deleted by the peer
    DeletedByPeer,
    /// Replaced by a rekeyed IKE_SA
    Rekeyed,
    /// Hard lifetime reached
    Expired,
    /// IKE_AUTH not completed within the half-open timeout
    HalfOpenTimeout,
    /// Negotiation or liveness failure
    Failed(Error),
}

impl fmt::Display for DestroyCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestroyCause::Deleted => f.write_str("deleted"),
            DestroyCause::DeletedByPeer => f.write_str("deleted by peer"),
            DestroyCause::Rekeyed => f.write_str("rekeyed"),
            DestroyCause::Expired => f.write_str("expired"),
            DestroyCause::HalfOpenTimeout => f.write_str("half-open timeout"),
            DestroyCause::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

/// Local request addressed to one IKE_SA
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaCommand {
    /// Delete the IKE_SA and its CHILD_SAs
    Terminate,
    /// Drop the IKE_SA locally without a delete exchange (the peer has
    /// already forgotten it)
    Discard,
    /// Rekey the IKE_SA
    RekeyIke,
    /// Rekey the CHILD_SA with this inbound SPI
    RekeyChild(u32),
    /// Delete the CHILD_SA with this inbound SPI
    DeleteChild(u32),
    /// Negotiate an additional CHILD_SA
    CreateChild,
    /// The kernel reports a CHILD_SA lifetime expiry
    ChildExpired {
        /// Inbound or outbound SPI of the SA
        spi: u32,
        /// Hard (delete) or soft (rekey) expiry
        hard: bool,
    },
    /// Probe the peer now
    Dpd,
}

/// Side effect requested by an IKE_SA
#[derive(Debug)]
pub enum Effect {
    /// Transmit a datagram
    Send {
        /// Destination
        to: SocketAddr,
        /// Local address to send from
        from: SocketAddr,
        /// Encoded IKE message
        packet: Vec<u8>,
    },
    /// Arm a timer, replacing any pending one of the same kind
    Schedule {
        /// Timer kind
        timer: Timer,
        /// Generation to hand back on expiry
        generation: u64,
        /// Delay
        after: Duration,
    },
    /// Disarm a timer
    Cancel {
        /// Timer kind
        timer: Timer,
    },
    /// A rekey produced a successor IKE_SA that must be registered
    Spawn(Box<IkeSa>),
    /// The peer was authenticated
    Authenticated {
        /// Peer identity
        remote_id: Identity,
        /// The peer asked to drop its older SAs
        initial_contact: bool,
    },
    /// The IKE_SA is gone and must be unregistered
    Destroyed {
        /// Reason
        cause: DestroyCause,
    },
}

/// Collaborators shared by all IKE_SAs
#[derive(Clone)]
pub struct Services {
    /// Key exchange and key derivation
    pub crypto: Arc<dyn CryptoBackend>,
    /// CHILD_SA installation
    pub kernel: Arc<dyn KernelInterface>,
    /// Identities and AUTH payloads
    pub credentials: Arc<dyn CredentialStore>,
    /// IKE SPIs for rekeyed SAs
    pub spis: Arc<dyn SpiAllocator>,
    /// Other IKE_SAs with the same peer
    pub contacts: Arc<dyn ContactIndex>,
    /// Counters
    pub metrics: IpsecMetrics,
}

impl Services {
    /// Bundle collaborators with fresh metrics
    pub fn new(
        crypto: Arc<dyn CryptoBackend>,
        kernel: Arc<dyn KernelInterface>,
        credentials: Arc<dyn CredentialStore>,
        spis: Arc<dyn SpiAllocator>,
    ) -> Self {
        Services {
            crypto,
            kernel,
            credentials,
            spis,
            contacts: Arc::new(NoContacts),
            metrics: IpsecMetrics::new(),
        }
    }

    /// Consult `contacts` before claiming INITIAL_CONTACT
    pub fn with_contacts(mut self, contacts: Arc<dyn ContactIndex>) -> Self {
        self.contacts = contacts;
        self
    }

    /// Share an existing set of counters
    pub fn with_metrics(mut self, metrics: IpsecMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

impl fmt::Debug for Services {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Services")
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Negotiated suite and the keys derived for it
#[derive(Debug)]
pub struct IkeKeys {
    /// Algorithms
    pub suite: IkeSuite,
    /// SK_d, SK_e, SK_p
    pub material: KeyMaterial,
}

impl IkeKeys {
    /// SK payload key for messages sent by the initiator (or responder)
    pub(crate) fn sk_e(&self, from_initiator: bool) -> SkKey<'_> {
        let key = if from_initiator {
            &self.material.sk_ei
        } else {
            &self.material.sk_er
        };
        SkKey {
            cipher: self.suite.cipher,
            key: &key[..],
        }
    }

    /// SK_pi or SK_pr
    pub(crate) fn sk_p(&self, of_initiator: bool) -> &[u8] {
        if of_initiator {
            &self.material.sk_pi
        } else {
            &self.material.sk_pr
        }
    }
}

/// State of an IKE_SA visible to its tasks
pub(crate) struct IkeSaCore {
    pub(crate) id: IkeSaId,
    pub(crate) state: IkeSaState,
    pub(crate) config: Arc<PeerConfig>,
    pub(crate) settings: Arc<DaemonConfig>,
    pub(crate) services: Services,

    pub(crate) local_addr: SocketAddr,
    pub(crate) remote_addr: SocketAddr,

    pub(crate) keys: Option<IkeKeys>,
    pub(crate) proposal: Option<Proposal>,
    pub(crate) nonce_i: Vec<u8>,
    pub(crate) nonce_r: Vec<u8>,
    /// Our IKE_SA_INIT message as sent, signed in IKE_AUTH
    pub(crate) sent_init: Vec<u8>,
    /// The peer's IKE_SA_INIT message as received
    pub(crate) received_init: Vec<u8>,
    pub(crate) local_id: Identity,
    pub(crate) remote_id: Option<Identity>,
    pub(crate) children: Vec<ChildSa>,
    pub(crate) nat: Option<NatStatus>,
    pub(crate) dpd: DpdState,

    /// Cookie to echo in a restarted IKE_SA_INIT
    pub(crate) cookie: Option<Vec<u8>>,
    /// IKE_SA_INIT restarts after COOKIE or INVALID_KE_PAYLOAD
    pub(crate) init_retries: u32,
    pub(crate) initial_contact: bool,
    /// Cause reported once a pending delete completes
    pub(crate) delete_cause: DestroyCause,
    pub(crate) followups: Vec<Task>,
    pub(crate) destroy_requested: Option<DestroyCause>,

    established_once: bool,
    half_open: Option<HalfOpenTicket>,
    timers: HashMap<Timer, u64>,
    next_generation: u64,
    effects: Vec<Effect>,
}

impl IkeSaCore {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: IkeSaId,
        config: Arc<PeerConfig>,
        settings: Arc<DaemonConfig>,
        services: Services,
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        half_open: Option<HalfOpenTicket>,
    ) -> Self {
        IkeSaCore {
            id,
            state: IkeSaState::Connecting,
            local_id: config.local_id.clone(),
            config,
            settings,
            services,
            local_addr,
            remote_addr,
            keys: None,
            proposal: None,
            nonce_i: Vec::new(),
            nonce_r: Vec::new(),
            sent_init: Vec::new(),
            received_init: Vec::new(),
            remote_id: None,
            children: Vec::new(),
            nat: None,
            dpd: DpdState::new(),
            cookie: None,
            init_retries: 0,
            initial_contact: false,
            delete_cause: DestroyCause::Deleted,
            followups: Vec::new(),
            destroy_requested: None,
            established_once: false,
            half_open,
            timers: HashMap::new(),
            next_generation: 1,
            effects: Vec::new(),
        }
    }

    /// Move to `next`, logging the transition
    pub(crate) fn set_state(&mut self, next: IkeSaState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        logging::log_ike_state_transition(
            &self.id.spi_i,
            &self.id.spi_r,
            &self.state.to_string(),
            &next.to_string(),
        );
        self.state = next;
        Ok(())
    }

    /// Empty message of this SA
    pub(crate) fn new_message(&self, exchange: ExchangeType, response: bool, message_id: u32) -> IkeMessage {
        let flags = if response {
            IkeFlags::response(self.id.initiator)
        } else {
            IkeFlags::request(self.id.initiator)
        };
        IkeMessage::new(exchange, self.id.spi_i, self.id.spi_r, flags, message_id)
    }

    /// Key protecting what we send
    pub(crate) fn sk_out(&self) -> Option<SkKey<'_>> {
        self.keys.as_ref().map(|k| k.sk_e(self.id.initiator))
    }

    /// Key protecting what the peer sends
    pub(crate) fn sk_in(&self) -> Option<SkKey<'_>> {
        self.keys.as_ref().map(|k| k.sk_e(!self.id.initiator))
    }

    pub(crate) fn emit(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    pub(crate) fn send(&mut self, packet: Vec<u8>, exchange: ExchangeType) {
        logging::log_message_send(exchange, self.remote_addr, packet.len());
        self.effects.push(Effect::Send {
            to: self.remote_addr,
            from: self.local_addr,
            packet,
        });
    }

    pub(crate) fn schedule(&mut self, timer: Timer, after: Duration) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.timers.insert(timer, generation);
        self.effects.push(Effect::Schedule {
            timer,
            generation,
            after,
        });
    }

    pub(crate) fn is_scheduled(&self, timer: Timer) -> bool {
        self.timers.contains_key(&timer)
    }

    pub(crate) fn cancel(&mut self, timer: Timer) {
        if self.timers.remove(&timer).is_some() {
            self.effects.push(Effect::Cancel { timer });
        }
    }

    /// Consume a fired timer; `false` if it is stale
    fn take_timer(&mut self, timer: Timer, generation: u64) -> bool {
        if self.timers.get(&timer) == Some(&generation) {
            self.timers.remove(&timer);
            true
        } else {
            false
        }
    }

    fn cancel_all_timers(&mut self) {
        let pending: Vec<Timer> = self.timers.drain().map(|(timer, _)| timer).collect();
        for timer in pending {
            self.effects.push(Effect::Cancel { timer });
        }
    }

    /// Ask for teardown once the current event is handled
    pub(crate) fn request_destroy(&mut self, cause: DestroyCause) {
        if self.destroy_requested.is_none() {
            self.destroy_requested = Some(cause);
        }
    }

    pub(crate) fn endpoints(&self) -> Endpoints {
        Endpoints {
            local: self.local_addr.ip(),
            remote: self.remote_addr.ip(),
            encap: self.nat.map_or(false, |n| n.is_nat_present()),
        }
    }

    /// Switch to port 4500 after NAT detection (RFC 7296 Section 2.23)
    pub(crate) fn float_to_nat_port(&mut self) {
        if self.remote_addr.port() == IKE_PORT {
            self.remote_addr.set_port(NAT_T_PORT);
        }
        if self.local_addr.port() == IKE_PORT {
            self.local_addr.set_port(NAT_T_PORT);
        }
    }

    /// Bookkeeping for an authenticated message from the peer
    pub(crate) fn note_inbound(&mut self, from: SocketAddr, to: SocketAddr) {
        self.dpd.record_activity();
        let behind_nat = self.nat.map_or(false, |n| n.is_nat_present());
        if behind_nat && self.keys.is_some() && from != self.remote_addr {
            info!(
                ike_sa = %self.id,
                old = %self.remote_addr,
                new = %from,
                "Peer address changed behind NAT"
            );
            self.remote_addr = from;
            self.local_addr = to;
        }
    }

    pub(crate) fn peer_label(&self) -> Option<String> {
        self.remote_id.as_ref().map(|id| id.to_string())
    }

    /// Log a failed exchange and count it
    pub(crate) fn note_failure(&self, exchange: ExchangeType, err: &Error) {
        let peer = self.peer_label();
        logging::log_exchange_failed(
            &self.id.spi_i,
            exchange,
            err.notify_type().map(|n| n.to_u16()),
            peer.as_deref(),
            &err.to_string(),
        );
        let metrics = &self.services.metrics;
        match err {
            Error::NoProposalChosen => metrics.record_proposal_failed(),
            Error::TsUnacceptable => metrics.record_ts_failed(),
            Error::AuthenticationFailed(reason) => {
                metrics.record_auth_failed();
                logging::log_authentication_failed(peer.as_deref().unwrap_or("%any"), reason);
            }
            _ => {}
        }
    }

    /// IKE_AUTH completed: CONNECTING -> ESTABLISHED
    pub(crate) fn establish(&mut self) -> Result<()> {
        self.set_state(IkeSaState::Established)?;
        self.established_once = true;
        self.half_open = None;
        self.cancel(Timer::HalfOpenTimeout);
        self.schedule_lifetimes();
        self.services.metrics.record_ike_sa_established();

        if let Some(remote_id) = self.remote_id.clone() {
            self.emit(Effect::Authenticated {
                remote_id,
                initial_contact: self.initial_contact,
            });
        }
        Ok(())
    }

    fn schedule_lifetimes(&mut self) {
        let config = self.config.clone();
        if config.dpd.enabled {
            self.schedule(Timer::Dpd, config.dpd.interval);
        }
        self.schedule(Timer::RekeyIke, config.ike_lifetime.rekey_after());
        self.schedule(Timer::ExpireIke, config.ike_lifetime.hard_time);
    }

    /// Retry an IKE rekey the peer refused with TEMPORARY_FAILURE
    pub(crate) fn defer(&mut self, timer: Timer) {
        let delay = Duration::from_secs(rand::thread_rng().gen_range(1..=10));
        debug!(ike_sa = %self.id, ?timer, ?delay, "Deferring after TEMPORARY_FAILURE");
        self.schedule(timer, delay);
    }

    pub(crate) fn child(&self, spi_in: u32) -> Option<&ChildSa> {
        self.children.iter().find(|c| c.spi_in == spi_in)
    }

    pub(crate) fn child_mut(&mut self, spi_in: u32) -> Option<&mut ChildSa> {
        self.children.iter_mut().find(|c| c.spi_in == spi_in)
    }

    /// CHILD_SA the peer refers to by its own inbound SPI
    pub(crate) fn child_by_spi_out_mut(&mut self, spi_out: u32) -> Option<&mut ChildSa> {
        self.children.iter_mut().find(|c| c.spi_out == spi_out)
    }

    /// Take ownership of a freshly installed CHILD_SA
    pub(crate) fn add_child(&mut self, child: ChildSa) {
        logging::log_child_sa_installed(child.spi_in, child.spi_out);
        self.services.metrics.record_child_sa_installed();
        self.schedule(Timer::RekeyChild(child.spi_in), child.lifetime.rekey_after());
        self.schedule(Timer::ExpireChild(child.spi_in), child.lifetime.hard_time);
        self.children.push(child);
    }

    /// Take over a CHILD_SA from a rekeyed IKE_SA, keeping its remaining lifetime
    fn adopt_child(&mut self, child: ChildSa) {
        self.schedule(Timer::RekeyChild(child.spi_in), child.remaining_soft());
        self.schedule(Timer::ExpireChild(child.spi_in), child.remaining_hard());
        self.children.push(child);
    }

    /// Remove a CHILD_SA from the kernel and forget it
    pub(crate) fn remove_child(&mut self, spi_in: u32, reason: &str) -> Option<ChildSa> {
        let pos = self.children.iter().position(|c| c.spi_in == spi_in)?;
        let mut child = self.children.remove(pos);
        self.cancel(Timer::RekeyChild(spi_in));
        self.cancel(Timer::ExpireChild(spi_in));

        if let Err(e) = child.remove(self.services.kernel.as_ref()) {
            warn!(
                child_spi = %format!("{:08x}", spi_in),
                error = %e,
                "Kernel refused CHILD_SA removal"
            );
        }
        logging::log_child_sa_deleted(spi_in, reason);
        self.services.metrics.record_child_sa_deleted();
        Some(child)
    }
}

/// IKE Security Association
pub struct IkeSa {
    core: IkeSaCore,
    tasks: TaskManager,
}

impl fmt::Debug for IkeSa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IkeSa")
            .field("id", &self.core.id)
            .field("state", &self.core.state)
            .field("peer", &self.core.config.name)
            .field("children", &self.core.children)
            .finish()
    }
}

impl IkeSa {
    /// IKE_SA we initiate to the configured peer address
    ///
    /// The IKE_SA_INIT, IKE_AUTH and first CHILD_SA tasks are queued; call
    /// [`IkeSa::initiate`] to send the first request.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the peer has no remote address.
    pub fn new_initiator(
        config: Arc<PeerConfig>,
        settings: Arc<DaemonConfig>,
        services: Services,
        spi_i: [u8; 8],
        local_addr: SocketAddr,
    ) -> Result<Self> {
        let remote_addr = config.remote_addr.ok_or_else(|| {
            Error::InvalidParameter(format!("peer {} has no remote address", config.name))
        })?;
        let id = IkeSaId {
            spi_i,
            spi_r: [0u8; 8],
            initiator: true,
        };
        services.metrics.record_handshake_started();

        let core = IkeSaCore::new(id, config, settings, services, local_addr, remote_addr, None);
        let mut tasks = TaskManager::new();
        tasks.queue(Task::IkeInit(Default::default()));
        tasks.queue(Task::IkeAuth(Default::default()));
        tasks.queue(Task::ChildCreate(ChildCreate::new()));
        Ok(IkeSa { core, tasks })
    }

    /// IKE_SA created for an admitted IKE_SA_INIT request
    #[allow(clippy::too_many_arguments)]
    pub fn new_responder(
        config: Arc<PeerConfig>,
        settings: Arc<DaemonConfig>,
        services: Services,
        spi_i: [u8; 8],
        spi_r: [u8; 8],
        local_addr: SocketAddr,
        remote_addr: SocketAddr,
        ticket: Option<HalfOpenTicket>,
    ) -> Self {
        let id = IkeSaId {
            spi_i,
            spi_r,
            initiator: false,
        };
        services.metrics.record_handshake_started();

        let half_open_timeout = settings.dos.half_open_timeout;
        let mut core =
            IkeSaCore::new(id, config, settings, services, local_addr, remote_addr, ticket);
        core.schedule(Timer::HalfOpenTimeout, half_open_timeout);
        IkeSa {
            core,
            tasks: TaskManager::new(),
        }
    }

    /// Successor of an IKE_SA rekeyed by CREATE_CHILD_SA
    ///
    /// All CHILD_SAs move from `old` to the new SA in one step, with their
    /// timers rescheduled for the remaining lifetime.
    pub(crate) fn from_rekey(
        old: &mut IkeSaCore,
        id: IkeSaId,
        keys: IkeKeys,
        proposal: Proposal,
        nonce_i: Vec<u8>,
        nonce_r: Vec<u8>,
    ) -> IkeSa {
        let mut core = IkeSaCore::new(
            id,
            old.config.clone(),
            old.settings.clone(),
            old.services.clone(),
            old.local_addr,
            old.remote_addr,
            None,
        );
        core.state = IkeSaState::Established;
        core.established_once = true;
        core.keys = Some(keys);
        core.proposal = Some(proposal);
        core.nonce_i = nonce_i;
        core.nonce_r = nonce_r;
        core.local_id = old.local_id.clone();
        core.remote_id = old.remote_id.clone();
        core.nat = old.nat;

        for child in mem::take(&mut old.children) {
            old.cancel(Timer::RekeyChild(child.spi_in));
            old.cancel(Timer::ExpireChild(child.spi_in));
            core.adopt_child(child);
        }
        core.schedule_lifetimes();

        IkeSa {
            core,
            tasks: TaskManager::new(),
        }
    }

    /// Start the queued exchanges
    pub fn initiate(&mut self) {
        if self.core.state == IkeSaState::Connecting && self.core.id.initiator {
            let timeout = self.core.settings.dos.half_open_timeout;
            self.core.schedule(Timer::HalfOpenTimeout, timeout);
        }
        self.settle();
    }

    /// Process one inbound IKE datagram
    ///
    /// # Errors
    ///
    /// An error means the datagram was dropped (wrong SPIs, message ID
    /// outside the window, undecodable).
    pub fn handle_packet(&mut self, raw: &[u8], from: SocketAddr, to: SocketAddr) -> Result<()> {
        if self.core.state == IkeSaState::Destroyed {
            return Err(Error::InvalidState("IKE_SA is destroyed".into()));
        }

        let header = decode_header(raw)?;
        let ours = header.initiator_spi == self.core.id.spi_i
            && (header.exchange_type == ExchangeType::IkeSaInit
                || header.responder_spi == self.core.id.spi_r)
            && header.flags.is_initiator() != self.core.id.initiator;
        if !ours {
            return Err(Error::SaNotFound(format!(
                "{}_i {}_r",
                hex::encode(header.initiator_spi),
                hex::encode(header.responder_spi)
            )));
        }

        let result = if header.is_request() {
            self.tasks
                .process_request(&mut self.core, raw, &header, from, to)
        } else {
            self.tasks
                .process_response(&mut self.core, raw, &header, from, to)
        };
        self.settle();
        result
    }

    /// A timer fired
    pub fn handle_timer(&mut self, timer: Timer, generation: u64) {
        if self.core.state == IkeSaState::Destroyed || !self.core.take_timer(timer, generation) {
            return;
        }

        match timer {
            Timer::Retransmit => self.tasks.retransmit(&mut self.core),
            Timer::Dpd => self.dpd_tick(),
            Timer::RekeyIke => {
                if self.core.state == IkeSaState::Established {
                    self.tasks.queue(Task::IkeRekey(IkeRekey::new()));
                }
            }
            Timer::ExpireIke => {
                info!(ike_sa = %self.core.id, "IKE_SA hard lifetime reached");
                self.core.delete_cause = DestroyCause::Expired;
                self.start_delete();
            }
            Timer::RekeyChild(spi) => {
                if self.core.child(spi).map_or(false, |c| c.is_usable()) {
                    self.tasks.queue(Task::ChildRekey(ChildRekey::new(spi)));
                }
            }
            Timer::ExpireChild(spi) => {
                if self.core.child(spi).is_some() {
                    self.tasks.queue(Task::ChildDelete(ChildDelete::new(vec![spi])));
                }
            }
            Timer::HalfOpenTimeout => {
                if self.core.state == IkeSaState::Connecting {
                    self.core.request_destroy(DestroyCause::HalfOpenTimeout);
                }
            }
            Timer::DeleteTimeout => {
                if self.core.state == IkeSaState::Deleting {
                    let cause = self.core.delete_cause.clone();
                    self.core.request_destroy(cause);
                }
            }
        }
        self.settle();
    }

    /// Apply a local command
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` if the SA cannot take the command in its
    /// current state, `ChildSaNotFound` for an unknown CHILD_SA.
    pub fn handle_command(&mut self, command: SaCommand) -> Result<()> {
        if self.core.state == IkeSaState::Destroyed {
            return Err(Error::InvalidState("IKE_SA is destroyed".into()));
        }

        match command {
            SaCommand::Terminate => match self.core.state {
                IkeSaState::Connecting => self.core.request_destroy(DestroyCause::Deleted),
                IkeSaState::Deleting => {}
                _ => self.start_delete(),
            },
            SaCommand::Discard => self.core.request_destroy(DestroyCause::DeletedByPeer),
            SaCommand::RekeyIke => {
                self.require_established()?;
                self.tasks.queue(Task::IkeRekey(IkeRekey::new()));
            }
            SaCommand::RekeyChild(spi) => {
                self.require_established()?;
                self.core.child(spi).ok_or(Error::ChildSaNotFound(spi))?;
                self.tasks.queue(Task::ChildRekey(ChildRekey::new(spi)));
            }
            SaCommand::DeleteChild(spi) => {
                self.require_established()?;
                self.core.child(spi).ok_or(Error::ChildSaNotFound(spi))?;
                self.tasks.queue(Task::ChildDelete(ChildDelete::new(vec![spi])));
            }
            SaCommand::CreateChild => {
                self.require_established()?;
                self.tasks.queue(Task::ChildCreate(ChildCreate::new()));
            }
            SaCommand::ChildExpired { spi, hard } => {
                let Some(spi_in) = self
                    .core
                    .children
                    .iter()
                    .find(|c| c.spi_in == spi || c.spi_out == spi)
                    .map(|c| c.spi_in)
                else {
                    return Ok(());
                };
                if hard {
                    self.tasks.queue(Task::ChildDelete(ChildDelete::new(vec![spi_in])));
                } else {
                    self.tasks.queue(Task::ChildRekey(ChildRekey::new(spi_in)));
                }
            }
            SaCommand::Dpd => {
                self.require_established()?;
                self.tasks.queue(Task::IkeDpd(IkeDpd));
            }
        }
        self.settle();
        Ok(())
    }

    /// Drain the side effects produced so far
    pub fn take_effects(&mut self) -> Vec<Effect> {
        mem::take(&mut self.core.effects)
    }

    /// SPI pair and role
    pub fn id(&self) -> IkeSaId {
        self.core.id
    }

    /// Our SPI
    pub fn local_spi(&self) -> [u8; 8] {
        self.core.id.local_spi()
    }

    /// Current state
    pub fn state(&self) -> IkeSaState {
        self.core.state
    }

    /// Peer configuration in use
    pub fn config(&self) -> &PeerConfig {
        &self.core.config
    }

    /// Address we send from
    pub fn local_addr(&self) -> SocketAddr {
        self.core.local_addr
    }

    /// Address of the peer
    pub fn remote_addr(&self) -> SocketAddr {
        self.core.remote_addr
    }

    /// Authenticated peer identity
    pub fn remote_identity(&self) -> Option<&Identity> {
        self.core.remote_id.as_ref()
    }

    /// CHILD_SAs owned by this IKE_SA
    pub fn children(&self) -> &[ChildSa] {
        &self.core.children
    }

    /// NAT detection outcome
    pub fn nat_status(&self) -> Option<NatStatus> {
        self.core.nat
    }

    /// Message ID of our next request
    pub fn next_message_id(&self) -> u32 {
        self.tasks.next_message_id()
    }

    /// Message ID we expect on the next peer request
    pub fn expected_message_id(&self) -> u32 {
        self.tasks.expected_message_id()
    }

    /// Number of retransmissions of the request in flight
    pub fn retransmissions(&self) -> Option<u32> {
        self.tasks.retransmissions()
    }

    /// Whether the SA is torn down
    pub fn is_destroyed(&self) -> bool {
        self.core.state == IkeSaState::Destroyed
    }

    fn require_established(&self) -> Result<()> {
        if self.core.state == IkeSaState::Established {
            Ok(())
        } else {
            Err(Error::InvalidState(format!(
                "IKE_SA {} is {}",
                self.core.id, self.core.state
            )))
        }
    }

    /// Enter DELETING now and put the delete exchange next in line
    fn start_delete(&mut self) {
        if self.core.state == IkeSaState::Connecting {
            let cause = self.core.delete_cause.clone();
            self.core.request_destroy(cause);
            return;
        }
        if self.core.set_state(IkeSaState::Deleting).is_err() {
            return;
        }
        if !self.core.is_scheduled(Timer::DeleteTimeout) {
            let timeout = self.core.settings.delete_timeout;
            self.core.schedule(Timer::DeleteTimeout, timeout);
        }
        for mut task in self.tasks.take_queued() {
            debug!(
                ike_sa = %self.core.id,
                task = task.name(),
                "Dropping queued task of deleted IKE_SA"
            );
            task.abort(&mut self.core);
        }
        if !self.tasks.has_delete() {
            self.tasks.queue(Task::IkeDelete(IkeDelete::default()));
        }
    }

    /// Queued work of a rekeyed IKE_SA continues on its successor
    fn hand_over_queued(&mut self) {
        if !self
            .core
            .effects
            .iter()
            .any(|effect| matches!(effect, Effect::Spawn(_)))
        {
            return;
        }

        let mut moved = Vec::new();
        for mut task in self.tasks.take_queued() {
            if let Task::IkeRekey(_) = task {
                debug!(ike_sa = %self.core.id, "Dropping queued IKE_SA rekey, already rekeyed");
                task.abort(&mut self.core);
            } else {
                moved.push(task);
            }
        }
        if moved.is_empty() {
            return;
        }

        let id = self.core.id;
        let successor = self.core.effects.iter_mut().find_map(|effect| match effect {
            Effect::Spawn(successor) => Some(successor),
            _ => None,
        });
        if let Some(successor) = successor {
            for task in moved {
                debug!(
                    ike_sa = %id,
                    successor = %successor.core.id,
                    task = task.name(),
                    "Moving queued task to rekeyed IKE_SA"
                );
                successor.tasks.queue(task);
            }
            successor.settle();
        }
    }

    fn dpd_tick(&mut self) {
        let config = self.core.config.clone();
        if !config.dpd.enabled || self.core.state != IkeSaState::Established {
            return;
        }

        match self.core.dpd.next_probe_delay(&config.dpd) {
            Some(wait) => self.core.schedule(Timer::Dpd, wait),
            None => {
                if self.tasks.is_idle() {
                    logging::log_dpd_probe(&self.core.id.spi_i, self.core.remote_addr);
                    self.core.services.metrics.record_dpd_check();
                    self.core.dpd.mark_probe();
                    self.tasks.queue(Task::IkeDpd(IkeDpd));
                }
                self.core.schedule(Timer::Dpd, config.dpd.interval);
            }
        }
    }

    /// Run follow-up work until the SA is quiescent
    fn settle(&mut self) {
        loop {
            if let Some(cause) = self.core.destroy_requested.take() {
                self.destroy(cause);
                return;
            }
            if self.core.state == IkeSaState::Destroyed {
                return;
            }
            for task in mem::take(&mut self.core.followups) {
                self.tasks.queue(task);
            }
            if self.core.state == IkeSaState::Deleting {
                self.hand_over_queued();
            }
            self.tasks.initiate(&mut self.core);
            if self.core.followups.is_empty() && self.core.destroy_requested.is_none() {
                return;
            }
        }
    }

    fn destroy(&mut self, cause: DestroyCause) {
        if self.core.state == IkeSaState::Destroyed {
            return;
        }
        self.tasks.clear(&mut self.core);

        for mut child in mem::take(&mut self.core.children) {
            if let Err(e) = child.remove(self.core.services.kernel.as_ref()) {
                warn!(
                    child_spi = %format!("{:08x}", child.spi_in),
                    error = %e,
                    "Kernel refused CHILD_SA removal"
                );
            }
            logging::log_child_sa_deleted(child.spi_in, "IKE_SA destroyed");
            self.core.services.metrics.record_child_sa_deleted();
        }
        self.core.cancel_all_timers();
        self.core.followups.clear();

        // Any state may be destroyed
        let _ = self.core.set_state(IkeSaState::Destroyed);
        self.core.half_open = None;
        self.core.keys = None;
        self.core.cookie = None;

        if self.core.established_once {
            self.core.services.metrics.record_ike_sa_deleted();
        } else {
            self.core.services.metrics.record_handshake_failed();
        }
        info!(ike_sa = %self.core.id, cause = %cause, "IKE_SA destroyed");
        self.core.emit(Effect::Destroyed { cause });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::config::{DaemonConfig, PeerConfig};
    use crate::ipsec::credentials::PskCredentials;
    use crate::ipsec::crypto::DefaultCrypto;
    use crate::ipsec::ikev2::payload::TrafficSelector;
    use crate::ipsec::kernel::MemoryKernel;
    use crate::ipsec::manager::SpiTable;
    use std::net::{IpAddr, Ipv4Addr};

    fn services() -> Services {
        Services::new(
            Arc::new(DefaultCrypto),
            Arc::new(MemoryKernel::new()),
            Arc::new(PskCredentials::new(Identity::fqdn("a")).with_default_key(b"k")),
            Arc::new(SpiTable::new()),
        )
    }

    fn peer() -> Arc<PeerConfig> {
        let net = |o| TrafficSelector::subnet(IpAddr::V4(Ipv4Addr::new(10, o, 0, 0)), 16).unwrap();
        Arc::new(
            PeerConfig::builder("site")
                .with_local_id(Identity::fqdn("a"))
                .with_remote_addr("192.0.2.2:500".parse().unwrap())
                .with_local_ts(net(1))
                .with_remote_ts(net(2))
                .build()
                .unwrap(),
        )
    }

    fn initiator() -> IkeSa {
        IkeSa::new_initiator(
            peer(),
            Arc::new(DaemonConfig::default()),
            services(),
            [1; 8],
            "192.0.2.1:500".parse().unwrap(),
        )
        .unwrap()
    }

    fn pending(effects: &[Effect], wanted: Timer) -> Option<u64> {
        effects.iter().rev().find_map(|e| match e {
            Effect::Schedule {
                timer, generation, ..
            } if *timer == wanted => Some(*generation),
            _ => None,
        })
    }

    #[test]
    fn test_state_transitions() {
        use IkeSaState::*;
        assert!(Connecting.can_transition_to(Established));
        assert!(Established.can_transition_to(Rekeying));
        assert!(Rekeying.can_transition_to(Established));
        assert!(Rekeying.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Destroyed));
        assert!(Connecting.can_transition_to(Destroyed));

        assert!(!Connecting.can_transition_to(Rekeying));
        assert!(!Deleting.can_transition_to(Established));
        assert!(!Destroyed.can_transition_to(Connecting));
        assert!(!Destroyed.can_transition_to(Destroyed));
    }

    #[test]
    fn test_id_display_marks_local_side() {
        let id = IkeSaId {
            spi_i: [0xaa; 8],
            spi_r: [0xbb; 8],
            initiator: false,
        };
        assert_eq!(id.to_string(), "aaaaaaaaaaaaaaaa_i bbbbbbbbbbbbbbbb_r*");
        assert_eq!(id.local_spi(), [0xbb; 8]);
        assert_eq!(id.remote_spi(), [0xaa; 8]);
    }

    #[test]
    fn test_initiate_sends_ike_sa_init() {
        let mut sa = initiator();
        sa.initiate();
        let effects = sa.take_effects();

        let sent: Vec<&Vec<u8>> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Send { packet, .. } => Some(packet),
                _ => None,
            })
            .collect();
        assert_eq!(sent.len(), 1);
        let msg = IkeMessage::decode(sent[0], None).unwrap();
        assert_eq!(msg.exchange_type, ExchangeType::IkeSaInit);
        assert_eq!(msg.message_id, 0);
        assert!(msg.sa().is_some() && msg.ke().is_some() && msg.nonce().is_some());

        assert!(pending(&effects, Timer::Retransmit).is_some());
        assert!(pending(&effects, Timer::HalfOpenTimeout).is_some());
        assert_eq!(sa.state(), IkeSaState::Connecting);
    }

    #[test]
    fn test_stale_timer_ignored() {
        let mut sa = initiator();
        sa.initiate();
        let effects = sa.take_effects();
        let generation = pending(&effects, Timer::HalfOpenTimeout).unwrap();

        sa.handle_timer(Timer::HalfOpenTimeout, generation + 100);
        assert_eq!(sa.state(), IkeSaState::Connecting);

        sa.handle_timer(Timer::HalfOpenTimeout, generation);
        assert!(sa.is_destroyed());
        let effects = sa.take_effects();
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Destroyed {
                cause: DestroyCause::HalfOpenTimeout
            }
        )));
        // Destruction disarms the retransmission timer
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::Cancel { timer: Timer::Retransmit })));
    }

    #[test]
    fn test_commands_rejected_before_established() {
        let mut sa = initiator();
        assert!(matches!(
            sa.handle_command(SaCommand::CreateChild),
            Err(Error::InvalidState(_))
        ));
        sa.handle_command(SaCommand::Terminate).unwrap();
        assert!(sa.is_destroyed());
        assert!(sa.handle_command(SaCommand::Terminate).is_err());
    }

    #[test]
    fn test_foreign_spi_dropped() {
        let mut sa = initiator();
        sa.initiate();
        let mut msg = IkeMessage::new(
            ExchangeType::IkeSaInit,
            [9; 8],
            [2; 8],
            IkeFlags::response(false),
            0,
        );
        msg.push(crate::ipsec::ikev2::payload::IkePayload::Notify(
            crate::ipsec::ikev2::payload::NotifyPayload::new(
                crate::ipsec::ikev2::constants::NotifyType::NoProposalChosen,
                Vec::new(),
            ),
        ));
        let raw = msg.encode(None).unwrap();
        let result = sa.handle_packet(&raw, sa.remote_addr(), sa.local_addr());
        assert!(matches!(result, Err(Error::SaNotFound(_))));
        assert_eq!(sa.state(), IkeSaState::Connecting);
    }
}
