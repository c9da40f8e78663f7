//! IKE_SA registry and admission control
//!
//! The manager is the only process-wide mutable state of the engine. It
//! indexes IKE_SAs for routing (by local SPI, by the initiator's SPI while
//! an IKE_SA_INIT is outstanding, and by authenticated peer identity),
//! hands out locally unique SPIs, and decides whether a new IKE_SA_INIT
//! request may allocate state at all.
//!
//! The manager does not own the IKE_SAs. It stores a handle per SA, whatever
//! the runtime uses to reach one (an actor mailbox in the daemon, a plain
//! index in tests).
//!
//! # Admission
//!
//! ```text
//! half-open < cookie_threshold            -> accept
//! cookie_threshold <= half-open < block   -> accept with valid COOKIE,
//!                                            otherwise answer with a challenge
//! half-open >= block_threshold            -> drop
//! ```

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::RngCore;

use super::config::DosConfig;
use super::cookie::CookieJar;
use super::ikev2::{
    constants::{ExchangeType, IkeFlags, NotifyType},
    message::{IkeHeader, IkeMessage},
    payload::{IkePayload, Identity, NotifyPayload},
};
use super::logging;
use super::metrics::IpsecMetrics;
use super::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Source of local IKE SPIs
pub trait SpiAllocator: Send + Sync {
    /// Reserve a SPI not used by any live local IKE_SA
    fn allocate(&self) -> Result<[u8; 8]>;

    /// Return a SPI to the pool
    fn release(&self, spi: &[u8; 8]);
}

/// Lookup of authenticated IKE_SAs by peer identity
pub trait ContactIndex: Send + Sync {
    /// Whether an IKE_SA other than `local_spi` is authenticated as `peer`
    fn has_contact(&self, peer: &Identity, local_spi: &[u8; 8]) -> bool;
}

/// Index without entries, for IKE_SAs running outside a manager
#[derive(Debug, Default, Clone, Copy)]
pub struct NoContacts;

impl ContactIndex for NoContacts {
    fn has_contact(&self, _peer: &Identity, _local_spi: &[u8; 8]) -> bool {
        false
    }
}

/// Table of reserved IKE SPIs
#[derive(Debug, Default)]
pub struct SpiTable {
    reserved: Mutex<HashSet<[u8; 8]>>,
}

impl SpiTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of reserved SPIs
    pub fn len(&self) -> usize {
        lock(&self.reserved).len()
    }

    /// Whether no SPI is reserved
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SpiAllocator for SpiTable {
    fn allocate(&self) -> Result<[u8; 8]> {
        let mut reserved = lock(&self.reserved);
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let mut spi = [0u8; 8];
            rng.fill_bytes(&mut spi);
            if spi != [0u8; 8] && reserved.insert(spi) {
                return Ok(spi);
            }
        }
        Err(Error::Internal("IKE SPI space exhausted".into()))
    }

    fn release(&self, spi: &[u8; 8]) {
        lock(&self.reserved).remove(spi);
    }
}

/// Slot in the half-open count
///
/// Held by an IKE_SA from its first IKE_SA_INIT request until it is
/// authenticated or destroyed. The count drops when the ticket does, so it
/// can neither leak nor go negative.
#[derive(Debug)]
pub struct HalfOpenTicket {
    count: Arc<AtomicUsize>,
}

impl HalfOpenTicket {
    fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        HalfOpenTicket { count }
    }
}

impl Drop for HalfOpenTicket {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Outcome of admission control for an IKE_SA_INIT request
#[derive(Debug)]
pub enum Admission {
    /// Create the IKE_SA
    Accept(HalfOpenTicket),
    /// Answer statelessly with this COOKIE response
    Challenge(Vec<u8>),
    /// Ignore the request
    Drop,
}

/// Where an inbound message should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route<H> {
    /// An existing IKE_SA
    Existing(H),
    /// A fresh IKE_SA_INIT request
    NewSa,
    /// Nothing matches
    Unknown,
}

#[derive(Debug)]
struct Entry<H> {
    handle: H,
    half_open_key: Option<(SocketAddr, [u8; 8])>,
    identity: Option<Identity>,
}

#[derive(Debug)]
struct Registry<H> {
    sas: HashMap<[u8; 8], Entry<H>>,
    half_open: HashMap<(SocketAddr, [u8; 8]), [u8; 8]>,
    identities: HashMap<Identity, Vec<[u8; 8]>>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Registry {
            sas: HashMap::new(),
            half_open: HashMap::new(),
            identities: HashMap::new(),
        }
    }
}

impl<H> Registry<H> {
    fn unindex_identity(&mut self, spi: &[u8; 8], identity: &Identity) {
        if let Some(spis) = self.identities.get_mut(identity) {
            spis.retain(|s| s != spi);
            if spis.is_empty() {
                self.identities.remove(identity);
            }
        }
    }
}

impl<H: Send> ContactIndex for Mutex<Registry<H>> {
    fn has_contact(&self, peer: &Identity, local_spi: &[u8; 8]) -> bool {
        lock(self)
            .identities
            .get(peer)
            .is_some_and(|spis| spis.iter().any(|spi| spi != local_spi))
    }
}

/// Process-wide IKE_SA registry
pub struct IkeSaManager<H> {
    registry: Arc<Mutex<Registry<H>>>,
    spis: Arc<SpiTable>,
    half_open: Arc<AtomicUsize>,
    cookies: Mutex<CookieJar>,
    dos: DosConfig,
    metrics: IpsecMetrics,
}

impl<H: Clone> IkeSaManager<H> {
    /// Create an empty registry
    pub fn new(dos: DosConfig, metrics: IpsecMetrics) -> Self {
        IkeSaManager {
            registry: Arc::new(Mutex::new(Registry::default())),
            spis: Arc::new(SpiTable::new()),
            half_open: Arc::new(AtomicUsize::new(0)),
            cookies: Mutex::new(CookieJar::new(dos.cookie_rotate_after)),
            dos,
            metrics,
        }
    }

    /// Allocator handed to IKE_SAs (IKE rekeys need fresh SPIs)
    pub fn spi_allocator(&self) -> Arc<dyn SpiAllocator> {
        self.spis.clone()
    }

    /// Identity index handed to IKE_SAs deciding on INITIAL_CONTACT
    pub fn contacts(&self) -> Arc<dyn ContactIndex>
    where
        H: Send + 'static,
    {
        self.registry.clone()
    }

    /// Reserve a local SPI for a new IKE_SA
    pub fn allocate_spi(&self) -> Result<[u8; 8]> {
        self.spis.allocate()
    }

    /// Current number of half-open IKE_SAs
    pub fn half_open(&self) -> usize {
        self.half_open.load(Ordering::SeqCst)
    }

    /// Number of registered IKE_SAs
    pub fn len(&self) -> usize {
        lock(&self.registry).sas.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rotate the cookie secret
    pub fn rotate_cookie_secret(&self) {
        lock(&self.cookies).rotate();
    }

    /// Replace both cookie secrets
    pub fn reset_cookie_secret(&self) {
        lock(&self.cookies).reset();
    }

    /// Decide whether an IKE_SA_INIT request may create state
    pub fn admit(&self, request: &IkeMessage, from: SocketAddr) -> Admission {
        let half_open = self.half_open();
        if half_open >= self.dos.block_threshold {
            logging::log_message_dropped(from, "half-open block threshold reached");
            return Admission::Drop;
        }
        if half_open < self.dos.cookie_threshold {
            return Admission::Accept(HalfOpenTicket::new(self.half_open.clone()));
        }

        let Some(nonce) = request.nonce() else {
            return Admission::Drop;
        };
        let peer = from.ip();
        let spi_i = request.initiator_spi;

        if let Some(cookie) = request.notify(NotifyType::Cookie) {
            if lock(&self.cookies).verify(&cookie.data, nonce, peer, &spi_i) {
                return Admission::Accept(HalfOpenTicket::new(self.half_open.clone()));
            }
            logging::log_message_dropped(from, "invalid cookie");
            return Admission::Drop;
        }

        let cookie = lock(&self.cookies).generate(nonce, peer, &spi_i);
        let mut challenge = IkeMessage::new(
            ExchangeType::IkeSaInit,
            spi_i,
            [0u8; 8],
            IkeFlags::response(false),
            0,
        );
        challenge.push(IkePayload::Notify(NotifyPayload::new(
            NotifyType::Cookie,
            cookie,
        )));

        match challenge.encode(None) {
            Ok(packet) => {
                logging::log_cookie_challenge(from, half_open);
                self.metrics.record_cookie_challenge();
                Admission::Challenge(packet)
            }
            Err(_) => Admission::Drop,
        }
    }

    /// Find the IKE_SA an inbound message belongs to
    pub fn route(&self, header: &IkeHeader, from: SocketAddr) -> Route<H> {
        let registry = lock(&self.registry);

        let is_new_init = header.exchange_type == ExchangeType::IkeSaInit
            && header.is_request()
            && header.responder_spi == [0u8; 8];
        if is_new_init {
            return match registry
                .half_open
                .get(&(from, header.initiator_spi))
                .and_then(|spi| registry.sas.get(spi))
            {
                Some(entry) => Route::Existing(entry.handle.clone()),
                None => Route::NewSa,
            };
        }

        match registry.sas.get(&header.recipient_spi()) {
            Some(entry) => Route::Existing(entry.handle.clone()),
            None => Route::Unknown,
        }
    }

    /// Register an IKE_SA under its local SPI
    ///
    /// Responders pass the peer address and initiator SPI of the
    /// IKE_SA_INIT request so that retransmissions of it find the SA.
    pub fn register(
        &self,
        local_spi: [u8; 8],
        handle: H,
        half_open_key: Option<(SocketAddr, [u8; 8])>,
    ) {
        let mut registry = lock(&self.registry);
        if let Some(key) = half_open_key {
            registry.half_open.insert(key, local_spi);
        }
        registry.sas.insert(
            local_spi,
            Entry {
                handle,
                half_open_key,
                identity: None,
            },
        );
    }

    /// Record that an IKE_SA authenticated its peer
    ///
    /// Returns the other IKE_SAs with the same peer identity when
    /// `replace` is set (the peer sent INITIAL_CONTACT), so the caller can
    /// tear them down.
    pub fn authenticated(&self, local_spi: &[u8; 8], identity: Identity, replace: bool) -> Vec<H> {
        let mut registry = lock(&self.registry);

        let Some(entry) = registry.sas.get_mut(local_spi) else {
            return Vec::new();
        };
        let half_open_key = entry.half_open_key.take();
        let previous = entry.identity.replace(identity.clone());

        if let Some(key) = half_open_key {
            registry.half_open.remove(&key);
        }
        if let Some(previous) = previous {
            registry.unindex_identity(local_spi, &previous);
        }

        let others: Vec<[u8; 8]> = registry
            .identities
            .get(&identity)
            .map(|spis| spis.iter().filter(|s| *s != local_spi).copied().collect())
            .unwrap_or_default();
        registry
            .identities
            .entry(identity)
            .or_default()
            .push(*local_spi);

        if !replace {
            return Vec::new();
        }
        others
            .iter()
            .filter_map(|spi| registry.sas.get(spi).map(|e| e.handle.clone()))
            .collect()
    }

    /// Handle of the IKE_SA with local SPI `local_spi`
    pub fn lookup(&self, local_spi: &[u8; 8]) -> Option<H> {
        lock(&self.registry)
            .sas
            .get(local_spi)
            .map(|e| e.handle.clone())
    }

    /// IKE_SAs authenticated with `identity`
    pub fn find_by_identity(&self, identity: &Identity) -> Vec<H> {
        let registry = lock(&self.registry);
        registry
            .identities
            .get(identity)
            .into_iter()
            .flatten()
            .filter_map(|spi| registry.sas.get(spi).map(|e| e.handle.clone()))
            .collect()
    }

    /// Drop an IKE_SA from every index and release its SPI
    pub fn remove(&self, local_spi: &[u8; 8]) -> Option<H> {
        let entry = {
            let mut registry = lock(&self.registry);
            let entry = registry.sas.remove(local_spi)?;
            if let Some(key) = &entry.half_open_key {
                registry.half_open.remove(key);
            }
            if let Some(identity) = &entry.identity {
                registry.unindex_identity(local_spi, identity);
            }
            entry
        };
        self.spis.release(local_spi);
        Some(entry.handle)
    }

    /// Handles of every registered IKE_SA
    pub fn handles(&self) -> Vec<H> {
        lock(&self.registry)
            .sas
            .values()
            .map(|e| e.handle.clone())
            .collect()
    }

    /// Empty the registry, returning every handle
    pub fn clear(&self) -> Vec<H> {
        let drained: Vec<([u8; 8], Entry<H>)> = {
            let mut registry = lock(&self.registry);
            registry.half_open.clear();
            registry.identities.clear();
            registry.sas.drain().collect()
        };
        drained
            .into_iter()
            .map(|(spi, entry)| {
                self.spis.release(&spi);
                entry.handle
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::payload::NoncePayload;

    fn manager(cookie_threshold: usize, block_threshold: usize) -> IkeSaManager<u32> {
        IkeSaManager::new(
            DosConfig {
                cookie_threshold,
                block_threshold,
                ..DosConfig::default()
            },
            IpsecMetrics::new(),
        )
    }

    fn init_request(spi_i: [u8; 8], cookie: Option<Vec<u8>>) -> IkeMessage {
        let mut msg = IkeMessage::new(ExchangeType::IkeSaInit, spi_i, [0; 8], IkeFlags::request(true), 0);
        if let Some(cookie) = cookie {
            msg.push(IkePayload::Notify(NotifyPayload::new(NotifyType::Cookie, cookie)));
        }
        msg.push(IkePayload::Nonce(NoncePayload::new(vec![9; 32]).unwrap()));
        msg
    }

    fn peer() -> SocketAddr {
        "192.0.2.7:500".parse().unwrap()
    }

    #[test]
    fn test_spi_table_uniqueness_and_release() {
        let table = SpiTable::new();
        let a = table.allocate().unwrap();
        let b = table.allocate().unwrap();
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        table.release(&a);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_half_open_ticket_counts() {
        let mgr = manager(10, 100);
        let first = mgr.admit(&init_request([1; 8], None), peer());
        let second = mgr.admit(&init_request([2; 8], None), peer());
        assert_eq!(mgr.half_open(), 2);

        drop(first);
        assert_eq!(mgr.half_open(), 1);
        drop(second);
        assert_eq!(mgr.half_open(), 0);
    }

    #[test]
    fn test_cookie_challenge_round_trip() {
        let mgr = manager(1, 100);
        let _held = mgr.admit(&init_request([1; 8], None), peer());

        let Admission::Challenge(packet) = mgr.admit(&init_request([2; 8], None), peer()) else {
            panic!("expected a cookie challenge");
        };
        let challenge = IkeMessage::decode(&packet, None).unwrap();
        assert_eq!(challenge.responder_spi, [0; 8]);
        let cookie = challenge.notify(NotifyType::Cookie).unwrap().data.clone();

        // Same request carrying the cookie is admitted
        let retry = init_request([2; 8], Some(cookie.clone()));
        assert!(matches!(mgr.admit(&retry, peer()), Admission::Accept(_)));

        // A different source address does not get in with it
        let other: SocketAddr = "198.51.100.1:500".parse().unwrap();
        assert!(matches!(mgr.admit(&retry, other), Admission::Drop));
    }

    #[test]
    fn test_block_threshold_drops() {
        let mgr = manager(0, 1);
        let _held = mgr.admit(&init_request([1; 8], Some(vec![0; 33])), peer());
        // First request carried a bogus cookie and was dropped, so nothing is held
        assert_eq!(mgr.half_open(), 0);

        let mgr = manager(5, 1);
        let _held = mgr.admit(&init_request([1; 8], None), peer());
        assert!(matches!(
            mgr.admit(&init_request([2; 8], None), peer()),
            Admission::Drop
        ));
    }

    #[test]
    fn test_routing() {
        let mgr = manager(10, 100);
        let local = mgr.allocate_spi().unwrap();
        mgr.register(local, 7, Some((peer(), [1; 8])));

        // Retransmitted IKE_SA_INIT request finds the half-open SA
        let init = IkeHeader::new([1; 8], [0; 8], 0, ExchangeType::IkeSaInit, IkeFlags::request(true), 0, 28);
        assert_eq!(mgr.route(&init, peer()), Route::Existing(7));

        // A new initiator SPI is a new SA
        let fresh = IkeHeader::new([2; 8], [0; 8], 0, ExchangeType::IkeSaInit, IkeFlags::request(true), 0, 28);
        assert_eq!(mgr.route(&fresh, peer()), Route::NewSa);

        // Requests from the initiator are addressed to the responder SPI
        let auth = IkeHeader::new([1; 8], local, 46, ExchangeType::IkeAuth, IkeFlags::request(true), 1, 28);
        assert_eq!(mgr.route(&auth, peer()), Route::Existing(7));

        let unknown = IkeHeader::new([1; 8], [3; 8], 46, ExchangeType::IkeAuth, IkeFlags::request(true), 1, 28);
        assert_eq!(mgr.route(&unknown, peer()), Route::Unknown);
    }

    #[test]
    fn test_identity_index_and_initial_contact() {
        let mgr = manager(10, 100);
        let peer_id = Identity::fqdn("branch.example.com");

        let old = mgr.allocate_spi().unwrap();
        mgr.register(old, 1, None);
        assert!(mgr.authenticated(&old, peer_id.clone(), true).is_empty());

        let new = mgr.allocate_spi().unwrap();
        mgr.register(new, 2, Some((peer(), [5; 8])));
        assert_eq!(mgr.find_by_identity(&peer_id).len(), 1);

        let replaced = mgr.authenticated(&new, peer_id.clone(), true);
        assert_eq!(replaced, vec![1]);
        assert_eq!(mgr.find_by_identity(&peer_id).len(), 2);

        // Authenticated SAs leave the half-open index
        let init = IkeHeader::new([5; 8], [0; 8], 0, ExchangeType::IkeSaInit, IkeFlags::request(true), 0, 28);
        assert_eq!(mgr.route(&init, peer()), Route::NewSa);

        assert_eq!(mgr.remove(&old), Some(1));
        assert_eq!(mgr.find_by_identity(&peer_id), vec![2]);
        assert_eq!(mgr.remove(&old), None);
    }

    #[test]
    fn test_contact_ignores_own_sa() {
        let mgr = manager(10, 100);
        let contacts = mgr.contacts();
        let peer_id = Identity::fqdn("branch.example.com");

        let first = mgr.allocate_spi().unwrap();
        mgr.register(first, 1, None);
        assert!(!contacts.has_contact(&peer_id, &first));

        mgr.authenticated(&first, peer_id.clone(), false);
        assert!(!contacts.has_contact(&peer_id, &first));

        let second = mgr.allocate_spi().unwrap();
        mgr.register(second, 2, None);
        assert!(contacts.has_contact(&peer_id, &second));
        assert!(!contacts.has_contact(&Identity::fqdn("other.example.com"), &second));

        mgr.remove(&first);
        assert!(!contacts.has_contact(&peer_id, &second));
    }

    #[test]
    fn test_clear_releases_spis() {
        let mgr = manager(10, 100);
        for handle in 0..3 {
            let spi = mgr.allocate_spi().unwrap();
            mgr.register(spi, handle, None);
        }
        let mut drained = mgr.clear();
        drained.sort();
        assert_eq!(drained, vec![0, 1, 2]);
        assert!(mgr.is_empty());
        assert!(mgr.spis.is_empty());
    }
}
