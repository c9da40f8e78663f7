//! Daemon and peer configuration
//!
//! Provides configuration structures and builder patterns for the daemon.
//! Configuration is assembled programmatically; nothing here parses files.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use super::{
    dpd::DpdConfig,
    ikev2::payload::{Identity, TrafficSelector},
    ikev2::proposal::{
        DhTransformId, EncrTransformId, EsnTransformId, PrfTransformId, Proposal, ProtocolId,
        Transform, TransformType,
    },
    Error, Result,
};

/// Default initial retransmission timeout (4 seconds)
pub const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_secs(4);

/// Default retransmission backoff base
pub const DEFAULT_RETRANSMIT_BASE: f64 = 1.8;

/// Default number of retransmissions before giving up
pub const DEFAULT_RETRANSMIT_TRIES: u32 = 5;

/// Default half-open count above which cookies are demanded
pub const DEFAULT_COOKIE_THRESHOLD: usize = 10;

/// Default half-open count above which IKE_SA_INIT requests are dropped
pub const DEFAULT_BLOCK_THRESHOLD: usize = 100;

/// Default time an IKE_SA may stay unauthenticated
pub const DEFAULT_HALF_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on waiting for a delete acknowledgment
pub const DEFAULT_DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Retransmission policy for requests we initiate
///
/// The delay before retransmission `n` (0-based) is
/// `min(timeout * base^n, max_interval)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetransmitConfig {
    /// Delay before the first retransmission
    pub timeout: Duration,

    /// Exponential backoff base
    pub base: f64,

    /// Retransmissions before the peer is declared unreachable
    pub tries: u32,

    /// Upper bound on a single delay
    pub max_interval: Option<Duration>,
}

impl Default for RetransmitConfig {
    fn default() -> Self {
        RetransmitConfig {
            timeout: DEFAULT_RETRANSMIT_TIMEOUT,
            base: DEFAULT_RETRANSMIT_BASE,
            tries: DEFAULT_RETRANSMIT_TRIES,
            max_interval: None,
        }
    }
}

impl RetransmitConfig {
    /// Delay to wait after sending attempt `attempt` (0 = original send)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.base.powi(attempt.min(i32::MAX as u32) as i32);
        let delay = Duration::try_from_secs_f64(self.timeout.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX);
        match self.max_interval {
            Some(max) => delay.min(max),
            None => delay,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(Error::InvalidParameter(
                "retransmit timeout must be non-zero".into(),
            ));
        }
        if !self.base.is_finite() || self.base < 1.0 {
            return Err(Error::InvalidParameter(
                "retransmit base must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Denial-of-service limits for unauthenticated IKE_SAs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DosConfig {
    /// Half-open IKE_SAs before new requests must return a cookie
    pub cookie_threshold: usize,

    /// Half-open IKE_SAs before new requests are dropped outright
    pub block_threshold: usize,

    /// Time allowed to complete IKE_AUTH
    pub half_open_timeout: Duration,

    /// Cookies issued before the cookie secret is rotated (0 = never)
    pub cookie_rotate_after: u32,
}

impl Default for DosConfig {
    fn default() -> Self {
        DosConfig {
            cookie_threshold: DEFAULT_COOKIE_THRESHOLD,
            block_threshold: DEFAULT_BLOCK_THRESHOLD,
            half_open_timeout: DEFAULT_HALF_OPEN_TIMEOUT,
            cookie_rotate_after: 10_000,
        }
    }
}

/// SA Lifetime limits
///
/// Defines when an SA should be rekeyed (soft limit) and when it must
/// be deleted (hard limit). Byte limits are enforced by the kernel, which
/// reports expiry back to the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaLifetime {
    /// Soft time limit - initiate rekey when reached
    pub soft_time: Duration,

    /// Hard time limit - delete SA when reached
    pub hard_time: Duration,

    /// Soft byte limit, handed to the kernel
    pub soft_bytes: Option<u64>,

    /// Hard byte limit, handed to the kernel
    pub hard_bytes: Option<u64>,

    /// Maximum random amount subtracted from the soft limit so that both
    /// peers do not start a rekey at the same moment
    pub jitter: Duration,
}

impl Default for SaLifetime {
    /// 1 hour hard, 45 minutes soft, up to 3 minutes jitter
    fn default() -> Self {
        SaLifetime {
            soft_time: Duration::from_secs(45 * 60),
            hard_time: Duration::from_secs(60 * 60),
            soft_bytes: None,
            hard_bytes: None,
            jitter: Duration::from_secs(3 * 60),
        }
    }
}

impl SaLifetime {
    /// Create custom lifetime with time limits and no jitter
    pub fn new(soft_time: Duration, hard_time: Duration) -> Result<Self> {
        if soft_time >= hard_time {
            return Err(Error::InvalidParameter(
                "Soft lifetime must be less than hard lifetime".into(),
            ));
        }

        Ok(SaLifetime {
            soft_time,
            hard_time,
            soft_bytes: None,
            hard_bytes: None,
            jitter: Duration::ZERO,
        })
    }

    /// Add byte-based lifetime limits
    pub fn with_byte_limits(mut self, soft_bytes: u64, hard_bytes: u64) -> Result<Self> {
        if soft_bytes >= hard_bytes {
            return Err(Error::InvalidParameter(
                "Soft byte limit must be less than hard byte limit".into(),
            ));
        }

        self.soft_bytes = Some(soft_bytes);
        self.hard_bytes = Some(hard_bytes);
        Ok(self)
    }

    /// Set the rekey jitter
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Time until rekey, with a random part of the jitter taken off
    pub fn rekey_after(&self) -> Duration {
        let jitter = self.jitter.min(self.soft_time);
        if jitter.is_zero() {
            return self.soft_time;
        }
        let cut = rand::thread_rng().gen_range(Duration::ZERO..=jitter);
        self.soft_time - cut
    }
}

/// Default IKE proposals
///
/// 1. AES-GCM-16-128, PRF-HMAC-SHA256, Curve25519
/// 2. AES-GCM-16-256, PRF-HMAC-SHA384, MODP-2048
pub fn default_ike_proposals() -> Vec<Proposal> {
    vec![
        Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr(EncrTransformId::AesGcm16, Some(128)))
            .add_transform(Transform::prf(PrfTransformId::HmacSha256))
            .add_transform(Transform::dh(DhTransformId::Curve25519)),
        Proposal::new(2, ProtocolId::Ike)
            .add_transform(Transform::encr(EncrTransformId::AesGcm16, Some(256)))
            .add_transform(Transform::prf(PrfTransformId::HmacSha384))
            .add_transform(Transform::dh(DhTransformId::Modp2048)),
    ]
}

/// Default ESP proposal: AES-GCM-16-128 without extended sequence numbers
pub fn default_esp_proposals() -> Vec<Proposal> {
    vec![Proposal::new(1, ProtocolId::Esp)
        .add_transform(Transform::encr(EncrTransformId::AesGcm16, Some(128)))
        .add_transform(Transform::esn(EsnTransformId::NoEsn))]
}

/// Configuration of one peer relationship
#[derive(Clone, Debug)]
pub struct PeerConfig {
    /// Connection name used for local commands
    pub name: String,

    /// Identity we present
    pub local_id: Identity,

    /// Identity the peer must present (any if unset)
    pub remote_id: Option<Identity>,

    /// Address to initiate to; responders accept from anywhere if unset
    pub remote_addr: Option<SocketAddr>,

    /// IKE SA proposals in preference order
    pub ike_proposals: Vec<Proposal>,

    /// ESP CHILD_SA proposals in preference order
    pub esp_proposals: Vec<Proposal>,

    /// Our side of the protected traffic
    pub local_ts: Vec<TrafficSelector>,

    /// The peer's side of the protected traffic
    pub remote_ts: Vec<TrafficSelector>,

    /// IKE_SA lifetime
    pub ike_lifetime: SaLifetime,

    /// CHILD_SA lifetime
    pub child_lifetime: SaLifetime,

    /// DH group for PFS in CREATE_CHILD_SA
    pub pfs_group: Option<DhTransformId>,

    /// Dead Peer Detection configuration
    pub dpd: DpdConfig,
}

impl PeerConfig {
    /// Create builder for a peer configuration
    pub fn builder(name: impl Into<String>) -> PeerConfigBuilder {
        PeerConfigBuilder::new(name)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidParameter("name cannot be empty".into()));
        }
        if self.local_id.data.is_empty() {
            return Err(Error::InvalidParameter("local_id cannot be empty".into()));
        }
        if self.ike_proposals.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one IKE proposal required".into(),
            ));
        }
        if self.esp_proposals.is_empty() {
            return Err(Error::InvalidParameter(
                "At least one ESP proposal required".into(),
            ));
        }
        for proposal in &self.ike_proposals {
            if proposal.protocol_id != ProtocolId::Ike
                || proposal.get_transform(TransformType::Dh).is_none()
            {
                return Err(Error::InvalidParameter(format!(
                    "IKE proposal {} needs protocol IKE and a DH group",
                    proposal.proposal_num
                )));
            }
        }
        for proposal in &self.esp_proposals {
            if proposal.protocol_id != ProtocolId::Esp {
                return Err(Error::InvalidParameter(format!(
                    "ESP proposal {} has protocol {:?}",
                    proposal.proposal_num, proposal.protocol_id
                )));
            }
        }
        if self.local_ts.is_empty() || self.remote_ts.is_empty() {
            return Err(Error::InvalidParameter(
                "Traffic selectors cannot be empty".into(),
            ));
        }
        Ok(())
    }

    /// ESP proposals as offered in CREATE_CHILD_SA, with the PFS group added
    pub fn child_proposals(&self, pfs: Option<DhTransformId>) -> Vec<Proposal> {
        self.esp_proposals
            .iter()
            .cloned()
            .map(|p| match pfs {
                Some(group) => p.add_transform(Transform::dh(group)),
                None => p,
            })
            .collect()
    }

    /// ESP proposals a responder accepts in CREATE_CHILD_SA: the plain ones
    /// and, if PFS is configured, the same ones with our group
    pub fn acceptable_child_proposals(&self) -> Vec<Proposal> {
        let mut proposals = self.child_proposals(None);
        if let Some(group) = self.pfs_group {
            proposals.extend(self.child_proposals(Some(group)));
        }
        proposals
    }

    /// Whether an authenticated peer identity is acceptable
    pub fn accepts_identity(&self, id: &Identity) -> bool {
        self.remote_id.as_ref().map_or(true, |expected| expected == id)
    }
}

/// Builder for PeerConfig
pub struct PeerConfigBuilder {
    name: String,
    local_id: Option<Identity>,
    remote_id: Option<Identity>,
    remote_addr: Option<SocketAddr>,
    ike_proposals: Option<Vec<Proposal>>,
    esp_proposals: Option<Vec<Proposal>>,
    local_ts: Vec<TrafficSelector>,
    remote_ts: Vec<TrafficSelector>,
    ike_lifetime: Option<SaLifetime>,
    child_lifetime: Option<SaLifetime>,
    pfs_group: Option<DhTransformId>,
    dpd: Option<DpdConfig>,
}

impl PeerConfigBuilder {
    /// Create new builder
    pub fn new(name: impl Into<String>) -> Self {
        PeerConfigBuilder {
            name: name.into(),
            local_id: None,
            remote_id: None,
            remote_addr: None,
            ike_proposals: None,
            esp_proposals: None,
            local_ts: Vec::new(),
            remote_ts: Vec::new(),
            ike_lifetime: None,
            child_lifetime: None,
            pfs_group: None,
            dpd: None,
        }
    }

    /// Set local identity
    pub fn with_local_id(mut self, id: Identity) -> Self {
        self.local_id = Some(id);
        self
    }

    /// Require a remote identity
    pub fn with_remote_id(mut self, id: Identity) -> Self {
        self.remote_id = Some(id);
        self
    }

    /// Set the peer address
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    /// Set IKE proposals
    pub fn with_ike_proposals(mut self, proposals: Vec<Proposal>) -> Self {
        self.ike_proposals = Some(proposals);
        self
    }

    /// Set ESP proposals
    pub fn with_esp_proposals(mut self, proposals: Vec<Proposal>) -> Self {
        self.esp_proposals = Some(proposals);
        self
    }

    /// Add a local traffic selector
    pub fn with_local_ts(mut self, ts: TrafficSelector) -> Self {
        self.local_ts.push(ts);
        self
    }

    /// Add a remote traffic selector
    pub fn with_remote_ts(mut self, ts: TrafficSelector) -> Self {
        self.remote_ts.push(ts);
        self
    }

    /// Set IKE_SA lifetime
    pub fn with_ike_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.ike_lifetime = Some(lifetime);
        self
    }

    /// Set CHILD_SA lifetime
    pub fn with_child_lifetime(mut self, lifetime: SaLifetime) -> Self {
        self.child_lifetime = Some(lifetime);
        self
    }

    /// Use PFS with this group in CREATE_CHILD_SA
    pub fn with_pfs_group(mut self, group: DhTransformId) -> Self {
        self.pfs_group = Some(group);
        self
    }

    /// Set DPD configuration
    pub fn with_dpd(mut self, config: DpdConfig) -> Self {
        self.dpd = Some(config);
        self
    }

    /// Build and validate
    pub fn build(self) -> Result<PeerConfig> {
        let config = PeerConfig {
            name: self.name,
            local_id: self
                .local_id
                .ok_or_else(|| Error::InvalidParameter("local_id is required".into()))?,
            remote_id: self.remote_id,
            remote_addr: self.remote_addr,
            ike_proposals: self.ike_proposals.unwrap_or_else(default_ike_proposals),
            esp_proposals: self.esp_proposals.unwrap_or_else(default_esp_proposals),
            local_ts: self.local_ts,
            remote_ts: self.remote_ts,
            ike_lifetime: self.ike_lifetime.unwrap_or(SaLifetime {
                soft_time: Duration::from_secs(3 * 60 * 60),
                hard_time: Duration::from_secs(4 * 60 * 60),
                ..SaLifetime::default()
            }),
            child_lifetime: self.child_lifetime.unwrap_or_default(),
            pfs_group: self.pfs_group,
            dpd: self.dpd.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// Process-wide daemon configuration
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Retransmission policy
    pub retransmit: RetransmitConfig,

    /// DoS limits
    pub dos: DosConfig,

    /// Bound on waiting for a delete acknowledgment
    pub delete_timeout: Duration,

    /// How often an IKE_SA_INIT is restarted after COOKIE or
    /// INVALID_KE_PAYLOAD before giving up
    pub max_init_retries: u32,

    /// Capacity of each IKE_SA's event inbox
    pub inbox_capacity: usize,

    /// Configured peers
    pub peers: Vec<Arc<PeerConfig>>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            retransmit: RetransmitConfig::default(),
            dos: DosConfig::default(),
            delete_timeout: DEFAULT_DELETE_TIMEOUT,
            max_init_retries: 3,
            inbox_capacity: 64,
            peers: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Add a peer
    pub fn with_peer(mut self, peer: PeerConfig) -> Self {
        self.peers.push(Arc::new(peer));
        self
    }

    /// Set the retransmission policy
    pub fn with_retransmit(mut self, retransmit: RetransmitConfig) -> Self {
        self.retransmit = retransmit;
        self
    }

    /// Set DoS limits
    pub fn with_dos(mut self, dos: DosConfig) -> Self {
        self.dos = dos;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.retransmit.validate()?;
        if self.dos.cookie_threshold > self.dos.block_threshold {
            return Err(Error::InvalidParameter(
                "cookie_threshold must not exceed block_threshold".into(),
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(Error::InvalidParameter(
                "inbox_capacity must be non-zero".into(),
            ));
        }
        for (i, peer) in self.peers.iter().enumerate() {
            peer.validate()?;
            if self.peers[..i].iter().any(|p| p.name == peer.name) {
                return Err(Error::InvalidParameter(format!(
                    "duplicate peer name {}",
                    peer.name
                )));
            }
        }
        Ok(())
    }

    /// Peer by connection name
    pub fn peer(&self, name: &str) -> Option<Arc<PeerConfig>> {
        self.peers.iter().find(|p| p.name == name).cloned()
    }

    /// Candidate configuration for an IKE_SA_INIT arriving from `addr`
    ///
    /// Peers pinned to that address win over wildcard peers.
    pub fn peer_for_addr(&self, addr: SocketAddr) -> Option<Arc<PeerConfig>> {
        self.peers
            .iter()
            .find(|p| p.remote_addr.map(|a| a.ip()) == Some(addr.ip()))
            .or_else(|| self.peers.iter().find(|p| p.remote_addr.is_none()))
            .cloned()
    }

    /// Configuration matching an authenticated peer identity
    pub fn peer_for_identity(&self, id: &Identity) -> Option<Arc<PeerConfig>> {
        self.peers
            .iter()
            .find(|p| p.remote_id.as_ref() == Some(id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ts(net: [u8; 4], prefix: u8) -> TrafficSelector {
        TrafficSelector::subnet(IpAddr::V4(Ipv4Addr::from(net)), prefix).unwrap()
    }

    fn peer(name: &str) -> PeerConfig {
        PeerConfig::builder(name)
            .with_local_id(Identity::fqdn("gw1.example.com"))
            .with_local_ts(ts([10, 1, 0, 0], 16))
            .with_remote_ts(ts([10, 2, 0, 0], 16))
            .build()
            .unwrap()
    }

    #[test]
    fn test_retransmit_delay_curve() {
        let config = RetransmitConfig::default();
        assert_eq!(config.delay(0), Duration::from_secs(4));
        assert_eq!(config.delay(1), Duration::from_secs_f64(4.0 * 1.8));
        assert!(config.delay(4) > config.delay(3));

        let capped = RetransmitConfig {
            max_interval: Some(Duration::from_secs(10)),
            ..RetransmitConfig::default()
        };
        assert_eq!(capped.delay(5), Duration::from_secs(10));
        assert_eq!(capped.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_peer_defaults() {
        let config = peer("site-b");
        assert_eq!(config.ike_proposals.len(), 2);
        assert_eq!(config.esp_proposals.len(), 1);
        assert!(config.dpd.enabled);
        assert!(config.ike_lifetime.soft_time < config.ike_lifetime.hard_time);
    }

    #[test]
    fn test_peer_requires_selectors() {
        let result = PeerConfig::builder("x")
            .with_local_id(Identity::fqdn("a"))
            .build();
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn test_peer_requires_local_id() {
        let result = PeerConfig::builder("x")
            .with_local_ts(ts([10, 1, 0, 0], 16))
            .with_remote_ts(ts([10, 2, 0, 0], 16))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_child_proposals_with_pfs() {
        let mut config = peer("pfs");
        config.pfs_group = Some(DhTransformId::Curve25519);

        let offered = config.child_proposals(config.pfs_group);
        assert_eq!(offered[0].dh_group(), Some(31));
        assert_eq!(config.acceptable_child_proposals().len(), 2);
    }

    #[test]
    fn test_lifetime_validation() {
        assert!(SaLifetime::new(Duration::from_secs(60), Duration::from_secs(30)).is_err());
        let lifetime = SaLifetime::new(Duration::from_secs(60), Duration::from_secs(90)).unwrap();
        assert!(lifetime.with_byte_limits(100, 50).is_err());
        assert_eq!(lifetime.rekey_after(), Duration::from_secs(60));

        let jittered = lifetime.with_jitter(Duration::from_secs(10));
        for _ in 0..20 {
            let after = jittered.rekey_after();
            assert!(after <= Duration::from_secs(60));
            assert!(after >= Duration::from_secs(50));
        }
    }

    #[test]
    fn test_daemon_config_lookup() {
        let pinned = PeerConfig {
            remote_addr: Some("192.0.2.1:500".parse().unwrap()),
            remote_id: Some(Identity::fqdn("gw2.example.com")),
            ..peer("pinned")
        };
        let config = DaemonConfig::default()
            .with_peer(peer("any"))
            .with_peer(pinned);
        config.validate().unwrap();

        assert_eq!(
            config.peer_for_addr("192.0.2.1:4500".parse().unwrap()).unwrap().name,
            "pinned"
        );
        assert_eq!(
            config.peer_for_addr("198.51.100.1:500".parse().unwrap()).unwrap().name,
            "any"
        );
        assert_eq!(
            config
                .peer_for_identity(&Identity::fqdn("gw2.example.com"))
                .unwrap()
                .name,
            "pinned"
        );
        assert!(config.peer("missing").is_none());
    }

    #[test]
    fn test_daemon_config_validation() {
        let config = DaemonConfig::default()
            .with_peer(peer("dup"))
            .with_peer(peer("dup"));
        assert!(config.validate().is_err());

        let config = DaemonConfig::default().with_dos(DosConfig {
            cookie_threshold: 200,
            ..DosConfig::default()
        });
        assert!(config.validate().is_err());
    }
}
