//! IKE daemon: the registry, the actors and the transport wired together
//!
//! ```no_run
//! use std::sync::Arc;
//! use ikev2d_proto::ipsec::{
//!     config::DaemonConfig, credentials::PskCredentials, daemon::Daemon,
//!     ikev2::payload::Identity, kernel::MemoryKernel, transport::UdpTransport,
//! };
//! use ikev2d_platform::SecurityModule;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(UdpTransport::bind("192.0.2.1:500".parse()?, None).await?);
//! let credentials = PskCredentials::new(Identity::fqdn("gw.example.com"))
//!     .with_default_key(b"shared secret");
//! let mut daemon = Daemon::new(
//!     DaemonConfig::default(),
//!     transport.clone(),
//!     Arc::new(MemoryKernel::new()),
//!     Arc::new(credentials),
//! )?;
//! daemon.init()?;
//! transport.serve(Arc::new(daemon)).await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ikev2d_platform::{PlatformError, PlatformResult, SecurityModule};
use tracing::{info, warn};

use super::actor::{self, SaEvent, SaHandle};
use super::config::DaemonConfig;
use super::credentials::CredentialStore;
use super::crypto::{CryptoBackend, DefaultCrypto};
use super::ike_sa::{IkeSa, SaCommand, Services};
use super::ikev2::{
    message::{decode_header, IkeHeader, IkeMessage},
    payload::Identity,
};
use super::kernel::KernelInterface;
use super::logging;
use super::manager::{Admission, IkeSaManager, Route};
use super::metrics::{IpsecMetrics, MetricsSnapshot};
use super::transport::Transport;
use super::{Error, Result};

/// Shared by the daemon and every actor
pub(crate) struct Runtime {
    pub(crate) settings: Arc<DaemonConfig>,
    pub(crate) services: Services,
    pub(crate) manager: IkeSaManager<SaHandle>,
    pub(crate) transport: Arc<dyn Transport>,
}

/// IKEv2 daemon
pub struct Daemon {
    runtime: Arc<Runtime>,
    running: AtomicBool,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("sas", &self.runtime.manager.len())
            .field("half_open", &self.runtime.manager.half_open())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

impl Daemon {
    /// Build a daemon with the default crypto backend
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the configuration does not validate.
    pub fn new(
        config: DaemonConfig,
        transport: Arc<dyn Transport>,
        kernel: Arc<dyn KernelInterface>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self> {
        Self::with_crypto(config, transport, kernel, credentials, Arc::new(DefaultCrypto))
    }

    /// Build a daemon with a custom crypto backend
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` if the configuration does not validate.
    pub fn with_crypto(
        config: DaemonConfig,
        transport: Arc<dyn Transport>,
        kernel: Arc<dyn KernelInterface>,
        credentials: Arc<dyn CredentialStore>,
        crypto: Arc<dyn CryptoBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let metrics = IpsecMetrics::new();
        let manager = IkeSaManager::new(config.dos.clone(), metrics.clone());
        let services = Services::new(crypto, kernel, credentials, manager.spi_allocator())
            .with_contacts(manager.contacts())
            .with_metrics(metrics);

        Ok(Daemon {
            runtime: Arc::new(Runtime {
                settings: Arc::new(config),
                services,
                manager,
                transport,
            }),
            running: AtomicBool::new(false),
        })
    }

    /// Route one received IKE datagram
    ///
    /// Never blocks: a datagram for an IKE_SA whose inbox is full is
    /// dropped and left to the peer's retransmission.
    pub fn dispatch(&self, data: &[u8], from: SocketAddr, to: SocketAddr) {
        let header = match decode_header(data) {
            Ok(header) => header,
            Err(e) => {
                logging::log_message_dropped(from, &e.to_string());
                return;
            }
        };

        match self.runtime.manager.route(&header, from) {
            Route::Existing(handle) => {
                let event = SaEvent::Packet {
                    data: data.to_vec(),
                    from,
                    to,
                };
                if let Err(e) = handle.try_send(event) {
                    logging::log_message_dropped(from, &e.to_string());
                }
            }
            Route::NewSa => self.accept(data, &header, from, to),
            Route::Unknown => logging::log_message_dropped(from, "no IKE_SA for SPI"),
        }
    }

    /// Admission control and responder setup for a new IKE_SA_INIT
    fn accept(&self, data: &[u8], header: &IkeHeader, from: SocketAddr, to: SocketAddr) {
        let runtime = &self.runtime;
        if !self.running.load(Ordering::SeqCst) {
            logging::log_message_dropped(from, "daemon not running");
            return;
        }
        let Some(config) = runtime.settings.peer_for_addr(from) else {
            logging::log_message_dropped(from, "no peer configuration");
            return;
        };
        let request = match IkeMessage::decode(data, None) {
            Ok(request) => request,
            Err(e) => {
                logging::log_message_dropped(from, &e.to_string());
                return;
            }
        };

        match runtime.manager.admit(&request, from) {
            Admission::Drop => {}
            Admission::Challenge(packet) => {
                let transport = runtime.transport.clone();
                tokio::spawn(async move {
                    let _ = transport.send(from, to, &packet).await;
                });
            }
            Admission::Accept(ticket) => {
                let spi_r = match runtime.manager.allocate_spi() {
                    Ok(spi) => spi,
                    Err(e) => {
                        warn!(peer = %from, error = %e, "Cannot allocate IKE SPI");
                        return;
                    }
                };
                let sa = IkeSa::new_responder(
                    config,
                    runtime.settings.clone(),
                    runtime.services.clone(),
                    header.initiator_spi,
                    spi_r,
                    to,
                    from,
                    Some(ticket),
                );
                let handle = actor::spawn(
                    runtime.clone(),
                    sa,
                    Some((from, header.initiator_spi)),
                );
                let event = SaEvent::Packet {
                    data: data.to_vec(),
                    from,
                    to,
                };
                if let Err(e) = handle.try_send(event) {
                    logging::log_message_dropped(from, &e.to_string());
                }
            }
        }
    }

    /// Open an IKE_SA to the named peer
    ///
    /// Returns our SPI of the new IKE_SA. Completion is reported through
    /// the registry and logs; the call does not wait for the peer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParameter` for an unknown peer or one without a
    /// remote address and `InvalidState` before [`SecurityModule::init`].
    pub fn initiate(&self, name: &str) -> Result<[u8; 8]> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(Error::InvalidState("daemon not running".into()));
        }
        let runtime = &self.runtime;
        let config = runtime
            .settings
            .peer(name)
            .ok_or_else(|| Error::InvalidParameter(format!("unknown peer {}", name)))?;
        let remote = config.remote_addr.ok_or_else(|| {
            Error::InvalidParameter(format!("peer {} has no remote address", name))
        })?;

        let spi_i = runtime.manager.allocate_spi()?;
        let local = runtime.transport.local_addr(remote);
        let mut sa = match IkeSa::new_initiator(
            config,
            runtime.settings.clone(),
            runtime.services.clone(),
            spi_i,
            local,
        ) {
            Ok(sa) => sa,
            Err(e) => {
                runtime.manager.spi_allocator().release(&spi_i);
                return Err(e);
            }
        };
        sa.initiate();
        actor::spawn(runtime.clone(), sa, None);
        info!(peer = name, spi_i = %hex::encode(spi_i), "Initiating IKE_SA");
        Ok(spi_i)
    }

    /// Send a command to the IKE_SA with local SPI `spi`
    ///
    /// # Errors
    ///
    /// Returns `SaNotFound` if there is no such IKE_SA and
    /// `TemporaryFailure` if its inbox is full.
    pub fn command(&self, spi: &[u8; 8], command: SaCommand) -> Result<()> {
        let handle = self
            .runtime
            .manager
            .lookup(spi)
            .ok_or_else(|| Error::SaNotFound(hex::encode(spi)))?;
        handle.try_send(SaEvent::Command(command))
    }

    /// Delete an IKE_SA and its CHILD_SAs
    ///
    /// # Errors
    ///
    /// See [`Daemon::command`].
    pub fn terminate(&self, spi: &[u8; 8]) -> Result<()> {
        self.command(spi, SaCommand::Terminate)
    }

    /// Relay a kernel lifetime expiry for a CHILD_SA
    ///
    /// The kernel only knows the ESP SPI, so every IKE_SA is told and the
    /// owner reacts.
    pub fn kernel_expire(&self, spi: u32, hard: bool) {
        for handle in self.runtime.manager.handles() {
            let _ = handle.try_send(SaEvent::Command(SaCommand::ChildExpired { spi, hard }));
        }
    }

    /// Local SPIs of the IKE_SAs authenticated as `identity`
    pub fn find_by_identity(&self, identity: &Identity) -> Vec<[u8; 8]> {
        self.runtime
            .manager
            .find_by_identity(identity)
            .iter()
            .map(SaHandle::local_spi)
            .collect()
    }

    /// Number of registered IKE_SAs
    pub fn sa_count(&self) -> usize {
        self.runtime.manager.len()
    }

    /// Number of half-open IKE_SAs
    pub fn half_open(&self) -> usize {
        self.runtime.manager.half_open()
    }

    /// Counter snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.runtime.services.metrics.snapshot()
    }

    /// Configuration in use
    pub fn config(&self) -> &DaemonConfig {
        &self.runtime.settings
    }

    /// Whether [`SecurityModule::init`] has run and shutdown has not
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Delete every IKE_SA and empty the registry
    ///
    /// Each SA sends its delete request once; the daemon does not wait for
    /// the acknowledgments.
    pub fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handles = self.runtime.manager.clear();
        info!(sas = handles.len(), "Closing all IKE_SAs");
        for handle in handles {
            let _ = handle.try_send(SaEvent::Command(SaCommand::Terminate));
            let _ = handle.try_send(SaEvent::Command(SaCommand::Discard));
        }
    }
}

impl SecurityModule for Daemon {
    fn id(&self) -> &'static str {
        "ikev2d"
    }

    fn description(&self) -> &'static str {
        "IKEv2 negotiation engine"
    }

    fn init(&mut self) -> PlatformResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(PlatformError::Lifecycle("daemon already running".into()));
        }
        self.runtime.manager.reset_cookie_secret();
        info!(
            peers = self.runtime.settings.peers.len(),
            "IKE daemon started"
        );
        Ok(())
    }

    fn shutdown(&mut self) -> PlatformResult<()> {
        self.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::config::PeerConfig;
    use crate::ipsec::credentials::PskCredentials;
    use crate::ipsec::ikev2::constants::ExchangeType;
    use crate::ipsec::ikev2::payload::TrafficSelector;
    use crate::ipsec::kernel::MemoryKernel;
    use crate::ipsec::transport::{Datagram, MemoryTransport};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;

    const LOCAL: &str = "192.0.2.1:500";
    const REMOTE: &str = "192.0.2.2:500";

    fn daemon() -> (Daemon, mpsc::UnboundedReceiver<Datagram>) {
        let ts = |n: u8| {
            TrafficSelector::subnet(IpAddr::V4(Ipv4Addr::new(10, n, 0, 0)), 16).unwrap()
        };
        let peer = PeerConfig::builder("branch")
            .with_local_id(Identity::fqdn("hq.example.com"))
            .with_remote_id(Identity::fqdn("branch.example.com"))
            .with_remote_addr(REMOTE.parse().unwrap())
            .with_local_ts(ts(1))
            .with_remote_ts(ts(2))
            .build()
            .unwrap();
        let (transport, rx) = MemoryTransport::new(LOCAL.parse().unwrap());
        let credentials =
            PskCredentials::new(Identity::fqdn("hq.example.com")).with_default_key(b"secret");
        let daemon = Daemon::new(
            DaemonConfig::default().with_peer(peer),
            Arc::new(transport),
            Arc::new(MemoryKernel::new()),
            Arc::new(credentials),
        )
        .unwrap();
        (daemon, rx)
    }

    #[tokio::test]
    async fn test_initiate_requires_init() {
        let (daemon, _rx) = daemon();
        assert!(matches!(daemon.initiate("branch"), Err(Error::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_initiate_sends_ike_sa_init() {
        let (mut daemon, mut rx) = daemon();
        daemon.init().unwrap();
        assert!(daemon.init().is_err());

        let spi = daemon.initiate("branch").unwrap();
        assert_eq!(daemon.sa_count(), 1);

        let datagram = rx.recv().await.unwrap();
        assert_eq!(datagram.to, REMOTE.parse().unwrap());
        let header = decode_header(&datagram.packet).unwrap();
        assert_eq!(header.exchange_type, ExchangeType::IkeSaInit);
        assert_eq!(header.initiator_spi, spi);
        assert_eq!(header.message_id, 0);
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let (mut daemon, _rx) = daemon();
        daemon.init().unwrap();
        assert!(matches!(
            daemon.initiate("nobody"),
            Err(Error::InvalidParameter(_))
        ));
        assert!(matches!(
            daemon.terminate(&[9; 8]),
            Err(Error::SaNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_garbage_dropped() {
        let (mut daemon, _rx) = daemon();
        daemon.init().unwrap();
        daemon.dispatch(&[1, 2, 3], REMOTE.parse().unwrap(), LOCAL.parse().unwrap());
        assert_eq!(daemon.sa_count(), 0);
        assert_eq!(daemon.half_open(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_clears_registry() {
        let (mut daemon, _rx) = daemon();
        daemon.init().unwrap();
        daemon.initiate("branch").unwrap();
        daemon.shutdown().unwrap();
        assert_eq!(daemon.sa_count(), 0);
        assert!(!daemon.is_running());
    }
}
