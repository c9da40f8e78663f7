//! IKEv2 negotiation engine
//!
//! This module implements the control plane of an IPsec gateway: it
//! negotiates IKE_SAs and CHILD_SAs with peers (RFC 7296) and hands the
//! resulting keys to the kernel.
//!
//! # Architecture
//!
//! ```text
//! UDP 500/4500 --> Daemon::dispatch --> IkeSaManager (route by SPI, DoS)
//!                                           |
//!                                           v
//!                        SaActor (one tokio task per IKE_SA)
//!                                           |
//!                                           v
//!                IkeSa --> TaskManager --> tasks (IKE_SA_INIT, IKE_AUTH,
//!                  |                       CREATE_CHILD_SA, INFORMATIONAL)
//!                  v
//!               Effects: send, timers, kernel install, spawn, destroy
//! ```
//!
//! - [`ikev2`] encodes and decodes messages, including the SK payload.
//! - [`ike_sa`] is a synchronous state machine per IKE_SA. It never does
//!   I/O; it returns [`ike_sa::Effect`]s.
//! - [`manager`] is the process-wide registry: SPI allocation, half-open
//!   accounting, cookie challenges and identity lookup.
//! - [`daemon`], [`actor`], [`scheduler`] and [`transport`] run the state
//!   machines on tokio.
//! - [`kernel`], [`credentials`] and [`crypto`] are the seams to the
//!   outside world, each with an in-process implementation.
//!
//! # Driving an IKE_SA by hand
//!
//! ```rust
//! use std::sync::Arc;
//! use ikev2d_proto::ipsec::{
//!     config::{DaemonConfig, PeerConfig},
//!     credentials::PskCredentials,
//!     crypto::DefaultCrypto,
//!     ike_sa::{Effect, IkeSa, Services},
//!     ikev2::payload::{Identity, TrafficSelector},
//!     kernel::MemoryKernel,
//!     manager::SpiTable,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let peer = PeerConfig::builder("branch")
//!     .with_local_id(Identity::fqdn("hq.example.com"))
//!     .with_remote_addr("192.0.2.2:500".parse()?)
//!     .with_local_ts(TrafficSelector::subnet("10.1.0.0".parse()?, 16)?)
//!     .with_remote_ts(TrafficSelector::subnet("10.2.0.0".parse()?, 16)?)
//!     .build()?;
//! let services = Services::new(
//!     Arc::new(DefaultCrypto),
//!     Arc::new(MemoryKernel::new()),
//!     Arc::new(PskCredentials::new(Identity::fqdn("hq.example.com")).with_default_key(b"k")),
//!     Arc::new(SpiTable::new()),
//! );
//!
//! let mut sa = IkeSa::new_initiator(
//!     Arc::new(peer),
//!     Arc::new(DaemonConfig::default()),
//!     services,
//!     [1; 8],
//!     "192.0.2.1:500".parse()?,
//! )?;
//! sa.initiate();
//! assert!(sa
//!     .take_effects()
//!     .iter()
//!     .any(|e| matches!(e, Effect::Send { .. })));
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2
//! - [RFC 3948](https://datatracker.ietf.org/doc/html/rfc3948) - UDP encapsulation of ESP
//! - [RFC 7383](https://datatracker.ietf.org/doc/html/rfc7383) - IKEv2 message fragmentation (not supported)

pub mod actor;
pub mod child_sa;
pub mod config;
pub mod cookie;
pub mod credentials;
pub mod crypto;
pub mod daemon;
pub mod dpd;
pub mod error;
pub mod ike_sa;
pub mod ikev2;
pub mod kernel;
pub mod logging;
pub mod manager;
pub mod metrics;
pub mod nat;
pub(crate) mod scheduler;
pub(crate) mod task;
pub(crate) mod task_manager;
pub mod transport;

pub use daemon::Daemon;
pub use error::{Error, Result};
pub use ike_sa::{IkeSa, IkeSaState, SaCommand};
