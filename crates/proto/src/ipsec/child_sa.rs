//! Child SA (Security Association) management
//!
//! A CHILD_SA is one ESP association negotiated under an IKE_SA, in IKE_AUTH
//! or in a CREATE_CHILD_SA exchange. Each side picks the SPI it wants to
//! receive on, so a CHILD_SA carries an inbound and an outbound SPI.
//!
//! # Lifecycle
//!
//! ```text
//! Negotiating -> Installed -> Rekeying -> Deleting -> Destroyed
//!                    |            |
//!                    |            +-> Installed   (rekey failed)
//!                    +-> Deleting
//! ```
//!
//! The outbound SPI only becomes usable once the kernel has confirmed both
//! directions. During a rekey the old SA stays installed until its
//! replacement is, so at least one of them always carries traffic.
//!
//! # Key Derivation
//!
//! ```text
//! KEYMAT = prf+(SK_d, [g^ir (new) |] Ni | Nr)
//!
//! Key split:
//! SK_ei | SK_ai | SK_er | SK_ar = KEYMAT
//! ```

use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::ipsec::{
    config::SaLifetime,
    crypto::{ChildKeys, SecretBytes},
    ikev2::payload::TrafficSelector,
    ikev2::proposal::{
        DhTransformId, EncrTransformId, IntegTransformId, Proposal, ProtocolId, TransformType,
    },
    kernel::{Direction, KernelInterface, KernelSa},
    Error, Result,
};

/// Child SA State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSaState {
    /// Keys derived, not yet in the kernel
    Negotiating,

    /// Both directions installed and carrying traffic
    Installed,

    /// A replacement is being negotiated; still carrying traffic
    Rekeying,

    /// A delete exchange is in progress
    Deleting,

    /// Removed from the kernel
    Destroyed,
}

impl ChildSaState {
    fn can_transition_to(self, next: ChildSaState) -> bool {
        use ChildSaState::*;
        matches!(
            (self, next),
            (Negotiating, Installed)
                | (Negotiating, Destroyed)
                | (Installed, Rekeying)
                | (Installed, Deleting)
                | (Rekeying, Installed)
                | (Rekeying, Deleting)
                | (Installed | Rekeying | Deleting, Destroyed)
        )
    }
}

impl fmt::Display for ChildSaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChildSaState::Negotiating => "NEGOTIATING",
            ChildSaState::Installed => "INSTALLED",
            ChildSaState::Rekeying => "REKEYING",
            ChildSaState::Deleting => "DELETING",
            ChildSaState::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

/// Algorithms negotiated for a CHILD_SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildSuite {
    /// Encryption algorithm
    pub encr: EncrTransformId,
    /// Encryption key length attribute in bits
    pub encr_key_bits: Option<u16>,
    /// Encryption keying material length (key + salt)
    pub encr_keymat_len: usize,
    /// Integrity algorithm, `None` for AEAD
    pub integ: Option<IntegTransformId>,
    /// Extended sequence numbers
    pub esn: bool,
    /// DH group used for PFS
    pub dh: Option<DhTransformId>,
}

impl ChildSuite {
    /// Extract the suite from a selected ESP proposal
    ///
    /// # Errors
    ///
    /// Returns `NoProposalChosen` when the proposal names an algorithm we
    /// cannot install.
    pub fn from_proposal(proposal: &Proposal) -> Result<Self> {
        let encr_transform = proposal
            .get_transform(TransformType::Encr)
            .ok_or(Error::NoProposalChosen)?;
        let encr =
            EncrTransformId::from_u16(encr_transform.transform_id).ok_or(Error::NoProposalChosen)?;
        let encr_keymat_len = encr
            .keymat_len(encr_transform.key_length)
            .map_err(|_| Error::NoProposalChosen)?;

        let integ = match proposal.get_transform(TransformType::Integ) {
            Some(t) => Some(IntegTransformId::from_u16(t.transform_id).ok_or(Error::NoProposalChosen)?),
            None => None,
        };
        if !encr.is_aead() && integ.is_none() {
            return Err(Error::NoProposalChosen);
        }

        let esn = proposal
            .get_transform(TransformType::Esn)
            .map_or(false, |t| t.transform_id == 1);

        let dh = match proposal.dh_group() {
            Some(group) => Some(DhTransformId::from_u16(group).ok_or(Error::NoProposalChosen)?),
            None => None,
        };

        Ok(ChildSuite {
            encr,
            encr_key_bits: encr_transform.key_length,
            encr_keymat_len,
            integ,
            esn,
            dh,
        })
    }

    /// Integrity key length in bytes (0 for AEAD)
    pub fn integ_key_len(&self) -> usize {
        self.integ.map_or(0, IntegTransformId::key_len)
    }
}

/// Addressing used when installing a CHILD_SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    /// Our tunnel address
    pub local: IpAddr,
    /// The peer's tunnel address
    pub remote: IpAddr,
    /// Wrap ESP in UDP (NAT detected)
    pub encap: bool,
}

/// Child Security Association
pub struct ChildSa {
    /// SPI the peer uses towards us (our choice)
    pub spi_in: u32,

    /// SPI we use towards the peer (the peer's choice)
    pub spi_out: u32,

    /// Protocol (always ESP here)
    pub protocol: ProtocolId,

    /// Selected proposal as exchanged on the wire
    pub proposal: Proposal,

    /// Negotiated algorithms
    pub suite: ChildSuite,

    /// Our side of the protected traffic
    pub local_ts: Vec<TrafficSelector>,

    /// The peer's side of the protected traffic
    pub remote_ts: Vec<TrafficSelector>,

    /// Lifetime limits
    pub lifetime: SaLifetime,

    /// Inbound SPI of the SA this one replaced
    pub rekeyed_from: Option<u32>,

    state: ChildSaState,
    created_at: Instant,
    /// Whether we sent the request that created this SA
    initiator: bool,
    keys: ChildKeys,
}

impl fmt::Debug for ChildSa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildSa")
            .field("spi_in", &format_args!("{:08x}", self.spi_in))
            .field("spi_out", &format_args!("{:08x}", self.spi_out))
            .field("state", &self.state)
            .field("suite", &self.suite)
            .field("local_ts", &self.local_ts)
            .field("remote_ts", &self.remote_ts)
            .finish()
    }
}

impl ChildSa {
    /// New CHILD_SA in `Negotiating` state
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        spi_in: u32,
        spi_out: u32,
        proposal: Proposal,
        suite: ChildSuite,
        local_ts: Vec<TrafficSelector>,
        remote_ts: Vec<TrafficSelector>,
        lifetime: SaLifetime,
        keys: ChildKeys,
        initiator: bool,
    ) -> Self {
        ChildSa {
            spi_in,
            spi_out,
            protocol: ProtocolId::Esp,
            proposal,
            suite,
            local_ts,
            remote_ts,
            lifetime,
            rekeyed_from: None,
            state: ChildSaState::Negotiating,
            created_at: Instant::now(),
            initiator,
            keys,
        }
    }

    /// Current state
    pub fn state(&self) -> ChildSaState {
        self.state
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` for transitions the lifecycle does
    /// not allow.
    pub fn set_state(&mut self, next: ChildSaState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Whether the SA carries traffic
    pub fn is_usable(&self) -> bool {
        matches!(self.state, ChildSaState::Installed | ChildSaState::Rekeying)
    }

    /// Time since the keys were derived
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time left until the soft lifetime, from now
    pub fn remaining_soft(&self) -> Duration {
        self.lifetime.soft_time.saturating_sub(self.age())
    }

    /// Time left until the hard lifetime, from now
    pub fn remaining_hard(&self) -> Duration {
        self.lifetime.hard_time.saturating_sub(self.age())
    }

    fn outbound_keys(&self) -> (&SecretBytes, &SecretBytes) {
        if self.initiator {
            (&self.keys.encr_i, &self.keys.integ_i)
        } else {
            (&self.keys.encr_r, &self.keys.integ_r)
        }
    }

    fn inbound_keys(&self) -> (&SecretBytes, &SecretBytes) {
        if self.initiator {
            (&self.keys.encr_r, &self.keys.integ_r)
        } else {
            (&self.keys.encr_i, &self.keys.integ_i)
        }
    }

    fn kernel_sa(&self, direction: Direction, endpoints: &Endpoints) -> KernelSa {
        let (spi, (encr_key, integ_key), src, dst, src_ts, dst_ts) = match direction {
            Direction::Inbound => (
                self.spi_in,
                self.inbound_keys(),
                endpoints.remote,
                endpoints.local,
                &self.remote_ts,
                &self.local_ts,
            ),
            Direction::Outbound => (
                self.spi_out,
                self.outbound_keys(),
                endpoints.local,
                endpoints.remote,
                &self.local_ts,
                &self.remote_ts,
            ),
        };

        KernelSa {
            spi,
            direction,
            protocol: self.protocol,
            src,
            dst,
            encr: self.suite.encr,
            encr_key: encr_key.clone(),
            integ: self.suite.integ,
            integ_key: integ_key.clone(),
            esn: self.suite.esn,
            src_ts: src_ts.clone(),
            dst_ts: dst_ts.clone(),
            lifetime: self.lifetime,
            encap: endpoints.encap,
        }
    }

    /// Install both directions, inbound first
    ///
    /// If the outbound half is refused the inbound half is removed again, so
    /// a failed install leaves nothing behind.
    ///
    /// # Errors
    ///
    /// Returns `KernelInstallFailure` from the kernel.
    pub fn install(&mut self, kernel: &dyn KernelInterface, endpoints: &Endpoints) -> Result<()> {
        if self.state != ChildSaState::Negotiating {
            return Err(Error::InvalidState(format!(
                "CHILD_SA {:08x} is {}",
                self.spi_in, self.state
            )));
        }

        if let Err(e) = kernel.install_child_sa(&self.kernel_sa(Direction::Inbound, endpoints)) {
            kernel.release_spi(self.spi_in);
            self.state = ChildSaState::Destroyed;
            return Err(e);
        }
        if let Err(e) = kernel.install_child_sa(&self.kernel_sa(Direction::Outbound, endpoints)) {
            // Error from the inbound removal is secondary to the install error
            let _ = kernel.remove_child_sa(self.spi_in, Direction::Inbound);
            self.state = ChildSaState::Destroyed;
            return Err(e);
        }

        self.state = ChildSaState::Installed;
        Ok(())
    }

    /// Remove both directions from the kernel
    ///
    /// The SA ends up `Destroyed` even if the kernel reports an error; the
    /// first error is returned.
    pub fn remove(&mut self, kernel: &dyn KernelInterface) -> Result<()> {
        let installed = matches!(
            self.state,
            ChildSaState::Installed | ChildSaState::Rekeying | ChildSaState::Deleting
        );
        self.state = ChildSaState::Destroyed;
        if !installed {
            return Ok(());
        }

        let inbound = kernel.remove_child_sa(self.spi_in, Direction::Inbound);
        let outbound = kernel.remove_child_sa(self.spi_out, Direction::Outbound);
        inbound.and(outbound)
    }
}
