//! Kernel SA interface
//!
//! The engine never touches the data path itself. Negotiated CHILD_SAs are
//! handed to a [`KernelInterface`] one direction at a time, and removed the
//! same way. [`MemoryKernel`] keeps that state in a table, which is enough
//! for tests and for running the daemon without privileges.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::Rng;

use super::config::SaLifetime;
use super::crypto::SecretBytes;
use super::ikev2::payload::TrafficSelector;
use super::ikev2::proposal::{EncrTransformId, IntegTransformId, ProtocolId};
use super::{Error, Result};

/// SPIs below this value are reserved (RFC 4303 Section 2.1)
const MIN_SPI: u32 = 0x100;

/// Direction of a kernel SA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Traffic arriving from the peer
    Inbound,
    /// Traffic sent to the peer
    Outbound,
}

/// One direction of a CHILD_SA as handed to the kernel
#[derive(Debug, Clone)]
pub struct KernelSa {
    /// SPI carried in packets of this direction
    pub spi: u32,
    /// Direction
    pub direction: Direction,
    /// ESP or AH
    pub protocol: ProtocolId,
    /// Tunnel source
    pub src: IpAddr,
    /// Tunnel destination
    pub dst: IpAddr,
    /// Encryption algorithm
    pub encr: EncrTransformId,
    /// Encryption key (with salt for AEAD)
    pub encr_key: SecretBytes,
    /// Integrity algorithm, `None` for AEAD
    pub integ: Option<IntegTransformId>,
    /// Integrity key
    pub integ_key: SecretBytes,
    /// Extended sequence numbers
    pub esn: bool,
    /// Selectors of the traffic source
    pub src_ts: Vec<TrafficSelector>,
    /// Selectors of the traffic destination
    pub dst_ts: Vec<TrafficSelector>,
    /// Lifetime limits; byte limits are enforced by the kernel
    pub lifetime: SaLifetime,
    /// UDP encapsulation (NAT-T)
    pub encap: bool,
}

/// Kernel-side SA management
pub trait KernelInterface: Send + Sync {
    /// Reserve a fresh inbound SPI
    fn allocate_spi(&self, protocol: ProtocolId) -> Result<u32>;

    /// Give back an SPI that was never installed
    fn release_spi(&self, _spi: u32) {}

    /// Install one direction of a CHILD_SA
    ///
    /// # Errors
    ///
    /// Returns `KernelInstallFailure` if the kernel refuses the SA.
    fn install_child_sa(&self, sa: &KernelSa) -> Result<()>;

    /// Remove one direction of a CHILD_SA
    fn remove_child_sa(&self, spi: u32, direction: Direction) -> Result<()>;
}

#[derive(Debug, Default)]
struct Tables {
    allocated: HashSet<u32>,
    installed: HashMap<(u32, Direction), KernelSa>,
    removed: Vec<(u32, Direction)>,
}

/// In-memory kernel with failure injection
#[derive(Debug, Default)]
pub struct MemoryKernel {
    tables: Mutex<Tables>,
    fail_installs: AtomicUsize,
}

impl MemoryKernel {
    /// Empty kernel
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make the next `count` installs fail
    pub fn fail_next_installs(&self, count: usize) {
        self.fail_installs.store(count, Ordering::SeqCst);
    }

    /// Whether an SA is installed
    pub fn is_installed(&self, spi: u32, direction: Direction) -> bool {
        self.tables().installed.contains_key(&(spi, direction))
    }

    /// Installed SA, if any
    pub fn installed(&self, spi: u32, direction: Direction) -> Option<KernelSa> {
        self.tables().installed.get(&(spi, direction)).cloned()
    }

    /// Number of installed SA directions
    pub fn installed_count(&self) -> usize {
        self.tables().installed.len()
    }

    /// Every removal, in call order
    pub fn removed(&self) -> Vec<(u32, Direction)> {
        self.tables().removed.clone()
    }
}

impl KernelInterface for MemoryKernel {
    fn allocate_spi(&self, _protocol: ProtocolId) -> Result<u32> {
        let mut tables = self.tables();
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let spi = rng.gen_range(MIN_SPI..=u32::MAX);
            if tables.allocated.insert(spi) {
                return Ok(spi);
            }
        }
        Err(Error::KernelInstallFailure("SPI space exhausted".into()))
    }

    fn release_spi(&self, spi: u32) {
        let mut tables = self.tables();
        if !tables.installed.contains_key(&(spi, Direction::Inbound)) {
            tables.allocated.remove(&spi);
        }
    }

    fn install_child_sa(&self, sa: &KernelSa) -> Result<()> {
        let injected = self
            .fail_installs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::KernelInstallFailure(format!(
                "injected failure for SPI {:08x}",
                sa.spi
            )));
        }

        let mut tables = self.tables();
        if sa.direction == Direction::Inbound && !tables.allocated.contains(&sa.spi) {
            return Err(Error::KernelInstallFailure(format!(
                "inbound SPI {:08x} was not allocated",
                sa.spi
            )));
        }
        if tables.installed.contains_key(&(sa.spi, sa.direction)) {
            return Err(Error::KernelInstallFailure(format!(
                "SPI {:08x} already installed",
                sa.spi
            )));
        }
        tables.installed.insert((sa.spi, sa.direction), sa.clone());
        Ok(())
    }

    fn remove_child_sa(&self, spi: u32, direction: Direction) -> Result<()> {
        let mut tables = self.tables();
        tables.removed.push((spi, direction));
        if direction == Direction::Inbound {
            tables.allocated.remove(&spi);
        }
        tables
            .installed
            .remove(&(spi, direction))
            .map(|_| ())
            .ok_or_else(|| Error::SaNotFound(format!("{:08x}/{:?}", spi, direction)))
    }
}
