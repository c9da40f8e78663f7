//! NAT Traversal (NAT-T)
//!
//! NAT detection during IKE_SA_INIT (RFC 7296 Section 2.23) and the non-ESP
//! marker used when IKE shares UDP port 4500 with ESP (RFC 3948).
//!
//! # NAT Detection Algorithm
//!
//! ```text
//! HASH = SHA-1(SPIi | SPIr | IP | Port)
//!
//! Each peer sends:
//! - NAT_DETECTION_SOURCE_IP: HASH over its own address
//! - NAT_DETECTION_DESTINATION_IP: HASH over the address it sends to
//! ```
//!
//! A received source hash that does not match the address the datagram came
//! from means the peer is behind a NAT; a destination hash that does not
//! match our own address means we are.

use std::net::{IpAddr, SocketAddr};

use sha1::{Digest, Sha1};

use crate::ipsec::ikev2::constants::NotifyType;
use crate::ipsec::ikev2::message::IkeMessage;
use crate::ipsec::ikev2::payload::NotifyPayload;

/// Default IKE port (UDP 500)
pub const IKE_PORT: u16 = 500;

/// NAT-T port (UDP 4500)
pub const NAT_T_PORT: u16 = 4500;

/// Non-ESP marker prepended to IKE messages on port 4500
pub const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

/// `SHA-1(SPIi | SPIr | IP | Port)`
pub fn detection_hash(spi_i: &[u8; 8], spi_r: &[u8; 8], addr: SocketAddr) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(spi_i);
    hasher.update(spi_r);
    match addr.ip() {
        IpAddr::V4(ip) => hasher.update(ip.octets()),
        IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(addr.port().to_be_bytes());

    let mut hash = [0u8; 20];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// NAT Detection Result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatStatus {
    /// No NAT detected
    NoNat,

    /// We are behind a NAT
    LocalNat,

    /// The peer is behind a NAT
    RemoteNat,

    /// NAT detected on both sides
    BothNat,
}

impl NatStatus {
    /// Check if any NAT is present
    pub fn is_nat_present(&self) -> bool {
        !matches!(self, NatStatus::NoNat)
    }

    /// Check if local NAT is present
    pub fn has_local_nat(&self) -> bool {
        matches!(self, NatStatus::LocalNat | NatStatus::BothNat)
    }

    /// Check if remote NAT is present
    pub fn has_remote_nat(&self) -> bool {
        matches!(self, NatStatus::RemoteNat | NatStatus::BothNat)
    }
}

/// The two NAT-D notifies for an IKE_SA_INIT message sent from `local` to
/// `remote`
pub fn detection_notifies(
    spi_i: &[u8; 8],
    spi_r: &[u8; 8],
    local: SocketAddr,
    remote: SocketAddr,
) -> [NotifyPayload; 2] {
    [
        NotifyPayload::new(
            NotifyType::NatDetectionSourceIp,
            detection_hash(spi_i, spi_r, local).to_vec(),
        ),
        NotifyPayload::new(
            NotifyType::NatDetectionDestinationIp,
            detection_hash(spi_i, spi_r, remote).to_vec(),
        ),
    ]
}

/// Evaluate the NAT-D notifies of a received IKE_SA_INIT message
///
/// `local` is the address the message arrived on, `remote` the address it
/// came from. Returns `None` if the peer does not support NAT detection.
/// A peer may send several source hashes (multi-homed); any match counts.
pub fn detect(
    message: &IkeMessage,
    spi_i: &[u8; 8],
    spi_r: &[u8; 8],
    local: SocketAddr,
    remote: SocketAddr,
) -> Option<NatStatus> {
    let dest = message.notify(NotifyType::NatDetectionDestinationIp)?;
    let mut sources = message
        .notifies()
        .filter(|n| n.notify_type == NotifyType::NatDetectionSourceIp)
        .peekable();
    sources.peek()?;

    let expected_source = detection_hash(spi_i, spi_r, remote);
    let remote_nat = !sources.any(|n| n.data == expected_source);
    let local_nat = dest.data != detection_hash(spi_i, spi_r, local);

    Some(match (local_nat, remote_nat) {
        (false, false) => NatStatus::NoNat,
        (true, false) => NatStatus::LocalNat,
        (false, true) => NatStatus::RemoteNat,
        (true, true) => NatStatus::BothNat,
    })
}

/// Prefix an IKE message with the non-ESP marker
pub fn add_non_esp_marker(msg: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(NON_ESP_MARKER.len() + msg.len());
    out.extend_from_slice(&NON_ESP_MARKER);
    out.extend_from_slice(msg);
    out
}

/// Strip the non-ESP marker from a port-4500 datagram
///
/// Returns `None` for ESP packets (a non-zero SPI where the marker would be)
/// and for datagrams too short to carry one.
pub fn strip_non_esp_marker(datagram: &[u8]) -> Option<&[u8]> {
    datagram.strip_prefix(&NON_ESP_MARKER[..])
}
