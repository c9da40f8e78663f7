//! IKEv2 Payload structures and parsing
//!
//! Implements IKE payloads as defined in RFC 7296 Section 3.2. Each payload
//! type knows how to parse and serialize its body; the generic header and the
//! chaining of `next_payload` values are handled by [`parse_payload_chain`]
//! and [`encode_payload_chain`].

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::constants::{NotifyType, PayloadType};
use super::proposal::{Proposal, ProtocolId};
use crate::ipsec::{Error, Result};

/// Generic IKE payload header (4 bytes)
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | Next Payload  |C|  RESERVED   |         Payload Length        |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Raw next payload type
    pub next_payload: u8,

    /// Critical bit (if set, the receiver must understand this payload)
    pub critical: bool,

    /// Total payload length including header (4 bytes + data)
    pub length: u16,
}

impl PayloadHeader {
    /// Payload header size
    pub const SIZE: usize = 4;

    /// Create new payload header
    pub fn new(next_payload: u8, critical: bool, length: u16) -> Self {
        PayloadHeader {
            next_payload,
            critical,
            length,
        }
    }

    /// Parse payload header from bytes
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is too short or the length field is smaller
    /// than the header itself
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(Error::BufferTooShort {
                required: Self::SIZE,
                available: data.len(),
            });
        }

        let length = u16::from_be_bytes([data[2], data[3]]);
        if (length as usize) < Self::SIZE {
            return Err(Error::InvalidLength {
                expected: Self::SIZE,
                actual: length as usize,
            });
        }

        Ok(PayloadHeader {
            next_payload: data[0],
            critical: (data[1] & 0x80) != 0,
            length,
        })
    }

    /// Serialize payload header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.next_payload;
        bytes[1] = if self.critical { 0x80 } else { 0x00 };
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes
    }

    /// Get payload data length (excluding header)
    pub fn data_length(&self) -> usize {
        self.length as usize - Self::SIZE
    }
}

/// IKE payloads carried in a message (outside or inside the SK envelope)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IkePayload {
    /// Security Association payload
    SA(SaPayload),

    /// Key Exchange payload
    KE(KePayload),

    /// Identification payload (Initiator)
    IDi(Identity),

    /// Identification payload (Responder)
    IDr(Identity),

    /// Authentication payload
    AUTH(AuthPayload),

    /// Nonce payload
    Nonce(NoncePayload),

    /// Notify payload
    Notify(NotifyPayload),

    /// Delete payload
    Delete(DeletePayload),

    /// Traffic selectors (Initiator)
    TSi(TsPayload),

    /// Traffic selectors (Responder)
    TSr(TsPayload),

    /// Payload type we do not interpret, kept verbatim
    Unknown {
        /// Raw payload type
        payload_type: u8,
        /// Critical bit as received
        critical: bool,
        /// Raw payload data (excluding header)
        data: Vec<u8>,
    },
}

impl IkePayload {
    /// Raw payload type value
    pub fn type_value(&self) -> u8 {
        match self {
            IkePayload::SA(_) => PayloadType::SA.to_u8(),
            IkePayload::KE(_) => PayloadType::KE.to_u8(),
            IkePayload::IDi(_) => PayloadType::IDi.to_u8(),
            IkePayload::IDr(_) => PayloadType::IDr.to_u8(),
            IkePayload::AUTH(_) => PayloadType::AUTH.to_u8(),
            IkePayload::Nonce(_) => PayloadType::Nonce.to_u8(),
            IkePayload::Notify(_) => PayloadType::N.to_u8(),
            IkePayload::Delete(_) => PayloadType::D.to_u8(),
            IkePayload::TSi(_) => PayloadType::TSi.to_u8(),
            IkePayload::TSr(_) => PayloadType::TSr.to_u8(),
            IkePayload::Unknown { payload_type, .. } => *payload_type,
        }
    }

    fn critical(&self) -> bool {
        match self {
            IkePayload::Unknown { critical, .. } => *critical,
            _ => false,
        }
    }

    /// Serialize payload body (without generic header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        match self {
            IkePayload::SA(sa) => sa.to_payload_data(),
            IkePayload::KE(ke) => ke.to_payload_data(),
            IkePayload::IDi(id) | IkePayload::IDr(id) => id.to_payload_data(),
            IkePayload::AUTH(auth) => auth.to_payload_data(),
            IkePayload::Nonce(nonce) => nonce.to_payload_data(),
            IkePayload::Notify(notify) => notify.to_payload_data(),
            IkePayload::Delete(delete) => delete.to_payload_data(),
            IkePayload::TSi(ts) | IkePayload::TSr(ts) => ts.to_payload_data(),
            IkePayload::Unknown { data, .. } => data.clone(),
        }
    }

    /// Parse a payload body of the given type
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedCriticalPayload` for an unrecognized payload with the
    /// critical bit set
    pub fn from_payload_data(payload_type: u8, critical: bool, data: &[u8]) -> Result<Self> {
        let known = PayloadType::from_u8(payload_type);
        let payload = match known {
            Some(PayloadType::SA) => IkePayload::SA(SaPayload::from_payload_data(data)?),
            Some(PayloadType::KE) => IkePayload::KE(KePayload::from_payload_data(data)?),
            Some(PayloadType::IDi) => IkePayload::IDi(Identity::from_payload_data(data)?),
            Some(PayloadType::IDr) => IkePayload::IDr(Identity::from_payload_data(data)?),
            Some(PayloadType::AUTH) => IkePayload::AUTH(AuthPayload::from_payload_data(data)?),
            Some(PayloadType::Nonce) => {
                IkePayload::Nonce(NoncePayload::from_payload_data(data)?)
            }
            Some(PayloadType::N) => IkePayload::Notify(NotifyPayload::from_payload_data(data)?),
            Some(PayloadType::D) => IkePayload::Delete(DeletePayload::from_payload_data(data)?),
            Some(PayloadType::TSi) => IkePayload::TSi(TsPayload::from_payload_data(data)?),
            Some(PayloadType::TSr) => IkePayload::TSr(TsPayload::from_payload_data(data)?),
            _ => {
                if critical {
                    return Err(Error::UnsupportedCriticalPayload(payload_type));
                }
                IkePayload::Unknown {
                    payload_type,
                    critical,
                    data: data.to_vec(),
                }
            }
        };
        Ok(payload)
    }
}

/// Serialize a payload chain
///
/// Returns the type of the first payload (for the enclosing header) and the
/// concatenated payloads. `trailer_type` is written as the next payload of the
/// last element (used when an SK payload follows cleartext payloads).
pub fn encode_payload_chain(payloads: &[IkePayload], trailer_type: u8) -> (u8, Vec<u8>) {
    let first = payloads.first().map_or(trailer_type, |p| p.type_value());
    let mut out = Vec::new();

    for (i, payload) in payloads.iter().enumerate() {
        let next = payloads
            .get(i + 1)
            .map_or(trailer_type, |p| p.type_value());
        let body = payload.to_payload_data();
        let header = PayloadHeader::new(
            next,
            payload.critical(),
            (PayloadHeader::SIZE + body.len()) as u16,
        );
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&body);
    }

    (first, out)
}

/// A payload chain as parsed from the wire
#[derive(Debug)]
pub struct ParsedChain {
    /// Payloads up to (excluding) a trailing SK payload
    pub payloads: Vec<IkePayload>,
    /// Offset of the SK payload within the input, if the chain ends in one
    pub encrypted_at: Option<usize>,
}

/// Parse a payload chain starting with `first_type`
///
/// Parsing stops at an SK payload, which must be the last payload of a
/// message; its offset is returned so the caller can decrypt it.
///
/// # Errors
///
/// Returns `MalformedMessage` on length fields inconsistent with the buffer
pub fn parse_payload_chain(first_type: u8, data: &[u8]) -> Result<ParsedChain> {
    let mut payloads = Vec::new();
    let mut next = first_type;
    let mut offset = 0;

    while next != PayloadType::None.to_u8() {
        if next == PayloadType::SK.to_u8() {
            return Ok(ParsedChain {
                payloads,
                encrypted_at: Some(offset),
            });
        }

        let header = PayloadHeader::from_bytes(&data[offset..])
            .map_err(|e| Error::MalformedMessage(format!("payload header: {}", e)))?;
        let end = offset + header.length as usize;
        if end > data.len() {
            return Err(Error::MalformedMessage(format!(
                "payload {} claims {} bytes, {} available",
                next,
                header.length,
                data.len() - offset
            )));
        }

        let body = &data[offset + PayloadHeader::SIZE..end];
        let payload = IkePayload::from_payload_data(next, header.critical, body).map_err(
            |e| match e {
                Error::UnsupportedCriticalPayload(_) => e,
                other => Error::MalformedMessage(other.to_string()),
            },
        )?;
        payloads.push(payload);

        next = header.next_payload;
        offset = end;
    }

    if offset != data.len() {
        return Err(Error::MalformedMessage(format!(
            "{} trailing bytes after last payload",
            data.len() - offset
        )));
    }

    Ok(ParsedChain {
        payloads,
        encrypted_at: None,
    })
}

/// Nonce Payload (RFC 7296 Section 3.9)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoncePayload {
    /// Nonce data
    pub nonce: Vec<u8>,
}

impl NoncePayload {
    /// Minimum nonce size (16 bytes)
    pub const MIN_SIZE: usize = 16;

    /// Maximum nonce size (256 bytes)
    pub const MAX_SIZE: usize = 256;

    /// Create new nonce payload
    pub fn new(nonce: Vec<u8>) -> Result<Self> {
        if nonce.len() < Self::MIN_SIZE || nonce.len() > Self::MAX_SIZE {
            return Err(Error::InvalidPayload(format!(
                "Nonce length {} outside {}..={}",
                nonce.len(),
                Self::MIN_SIZE,
                Self::MAX_SIZE
            )));
        }
        Ok(NoncePayload { nonce })
    }

    /// Parse nonce payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        Self::new(data.to_vec())
    }

    /// Serialize nonce payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        self.nonce.clone()
    }
}

/// Key Exchange Payload (RFC 7296 Section 3.4)
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |   Diffie-Hellman Group Num    |           RESERVED            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ~                       Key Exchange Data                       ~
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KePayload {
    /// Diffie-Hellman group number
    pub dh_group: u16,

    /// Key exchange data (public value)
    pub key_data: Vec<u8>,
}

impl KePayload {
    /// Create new KE payload
    pub fn new(dh_group: u16, key_data: Vec<u8>) -> Self {
        KePayload { dh_group, key_data }
    }

    /// Parse KE payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        Ok(KePayload {
            dh_group: u16::from_be_bytes([data[0], data[1]]),
            key_data: data[4..].to_vec(),
        })
    }

    /// Serialize KE payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.key_data.len());
        data.extend_from_slice(&self.dh_group.to_be_bytes());
        data.extend_from_slice(&[0u8, 0u8]);
        data.extend_from_slice(&self.key_data);
        data
    }
}

/// Security Association Payload (RFC 7296 Section 3.3)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaPayload {
    /// Proposals in order of preference
    pub proposals: Vec<Proposal>,
}

impl SaPayload {
    /// Create new SA payload
    pub fn new(proposals: Vec<Proposal>) -> Self {
        SaPayload { proposals }
    }

    /// Parse SA payload from data (without header)
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        let mut proposals = Vec::new();
        let mut offset = 0;

        loop {
            let (proposal, last, consumed) = Proposal::from_bytes(&data[offset..])?;
            proposals.push(proposal);
            offset += consumed;
            if last {
                break;
            }
            if offset >= data.len() {
                return Err(Error::InvalidPayload(
                    "SA payload ends before last proposal".into(),
                ));
            }
        }

        if offset != data.len() {
            return Err(Error::InvalidPayload(
                "Trailing data after last proposal".into(),
            ));
        }

        Ok(SaPayload { proposals })
    }

    /// Serialize SA payload to bytes (without header)
    pub fn to_payload_data(&self) -> Vec<u8> {
        let count = self.proposals.len();
        self.proposals
            .iter()
            .enumerate()
            .flat_map(|(i, p)| p.to_bytes(i + 1 == count))
            .collect()
    }
}

/// Identification type (RFC 7296 Section 3.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdType {
    /// ID_IPV4_ADDR
    Ipv4Addr = 1,
    /// ID_FQDN
    Fqdn = 2,
    /// ID_RFC822_ADDR
    Rfc822Addr = 3,
    /// ID_IPV6_ADDR
    Ipv6Addr = 5,
    /// ID_DER_ASN1_DN
    DerAsn1Dn = 9,
    /// ID_DER_ASN1_GN
    DerAsn1Gn = 10,
    /// ID_KEY_ID
    KeyId = 11,
}

impl IdType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IdType::Ipv4Addr),
            2 => Some(IdType::Fqdn),
            3 => Some(IdType::Rfc822Addr),
            5 => Some(IdType::Ipv6Addr),
            9 => Some(IdType::DerAsn1Dn),
            10 => Some(IdType::DerAsn1Gn),
            11 => Some(IdType::KeyId),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Peer identity as carried in IDi/IDr payloads
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Identification type
    pub id_type: IdType,

    /// Identification data
    pub data: Vec<u8>,
}

impl Identity {
    /// Create new identity
    pub fn new(id_type: IdType, data: Vec<u8>) -> Self {
        Identity { id_type, data }
    }

    /// FQDN identity
    pub fn fqdn(fqdn: &str) -> Self {
        Identity::new(IdType::Fqdn, fqdn.as_bytes().to_vec())
    }

    /// RFC 822 (email) identity
    pub fn email(email: &str) -> Self {
        Identity::new(IdType::Rfc822Addr, email.as_bytes().to_vec())
    }

    /// Key ID identity
    pub fn key_id(key_id: &[u8]) -> Self {
        Identity::new(IdType::KeyId, key_id.to_vec())
    }

    /// IP address identity
    pub fn address(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Identity::new(IdType::Ipv4Addr, v4.octets().to_vec()),
            IpAddr::V6(v6) => Identity::new(IdType::Ipv6Addr, v6.octets().to_vec()),
        }
    }

    /// Parse ID payload body
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let id_type = IdType::from_u8(data[0])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown ID type: {}", data[0])))?;

        Ok(Identity {
            id_type,
            data: data[4..].to_vec(),
        })
    }

    /// Serialize ID payload body, which is also the ID' input to AUTH
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.data.len());
        bytes.push(self.id_type.to_u8());
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id_type {
            IdType::Fqdn | IdType::Rfc822Addr => {
                write!(f, "{}", String::from_utf8_lossy(&self.data))
            }
            IdType::Ipv4Addr if self.data.len() == 4 => write!(
                f,
                "{}",
                Ipv4Addr::new(self.data[0], self.data[1], self.data[2], self.data[3])
            ),
            IdType::Ipv6Addr if self.data.len() == 16 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.data);
                write!(f, "{}", Ipv6Addr::from(octets))
            }
            _ => write!(f, "{:?}:{}", self.id_type, hex::encode(&self.data)),
        }
    }
}

/// Authentication method (RFC 7296 Section 3.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    /// RSA Digital Signature
    RsaSig = 1,
    /// Shared Key Message Integrity Code
    SharedKeyMic = 2,
    /// DSS Digital Signature
    DssSig = 3,
    /// Digital Signature (RFC 7427)
    DigitalSignature = 14,
}

impl AuthMethod {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AuthMethod::RsaSig),
            2 => Some(AuthMethod::SharedKeyMic),
            3 => Some(AuthMethod::DssSig),
            14 => Some(AuthMethod::DigitalSignature),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Authentication Payload (RFC 7296 Section 3.8)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthPayload {
    /// Authentication method
    pub auth_method: AuthMethod,

    /// Authentication data
    pub auth_data: Vec<u8>,
}

impl AuthPayload {
    /// Create new AUTH payload
    pub fn new(auth_method: AuthMethod, auth_data: Vec<u8>) -> Self {
        AuthPayload {
            auth_method,
            auth_data,
        }
    }

    /// Parse AUTH payload body
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let auth_method = AuthMethod::from_u8(data[0]).ok_or_else(|| {
            Error::InvalidPayload(format!("Unknown auth method: {}", data[0]))
        })?;

        Ok(AuthPayload {
            auth_method,
            auth_data: data[4..].to_vec(),
        })
    }

    /// Serialize AUTH payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.auth_data.len());
        bytes.push(self.auth_method.to_u8());
        bytes.extend_from_slice(&[0u8; 3]);
        bytes.extend_from_slice(&self.auth_data);
        bytes
    }
}

/// Notify Payload (RFC 7296 Section 3.10)
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Protocol ID  |   SPI Size    |      Notify Message Type      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ~                Security Parameter Index (SPI)                 ~
/// ~                       Notification Data                       ~
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyPayload {
    /// Protocol ID (0 when not SA-specific)
    pub protocol_id: u8,

    /// SPI the notify refers to (may be empty)
    pub spi: Vec<u8>,

    /// Notify message type
    pub notify_type: NotifyType,

    /// Notification data
    pub data: Vec<u8>,
}

impl NotifyPayload {
    /// Notify not bound to an SA
    pub fn new(notify_type: NotifyType, data: Vec<u8>) -> Self {
        NotifyPayload {
            protocol_id: 0,
            spi: Vec::new(),
            notify_type,
            data,
        }
    }

    /// Notify referring to a CHILD_SA SPI
    pub fn with_child_spi(notify_type: NotifyType, protocol: ProtocolId, spi: u32) -> Self {
        NotifyPayload {
            protocol_id: protocol.to_u8(),
            spi: spi.to_be_bytes().to_vec(),
            notify_type,
            data: Vec::new(),
        }
    }

    /// SPI as a 32-bit value
    pub fn spi_u32(&self) -> Option<u32> {
        <[u8; 4]>::try_from(self.spi.as_slice())
            .ok()
            .map(u32::from_be_bytes)
    }

    /// Parse notify payload body
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let spi_size = data[1] as usize;
        if data.len() < 4 + spi_size {
            return Err(Error::BufferTooShort {
                required: 4 + spi_size,
                available: data.len(),
            });
        }

        Ok(NotifyPayload {
            protocol_id: data[0],
            spi: data[4..4 + spi_size].to_vec(),
            notify_type: NotifyType::from_u16(u16::from_be_bytes([data[2], data[3]])),
            data: data[4 + spi_size..].to_vec(),
        })
    }

    /// Serialize notify payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.spi.len() + self.data.len());
        bytes.push(self.protocol_id);
        bytes.push(self.spi.len() as u8);
        bytes.extend_from_slice(&self.notify_type.to_u16().to_be_bytes());
        bytes.extend_from_slice(&self.spi);
        bytes.extend_from_slice(&self.data);
        bytes
    }
}

/// Delete Payload (RFC 7296 Section 3.11)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletePayload {
    /// Protocol of the SAs being deleted
    pub protocol_id: ProtocolId,

    /// SPIs being deleted (empty for the IKE_SA itself)
    pub spis: Vec<u32>,
}

impl DeletePayload {
    /// Delete the IKE_SA the message is sent under
    pub fn ike() -> Self {
        DeletePayload {
            protocol_id: ProtocolId::Ike,
            spis: Vec::new(),
        }
    }

    /// Delete ESP CHILD_SAs by their sender-inbound SPIs
    pub fn esp(spis: Vec<u32>) -> Self {
        DeletePayload {
            protocol_id: ProtocolId::Esp,
            spis,
        }
    }

    /// Parse delete payload body
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let protocol_id = ProtocolId::from_u8(data[0]).ok_or_else(|| {
            Error::InvalidPayload(format!("Unknown delete protocol: {}", data[0]))
        })?;
        let spi_size = data[1] as usize;
        let count = u16::from_be_bytes([data[2], data[3]]) as usize;

        match (protocol_id, spi_size) {
            (ProtocolId::Ike, 0) if count == 0 && data.len() == 4 => Ok(DeletePayload::ike()),
            (ProtocolId::Esp | ProtocolId::Ah, 4) if data.len() == 4 + 4 * count => {
                let spis = data[4..]
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                Ok(DeletePayload { protocol_id, spis })
            }
            _ => Err(Error::InvalidPayload(format!(
                "Inconsistent delete payload: protocol {:?}, spi size {}, {} SPIs in {} bytes",
                protocol_id,
                spi_size,
                count,
                data.len()
            ))),
        }
    }

    /// Serialize delete payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let spi_size = if self.protocol_id == ProtocolId::Ike {
            0
        } else {
            4
        };
        let mut bytes = Vec::with_capacity(4 + 4 * self.spis.len());
        bytes.push(self.protocol_id.to_u8());
        bytes.push(spi_size);
        bytes.extend_from_slice(&(self.spis.len() as u16).to_be_bytes());
        for spi in &self.spis {
            bytes.extend_from_slice(&spi.to_be_bytes());
        }
        bytes
    }
}

/// TS_IPV4_ADDR_RANGE
pub const TS_IPV4_ADDR_RANGE: u8 = 7;

/// TS_IPV6_ADDR_RANGE
pub const TS_IPV6_ADDR_RANGE: u8 = 8;

/// A single traffic selector (RFC 7296 Section 3.13.1)
///
/// Address and port ranges are inclusive. Protocol 0 means any protocol.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrafficSelector {
    /// IP protocol (0 = any)
    pub ip_protocol: u8,
    /// First port of the range
    pub start_port: u16,
    /// Last port of the range
    pub end_port: u16,
    /// First address of the range
    pub start_addr: IpAddr,
    /// Last address of the range
    pub end_addr: IpAddr,
}

impl TrafficSelector {
    /// Selector for an address range, any protocol and port
    pub fn range(start_addr: IpAddr, end_addr: IpAddr) -> Self {
        TrafficSelector {
            ip_protocol: 0,
            start_port: 0,
            end_port: 0xffff,
            start_addr,
            end_addr,
        }
    }

    /// Selector for a CIDR subnet
    pub fn subnet(network: IpAddr, prefix_len: u8) -> Result<Self> {
        match network {
            IpAddr::V4(v4) => {
                if prefix_len > 32 {
                    return Err(Error::InvalidParameter(format!(
                        "IPv4 prefix length {} out of range",
                        prefix_len
                    )));
                }
                let mask = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
                let start = u32::from(v4) & mask;
                let end = start | !mask;
                Ok(TrafficSelector::range(
                    IpAddr::V4(Ipv4Addr::from(start)),
                    IpAddr::V4(Ipv4Addr::from(end)),
                ))
            }
            IpAddr::V6(v6) => {
                if prefix_len > 128 {
                    return Err(Error::InvalidParameter(format!(
                        "IPv6 prefix length {} out of range",
                        prefix_len
                    )));
                }
                let mask = u128::MAX.checked_shl(128 - prefix_len as u32).unwrap_or(0);
                let start = u128::from(v6) & mask;
                let end = start | !mask;
                Ok(TrafficSelector::range(
                    IpAddr::V6(Ipv6Addr::from(start)),
                    IpAddr::V6(Ipv6Addr::from(end)),
                ))
            }
        }
    }

    /// Restrict to one protocol and port range
    pub fn with_protocol(mut self, ip_protocol: u8, start_port: u16, end_port: u16) -> Self {
        self.ip_protocol = ip_protocol;
        self.start_port = start_port;
        self.end_port = end_port;
        self
    }

    fn is_ipv4(&self) -> bool {
        self.start_addr.is_ipv4()
    }

    /// Intersection of two selectors, `None` if they do not overlap
    pub fn intersect(&self, other: &TrafficSelector) -> Option<TrafficSelector> {
        if self.is_ipv4() != other.is_ipv4() {
            return None;
        }

        let ip_protocol = match (self.ip_protocol, other.ip_protocol) {
            (0, p) | (p, 0) => p,
            (a, b) if a == b => a,
            _ => return None,
        };

        let start_port = self.start_port.max(other.start_port);
        let end_port = self.end_port.min(other.end_port);
        let start_addr = self.start_addr.max(other.start_addr);
        let end_addr = self.end_addr.min(other.end_addr);

        if start_port > end_port || start_addr > end_addr {
            return None;
        }

        Some(TrafficSelector {
            ip_protocol,
            start_port,
            end_port,
            start_addr,
            end_addr,
        })
    }

    /// Whether `other` lies entirely within this selector
    pub fn contains(&self, other: &TrafficSelector) -> bool {
        self.intersect(other).as_ref() == Some(other)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let (ts_type, start, end): (u8, Vec<u8>, Vec<u8>) = match (self.start_addr, self.end_addr)
        {
            (IpAddr::V4(s), IpAddr::V4(e)) => {
                (TS_IPV4_ADDR_RANGE, s.octets().to_vec(), e.octets().to_vec())
            }
            (IpAddr::V6(s), IpAddr::V6(e)) => {
                (TS_IPV6_ADDR_RANGE, s.octets().to_vec(), e.octets().to_vec())
            }
            // Mixed families cannot be built through the public constructors
            (s, e) => {
                let to_v6 = |a: IpAddr| match a {
                    IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                    IpAddr::V6(v6) => v6,
                };
                (
                    TS_IPV6_ADDR_RANGE,
                    to_v6(s).octets().to_vec(),
                    to_v6(e).octets().to_vec(),
                )
            }
        };

        let len = 8 + start.len() + end.len();
        let mut bytes = Vec::with_capacity(len);
        bytes.push(ts_type);
        bytes.push(self.ip_protocol);
        bytes.extend_from_slice(&(len as u16).to_be_bytes());
        bytes.extend_from_slice(&self.start_port.to_be_bytes());
        bytes.extend_from_slice(&self.end_port.to_be_bytes());
        bytes.extend_from_slice(&start);
        bytes.extend_from_slice(&end);
        bytes
    }

    fn from_bytes(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: data.len(),
            });
        }

        let len = u16::from_be_bytes([data[2], data[3]]) as usize;
        let addr_len = match data[0] {
            TS_IPV4_ADDR_RANGE => 4,
            TS_IPV6_ADDR_RANGE => 16,
            other => {
                return Err(Error::InvalidPayload(format!(
                    "Unsupported traffic selector type: {}",
                    other
                )))
            }
        };
        if len != 8 + 2 * addr_len || data.len() < len {
            return Err(Error::InvalidLength {
                expected: 8 + 2 * addr_len,
                actual: len,
            });
        }

        let addr = |bytes: &[u8]| -> IpAddr {
            if addr_len == 4 {
                IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
            } else {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(bytes);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };

        Ok((
            TrafficSelector {
                ip_protocol: data[1],
                start_port: u16::from_be_bytes([data[4], data[5]]),
                end_port: u16::from_be_bytes([data[6], data[7]]),
                start_addr: addr(&data[8..8 + addr_len]),
                end_addr: addr(&data[8 + addr_len..len]),
            },
            len,
        ))
    }
}

impl fmt::Display for TrafficSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_addr, self.end_addr)?;
        if self.ip_protocol != 0 || self.start_port != 0 || self.end_port != 0xffff {
            write!(
                f,
                "[{}/{}-{}]",
                self.ip_protocol, self.start_port, self.end_port
            )?;
        }
        Ok(())
    }
}

/// Narrow the peer's proposed selectors to the locally configured ones
///
/// # Errors
///
/// Returns `TsUnacceptable` if no proposed selector overlaps a local one.
pub fn narrow_selectors(
    proposed: &[TrafficSelector],
    local: &[TrafficSelector],
) -> Result<Vec<TrafficSelector>> {
    let mut narrowed: Vec<TrafficSelector> = Vec::new();
    for p in proposed {
        for l in local {
            if let Some(ts) = p.intersect(l) {
                if !narrowed.contains(&ts) {
                    narrowed.push(ts);
                }
            }
        }
    }

    if narrowed.is_empty() {
        return Err(Error::TsUnacceptable);
    }
    Ok(narrowed)
}

/// Traffic Selector Payload (RFC 7296 Section 3.13)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsPayload {
    /// Selectors
    pub selectors: Vec<TrafficSelector>,
}

impl TsPayload {
    /// Create new TS payload
    pub fn new(selectors: Vec<TrafficSelector>) -> Self {
        TsPayload { selectors }
    }

    /// Parse TS payload body
    pub fn from_payload_data(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: data.len(),
            });
        }

        let count = data[0] as usize;
        let mut selectors = Vec::with_capacity(count);
        let mut offset = 4;
        for _ in 0..count {
            let (ts, consumed) = TrafficSelector::from_bytes(&data[offset..])?;
            selectors.push(ts);
            offset += consumed;
        }

        if offset != data.len() {
            return Err(Error::InvalidPayload(
                "Traffic selector count does not match payload length".into(),
            ));
        }

        Ok(TsPayload { selectors })
    }

    /// Serialize TS payload body
    pub fn to_payload_data(&self) -> Vec<u8> {
        let mut bytes = vec![self.selectors.len() as u8, 0, 0, 0];
        for ts in &self.selectors {
            bytes.extend_from_slice(&ts.to_bytes());
        }
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::proposal::{DhTransformId, EncrTransformId, PrfTransformId, Transform};

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_payload_header_rejects_short_length() {
        let bytes = [0u8, 0x00, 0x00, 0x03];
        assert!(PayloadHeader::from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_chain_roundtrip_with_unknown_noncritical() {
        let payloads = vec![
            IkePayload::SA(SaPayload::new(vec![Proposal::new(1, ProtocolId::Ike)
                .add_transform(Transform::encr(EncrTransformId::AesGcm16, Some(128)))
                .add_transform(Transform::prf(PrfTransformId::HmacSha256))
                .add_transform(Transform::dh(DhTransformId::Curve25519))])),
            IkePayload::Nonce(NoncePayload::new(vec![7u8; 32]).unwrap()),
            IkePayload::Unknown {
                payload_type: 43,
                critical: false,
                data: b"vendor".to_vec(),
            },
            IkePayload::Notify(NotifyPayload::new(NotifyType::Cookie, vec![1, 2, 3, 4])),
        ];

        let (first, bytes) = encode_payload_chain(&payloads, 0);
        assert_eq!(first, PayloadType::SA.to_u8());

        let parsed = parse_payload_chain(first, &bytes).unwrap();
        assert_eq!(parsed.payloads, payloads);
        assert!(parsed.encrypted_at.is_none());
    }

    #[test]
    fn test_unknown_critical_payload_rejected() {
        let payloads = vec![IkePayload::Unknown {
            payload_type: 200,
            critical: true,
            data: vec![0; 4],
        }];
        let (first, bytes) = encode_payload_chain(&payloads, 0);
        assert_eq!(
            parse_payload_chain(first, &bytes).unwrap_err(),
            Error::UnsupportedCriticalPayload(200)
        );
    }

    #[test]
    fn test_truncated_chain_is_malformed() {
        let payloads = vec![IkePayload::Nonce(NoncePayload::new(vec![1u8; 16]).unwrap())];
        let (first, bytes) = encode_payload_chain(&payloads, 0);
        let err = parse_payload_chain(first, &bytes[..bytes.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::MalformedMessage(_)));
    }

    #[test]
    fn test_nonce_bounds() {
        assert!(NoncePayload::new(vec![0u8; 15]).is_err());
        assert!(NoncePayload::new(vec![0u8; 16]).is_ok());
        assert!(NoncePayload::new(vec![0u8; 257]).is_err());
    }

    #[test]
    fn test_delete_payload_formats() {
        let ike = DeletePayload::ike();
        assert_eq!(ike.to_payload_data(), vec![1, 0, 0, 0]);
        assert_eq!(DeletePayload::from_payload_data(&[1, 0, 0, 0]).unwrap(), ike);

        let esp = DeletePayload::esp(vec![0xc0ffee01, 0xc0ffee02]);
        let bytes = esp.to_payload_data();
        assert_eq!(bytes.len(), 12);
        assert_eq!(DeletePayload::from_payload_data(&bytes).unwrap(), esp);

        // Count says two SPIs, only one present
        assert!(DeletePayload::from_payload_data(&bytes[..8]).is_err());
    }

    #[test]
    fn test_notify_with_spi() {
        let notify = NotifyPayload::with_child_spi(NotifyType::RekeySa, ProtocolId::Esp, 0xdeadbeef);
        let parsed = NotifyPayload::from_payload_data(&notify.to_payload_data()).unwrap();
        assert_eq!(parsed.spi_u32(), Some(0xdeadbeef));
        assert_eq!(parsed.notify_type, NotifyType::RekeySa);
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(Identity::fqdn("gw.example.org").to_string(), "gw.example.org");
        assert_eq!(Identity::address(v4("192.0.2.1")).to_string(), "192.0.2.1");
    }

    #[test]
    fn test_subnet_selector() {
        let ts = TrafficSelector::subnet(v4("10.1.2.3"), 24).unwrap();
        assert_eq!(ts.start_addr, v4("10.1.2.0"));
        assert_eq!(ts.end_addr, v4("10.1.2.255"));

        let all = TrafficSelector::subnet(v4("0.0.0.0"), 0).unwrap();
        assert_eq!(all.end_addr, v4("255.255.255.255"));
    }

    #[test]
    fn test_narrowing_intersects_ranges() {
        let proposed = vec![TrafficSelector::subnet(v4("10.0.0.0"), 8).unwrap()];
        let local = vec![TrafficSelector::subnet(v4("10.1.0.0"), 16)
            .unwrap()
            .with_protocol(6, 443, 443)];

        let narrowed = narrow_selectors(&proposed, &local).unwrap();
        assert_eq!(narrowed.len(), 1);
        assert_eq!(narrowed[0].start_addr, v4("10.1.0.0"));
        assert_eq!(narrowed[0].ip_protocol, 6);
        assert_eq!(narrowed[0].start_port, 443);
        assert!(proposed[0].contains(&narrowed[0]));
    }

    #[test]
    fn test_narrowing_disjoint_is_unacceptable() {
        let proposed = vec![TrafficSelector::subnet(v4("10.0.0.0"), 24).unwrap()];
        let local = vec![TrafficSelector::subnet(v4("192.168.0.0"), 16).unwrap()];
        assert_eq!(
            narrow_selectors(&proposed, &local),
            Err(Error::TsUnacceptable)
        );

        let v6: Vec<TrafficSelector> =
            vec![TrafficSelector::subnet("2001:db8::".parse().unwrap(), 32).unwrap()];
        assert_eq!(narrow_selectors(&proposed, &v6), Err(Error::TsUnacceptable));
    }

    #[test]
    fn test_ts_payload_roundtrip_mixed_families() {
        let payload = TsPayload::new(vec![
            TrafficSelector::subnet(v4("172.16.0.0"), 12).unwrap(),
            TrafficSelector::subnet("2001:db8::".parse().unwrap(), 48)
                .unwrap()
                .with_protocol(17, 500, 500),
        ]);
        let parsed = TsPayload::from_payload_data(&payload.to_payload_data()).unwrap();
        assert_eq!(parsed, payload);
    }
}
