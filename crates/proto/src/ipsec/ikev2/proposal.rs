//! IKEv2 Proposal and Transform structures
//!
//! Implements SA proposal negotiation as defined in RFC 7296 Section 3.3.
//!
//! # Structure
//!
//! ```text
//! SA Payload
//!   └── Proposal(s)          (ordered by the initiator's preference)
//!         └── Transform(s)   (alternatives per transform type)
//! ```
//!
//! Selection is first-match: the responder walks the initiator's proposals in
//! order and takes the first one that one of its own configured proposals can
//! satisfy, picking for each transform type the first alternative the
//! initiator listed that is also configured locally.

use crate::ipsec::{Error, Result};

/// Transform attribute type carrying the key length in bits
pub const ATTR_KEY_LENGTH: u16 = 14;

/// Transform Type (RFC 7296 Section 3.3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransformType {
    /// Encryption Algorithm (ENCR)
    Encr,
    /// Pseudo-random Function (PRF)
    Prf,
    /// Integrity Algorithm (INTEG)
    Integ,
    /// Diffie-Hellman Group (D-H)
    Dh,
    /// Extended Sequence Numbers (ESN)
    Esn,
    /// Transform type we do not know
    Other(u8),
}

impl TransformType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => TransformType::Encr,
            2 => TransformType::Prf,
            3 => TransformType::Integ,
            4 => TransformType::Dh,
            5 => TransformType::Esn,
            other => TransformType::Other(other),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        match self {
            TransformType::Encr => 1,
            TransformType::Prf => 2,
            TransformType::Integ => 3,
            TransformType::Dh => 4,
            TransformType::Esn => 5,
            TransformType::Other(value) => value,
        }
    }
}

/// Transform ID for Encryption (ENCR) algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EncrTransformId {
    /// AES-CBC (key length attribute required)
    AesCbc = 12,
    /// AES-GCM with 16-byte ICV (key length attribute required)
    AesGcm16 = 20,
    /// ChaCha20-Poly1305 (RFC 7634)
    ChaCha20Poly1305 = 28,
}

impl EncrTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            12 => Some(EncrTransformId::AesCbc),
            20 => Some(EncrTransformId::AesGcm16),
            28 => Some(EncrTransformId::ChaCha20Poly1305),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Check if this is an AEAD cipher
    pub fn is_aead(self) -> bool {
        matches!(
            self,
            EncrTransformId::AesGcm16 | EncrTransformId::ChaCha20Poly1305
        )
    }

    /// Length of keying material drawn from prf+ for this cipher
    ///
    /// AEAD ciphers take 4 extra bytes of salt (RFC 5282, RFC 7634).
    pub fn keymat_len(self, key_length_bits: Option<u16>) -> Result<usize> {
        match self {
            EncrTransformId::ChaCha20Poly1305 => Ok(32 + 4),
            EncrTransformId::AesGcm16 | EncrTransformId::AesCbc => {
                let bits = key_length_bits.ok_or_else(|| {
                    Error::InvalidPayload("AES transform without key length".into())
                })?;
                if !matches!(bits, 128 | 192 | 256) {
                    return Err(Error::InvalidPayload(format!(
                        "Unsupported AES key length: {}",
                        bits
                    )));
                }
                let salt = if self.is_aead() { 4 } else { 0 };
                Ok(bits as usize / 8 + salt)
            }
        }
    }
}

/// Transform ID for PRF algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum PrfTransformId {
    /// HMAC-SHA2-256
    HmacSha256 = 5,
    /// HMAC-SHA2-384
    HmacSha384 = 6,
    /// HMAC-SHA2-512
    HmacSha512 = 7,
}

impl PrfTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            5 => Some(PrfTransformId::HmacSha256),
            6 => Some(PrfTransformId::HmacSha384),
            7 => Some(PrfTransformId::HmacSha512),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Transform ID for Integrity algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum IntegTransformId {
    /// HMAC-SHA2-256-128
    HmacSha256_128 = 12,
    /// HMAC-SHA2-384-192
    HmacSha384_192 = 13,
    /// HMAC-SHA2-512-256
    HmacSha512_256 = 14,
}

impl IntegTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            12 => Some(IntegTransformId::HmacSha256_128),
            13 => Some(IntegTransformId::HmacSha384_192),
            14 => Some(IntegTransformId::HmacSha512_256),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    /// Integrity key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            IntegTransformId::HmacSha256_128 => 32,
            IntegTransformId::HmacSha384_192 => 48,
            IntegTransformId::HmacSha512_256 => 64,
        }
    }
}

/// Transform ID for Diffie-Hellman groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum DhTransformId {
    /// 2048-bit MODP Group
    Modp2048 = 14,
    /// Curve25519
    Curve25519 = 31,
}

impl DhTransformId {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            14 => Some(DhTransformId::Modp2048),
            31 => Some(DhTransformId::Curve25519),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Transform ID for Extended Sequence Numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EsnTransformId {
    /// 32-bit sequence numbers
    NoEsn = 0,
    /// 64-bit extended sequence numbers
    Esn = 1,
}

/// IKE Transform
///
/// Represents a single cryptographic algorithm choice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// Transform type
    pub transform_type: TransformType,

    /// Transform ID
    pub transform_id: u16,

    /// Key length attribute in bits, if present
    pub key_length: Option<u16>,
}

impl Transform {
    /// Transform header size
    pub const HEADER_SIZE: usize = 8;

    /// Create new transform
    pub fn new(transform_type: TransformType, transform_id: u16) -> Self {
        Transform {
            transform_type,
            transform_id,
            key_length: None,
        }
    }

    /// Create encryption transform
    pub fn encr(id: EncrTransformId, key_length: Option<u16>) -> Self {
        Transform {
            key_length,
            ..Transform::new(TransformType::Encr, id.to_u16())
        }
    }

    /// Create PRF transform
    pub fn prf(id: PrfTransformId) -> Self {
        Transform::new(TransformType::Prf, id.to_u16())
    }

    /// Create integrity transform
    pub fn integ(id: IntegTransformId) -> Self {
        Transform::new(TransformType::Integ, id.to_u16())
    }

    /// Create DH group transform
    pub fn dh(id: DhTransformId) -> Self {
        Transform::new(TransformType::Dh, id.to_u16())
    }

    /// Create ESN transform
    pub fn esn(id: EsnTransformId) -> Self {
        Transform::new(TransformType::Esn, id as u16)
    }

    /// Same algorithm, including key length
    pub fn is_compatible_with(&self, other: &Transform) -> bool {
        self.transform_type == other.transform_type
            && self.transform_id == other.transform_id
            && self.key_length == other.key_length
    }

    /// Serialize transform substructure (RFC 7296 Section 3.3.2)
    pub fn to_bytes(&self, is_last: bool) -> Vec<u8> {
        let attr_len = if self.key_length.is_some() { 4 } else { 0 };
        let total_len = Self::HEADER_SIZE + attr_len;

        let mut bytes = Vec::with_capacity(total_len);
        bytes.push(if is_last { 0 } else { 3 });
        bytes.push(0);
        bytes.extend_from_slice(&(total_len as u16).to_be_bytes());
        bytes.push(self.transform_type.to_u8());
        bytes.push(0);
        bytes.extend_from_slice(&self.transform_id.to_be_bytes());

        if let Some(bits) = self.key_length {
            // TV format: AF bit set, fixed 2-byte value
            bytes.extend_from_slice(&(0x8000 | ATTR_KEY_LENGTH).to_be_bytes());
            bytes.extend_from_slice(&bits.to_be_bytes());
        }

        bytes
    }

    /// Parse transform substructure
    ///
    /// Returns the transform, whether it was the last one, and the bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Result<(Self, bool, usize)> {
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: Self::HEADER_SIZE,
                available: data.len(),
            });
        }

        let is_last = match data[0] {
            0 => true,
            3 => false,
            other => {
                return Err(Error::InvalidPayload(format!(
                    "Invalid transform last-substruc value: {}",
                    other
                )))
            }
        };

        let transform_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if transform_len < Self::HEADER_SIZE || transform_len > data.len() {
            return Err(Error::InvalidLength {
                expected: Self::HEADER_SIZE,
                actual: transform_len,
            });
        }

        let transform_type = TransformType::from_u8(data[4]);
        let transform_id = u16::from_be_bytes([data[6], data[7]]);

        let mut key_length = None;
        let mut offset = Self::HEADER_SIZE;
        while offset < transform_len {
            if transform_len - offset < 4 {
                return Err(Error::InvalidPayload("Truncated transform attribute".into()));
            }
            let raw_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
            let value = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
            if raw_type & 0x8000 != 0 {
                if raw_type & 0x7fff == ATTR_KEY_LENGTH {
                    key_length = Some(value);
                }
                offset += 4;
            } else {
                // TLV attribute: skip over it
                offset += 4 + value as usize;
            }
        }
        if offset != transform_len {
            return Err(Error::InvalidPayload("Transform attribute overrun".into()));
        }

        Ok((
            Transform {
                transform_type,
                transform_id,
                key_length,
            },
            is_last,
            transform_len,
        ))
    }
}

/// Protocol ID for proposals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolId {
    /// IKE SA
    Ike = 1,
    /// AH (Authentication Header)
    Ah = 2,
    /// ESP (Encapsulating Security Payload)
    Esp = 3,
}

impl ProtocolId {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolId::Ike),
            2 => Some(ProtocolId::Ah),
            3 => Some(ProtocolId::Esp),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// IKE Proposal
///
/// Represents a single proposal containing one or more transforms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    /// Proposal number (1-based)
    pub proposal_num: u8,

    /// Protocol ID (IKE, ESP, AH)
    pub protocol_id: ProtocolId,

    /// SPI (empty in IKE_SA_INIT, 8 bytes for IKE rekey, 4 bytes for ESP/AH)
    pub spi: Vec<u8>,

    /// List of transforms
    pub transforms: Vec<Transform>,
}

impl Proposal {
    /// Proposal header size (without SPI)
    pub const HEADER_SIZE: usize = 8;

    /// Create new proposal
    pub fn new(proposal_num: u8, protocol_id: ProtocolId) -> Self {
        Proposal {
            proposal_num,
            protocol_id,
            spi: Vec::new(),
            transforms: Vec::new(),
        }
    }

    /// Add transform to proposal
    pub fn add_transform(mut self, transform: Transform) -> Self {
        self.transforms.push(transform);
        self
    }

    /// Set SPI
    pub fn with_spi(mut self, spi: Vec<u8>) -> Self {
        self.spi = spi;
        self
    }

    /// Get first transform of a type
    pub fn get_transform(&self, transform_type: TransformType) -> Option<&Transform> {
        self.transforms
            .iter()
            .find(|t| t.transform_type == transform_type)
    }

    /// Negotiated DH group, if the proposal carries one
    pub fn dh_group(&self) -> Option<u16> {
        self.get_transform(TransformType::Dh)
            .map(|t| t.transform_id)
            .filter(|id| *id != 0)
    }

    /// SPI as a 32-bit ESP/AH value
    pub fn spi_u32(&self) -> Option<u32> {
        <[u8; 4]>::try_from(self.spi.as_slice())
            .ok()
            .map(u32::from_be_bytes)
    }

    /// SPI as an 8-byte IKE value
    pub fn spi_ike(&self) -> Option<[u8; 8]> {
        <[u8; 8]>::try_from(self.spi.as_slice()).ok()
    }

    fn transform_types(&self) -> Vec<TransformType> {
        let mut types: Vec<TransformType> =
            self.transforms.iter().map(|t| t.transform_type).collect();
        types.sort();
        types.dedup();
        types
    }

    /// Pick one transform per type from `self` (the peer's offer) that the
    /// configured proposal also lists. Alternatives are tried in the order
    /// the peer listed them.
    pub fn select(&self, configured: &Proposal) -> Option<Proposal> {
        if configured.protocol_id != self.protocol_id {
            return None;
        }

        let types = configured.transform_types();
        if types != self.transform_types() {
            return None;
        }

        let mut chosen = Vec::with_capacity(types.len());
        for transform_type in types {
            let pick = self
                .transforms
                .iter()
                .filter(|t| t.transform_type == transform_type)
                .find(|offered| {
                    configured
                        .transforms
                        .iter()
                        .any(|local| offered.is_compatible_with(local))
                })?;
            chosen.push(pick.clone());
        }

        Some(Proposal {
            proposal_num: self.proposal_num,
            protocol_id: self.protocol_id,
            spi: self.spi.clone(),
            transforms: chosen,
        })
    }

    /// Check that a proposal chosen by the peer is one we could have offered:
    /// one transform per type, each listed in our proposal with the same number.
    pub fn is_selection_of(&self, offered: &[Proposal]) -> bool {
        let Some(ours) = offered
            .iter()
            .find(|p| p.proposal_num == self.proposal_num && p.protocol_id == self.protocol_id)
        else {
            return false;
        };

        let types = self.transform_types();
        types.len() == self.transforms.len()
            && types == ours.transform_types()
            && self
                .transforms
                .iter()
                .all(|t| ours.transforms.iter().any(|o| t.is_compatible_with(o)))
    }

    /// Serialize proposal substructure (RFC 7296 Section 3.3.1)
    pub fn to_bytes(&self, is_last: bool) -> Vec<u8> {
        let count = self.transforms.len();
        let transform_bytes: Vec<u8> = self
            .transforms
            .iter()
            .enumerate()
            .flat_map(|(i, t)| t.to_bytes(i + 1 == count))
            .collect();

        let total_len = Self::HEADER_SIZE + self.spi.len() + transform_bytes.len();

        let mut bytes = Vec::with_capacity(total_len);
        bytes.push(if is_last { 0 } else { 2 });
        bytes.push(0);
        bytes.extend_from_slice(&(total_len as u16).to_be_bytes());
        bytes.push(self.proposal_num);
        bytes.push(self.protocol_id.to_u8());
        bytes.push(self.spi.len() as u8);
        bytes.push(count as u8);
        bytes.extend_from_slice(&self.spi);
        bytes.extend_from_slice(&transform_bytes);
        bytes
    }

    /// Parse proposal substructure
    pub fn from_bytes(data: &[u8]) -> Result<(Self, bool, usize)> {
        if data.len() < Self::HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: Self::HEADER_SIZE,
                available: data.len(),
            });
        }

        let is_last = match data[0] {
            0 => true,
            2 => false,
            other => {
                return Err(Error::InvalidPayload(format!(
                    "Invalid proposal last-substruc value: {}",
                    other
                )))
            }
        };

        let proposal_len = u16::from_be_bytes([data[2], data[3]]) as usize;
        if proposal_len < Self::HEADER_SIZE || proposal_len > data.len() {
            return Err(Error::InvalidLength {
                expected: Self::HEADER_SIZE,
                actual: proposal_len,
            });
        }

        let proposal_num = data[4];
        let protocol_id = ProtocolId::from_u8(data[5])
            .ok_or_else(|| Error::InvalidPayload(format!("Unknown protocol ID: {}", data[5])))?;
        let spi_size = data[6] as usize;
        let num_transforms = data[7] as usize;

        let spi_end = Self::HEADER_SIZE + spi_size;
        if spi_end > proposal_len {
            return Err(Error::InvalidPayload("SPI exceeds proposal length".into()));
        }
        let spi = data[Self::HEADER_SIZE..spi_end].to_vec();

        let mut transforms = Vec::with_capacity(num_transforms);
        let mut offset = spi_end;
        for i in 0..num_transforms {
            let (transform, last, consumed) = Transform::from_bytes(&data[offset..proposal_len])?;
            transforms.push(transform);
            offset += consumed;
            if last != (i + 1 == num_transforms) {
                return Err(Error::InvalidPayload(
                    "Transform count does not match last-substruc markers".into(),
                ));
            }
        }

        if offset != proposal_len {
            return Err(Error::InvalidLength {
                expected: proposal_len,
                actual: offset,
            });
        }

        Ok((
            Proposal {
                proposal_num,
                protocol_id,
                spi,
                transforms,
            },
            is_last,
            proposal_len,
        ))
    }
}

/// Select the first proposal from the peer's ordered offer that any locally
/// configured proposal accepts.
///
/// # Errors
///
/// Returns `NoProposalChosen` if nothing in the offer is acceptable.
pub fn select_proposal(offered: &[Proposal], configured: &[Proposal]) -> Result<Proposal> {
    offered
        .iter()
        .find_map(|offer| configured.iter().find_map(|local| offer.select(local)))
        .ok_or(Error::NoProposalChosen)
}
