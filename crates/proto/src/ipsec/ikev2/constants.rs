//! IKEv2 protocol constants from RFC 7296

use std::fmt;

/// IKE version 2 (major version = 2, minor version = 0)
pub const IKE_VERSION: u8 = 0x20;

/// Maximum IKE message size (64KB - 1)
pub const MAX_IKE_MESSAGE_SIZE: u32 = 65535;

/// IKE header size (28 bytes)
pub const IKE_HEADER_SIZE: usize = 28;

/// Notify types below this value are errors, at or above are status
pub const NOTIFY_STATUS_BASE: u16 = 16384;

/// Exchange Types (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// IKE_SA_INIT exchange (34)
    IkeSaInit = 34,

    /// IKE_AUTH exchange (35)
    IkeAuth = 35,

    /// CREATE_CHILD_SA exchange (36)
    CreateChildSa = 36,

    /// INFORMATIONAL exchange (37)
    Informational = 37,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            34 => Some(ExchangeType::IkeSaInit),
            35 => Some(ExchangeType::IkeAuth),
            36 => Some(ExchangeType::CreateChildSa),
            37 => Some(ExchangeType::Informational),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Name as used in RFC 7296
    pub fn name(self) -> &'static str {
        match self {
            ExchangeType::IkeSaInit => "IKE_SA_INIT",
            ExchangeType::IkeAuth => "IKE_AUTH",
            ExchangeType::CreateChildSa => "CREATE_CHILD_SA",
            ExchangeType::Informational => "INFORMATIONAL",
        }
    }
}

impl fmt::Display for ExchangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// IKE message flags (RFC 7296 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IkeFlags(u8);

impl IkeFlags {
    /// Response flag (bit 5)
    pub const RESPONSE: u8 = 0x20;

    /// Version flag (bit 4)
    pub const VERSION: u8 = 0x10;

    /// Initiator flag (bit 3)
    pub const INITIATOR: u8 = 0x08;

    /// Create new flags
    pub fn new(value: u8) -> Self {
        IkeFlags(value & 0x38)
    }

    /// Flags for a request sent by the original initiator (or not)
    pub fn request(is_initiator: bool) -> Self {
        if is_initiator {
            IkeFlags(Self::INITIATOR)
        } else {
            IkeFlags(0)
        }
    }

    /// Flags for a response sent by the original initiator (or not)
    pub fn response(is_initiator: bool) -> Self {
        let mut flags = Self::RESPONSE;
        if is_initiator {
            flags |= Self::INITIATOR;
        }
        IkeFlags(flags)
    }

    /// Check if this is a response
    pub fn is_response(self) -> bool {
        (self.0 & Self::RESPONSE) != 0
    }

    /// Check if the sender is the original initiator of the IKE_SA
    pub fn is_initiator(self) -> bool {
        (self.0 & Self::INITIATOR) != 0
    }

    /// Get raw value
    pub fn value(self) -> u8 {
        self.0
    }
}

/// Payload Types (RFC 7296 Section 3.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// No next payload (0)
    None = 0,
    /// Security Association (33)
    SA = 33,
    /// Key Exchange (34)
    KE = 34,
    /// Identification - Initiator (35)
    IDi = 35,
    /// Identification - Responder (36)
    IDr = 36,
    /// Certificate (37)
    CERT = 37,
    /// Certificate Request (38)
    CERTREQ = 38,
    /// Authentication (39)
    AUTH = 39,
    /// Nonce (40)
    Nonce = 40,
    /// Notify (41)
    N = 41,
    /// Delete (42)
    D = 42,
    /// Vendor ID (43)
    V = 43,
    /// Traffic Selector - Initiator (44)
    TSi = 44,
    /// Traffic Selector - Responder (45)
    TSr = 45,
    /// Encrypted and Authenticated (46)
    SK = 46,
    /// Configuration (47)
    CP = 47,
    /// Extensible Authentication (48)
    EAP = 48,
}

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            33 => Some(PayloadType::SA),
            34 => Some(PayloadType::KE),
            35 => Some(PayloadType::IDi),
            36 => Some(PayloadType::IDr),
            37 => Some(PayloadType::CERT),
            38 => Some(PayloadType::CERTREQ),
            39 => Some(PayloadType::AUTH),
            40 => Some(PayloadType::Nonce),
            41 => Some(PayloadType::N),
            42 => Some(PayloadType::D),
            43 => Some(PayloadType::V),
            44 => Some(PayloadType::TSi),
            45 => Some(PayloadType::TSr),
            46 => Some(PayloadType::SK),
            47 => Some(PayloadType::CP),
            48 => Some(PayloadType::EAP),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Notify Message Types (RFC 7296 Section 3.10.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotifyType {
    /// UNSUPPORTED_CRITICAL_PAYLOAD (1)
    UnsupportedCriticalPayload,
    /// INVALID_IKE_SPI (4)
    InvalidIkeSpi,
    /// INVALID_MAJOR_VERSION (5)
    InvalidMajorVersion,
    /// INVALID_SYNTAX (7)
    InvalidSyntax,
    /// INVALID_MESSAGE_ID (9)
    InvalidMessageId,
    /// INVALID_SPI (11)
    InvalidSpi,
    /// NO_PROPOSAL_CHOSEN (14)
    NoProposalChosen,
    /// INVALID_KE_PAYLOAD (17)
    InvalidKePayload,
    /// AUTHENTICATION_FAILED (24)
    AuthenticationFailed,
    /// SINGLE_PAIR_REQUIRED (34)
    SinglePairRequired,
    /// NO_ADDITIONAL_SAS (35)
    NoAdditionalSas,
    /// TS_UNACCEPTABLE (38)
    TsUnacceptable,
    /// INVALID_SELECTORS (39)
    InvalidSelectors,
    /// TEMPORARY_FAILURE (43)
    TemporaryFailure,
    /// CHILD_SA_NOT_FOUND (44)
    ChildSaNotFound,
    /// INITIAL_CONTACT (16384)
    InitialContact,
    /// NAT_DETECTION_SOURCE_IP (16388)
    NatDetectionSourceIp,
    /// NAT_DETECTION_DESTINATION_IP (16389)
    NatDetectionDestinationIp,
    /// COOKIE (16390)
    Cookie,
    /// USE_TRANSPORT_MODE (16391)
    UseTransportMode,
    /// REKEY_SA (16393)
    RekeySa,
    /// Any other notify type, kept verbatim
    Other(u16),
}

impl NotifyType {
    /// Convert from the wire value
    pub fn from_u16(value: u16) -> Self {
        match value {
            1 => NotifyType::UnsupportedCriticalPayload,
            4 => NotifyType::InvalidIkeSpi,
            5 => NotifyType::InvalidMajorVersion,
            7 => NotifyType::InvalidSyntax,
            9 => NotifyType::InvalidMessageId,
            11 => NotifyType::InvalidSpi,
            14 => NotifyType::NoProposalChosen,
            17 => NotifyType::InvalidKePayload,
            24 => NotifyType::AuthenticationFailed,
            34 => NotifyType::SinglePairRequired,
            35 => NotifyType::NoAdditionalSas,
            38 => NotifyType::TsUnacceptable,
            39 => NotifyType::InvalidSelectors,
            43 => NotifyType::TemporaryFailure,
            44 => NotifyType::ChildSaNotFound,
            16384 => NotifyType::InitialContact,
            16388 => NotifyType::NatDetectionSourceIp,
            16389 => NotifyType::NatDetectionDestinationIp,
            16390 => NotifyType::Cookie,
            16391 => NotifyType::UseTransportMode,
            16393 => NotifyType::RekeySa,
            other => NotifyType::Other(other),
        }
    }

    /// Convert to the wire value
    pub fn to_u16(self) -> u16 {
        match self {
            NotifyType::UnsupportedCriticalPayload => 1,
            NotifyType::InvalidIkeSpi => 4,
            NotifyType::InvalidMajorVersion => 5,
            NotifyType::InvalidSyntax => 7,
            NotifyType::InvalidMessageId => 9,
            NotifyType::InvalidSpi => 11,
            NotifyType::NoProposalChosen => 14,
            NotifyType::InvalidKePayload => 17,
            NotifyType::AuthenticationFailed => 24,
            NotifyType::SinglePairRequired => 34,
            NotifyType::NoAdditionalSas => 35,
            NotifyType::TsUnacceptable => 38,
            NotifyType::InvalidSelectors => 39,
            NotifyType::TemporaryFailure => 43,
            NotifyType::ChildSaNotFound => 44,
            NotifyType::InitialContact => 16384,
            NotifyType::NatDetectionSourceIp => 16388,
            NotifyType::NatDetectionDestinationIp => 16389,
            NotifyType::Cookie => 16390,
            NotifyType::UseTransportMode => 16391,
            NotifyType::RekeySa => 16393,
            NotifyType::Other(value) => value,
        }
    }

    /// Error notifies occupy the range below 16384
    pub fn is_error(self) -> bool {
        self.to_u16() < NOTIFY_STATUS_BASE
    }
}
