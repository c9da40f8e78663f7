//! Error types for the IKEv2 engine
//!
//! One error type covers the codec, the negotiation tasks and the
//! collaborator boundaries (kernel, transport, crypto backend). Errors are
//! classified by how far they propagate: negotiation mismatches fail only the
//! current exchange, while cryptographic and liveness failures tear down the
//! whole IKE_SA.

use std::fmt;

use super::ikev2::constants::NotifyType;

/// Result type for IKE operations
pub type Result<T> = std::result::Result<T, Error>;

/// IKE engine errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Unparseable or inconsistent wire data
    MalformedMessage(String),

    /// Invalid payload body
    InvalidPayload(String),

    /// Unsupported major version in the IKE header
    UnsupportedVersion(u8),

    /// Unsupported exchange type
    UnsupportedExchangeType(u8),

    /// Payload with the critical bit set that we do not understand
    UnsupportedCriticalPayload(u8),

    /// Integrity check of the encrypted payload failed
    DecryptionFailed,

    /// Peer identity or AUTH payload could not be verified
    AuthenticationFailed(String),

    /// No acceptable proposal found in negotiation
    NoProposalChosen,

    /// Traffic selector intersection is empty
    TsUnacceptable,

    /// Peer requested a different DH group
    InvalidKePayload {
        /// Group the peer wants
        group: u16,
    },

    /// Peer asked us to retry later
    TemporaryFailure,

    /// Peer does not know the CHILD_SA we referenced
    ChildSaNotFound(u32),

    /// Any other error notify received from the peer
    PeerNotify(u16),

    /// Retransmission budget exhausted
    PeerUnreachable,

    /// Kernel refused to install or remove SA state
    KernelInstallFailure(String),

    /// Cryptographic primitive failed
    CryptoFailure(String),

    /// Invalid key length for the negotiated algorithm
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid packet length
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Buffer too short for operation
    BufferTooShort {
        /// Required length
        required: usize,
        /// Available length
        available: usize,
    },

    /// Message too large
    MessageTooLarge(u32),

    /// Message ID outside the accepted window
    InvalidMessageId {
        /// Expected message ID
        expected: u32,
        /// Received message ID
        received: u32,
    },

    /// Security Association not found
    SaNotFound(String),

    /// Operation not valid in the current state
    InvalidState(String),

    /// State machine transition not allowed
    InvalidStateTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Invalid configuration or argument
    InvalidParameter(String),

    /// I/O error
    Io(String),

    /// Internal error (should not happen)
    Internal(String),
}

impl Error {
    /// Notify type reported to the peer for this error, if any
    pub fn notify_type(&self) -> Option<NotifyType> {
        match self {
            Error::MalformedMessage(_) | Error::InvalidPayload(_) => {
                Some(NotifyType::InvalidSyntax)
            }
            Error::UnsupportedCriticalPayload(_) => Some(NotifyType::UnsupportedCriticalPayload),
            Error::UnsupportedVersion(_) => Some(NotifyType::InvalidMajorVersion),
            Error::AuthenticationFailed(_) => Some(NotifyType::AuthenticationFailed),
            Error::NoProposalChosen => Some(NotifyType::NoProposalChosen),
            Error::TsUnacceptable => Some(NotifyType::TsUnacceptable),
            Error::InvalidKePayload { .. } => Some(NotifyType::InvalidKePayload),
            Error::TemporaryFailure => Some(NotifyType::TemporaryFailure),
            Error::ChildSaNotFound(_) => Some(NotifyType::ChildSaNotFound),
            _ => None,
        }
    }

    /// Whether this error tears down the whole IKE_SA
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::DecryptionFailed | Error::AuthenticationFailed(_) | Error::PeerUnreachable
        )
    }

    /// Map an error notify received from the peer to an error
    pub fn from_notify(notify: NotifyType, data: &[u8]) -> Self {
        match notify {
            NotifyType::NoProposalChosen => Error::NoProposalChosen,
            NotifyType::TsUnacceptable => Error::TsUnacceptable,
            NotifyType::AuthenticationFailed => {
                Error::AuthenticationFailed("peer rejected our AUTH payload".into())
            }
            NotifyType::InvalidKePayload if data.len() >= 2 => Error::InvalidKePayload {
                group: u16::from_be_bytes([data[0], data[1]]),
            },
            NotifyType::TemporaryFailure => Error::TemporaryFailure,
            NotifyType::InvalidSyntax => {
                Error::MalformedMessage("peer reported INVALID_SYNTAX".into())
            }
            other => Error::PeerNotify(other.to_u16()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::MalformedMessage(msg) => write!(f, "Malformed IKE message: {}", msg),
            Error::InvalidPayload(msg) => write!(f, "Invalid IKE payload: {}", msg),
            Error::UnsupportedVersion(v) => write!(f, "Unsupported IKE version: 0x{:02x}", v),
            Error::UnsupportedExchangeType(t) => write!(f, "Unsupported exchange type: {}", t),
            Error::UnsupportedCriticalPayload(t) => {
                write!(f, "Unsupported critical payload type: {}", t)
            }
            Error::DecryptionFailed => write!(f, "Integrity check of encrypted payload failed"),
            Error::AuthenticationFailed(msg) => write!(f, "Authentication failed: {}", msg),
            Error::NoProposalChosen => write!(f, "No acceptable proposal found in negotiation"),
            Error::TsUnacceptable => write!(f, "Traffic selectors unacceptable"),
            Error::InvalidKePayload { group } => {
                write!(f, "Peer requested DH group {}", group)
            }
            Error::TemporaryFailure => write!(f, "Peer reported temporary failure"),
            Error::ChildSaNotFound(spi) => write!(f, "CHILD_SA not found: 0x{:08x}", spi),
            Error::PeerNotify(code) => write!(f, "Peer sent error notify {}", code),
            Error::PeerUnreachable => write!(f, "Peer unreachable: retransmission limit reached"),
            Error::KernelInstallFailure(msg) => write!(f, "Kernel SA operation failed: {}", msg),
            Error::CryptoFailure(msg) => write!(f, "Cryptographic error: {}", msg),
            Error::InvalidKeyLength { expected, actual } => {
                write!(f, "Invalid key length: expected {}, got {}", expected, actual)
            }
            Error::InvalidLength { expected, actual } => {
                write!(f, "Invalid length: expected {}, got {}", expected, actual)
            }
            Error::BufferTooShort {
                required,
                available,
            } => write!(
                f,
                "Buffer too short: need {} bytes, have {}",
                required, available
            ),
            Error::MessageTooLarge(size) => write!(f, "IKE message too large: {} bytes", size),
            Error::InvalidMessageId { expected, received } => write!(
                f,
                "Unexpected message ID: expected {}, got {}",
                expected, received
            ),
            Error::SaNotFound(id) => write!(f, "Security Association not found: {}", id),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidStateTransition { from, to } => {
                write!(f, "Invalid state transition: {} -> {}", from, to)
            }
            Error::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            Error::Io(msg) => write!(f, "I/O error: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl From<Error> for ikev2d_platform::PlatformError {
    fn from(err: Error) -> Self {
        match err {
            Error::InvalidParameter(msg) => ikev2d_platform::PlatformError::Config(msg),
            other => ikev2d_platform::PlatformError::Protocol(other.to_string()),
        }
    }
}
