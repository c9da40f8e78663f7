//! IKEv2 negotiation engine for the ikev2d daemon.
//!
//! The crate negotiates and maintains IPsec security associations: it runs
//! the IKE_SA_INIT, IKE_AUTH, CREATE_CHILD_SA and INFORMATIONAL exchanges,
//! retransmits and deduplicates messages, rekeys and deletes SAs, and tells
//! the kernel which CHILD_SAs to install.
//!
//! # Features
//!
//! - `ipsec` (default) - the IKEv2 engine and its tokio runtime
//!
//! # Example
//!
//! ```rust
//! use ikev2d_proto::ipsec::ikev2::{
//!     constants::{ExchangeType, IkeFlags},
//!     message::{decode_header, IkeMessage},
//! };
//!
//! let msg = IkeMessage::new(ExchangeType::IkeSaInit, [7; 8], [0; 8], IkeFlags::request(true), 0);
//! let wire = msg.encode(None).unwrap();
//!
//! let header = decode_header(&wire).unwrap();
//! assert_eq!(header.exchange_type, ExchangeType::IkeSaInit);
//! assert_eq!(header.initiator_spi, [7; 8]);
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (`ring`, RustCrypto AEADs)
//! - Constant-time comparison of authentication data
//! - Key material is zeroized on drop
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - Internet Key Exchange Protocol Version 2
//! - [RFC 4303](https://datatracker.ietf.org/doc/html/rfc4303) - IP Encapsulating Security Payload

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ipsec")]
pub mod ipsec;
