//! IKEv2 (Internet Key Exchange v2) wire protocol
//!
//! This module implements the IKEv2 message format as defined in RFC 7296.
//! The exchanges built on top of it are driven by [`crate::ipsec::ike_sa`].
//!
//! # Protocol Overview
//!
//! 1. **IKE_SA_INIT**: negotiate algorithms, exchange nonces and DH values
//! 2. **IKE_AUTH**: authenticate peers and create the first CHILD_SA
//! 3. **CREATE_CHILD_SA**: create additional CHILD_SAs or rekey
//! 4. **INFORMATIONAL**: deletes, notifies and liveness checks
//!
//! # References
//!
//! - [RFC 7296](https://datatracker.ietf.org/doc/html/rfc7296) - IKEv2 Protocol
//! - [RFC 5282](https://datatracker.ietf.org/doc/html/rfc5282) - AEAD in IKEv2

pub mod auth;
pub mod constants;
pub mod message;
pub mod payload;
pub mod proposal;

pub use constants::*;
pub use message::*;
pub use payload::*;
pub use proposal::*;
