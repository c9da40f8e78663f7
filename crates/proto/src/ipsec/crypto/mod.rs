//! Cryptographic operations for IKEv2
//!
//! This module provides the primitives the negotiation engine consumes:
//! - PRF and prf+ (RFC 7296 Section 2.13)
//! - Zeroizing key containers and the IKE/CHILD key schedules
//! - AEAD ciphers for the SK payload
//! - Diffie-Hellman key exchange
//! - The [`CryptoBackend`] seam used by IKE_SAs

pub mod backend;
pub mod cipher;
pub mod dh;
pub mod keys;
pub mod prf;

pub use backend::{CryptoBackend, DefaultCrypto, IkeSuite};
pub use cipher::CipherAlgorithm;
pub use dh::{generate_keypair, DhSecret};
pub use keys::{ChildKeys, KeyMaterial, SecretBytes};
pub use prf::PrfAlgorithm;
