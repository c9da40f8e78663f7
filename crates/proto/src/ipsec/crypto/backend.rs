//! Crypto backend used by the negotiation engine
//!
//! IKE_SAs never call primitives directly; they go through a shared
//! `Arc<dyn CryptoBackend>` so the suite can be swapped (or made
//! deterministic) without touching the state machines.

use rand::RngCore;

use super::cipher::CipherAlgorithm;
use super::dh::{generate_keypair, DhSecret};
use super::keys::{ChildKeys, KeyMaterial};
use super::prf::PrfAlgorithm;
use crate::ipsec::ikev2::proposal::{DhTransformId, Proposal, TransformType};
use crate::ipsec::{Error, Result};

/// Default nonce length (RFC 7296 requires at least half the PRF key size)
pub const NONCE_LEN: usize = 32;

/// Algorithms negotiated for an IKE_SA
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IkeSuite {
    /// SK payload cipher
    pub cipher: CipherAlgorithm,
    /// Pseudo-random function
    pub prf: PrfAlgorithm,
    /// Diffie-Hellman group
    pub dh: DhTransformId,
}

impl IkeSuite {
    /// Extract the suite from a selected IKE proposal
    ///
    /// # Errors
    ///
    /// Returns `NoProposalChosen` when the proposal lacks a transform we can
    /// drive (non-AEAD cipher, unknown PRF or group).
    pub fn from_proposal(proposal: &Proposal) -> Result<Self> {
        let encr = proposal
            .get_transform(TransformType::Encr)
            .ok_or(Error::NoProposalChosen)?;
        let cipher = CipherAlgorithm::from_transform(encr)?;

        let prf = proposal
            .get_transform(TransformType::Prf)
            .and_then(|t| PrfAlgorithm::from_transform_id(t.transform_id))
            .ok_or(Error::NoProposalChosen)?;

        let dh = proposal
            .dh_group()
            .and_then(DhTransformId::from_u16)
            .ok_or(Error::NoProposalChosen)?;

        Ok(IkeSuite { cipher, prf, dh })
    }
}

/// Cryptographic services consumed by IKE_SAs
pub trait CryptoBackend: Send + Sync {
    /// Fresh ephemeral DH key pair
    fn generate_dh_keypair(&self, group: DhTransformId) -> Result<(Vec<u8>, DhSecret)> {
        generate_keypair(group)
    }

    /// Fill a buffer from the system RNG
    fn random_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    /// Fresh nonce for IKE_SA_INIT or CREATE_CHILD_SA
    fn nonce(&self) -> Vec<u8> {
        self.random_bytes(NONCE_LEN)
    }

    /// Derive the IKE_SA keys of a fresh SA from the DH result
    fn derive_keys(
        &self,
        suite: &IkeSuite,
        shared: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
        spi_i: &[u8; 8],
        spi_r: &[u8; 8],
    ) -> Result<KeyMaterial> {
        let skeyseed = KeyMaterial::skeyseed(suite.prf, nonce_i, nonce_r, shared);
        KeyMaterial::expand(
            suite.prf,
            &skeyseed,
            nonce_i,
            nonce_r,
            spi_i,
            spi_r,
            suite.cipher.keymat_len(),
            0,
        )
    }

    /// Derive the keys of an IKE_SA replacing one whose SK_d is `old_sk_d`
    #[allow(clippy::too_many_arguments)]
    fn derive_rekeyed_keys(
        &self,
        suite: &IkeSuite,
        old_prf: PrfAlgorithm,
        old_sk_d: &[u8],
        shared: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
        spi_i: &[u8; 8],
        spi_r: &[u8; 8],
    ) -> Result<KeyMaterial> {
        let skeyseed = KeyMaterial::skeyseed_rekey(old_prf, old_sk_d, shared, nonce_i, nonce_r);
        KeyMaterial::expand(
            suite.prf,
            &skeyseed,
            nonce_i,
            nonce_r,
            spi_i,
            spi_r,
            suite.cipher.keymat_len(),
            0,
        )
    }

    /// Derive CHILD_SA keys from SK_d
    #[allow(clippy::too_many_arguments)]
    fn derive_child_keys(
        &self,
        prf: PrfAlgorithm,
        sk_d: &[u8],
        shared: Option<&[u8]>,
        nonce_i: &[u8],
        nonce_r: &[u8],
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Result<ChildKeys> {
        ChildKeys::derive(prf, sk_d, shared, nonce_i, nonce_r, encr_key_len, integ_key_len)
    }
}

/// Backend built on the in-crate primitives
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCrypto;

impl CryptoBackend for DefaultCrypto {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipsec::ikev2::proposal::{EncrTransformId, PrfTransformId, ProtocolId, Transform};

    fn proposal() -> Proposal {
        Proposal::new(1, ProtocolId::Ike)
            .add_transform(Transform::encr(EncrTransformId::AesGcm16, Some(256)))
            .add_transform(Transform::prf(PrfTransformId::HmacSha384))
            .add_transform(Transform::dh(DhTransformId::Modp2048))
    }

    #[test]
    fn test_suite_from_proposal() {
        let suite = IkeSuite::from_proposal(&proposal()).unwrap();
        assert_eq!(suite.cipher, CipherAlgorithm::AesGcm256);
        assert_eq!(suite.prf, PrfAlgorithm::HmacSha384);
        assert_eq!(suite.dh, DhTransformId::Modp2048);
    }

    #[test]
    fn test_suite_requires_dh() {
        let mut p = proposal();
        p.transforms.retain(|t| t.transform_type != TransformType::Dh);
        assert_eq!(IkeSuite::from_proposal(&p), Err(Error::NoProposalChosen));
    }

    #[test]
    fn test_both_sides_derive_same_keys() {
        let crypto = DefaultCrypto;
        let suite = IkeSuite {
            cipher: CipherAlgorithm::AesGcm128,
            prf: PrfAlgorithm::HmacSha256,
            dh: DhTransformId::Curve25519,
        };
        let (pub_i, sec_i) = crypto.generate_dh_keypair(suite.dh).unwrap();
        let (pub_r, sec_r) = crypto.generate_dh_keypair(suite.dh).unwrap();
        let ni = crypto.nonce();
        let nr = crypto.nonce();
        assert_eq!(ni.len(), NONCE_LEN);

        let shared_i = sec_i.agree(&pub_r).unwrap();
        let shared_r = sec_r.agree(&pub_i).unwrap();
        let keys_i = crypto
            .derive_keys(&suite, &shared_i, &ni, &nr, &[1; 8], &[2; 8])
            .unwrap();
        let keys_r = crypto
            .derive_keys(&suite, &shared_r, &ni, &nr, &[1; 8], &[2; 8])
            .unwrap();

        assert_eq!(keys_i.sk_ei, keys_r.sk_ei);
        assert_eq!(keys_i.sk_ei.len(), 20);
        assert_eq!(keys_i.sk_d, keys_r.sk_d);
    }
}
