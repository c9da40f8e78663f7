//! Keying material with enforced zeroization
//!
//! Every buffer that holds secret material ([`SecretBytes`]) is wiped when it
//! is dropped. The IKE_SA key set ([`KeyMaterial`]) and CHILD_SA key set
//! ([`ChildKeys`]) are built from it, so tearing down an SA releases its
//! keys deterministically.

use std::fmt;
use std::ops::Deref;

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::prf::PrfAlgorithm;
use crate::ipsec::{Error, Result};

/// Owned secret buffer, zeroized on drop
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretBytes(Vec<u8>);

impl SecretBytes {
    /// Take ownership of a buffer
    pub fn new(bytes: Vec<u8>) -> Self {
        SecretBytes(bytes)
    }

    /// Copy a slice into a new secret buffer
    pub fn from_slice(bytes: &[u8]) -> Self {
        SecretBytes(bytes.to_vec())
    }

    /// Empty buffer with preallocated capacity, so appends do not leave
    /// unzeroized copies behind after reallocation
    pub fn with_capacity(capacity: usize) -> Self {
        SecretBytes(Vec::with_capacity(capacity))
    }

    /// Append bytes
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        if self.0.capacity() - self.0.len() < bytes.len() {
            let mut grown = Vec::with_capacity((self.0.len() + bytes.len()).max(self.0.capacity() * 2));
            grown.extend_from_slice(&self.0);
            self.0.zeroize();
            self.0 = grown;
        }
        self.0.extend_from_slice(bytes);
    }

    /// Shorten the buffer, wiping the removed tail
    pub fn truncate(&mut self, len: usize) {
        if len < self.0.len() {
            self.0[len..].zeroize();
            self.0.truncate(len);
        }
    }

    /// Split off `len` bytes starting at `offset` into a new secret buffer
    fn slice(&self, offset: usize, len: usize) -> Result<SecretBytes> {
        self.0
            .get(offset..offset + len)
            .map(SecretBytes::from_slice)
            .ok_or_else(|| Error::CryptoFailure("keying material too short".into()))
    }
}

impl Deref for SecretBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for SecretBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretBytes([REDACTED; {}])", self.0.len())
    }
}

/// IKEv2 key material derived from SKEYSEED
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// SK_d - Key for deriving CHILD_SA keys and rekeyed IKE_SA keys
    pub sk_d: SecretBytes,

    /// SK_ai - Initiator's integrity key (empty for AEAD suites)
    pub sk_ai: SecretBytes,

    /// SK_ar - Responder's integrity key (empty for AEAD suites)
    pub sk_ar: SecretBytes,

    /// SK_ei - Initiator's encryption key (including AEAD salt)
    pub sk_ei: SecretBytes,

    /// SK_er - Responder's encryption key (including AEAD salt)
    pub sk_er: SecretBytes,

    /// SK_pi - Initiator's AUTH payload key
    pub sk_pi: SecretBytes,

    /// SK_pr - Responder's AUTH payload key
    pub sk_pr: SecretBytes,
}

impl KeyMaterial {
    /// `SKEYSEED = prf(Ni | Nr, g^ir)`
    pub fn skeyseed(prf: PrfAlgorithm, nonce_i: &[u8], nonce_r: &[u8], shared: &[u8]) -> SecretBytes {
        let mut key = SecretBytes::with_capacity(nonce_i.len() + nonce_r.len());
        key.extend_from_slice(nonce_i);
        key.extend_from_slice(nonce_r);
        SecretBytes::new(prf.compute(&key, shared))
    }

    /// `SKEYSEED = prf(SK_d (old), g^ir (new) | Ni | Nr)` for IKE_SA rekey
    pub fn skeyseed_rekey(
        prf: PrfAlgorithm,
        old_sk_d: &[u8],
        shared: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
    ) -> SecretBytes {
        let mut data = SecretBytes::with_capacity(shared.len() + nonce_i.len() + nonce_r.len());
        data.extend_from_slice(shared);
        data.extend_from_slice(nonce_i);
        data.extend_from_slice(nonce_r);
        SecretBytes::new(prf.compute(old_sk_d, &data))
    }

    /// Expand SKEYSEED into the seven IKE_SA keys
    ///
    /// ```text
    /// {SK_d | SK_ai | SK_ar | SK_ei | SK_er | SK_pi | SK_pr}
    ///     = prf+ (SKEYSEED, Ni | Nr | SPIi | SPIr)
    /// ```
    #[allow(clippy::too_many_arguments)]
    pub fn expand(
        prf: PrfAlgorithm,
        skeyseed: &[u8],
        nonce_i: &[u8],
        nonce_r: &[u8],
        spi_i: &[u8; 8],
        spi_r: &[u8; 8],
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Result<Self> {
        let mut seed = Vec::with_capacity(nonce_i.len() + nonce_r.len() + 16);
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);
        seed.extend_from_slice(spi_i);
        seed.extend_from_slice(spi_r);

        let prf_len = prf.output_len();
        let total_len = 3 * prf_len + 2 * integ_key_len + 2 * encr_key_len;
        let keymat = prf.prf_plus(skeyseed, &seed, total_len);

        let mut offset = 0;
        let mut take = |len: usize| {
            let key = keymat.slice(offset, len);
            offset += len;
            key
        };

        Ok(KeyMaterial {
            sk_d: take(prf_len)?,
            sk_ai: take(integ_key_len)?,
            sk_ar: take(integ_key_len)?,
            sk_ei: take(encr_key_len)?,
            sk_er: take(encr_key_len)?,
            sk_pi: take(prf_len)?,
            sk_pr: take(prf_len)?,
        })
    }
}

/// CHILD_SA keys, per direction
#[derive(Debug, Clone, Zeroize, ZeroizeOnDrop)]
pub struct ChildKeys {
    /// Initiator-to-responder encryption key
    pub encr_i: SecretBytes,
    /// Initiator-to-responder integrity key
    pub integ_i: SecretBytes,
    /// Responder-to-initiator encryption key
    pub encr_r: SecretBytes,
    /// Responder-to-initiator integrity key
    pub integ_r: SecretBytes,
}

impl ChildKeys {
    /// `KEYMAT = prf+(SK_d, [g^ir (new) |] Ni | Nr)`
    ///
    /// Keys are taken initiator-to-responder first, encryption before
    /// integrity (RFC 7296 Section 2.17).
    pub fn derive(
        prf: PrfAlgorithm,
        sk_d: &[u8],
        shared: Option<&[u8]>,
        nonce_i: &[u8],
        nonce_r: &[u8],
        encr_key_len: usize,
        integ_key_len: usize,
    ) -> Result<Self> {
        let shared = shared.unwrap_or_default();
        let mut seed = SecretBytes::with_capacity(shared.len() + nonce_i.len() + nonce_r.len());
        seed.extend_from_slice(shared);
        seed.extend_from_slice(nonce_i);
        seed.extend_from_slice(nonce_r);

        let keymat = prf.prf_plus(sk_d, &seed, 2 * (encr_key_len + integ_key_len));

        Ok(ChildKeys {
            encr_i: keymat.slice(0, encr_key_len)?,
            integ_i: keymat.slice(encr_key_len, integ_key_len)?,
            encr_r: keymat.slice(encr_key_len + integ_key_len, encr_key_len)?,
            integ_r: keymat.slice(2 * encr_key_len + integ_key_len, integ_key_len)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_debug_redacted() {
        let secret = SecretBytes::from_slice(b"hunter2");
        let shown = format!("{:?}", secret);
        assert!(!shown.contains("hunter2"));
        assert!(shown.contains("REDACTED"));
    }

    #[test]
    fn test_secret_grows_and_truncates() {
        let mut secret = SecretBytes::with_capacity(2);
        secret.extend_from_slice(&[1, 2]);
        secret.extend_from_slice(&[3, 4, 5]);
        assert_eq!(&secret[..], &[1, 2, 3, 4, 5]);
        secret.truncate(2);
        assert_eq!(&secret[..], &[1, 2]);
    }

    #[test]
    fn test_key_material_layout() {
        let prf = PrfAlgorithm::HmacSha256;
        let ni = vec![0x01; 32];
        let nr = vec![0x02; 32];
        let skeyseed = KeyMaterial::skeyseed(prf, &ni, &nr, &[0x03; 32]);
        let spi_i = [0x04; 8];
        let spi_r = [0x05; 8];

        let keys = KeyMaterial::expand(prf, &skeyseed, &ni, &nr, &spi_i, &spi_r, 20, 0).unwrap();
        assert_eq!(keys.sk_d.len(), 32);
        assert!(keys.sk_ai.is_empty());
        assert_eq!(keys.sk_ei.len(), 20);
        assert_eq!(keys.sk_pr.len(), 32);

        // Keys are consecutive slices of one prf+ stream
        let mut seed = Vec::new();
        seed.extend_from_slice(&ni);
        seed.extend_from_slice(&nr);
        seed.extend_from_slice(&spi_i);
        seed.extend_from_slice(&spi_r);
        let stream = prf.prf_plus(&skeyseed, &seed, 32 * 3 + 40);
        assert_eq!(&keys.sk_d[..], &stream[..32]);
        assert_eq!(&keys.sk_ei[..], &stream[32..52]);
        assert_eq!(&keys.sk_er[..], &stream[52..72]);
        assert_eq!(&keys.sk_pi[..], &stream[72..104]);
    }

    #[test]
    fn test_rekey_skeyseed_differs() {
        let prf = PrfAlgorithm::HmacSha256;
        let fresh = KeyMaterial::skeyseed(prf, &[1; 16], &[2; 16], &[3; 32]);
        let rekeyed = KeyMaterial::skeyseed_rekey(prf, &[9; 32], &[3; 32], &[1; 16], &[2; 16]);
        assert_ne!(fresh, rekeyed);
    }

    #[test]
    fn test_child_keys_pfs_changes_output() {
        let prf = PrfAlgorithm::HmacSha256;
        let sk_d = [0x42; 32];
        let plain = ChildKeys::derive(prf, &sk_d, None, &[1; 32], &[2; 32], 20, 0).unwrap();
        let pfs = ChildKeys::derive(prf, &sk_d, Some(&[7; 32]), &[1; 32], &[2; 32], 20, 0).unwrap();
        assert_eq!(plain.encr_i.len(), 20);
        assert_ne!(plain.encr_i, plain.encr_r);
        assert_ne!(plain.encr_i, pfs.encr_i);
    }
}
