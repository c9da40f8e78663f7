//! Pseudo-Random Function (PRF) implementations
//!
//! Implements the PRF algorithms used for IKEv2 key derivation (RFC 7296
//! Section 2.13) and the AUTH payload computation.

use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha384, Sha512};

use super::keys::SecretBytes;
use crate::ipsec::ikev2::proposal::PrfTransformId;

/// PRF algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrfAlgorithm {
    /// HMAC-SHA2-256
    HmacSha256,
    /// HMAC-SHA2-384
    HmacSha384,
    /// HMAC-SHA2-512
    HmacSha512,
}

impl PrfAlgorithm {
    /// Map a negotiated PRF transform ID
    pub fn from_transform_id(id: u16) -> Option<Self> {
        match PrfTransformId::from_u16(id)? {
            PrfTransformId::HmacSha256 => Some(PrfAlgorithm::HmacSha256),
            PrfTransformId::HmacSha384 => Some(PrfAlgorithm::HmacSha384),
            PrfTransformId::HmacSha512 => Some(PrfAlgorithm::HmacSha512),
        }
    }

    /// Get PRF output length in bytes
    pub fn output_len(self) -> usize {
        match self {
            PrfAlgorithm::HmacSha256 => 32,
            PrfAlgorithm::HmacSha384 => 48,
            PrfAlgorithm::HmacSha512 => 64,
        }
    }

    /// Compute prf(key, data)
    pub fn compute(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            PrfAlgorithm::HmacSha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha384 => {
                let mut mac =
                    Hmac::<Sha384>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
            PrfAlgorithm::HmacSha512 => {
                let mut mac =
                    Hmac::<Sha512>::new_from_slice(key).expect("HMAC can take key of any size");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }

    /// Compute prf+ (key expansion function)
    ///
    /// ```text
    /// prf+ (K,S) = T1 | T2 | T3 | T4 | ...
    ///
    /// T1 = prf (K, S | 0x01)
    /// T2 = prf (K, T1 | S | 0x02)
    /// ...
    /// ```
    ///
    /// The output is held in a zeroizing buffer since it is always keying
    /// material.
    pub fn prf_plus(self, key: &[u8], seed: &[u8], output_len: usize) -> SecretBytes {
        let mut output = SecretBytes::with_capacity(output_len);
        let mut t = SecretBytes::default();
        let mut counter: u8 = 1;

        while output.len() < output_len {
            let mut input = SecretBytes::with_capacity(t.len() + seed.len() + 1);
            input.extend_from_slice(&t);
            input.extend_from_slice(seed);
            input.extend_from_slice(&[counter]);

            t = SecretBytes::new(self.compute(key, &input));
            output.extend_from_slice(&t);

            // prf+ is only defined for 255 iterations
            counter = counter.wrapping_add(1);
            if counter == 0 {
                break;
            }
        }

        output.truncate(output_len);
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prf_output_len() {
        assert_eq!(PrfAlgorithm::HmacSha256.output_len(), 32);
        assert_eq!(PrfAlgorithm::HmacSha384.output_len(), 48);
        assert_eq!(PrfAlgorithm::HmacSha512.output_len(), 64);
    }

    #[test]
    fn test_prf_hmac_sha256_rfc4231_case2() {
        // RFC 4231 test case 2
        let output = PrfAlgorithm::HmacSha256.compute(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            hex::encode(output),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_prf_plus_expansion_prefix() {
        let key = b"secret key";
        let seed = b"seed data";

        let long = PrfAlgorithm::HmacSha256.prf_plus(key, seed, 100);
        assert_eq!(long.len(), 100);

        let short = PrfAlgorithm::HmacSha256.prf_plus(key, seed, 16);
        assert_eq!(&short[..], &long[..16]);

        // T1 = prf(K, S | 0x01)
        let mut input = seed.to_vec();
        input.push(1);
        let t1 = PrfAlgorithm::HmacSha256.compute(key, &input);
        assert_eq!(&long[..32], &t1[..]);
    }

    #[test]
    fn test_transform_mapping() {
        assert_eq!(
            PrfAlgorithm::from_transform_id(6),
            Some(PrfAlgorithm::HmacSha384)
        );
        assert_eq!(PrfAlgorithm::from_transform_id(2), None);
    }
}
