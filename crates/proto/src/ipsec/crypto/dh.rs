//! Diffie-Hellman groups for IKE_SA_INIT and PFS
//!
//! - Group 31 (Curve25519) through `ring::agreement`
//! - Group 14 (2048-bit MODP, RFC 3526) through `num-bigint`
//!
//! Private values never leave [`DhSecret`]; MODP exponents are zeroized on
//! drop and X25519 keys are consumed by the agreement.

use std::fmt;

use num_bigint::{BigUint, RandBigInt};
use once_cell::sync::Lazy;
use ring::agreement::{agree_ephemeral, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::SystemRandom;

use super::keys::SecretBytes;
use crate::ipsec::ikev2::proposal::DhTransformId;
use crate::ipsec::{Error, Result};

/// MODP group 14 public values and shared secrets are always 256 bytes
const MODP2048_LEN: usize = 256;

static MODP2048_P: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(
        b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
          29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
          EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
          E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
          EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3D\
          C2007CB8A163BF0598DA48361C55D39A69163FA8FD24CF5F\
          83655D23DCA3AD961C62F356208552BB9ED529077096966D\
          670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
          E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9\
          DE2BCBF6955817183995497CEA956AE515D2261898FA0510\
          15728E5A8AACAA68FFFFFFFFFFFFFFFF",
        16,
    )
    .expect("valid RFC 3526 prime")
});

/// Left-pad a big-endian integer to the group's fixed length
fn to_fixed_len(value: &BigUint) -> Vec<u8> {
    let bytes = value.to_bytes_be();
    let mut out = vec![0u8; MODP2048_LEN.saturating_sub(bytes.len())];
    out.extend_from_slice(&bytes);
    out
}

/// Private half of an ephemeral DH key pair
pub enum DhSecret {
    /// Curve25519 private key
    X25519(EphemeralPrivateKey),
    /// MODP exponent (big-endian)
    Modp2048(SecretBytes),
}

impl fmt::Debug for DhSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DhSecret::X25519(_) => f.write_str("DhSecret::X25519([REDACTED])"),
            DhSecret::Modp2048(_) => f.write_str("DhSecret::Modp2048([REDACTED])"),
        }
    }
}

impl DhSecret {
    /// Group this secret belongs to
    pub fn group(&self) -> DhTransformId {
        match self {
            DhSecret::X25519(_) => DhTransformId::Curve25519,
            DhSecret::Modp2048(_) => DhTransformId::Modp2048,
        }
    }

    /// Compute the shared secret g^ir with the peer's public value
    ///
    /// # Errors
    ///
    /// Returns `CryptoFailure` for malformed or degenerate peer values.
    pub fn agree(self, peer_public: &[u8]) -> Result<SecretBytes> {
        match self {
            DhSecret::X25519(private) => {
                if peer_public.len() != 32 {
                    return Err(Error::CryptoFailure(format!(
                        "Curve25519 public value must be 32 bytes, got {}",
                        peer_public.len()
                    )));
                }
                let peer = UnparsedPublicKey::new(&X25519, peer_public);
                agree_ephemeral(private, &peer, SecretBytes::from_slice)
                    .map_err(|_| Error::CryptoFailure("Curve25519 agreement failed".into()))
            }
            DhSecret::Modp2048(exponent) => {
                if peer_public.len() != MODP2048_LEN {
                    return Err(Error::CryptoFailure(format!(
                        "MODP-2048 public value must be {} bytes, got {}",
                        MODP2048_LEN,
                        peer_public.len()
                    )));
                }
                let y_peer = BigUint::from_bytes_be(peer_public);
                let one = BigUint::from(1u32);
                let p_minus_one = MODP2048_P.clone() - 1u32;
                if y_peer <= one || y_peer >= p_minus_one {
                    return Err(Error::CryptoFailure(
                        "MODP-2048 public value out of range".into(),
                    ));
                }
                let x = BigUint::from_bytes_be(&exponent);
                let shared = y_peer.modpow(&x, &MODP2048_P);
                Ok(SecretBytes::new(to_fixed_len(&shared)))
            }
        }
    }
}

/// Generate an ephemeral key pair for `group`
///
/// Returns the public value as sent in the KE payload and the private half.
pub fn generate_keypair(group: DhTransformId) -> Result<(Vec<u8>, DhSecret)> {
    match group {
        DhTransformId::Curve25519 => {
            let rng = SystemRandom::new();
            let private = EphemeralPrivateKey::generate(&X25519, &rng)
                .map_err(|_| Error::CryptoFailure("Curve25519 key generation failed".into()))?;
            let public = private
                .compute_public_key()
                .map_err(|_| Error::CryptoFailure("Curve25519 public key failed".into()))?;
            Ok((public.as_ref().to_vec(), DhSecret::X25519(private)))
        }
        DhTransformId::Modp2048 => {
            let mut rng = rand::thread_rng();
            let p_minus_one = MODP2048_P.clone() - 1u32;
            let x = rng.gen_biguint_range(&BigUint::from(2u32), &p_minus_one);
            let y = BigUint::from(2u32).modpow(&x, &MODP2048_P);
            Ok((
                to_fixed_len(&y),
                DhSecret::Modp2048(SecretBytes::new(x.to_bytes_be())),
            ))
        }
    }
}
