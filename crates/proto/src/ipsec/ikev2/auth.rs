//! IKEv2 Authentication
//!
//! Implements shared-key authentication as defined in RFC 7296 Section 2.15.

use subtle::ConstantTimeEq;

use super::payload::{AuthMethod, AuthPayload, Identity};
use crate::ipsec::crypto::PrfAlgorithm;
use crate::ipsec::{Error, Result};

/// Key pad for IKEv2 (RFC 7296 Section 2.15)
const KEY_PAD_IKEV2: &[u8] = b"Key Pad for IKEv2";

/// Build the octets covered by an AUTH payload
///
/// ```text
/// InitiatorSignedOctets = RealMessage1 | NonceR | prf(SK_pi, IDi')
/// ResponderSignedOctets = RealMessage2 | NonceI | prf(SK_pr, IDr')
/// ```
///
/// `real_message` is the signer's own IKE_SA_INIT message as sent on the
/// wire, `peer_nonce` the nonce the other side contributed, and `sk_p` the
/// signer's SK_pi or SK_pr.
pub fn signed_octets(
    prf: PrfAlgorithm,
    real_message: &[u8],
    peer_nonce: &[u8],
    sk_p: &[u8],
    identity: &Identity,
) -> Vec<u8> {
    let id_hash = prf.compute(sk_p, &identity.to_payload_data());

    let mut octets = Vec::with_capacity(real_message.len() + peer_nonce.len() + id_hash.len());
    octets.extend_from_slice(real_message);
    octets.extend_from_slice(peer_nonce);
    octets.extend_from_slice(&id_hash);
    octets
}

/// Compute AUTH payload for PSK authentication
///
/// ```text
/// AUTH = prf(prf(Shared Secret, "Key Pad for IKEv2"), <SignedOctets>)
/// ```
pub fn compute_psk_auth(prf: PrfAlgorithm, psk: &[u8], signed_octets: &[u8]) -> AuthPayload {
    let key = prf.compute(psk, KEY_PAD_IKEV2);
    AuthPayload::new(AuthMethod::SharedKeyMic, prf.compute(&key, signed_octets))
}

/// Verify a received PSK AUTH payload in constant time
///
/// # Errors
///
/// Returns `AuthenticationFailed` on a method or MAC mismatch.
pub fn verify_psk_auth(
    prf: PrfAlgorithm,
    psk: &[u8],
    signed_octets: &[u8],
    received: &AuthPayload,
) -> Result<()> {
    if received.auth_method != AuthMethod::SharedKeyMic {
        return Err(Error::AuthenticationFailed(format!(
            "Expected PSK auth, got {:?}",
            received.auth_method
        )));
    }

    let expected = compute_psk_auth(prf, psk, signed_octets);
    if bool::from(expected.auth_data.ct_eq(&received.auth_data)) {
        Ok(())
    } else {
        Err(Error::AuthenticationFailed(
            "AUTH verification failed".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_psk_auth_roundtrip() {
        let prf = PrfAlgorithm::HmacSha256;
        let octets = signed_octets(
            prf,
            &[0x01; 200],
            &[0x02; 32],
            &[0x03; 32],
            &Identity::fqdn("gw.example.com"),
        );
        assert_eq!(octets.len(), 200 + 32 + 32);

        let auth = compute_psk_auth(prf, b"swordfish", &octets);
        assert_eq!(auth.auth_method, AuthMethod::SharedKeyMic);
        assert_eq!(auth.auth_data.len(), 32);
        assert!(verify_psk_auth(prf, b"swordfish", &octets, &auth).is_ok());
    }

    #[test]
    fn test_auth_binds_identity() {
        let prf = PrfAlgorithm::HmacSha256;
        let a = signed_octets(prf, &[1; 64], &[2; 32], &[3; 32], &Identity::fqdn("a"));
        let b = signed_octets(prf, &[1; 64], &[2; 32], &[3; 32], &Identity::fqdn("b"));
        let auth = compute_psk_auth(prf, b"psk", &a);
        assert!(matches!(
            verify_psk_auth(prf, b"psk", &b, &auth),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_wrong_psk_rejected() {
        let prf = PrfAlgorithm::HmacSha384;
        let octets = vec![0x0A; 100];
        let auth = compute_psk_auth(prf, b"right", &octets);
        assert_eq!(auth.auth_data.len(), 48);
        assert!(matches!(
            verify_psk_auth(prf, b"wrong", &octets, &auth),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_wrong_method_rejected() {
        let prf = PrfAlgorithm::HmacSha256;
        let wrong = AuthPayload::new(AuthMethod::RsaSig, vec![0xFF; 32]);
        assert!(matches!(
            verify_psk_auth(prf, b"psk", &[0x0C; 100], &wrong),
            Err(Error::AuthenticationFailed(_))
        ));
    }

    #[test]
    fn test_truncated_mac_rejected() {
        let prf = PrfAlgorithm::HmacSha256;
        let octets = vec![0x0D; 50];
        let mut auth = compute_psk_auth(prf, b"psk", &octets);
        auth.auth_data.truncate(16);
        assert!(verify_psk_auth(prf, b"psk", &octets, &auth).is_err());
    }
}
