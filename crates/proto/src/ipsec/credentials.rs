//! Credential store
//!
//! Authentication material lives outside the negotiation engine. An IKE_SA
//! asks the store to produce its own AUTH payload and to judge the peer's;
//! it never sees the shared secrets.

use std::collections::HashMap;

use super::crypto::{PrfAlgorithm, SecretBytes};
use super::ikev2::auth::{compute_psk_auth, verify_psk_auth};
use super::ikev2::payload::{AuthPayload, Identity};
use super::{Error, Result};

/// Evidence presented by a peer in IKE_AUTH
#[derive(Debug, Clone, Copy)]
pub struct AuthProof<'a> {
    /// PRF negotiated for the IKE_SA
    pub prf: PrfAlgorithm,
    /// Octets the peer signed (its IKE_SA_INIT message, our nonce, prf(SK_p, ID))
    pub signed_octets: &'a [u8],
    /// The received AUTH payload
    pub auth: &'a AuthPayload,
}

/// Source of local identity and authentication decisions
pub trait CredentialStore: Send + Sync {
    /// Default identity of this host
    fn local_identity(&self) -> Identity;

    /// Produce our AUTH payload over `signed_octets`
    ///
    /// `peer` is the expected peer identity, if known before IKE_AUTH.
    fn sign(
        &self,
        local: &Identity,
        peer: Option<&Identity>,
        prf: PrfAlgorithm,
        signed_octets: &[u8],
    ) -> Result<AuthPayload>;

    /// Check a peer's AUTH payload
    fn authenticate(&self, peer: &Identity, proof: &AuthProof<'_>) -> bool;
}

/// Pre-shared key credentials
///
/// Keys are looked up by peer identity, falling back to a default key.
#[derive(Debug, Clone)]
pub struct PskCredentials {
    local: Identity,
    keys: HashMap<Identity, SecretBytes>,
    default_key: Option<SecretBytes>,
}

impl PskCredentials {
    /// Store for `local` without any keys
    pub fn new(local: Identity) -> Self {
        PskCredentials {
            local,
            keys: HashMap::new(),
            default_key: None,
        }
    }

    /// Key shared with one peer
    pub fn with_peer_key(mut self, peer: Identity, key: &[u8]) -> Self {
        self.keys.insert(peer, SecretBytes::from_slice(key));
        self
    }

    /// Key used for peers without an entry of their own
    pub fn with_default_key(mut self, key: &[u8]) -> Self {
        self.default_key = Some(SecretBytes::from_slice(key));
        self
    }

    fn key_for(&self, peer: Option<&Identity>) -> Option<&SecretBytes> {
        peer.and_then(|id| self.keys.get(id))
            .or(self.default_key.as_ref())
    }
}

impl CredentialStore for PskCredentials {
    fn local_identity(&self) -> Identity {
        self.local.clone()
    }

    fn sign(
        &self,
        local: &Identity,
        peer: Option<&Identity>,
        prf: PrfAlgorithm,
        signed_octets: &[u8],
    ) -> Result<AuthPayload> {
        let key = self.key_for(peer).ok_or_else(|| {
            Error::AuthenticationFailed(format!(
                "no shared key for {} -> {}",
                local,
                peer.map_or_else(|| "%any".to_string(), |p| p.to_string())
            ))
        })?;
        Ok(compute_psk_auth(prf, key, signed_octets))
    }

    fn authenticate(&self, peer: &Identity, proof: &AuthProof<'_>) -> bool {
        match self.key_for(Some(peer)) {
            Some(key) => verify_psk_auth(proof.prf, key, proof.signed_octets, proof.auth).is_ok(),
            None => false,
        }
    }
}
