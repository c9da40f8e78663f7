//! Stateless cookie challenge (RFC 7296 Section 2.6)
//!
//! ```text
//! Cookie = <VersionIDofSecret> | HMAC-SHA256(<secret>, Ni | IPi | SPIi)
//! ```
//!
//! Nothing is stored per request: a returning initiator is verified by
//! recomputing the hash. After a rotation the previous secret keeps
//! validating so that challenges in flight still succeed.

use std::net::IpAddr;

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// Cookie length: version byte and HMAC-SHA256 output
pub const COOKIE_LEN: usize = 1 + 32;

struct Secret {
    version: u8,
    key: Zeroizing<[u8; 32]>,
}

impl Secret {
    fn random(version: u8) -> Self {
        let mut key = Zeroizing::new([0u8; 32]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Secret { version, key }
    }

    fn cookie(&self, nonce_i: &[u8], peer: IpAddr, spi_i: &[u8; 8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key[..])
            .expect("HMAC can take key of any size");
        mac.update(nonce_i);
        match peer {
            IpAddr::V4(ip) => mac.update(&ip.octets()),
            IpAddr::V6(ip) => mac.update(&ip.octets()),
        }
        mac.update(spi_i);

        let mut cookie = Vec::with_capacity(COOKIE_LEN);
        cookie.push(self.version);
        cookie.extend_from_slice(&mac.finalize().into_bytes());
        cookie
    }
}

/// Cookie generator and verifier
pub struct CookieJar {
    current: Secret,
    previous: Option<Secret>,
    issued: u32,
    rotate_after: u32,
}

impl std::fmt::Debug for CookieJar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookieJar")
            .field("version", &self.current.version)
            .field("issued", &self.issued)
            .field("rotate_after", &self.rotate_after)
            .finish()
    }
}

impl CookieJar {
    /// New jar with a random secret, rotated after `rotate_after` cookies
    /// (0 disables count-based rotation)
    pub fn new(rotate_after: u32) -> Self {
        CookieJar {
            current: Secret::random(0),
            previous: None,
            issued: 0,
            rotate_after,
        }
    }

    /// Replace the secret; the old one stays valid until the next rotation
    pub fn rotate(&mut self) {
        let next = Secret::random(self.current.version.wrapping_add(1));
        self.previous = Some(std::mem::replace(&mut self.current, next));
        self.issued = 0;
    }

    /// Drop both secrets and start over
    pub fn reset(&mut self) {
        self.current = Secret::random(0);
        self.previous = None;
        self.issued = 0;
    }

    /// Cookie for an IKE_SA_INIT request
    pub fn generate(&mut self, nonce_i: &[u8], peer: IpAddr, spi_i: &[u8; 8]) -> Vec<u8> {
        if self.rotate_after > 0 && self.issued >= self.rotate_after {
            self.rotate();
        }
        self.issued += 1;
        self.current.cookie(nonce_i, peer, spi_i)
    }

    /// Check a cookie returned by an initiator
    pub fn verify(&self, cookie: &[u8], nonce_i: &[u8], peer: IpAddr, spi_i: &[u8; 8]) -> bool {
        let Some(&version) = cookie.first() else {
            return false;
        };

        let secret = if version == self.current.version {
            &self.current
        } else {
            match &self.previous {
                Some(previous) if previous.version == version => previous,
                _ => return false,
            }
        };

        bool::from(secret.cookie(nonce_i, peer, spi_i).ct_eq(cookie))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const PEER: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10));

    #[test]
    fn test_cookie_verifies() {
        let mut jar = CookieJar::new(0);
        let cookie = jar.generate(&[1; 32], PEER, &[7; 8]);
        assert_eq!(cookie.len(), COOKIE_LEN);
        assert!(jar.verify(&cookie, &[1; 32], PEER, &[7; 8]));
    }

    #[test]
    fn test_cookie_bound_to_request() {
        let mut jar = CookieJar::new(0);
        let cookie = jar.generate(&[1; 32], PEER, &[7; 8]);

        let other_peer = IpAddr::V4(Ipv4Addr::new(192, 0, 2, 11));
        assert!(!jar.verify(&cookie, &[1; 32], other_peer, &[7; 8]));
        assert!(!jar.verify(&cookie, &[2; 32], PEER, &[7; 8]));
        assert!(!jar.verify(&cookie, &[1; 32], PEER, &[8; 8]));
        assert!(!jar.verify(&[], &[1; 32], PEER, &[7; 8]));
    }

    #[test]
    fn test_previous_secret_survives_one_rotation() {
        let mut jar = CookieJar::new(0);
        let cookie = jar.generate(&[1; 32], PEER, &[7; 8]);

        jar.rotate();
        assert!(jar.verify(&cookie, &[1; 32], PEER, &[7; 8]));

        jar.rotate();
        assert!(!jar.verify(&cookie, &[1; 32], PEER, &[7; 8]));
    }

    #[test]
    fn test_rotation_after_count() {
        let mut jar = CookieJar::new(2);
        let first = jar.generate(&[1; 32], PEER, &[7; 8]);
        jar.generate(&[1; 32], PEER, &[7; 8]);
        let third = jar.generate(&[1; 32], PEER, &[7; 8]);
        assert_ne!(first[0], third[0]);
    }

    #[test]
    fn test_reset_invalidates() {
        let mut jar = CookieJar::new(0);
        let cookie = jar.generate(&[1; 32], PEER, &[7; 8]);
        jar.reset();
        assert!(!jar.verify(&cookie, &[1; 32], PEER, &[7; 8]));
    }
}
