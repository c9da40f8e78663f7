//! AEAD ciphers for the SK (encrypted) payload
//!
//! IKEv2 AEAD framing (RFC 5282 for AES-GCM, RFC 7634 for
//! ChaCha20-Poly1305): the keying material for each direction is the cipher
//! key followed by a 4-byte salt; every message carries an 8-byte explicit IV;
//! the 12-byte nonce is `salt | IV`; the ICV is 16 bytes.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes128Gcm, Aes256Gcm, Nonce as AesGcmNonce,
};
use chacha20poly1305::ChaCha20Poly1305;

use crate::ipsec::ikev2::proposal::{EncrTransformId, Transform, TransformType};
use crate::ipsec::{Error, Result};

/// Salt length appended to the cipher key in AEAD keying material
pub const SALT_LEN: usize = 4;

/// Cipher algorithm for SK payload encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    /// AES-GCM with 128-bit key and 16-byte ICV
    AesGcm128,
    /// AES-GCM with 256-bit key and 16-byte ICV
    AesGcm256,
    /// ChaCha20-Poly1305
    ChaCha20Poly1305,
}

impl CipherAlgorithm {
    /// Map a negotiated ENCR transform
    ///
    /// # Errors
    ///
    /// Only AEAD transforms can protect IKE messages here; anything else is
    /// `NoProposalChosen`.
    pub fn from_transform(transform: &Transform) -> Result<Self> {
        if transform.transform_type != TransformType::Encr {
            return Err(Error::InvalidParameter(format!(
                "Not an encryption transform: {:?}",
                transform.transform_type
            )));
        }

        match (
            EncrTransformId::from_u16(transform.transform_id),
            transform.key_length,
        ) {
            (Some(EncrTransformId::AesGcm16), Some(128)) => Ok(CipherAlgorithm::AesGcm128),
            (Some(EncrTransformId::AesGcm16), Some(256)) => Ok(CipherAlgorithm::AesGcm256),
            (Some(EncrTransformId::ChaCha20Poly1305), None) => {
                Ok(CipherAlgorithm::ChaCha20Poly1305)
            }
            _ => Err(Error::NoProposalChosen),
        }
    }

    /// The transform advertising this cipher
    pub fn to_transform(self) -> Transform {
        match self {
            CipherAlgorithm::AesGcm128 => Transform::encr(EncrTransformId::AesGcm16, Some(128)),
            CipherAlgorithm::AesGcm256 => Transform::encr(EncrTransformId::AesGcm16, Some(256)),
            CipherAlgorithm::ChaCha20Poly1305 => {
                Transform::encr(EncrTransformId::ChaCha20Poly1305, None)
            }
        }
    }

    /// Cipher key length in bytes
    pub fn key_len(self) -> usize {
        match self {
            CipherAlgorithm::AesGcm128 => 16,
            CipherAlgorithm::AesGcm256 | CipherAlgorithm::ChaCha20Poly1305 => 32,
        }
    }

    /// Keying material length (key + salt)
    pub fn keymat_len(self) -> usize {
        self.key_len() + SALT_LEN
    }

    /// Explicit IV length carried in each message
    pub fn iv_len(self) -> usize {
        8
    }

    /// Integrity check value length
    pub fn icv_len(self) -> usize {
        16
    }

    fn nonce(self, keymat: &[u8], iv: &[u8]) -> Result<[u8; 12]> {
        if keymat.len() != self.keymat_len() {
            return Err(Error::InvalidKeyLength {
                expected: self.keymat_len(),
                actual: keymat.len(),
            });
        }
        if iv.len() != self.iv_len() {
            return Err(Error::InvalidLength {
                expected: self.iv_len(),
                actual: iv.len(),
            });
        }

        let mut nonce = [0u8; 12];
        nonce[..SALT_LEN].copy_from_slice(&keymat[self.key_len()..]);
        nonce[SALT_LEN..].copy_from_slice(iv);
        Ok(nonce)
    }

    /// Encrypt and authenticate
    ///
    /// Returns ciphertext with the ICV appended.
    pub fn seal(self, keymat: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(keymat, iv)?;
        let key = &keymat[..self.key_len()];
        let payload = Payload {
            msg: plaintext,
            aad,
        };

        let sealed = match self {
            CipherAlgorithm::AesGcm128 => Aes128Gcm::new_from_slice(key)
                .map_err(|_| Error::CryptoFailure("AES-GCM key setup failed".into()))?
                .encrypt(AesGcmNonce::from_slice(&nonce), payload),
            CipherAlgorithm::AesGcm256 => Aes256Gcm::new_from_slice(key)
                .map_err(|_| Error::CryptoFailure("AES-GCM key setup failed".into()))?
                .encrypt(AesGcmNonce::from_slice(&nonce), payload),
            CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| Error::CryptoFailure("ChaCha20-Poly1305 key setup failed".into()))?
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload),
        };

        sealed.map_err(|_| Error::CryptoFailure("AEAD encryption failed".into()))
    }

    /// Verify and decrypt
    ///
    /// # Errors
    ///
    /// Returns `DecryptionFailed` if the ICV does not verify.
    pub fn open(self, keymat: &[u8], iv: &[u8], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = self.nonce(keymat, iv)?;
        if ciphertext.len() < self.icv_len() {
            return Err(Error::DecryptionFailed);
        }
        let key = &keymat[..self.key_len()];
        let payload = Payload {
            msg: ciphertext,
            aad,
        };

        let opened = match self {
            CipherAlgorithm::AesGcm128 => Aes128Gcm::new_from_slice(key)
                .map_err(|_| Error::CryptoFailure("AES-GCM key setup failed".into()))?
                .decrypt(AesGcmNonce::from_slice(&nonce), payload),
            CipherAlgorithm::AesGcm256 => Aes256Gcm::new_from_slice(key)
                .map_err(|_| Error::CryptoFailure("AES-GCM key setup failed".into()))?
                .decrypt(AesGcmNonce::from_slice(&nonce), payload),
            CipherAlgorithm::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| Error::CryptoFailure("ChaCha20-Poly1305 key setup failed".into()))?
                .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload),
        };

        opened.map_err(|_| Error::DecryptionFailed)
    }
}
