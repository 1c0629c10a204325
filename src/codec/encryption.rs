//! Symmetric payload encryption.
//!
//! Encryption is optional. Without an [`Encryptor`] the wire format is the
//! plain serialized bytes.

use base64::Engine;

use crate::error::BusError;

/// Symmetric encrypt/decrypt of whole wire values.
pub trait Encryptor: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, BusError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, BusError>;
}

/// Decode a base64 key and check it is 32 bytes.
pub fn decode_key(encoded: &str) -> Result<[u8; 32], BusError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| BusError::Config(format!("encryption key is not base64: {}", e)))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| BusError::Config(format!("encryption key must be 32 bytes, got {}", b.len())))
}

#[cfg(feature = "encryption")]
pub use aes::AesGcmEncryptor;

#[cfg(feature = "encryption")]
mod aes {
    use aes_gcm::aead::{Aead, KeyInit, OsRng};
    use aes_gcm::{AeadCore, Aes256Gcm, Nonce};

    use super::{decode_key, Encryptor};
    use crate::error::BusError;

    const NONCE_SIZE: usize = 12;

    /// AES-256-GCM with a random nonce per message.
    ///
    /// Wire format: `nonce (12 bytes) || ciphertext`.
    pub struct AesGcmEncryptor {
        cipher: Aes256Gcm,
    }

    impl AesGcmEncryptor {
        pub fn new(key: &[u8; 32]) -> Self {
            Self {
                cipher: Aes256Gcm::new(key.into()),
            }
        }

        /// Build from a base64-encoded 32-byte key.
        pub fn from_base64_key(encoded: &str) -> Result<Self, BusError> {
            Ok(Self::new(&decode_key(encoded)?))
        }
    }

    impl Encryptor for AesGcmEncryptor {
        fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, BusError> {
            let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
            let ciphertext = self
                .cipher
                .encrypt(&nonce, plaintext)
                .map_err(|_| BusError::Encryption("encrypt failed".into()))?;

            let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
            out.extend_from_slice(&nonce);
            out.extend_from_slice(&ciphertext);
            Ok(out)
        }

        fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, BusError> {
            if data.len() < NONCE_SIZE {
                return Err(BusError::Encryption("ciphertext too short".into()));
            }
            let (nonce, ciphertext) = data.split_at(NONCE_SIZE);
            self.cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| BusError::Encryption("decrypt failed".into()))
        }
    }

}
