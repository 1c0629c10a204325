//! Wire codec - serializer, optional encryption, and the wire shapes.
//!
//! ```text
//! value ──serialize──▶ bytes ──encrypt (optional)──▶ record value
//! record value ──decrypt (optional)──▶ bytes ──deserialize──▶ value
//! ```

mod encryption;
mod envelope;
mod serializer;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::BusConfig;
use crate::error::BusError;

#[cfg(feature = "encryption")]
pub use encryption::AesGcmEncryptor;
pub use encryption::{decode_key, Encryptor};
pub use envelope::{
    Acknowledgement, DispatchMode, Envelope, WireKey, ACK_KEY_HEADER, ACK_TOPIC_HEADER,
};
pub use serializer::Serializer;

/// Serializer plus optional encryptor, shared by both sides of the bus.
#[derive(Clone, Default)]
pub struct WireCodec {
    serializer: Serializer,
    encryptor: Option<Arc<dyn Encryptor>>,
}

impl WireCodec {
    pub fn new(serializer: Serializer) -> Self {
        Self {
            serializer,
            encryptor: None,
        }
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn Encryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    /// Build the codec a config describes.
    pub fn from_config(config: &BusConfig) -> Result<Self, BusError> {
        let codec = Self::new(config.serializer);
        match &config.encryption_key {
            None => Ok(codec),
            #[cfg(feature = "encryption")]
            Some(key) => Ok(codec.with_encryptor(Arc::new(AesGcmEncryptor::from_base64_key(key)?))),
            #[cfg(not(feature = "encryption"))]
            Some(_) => Err(BusError::Config(
                "encryption_key set but the `encryption` feature is disabled".into(),
            )),
        }
    }

    pub fn serializer(&self) -> Serializer {
        self.serializer
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryptor.is_some()
    }

    /// Serialize then encrypt.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, BusError> {
        let bytes = self.serializer.serialize(value)?;
        match &self.encryptor {
            Some(encryptor) => encryptor.encrypt(&bytes),
            None => Ok(bytes),
        }
    }

    /// Decrypt then deserialize.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, BusError> {
        match &self.encryptor {
            Some(encryptor) => self.serializer.deserialize(&encryptor.decrypt(bytes)?),
            None => self.serializer.deserialize(bytes),
        }
    }
}

impl std::fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireCodec")
            .field("serializer", &self.serializer)
            .field("encrypted", &self.is_encrypted())
            .finish()
    }
}
