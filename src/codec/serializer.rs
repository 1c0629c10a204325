//! Byte serialization for payloads, envelopes and acknowledgements.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Which binary format goes on the wire.
///
/// Both ends of a bus must agree; bitcode is compact and is the default,
/// JSON is handy when inspecting topics with generic tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Serializer {
    #[default]
    Bitcode,
    Json,
}

impl Serializer {
    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, BusError> {
        match self {
            Serializer::Bitcode => {
                bitcode::serialize(value).map_err(|e| BusError::Serialization(e.to_string()))
            }
            Serializer::Json => {
                serde_json::to_vec(value).map_err(|e| BusError::Serialization(e.to_string()))
            }
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, BusError> {
        match self {
            Serializer::Bitcode => {
                bitcode::deserialize(bytes).map_err(|e| BusError::Serialization(e.to_string()))
            }
            Serializer::Json => {
                serde_json::from_slice(bytes).map_err(|e| BusError::Serialization(e.to_string()))
            }
        }
    }
}
