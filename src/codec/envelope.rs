//! What travels on the wire: envelopes out, acknowledgements back.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BusError;
use crate::identity::Identity;

/// Header naming the topic an acknowledgement must be produced to.
pub const ACK_TOPIC_HEADER: &str = "AckTopic";

/// Header carrying the correlation id the acknowledgement must be keyed with.
pub const ACK_KEY_HEADER: &str = "AckKey";

/// Record key distinguishing "no reply wanted" from "reply wanted".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireKey {
    Body,
    BodyAck,
}

impl WireKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            WireKey::Body => "Body",
            WireKey::BodyAck => "BodyAck",
        }
    }

    pub fn parse(key: &str) -> Result<Self, BusError> {
        match key {
            "Body" => Ok(WireKey::Body),
            "BodyAck" => Ok(WireKey::BodyAck),
            other => Err(BusError::UnknownWireKey(other.to_string())),
        }
    }

    pub fn wants_reply(&self) -> bool {
        matches!(self, WireKey::BodyAck)
    }
}

/// How a dispatched command expects to be answered.
///
/// The record's [`WireKey`] says whether a reply is wanted. The envelope also
/// records the mode so the exchange can choose between the await and the
/// await-with-result handler bindings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchMode {
    FireAndForget,
    AwaitHandlerCompletion,
    AwaitHandlerResult,
}

impl DispatchMode {
    pub fn wire_key(&self) -> WireKey {
        match self {
            DispatchMode::FireAndForget => WireKey::Body,
            _ => WireKey::BodyAck,
        }
    }
}

/// One message on the wire: payload plus caller snapshot and origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Registered type tag of the payload.
    pub message_type: String,
    /// Serialized payload.
    pub payload: Vec<u8>,
    /// Dispatch mode requested by the sender.
    pub mode: DispatchMode,
    /// Caller claims at dispatch time.
    pub claims: Option<Vec<(String, String)>>,
    /// Service that dispatched the message.
    pub source_service: Option<String>,
}

impl Envelope {
    pub fn new(message_type: impl Into<String>, payload: Vec<u8>, mode: DispatchMode) -> Self {
        Self {
            message_type: message_type.into(),
            payload,
            mode,
            claims: None,
            source_service: None,
        }
    }

    /// Attach a caller identity snapshot. Empty identities are omitted.
    pub fn with_identity(mut self, identity: Option<&Identity>) -> Self {
        self.claims = identity.filter(|i| !i.is_empty()).map(Identity::to_claims);
        self
    }

    pub fn with_source(mut self, service: Option<&str>) -> Self {
        self.source_service = service.map(str::to_string);
        self
    }

    /// Rebuild the caller identity, if one was sent.
    pub fn identity(&self) -> Option<Identity> {
        self.claims.clone().map(Identity::from_claims)
    }
}

/// Reply produced by an exchange for a reply-wanted dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub success: bool,
    pub error_message: Option<String>,
    /// JSON-encoded handler result, for result-bearing dispatches.
    pub result: Option<Vec<u8>>,
}

impl Acknowledgement {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: None,
            result: None,
        }
    }

    pub fn with_result(value: &Value) -> Result<Self, BusError> {
        let bytes = serde_json::to_vec(value).map_err(|e| BusError::Serialization(e.to_string()))?;
        Ok(Self {
            success: true,
            error_message: None,
            result: Some(bytes),
        })
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            result: None,
        }
    }

    /// Decode the result into `T`. A missing result decodes from JSON `null`.
    pub fn decode_result<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        let value = match &self.result {
            Some(bytes) => {
                serde_json::from_slice(bytes).map_err(|e| BusError::Serialization(e.to_string()))?
            }
            None => Value::Null,
        };
        serde_json::from_value(value).map_err(|e| BusError::Serialization(e.to_string()))
    }

    /// Turn a failed acknowledgement into a [`BusError::RemoteHandler`].
    pub fn into_result(self, topic: &str) -> Result<Self, BusError> {
        if self.success {
            Ok(self)
        } else {
            Err(BusError::RemoteHandler {
                topic: topic.to_string(),
                message: self.error_message.unwrap_or_default(),
            })
        }
    }
}
