//! Commands, events and the decoded payloads handlers receive.
//!
//! A message type is identified on the wire by a stable string tag
//! ([`Message::TYPE_NAME`]). Registering a type captures its decoder once, so
//! an exchange turns envelope bytes back into a typed value without any
//! runtime type lookup.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! struct PlaceOrder { id: String }
//! sourced_bus::command!(PlaceOrder);
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderPlaced { id: String }
//! sourced_bus::event!(OrderPlaced => "orders.OrderPlaced");
//! ```

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::Serializer;
use crate::error::BusError;

/// Anything that can travel on the bus.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire tag; also the base of the topic name.
    const TYPE_NAME: &'static str;
}

/// A directed request with at most one logical handler.
pub trait Command: Message {}

/// A broadcast notification with any number of subscribers.
pub trait Event: Message {}

/// Implement [`Command`] for a type, tagged with its name or an explicit tag.
#[macro_export]
macro_rules! command {
    ($ty:ident) => {
        $crate::command!($ty => stringify!($ty));
    };
    ($ty:ident => $name:expr) => {
        impl $crate::Message for $ty {
            const TYPE_NAME: &'static str = $name;
        }
        impl $crate::Command for $ty {}
    };
}

/// Implement [`Event`] for a type, tagged with its name or an explicit tag.
#[macro_export]
macro_rules! event {
    ($ty:ident) => {
        $crate::event!($ty => stringify!($ty));
    };
    ($ty:ident => $name:expr) => {
        impl $crate::Message for $ty {
            const TYPE_NAME: &'static str = $name;
        }
        impl $crate::Event for $ty {}
    };
}

/// Which side of the bus a type belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Command,
    Event,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Event => "event",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded message, handed to handlers without its static type.
///
/// Handlers bound for several types match on [`Payload::type_name`] or try
/// [`Payload::downcast_ref`] per type.
pub struct Payload {
    type_name: &'static str,
    value: Box<dyn Any + Send + Sync>,
}

impl Payload {
    pub fn new<M: Message>(message: M) -> Self {
        Self {
            type_name: M::TYPE_NAME,
            value: Box::new(message),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<M: Message>(&self) -> bool {
        self.value.is::<M>()
    }

    pub fn downcast_ref<M: Message>(&self) -> Option<&M> {
        self.value.downcast_ref::<M>()
    }

    /// Take the typed message out, or get the payload back on a type mismatch.
    pub fn downcast<M: Message>(self) -> Result<M, Payload> {
        let type_name = self.type_name;
        self.value
            .downcast::<M>()
            .map(|boxed| *boxed)
            .map_err(|value| Payload { type_name, value })
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Payload")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

type DecodeFn = dyn Fn(Serializer, &[u8]) -> Result<Payload, BusError> + Send + Sync;

/// A registered message type: its tag, its kind and its decoder.
#[derive(Clone)]
pub struct MessageType {
    name: &'static str,
    kind: MessageKind,
    decode: Arc<DecodeFn>,
}

impl MessageType {
    pub fn command<C: Command>() -> Self {
        Self::of::<C>(MessageKind::Command)
    }

    pub fn event<E: Event>() -> Self {
        Self::of::<E>(MessageKind::Event)
    }

    fn of<M: Message>(kind: MessageKind) -> Self {
        Self {
            name: M::TYPE_NAME,
            kind,
            decode: Arc::new(|serializer: Serializer, bytes: &[u8]| {
                serializer.deserialize::<M>(bytes).map(Payload::new)
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// Decode payload bytes tagged `tag`. Fails when the tag is not this type.
    pub fn decode(&self, tag: &str, serializer: Serializer, bytes: &[u8]) -> Result<Payload, BusError> {
        if tag != self.name {
            return Err(BusError::UnregisteredType(tag.to_string()));
        }
        (self.decode)(serializer, bytes)
    }
}

impl fmt::Debug for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageType")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for MessageType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.kind == other.kind
    }
}
