pub mod broker;
pub mod bus;
pub mod codec;
mod config;
pub mod dispatch;
mod error;
pub mod exchange;
pub mod identity;
mod message;
pub mod topic;

pub use broker::{Broker, InMemoryBroker};
pub use bus::Bus;
pub use codec::{Acknowledgement, DispatchMode, Envelope, Serializer, WireCodec};
pub use config::BusConfig;
pub use dispatch::Dispatcher;
pub use error::{BrokerError, BusError, HandlerError};
pub use exchange::{
    CallContext, CommandHandlers, EventHandler, Exchange, ExchangeState, ExchangeStats,
    ReceiveBudget, RetryPolicy,
};
pub use identity::Identity;
pub use message::{Command, Event, Message, MessageKind, MessageType, Payload};
