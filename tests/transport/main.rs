//! Transport integration tests against the in-memory broker.

mod support;
mod acknowledgements;
mod encryption;
mod events;
mod lifecycle;
mod reconnect;
