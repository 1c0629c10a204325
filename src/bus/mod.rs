//! Service bus - the facade the rest of a service talks to.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Bus (per service)                         │
//! │  - register_command_type / register_event_type              │
//! │  - set_command_handlers / set_event_handler                 │
//! │  - open() / close()                                         │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                    │
//!            ▼                                    ▼
//! ┌───────────────────────┐          ┌───────────────────────────┐
//! │ Dispatcher            │          │ Exchange (one per type)   │
//! │  send, await replies  │          │  consume, handle, ack     │
//! └───────────────────────┘          └───────────────────────────┘
//!            │                                    │
//!            └──────────────┬─────────────────────┘
//!                           ▼
//!                 ┌───────────────────┐
//!                 │  Broker (trait)   │
//!                 └───────────────────┘
//! ```
//!
//! Commands are load-balanced across services registering the same type;
//! events reach every registered service.

mod bus;

pub use bus::Bus;
