//! Bidirectional, message-oriented connections over byte streams.
//!
//! Peers exchange self-describing [`Message`]s framed by a numeric header. On
//! receipt a message acts on the receiving endpoint directly, so applications
//! define behavior by defining message types rather than by dispatching on
//! them. On top of that, [`ReplyConnection`] pairs requests with replies
//! through a [`CorrelationId`] carried in the payload.
//!
//! Every connection runs its own blocking read thread and a [`Listener`]
//! accepts on another; there is no async runtime.
//!
//! The [`demo`] module holds two small protocols built on the crate, used by
//! the bundled binaries.
pub mod config;
pub mod connection;
pub mod demo;
mod error;
pub mod listener;
pub mod protocol;

pub use config::{ConnectionConfig, ListenerConfig};
pub use connection::{
    ClientSide, Connection, Duplex, Endpoint, Link, ReplyConnection, ServerSide, Side, State,
    spawn, spawn_client, spawn_server,
};
pub use error::{Error, Result};
pub use listener::{ConnectionFactory, Listener, ListenerHandle};
pub use protocol::{Correlated, CorrelationId, Family, FromWire, Message, Registry};
