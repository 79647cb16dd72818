//! Wire protocol shared by clients and servers.
//!
//! This module defines what travels over a connection: [`Message`] values, the
//! [`Registry`] that maps them to numeric headers, and the [`primitive`] codec
//! their payloads are written with.
//!
//! # Overview
//!
//! A protocol is a [`Family`] of message types. Each type is registered once,
//! under a non-negative `i32` header, with a predicate recognising its values,
//! a decoder and an encoder. Both peers must build their registries with the
//! same headers for the same types; nothing is negotiated on the wire.
//!
//! # Binary Format
//!
//! Frames are not length-prefixed. Each frame is:
//!
//! - The header, as a big-endian `i32`.
//! - The payload, exactly as the message's [`serialize`](Message::serialize)
//!   wrote it. A dataless message writes nothing.
//!
//! Because the decoder must consume exactly what the encoder produced, a
//! mismatch between the two desynchronises the stream for good. Connections
//! treat any decoding failure as fatal.
//!
//! # Request and Reply
//!
//! Messages implementing [`Correlated`] can take part in request/reply
//! exchanges. The [`CorrelationId`] is part of the payload; the framing knows
//! nothing about it.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): Drives reads and writes of these frames.
pub mod primitive;

mod message;
mod registry;

pub use message::{AsAny, Correlated, CorrelationId, Family, FromWire, Message};
pub use registry::Registry;
