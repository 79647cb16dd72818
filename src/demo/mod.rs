//! Small protocols built on the crate.
//!
//! - [`chat`]: one-way lines relayed between members of a room.
//! - [`qa`]: questions answered through request/reply correlation.
//!
//! Both back the `chat_*` and `qa_*` binaries and double as working examples
//! of a [`Family`](crate::Family) with custom endpoint types.
pub mod chat;
pub mod qa;
