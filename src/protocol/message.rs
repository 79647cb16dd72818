//! Self-describing messages.
//!
//! A [`Message`] carries its own receive-time behavior: once the registry has
//! decoded one, the connection hands itself to the message's
//! [`on_client`](Message::on_client) or [`on_server`](Message::on_server)
//! effect. The transport never switches on concrete message types.
//!
//! Messages belong to a [`Family`], which names the context types each side of
//! the conversation passes to those effects.
use std::{
    any::Any,
    fmt,
    io::{Read, Write},
};

use uuid::Uuid;

use super::primitive;
use crate::error::Result;

/// Binds a message family to the endpoint types its effects run against.
///
/// `Client` is what a message sees when a client receives it, `Server` what it
/// sees on the server. Families are usually uninhabited marker types.
pub trait Family: Sized + Send + Sync + 'static {
    type Client: Send + Sync + 'static;
    type Server: Send + Sync + 'static;
}

/// Type-erased access to the concrete message, implemented for every type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A unit of protocol data that knows how to write itself and how to act on the
/// endpoint that receives it.
pub trait Message<F: Family>: AsAny + fmt::Debug + Send + Sync {
    /// Writes the payload. Must mirror the decoder registered for this type.
    /// Dataless messages keep the default.
    fn serialize(&self, _out: &mut dyn Write) -> Result<()> {
        Ok(())
    }

    /// Invoked on the client's read thread when the client receives this message.
    fn on_client(&self, _client: &F::Client) {}

    /// Invoked on the server's read thread when the server receives this message.
    fn on_server(&self, _server: &F::Server) {}

    /// Messages playing the reply role return themselves here so a
    /// [`ReplyConnection`](crate::ReplyConnection) can route them.
    fn as_reply(&self) -> Option<&dyn Correlated> {
        None
    }
}

impl<F: Family> dyn Message<F> {
    pub fn downcast_ref<T: Message<F>>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }

    pub fn is<T: Message<F>>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Decoding half of a message type, used by
/// [`Registry::register_type`](crate::Registry::register_type).
pub trait FromWire: Sized {
    fn read_from(input: &mut dyn Read) -> Result<Self>;
}

/// Opaque token linking a request to its reply. The empty token means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// A fresh identifier made of two v4 UUIDs, 244 random bits from the OS source.
    pub fn generate() -> Self {
        Self(format!(
            "{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        ))
    }

    pub fn unset() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn read_from(input: &mut dyn Read) -> Result<Self> {
        primitive::read_string(input).map(Self)
    }

    pub fn write_to(&self, out: &mut dyn Write) -> Result<()> {
        primitive::write_string(out, &self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Shared by the request (repliable) and reply roles. Implementors write the
/// correlation ID as the first payload field; see [`correlated!`](crate::correlated)
/// for the usual implementation.
pub trait Correlated {
    fn correlation_id(&self) -> &CorrelationId;
    fn set_correlation_id(&mut self, id: CorrelationId);

    /// Writes the correlation ID ahead of the rest of the payload.
    fn write_correlation(&self, out: &mut dyn Write) -> Result<()> {
        self.correlation_id().write_to(out)
    }
}

/// Implements [`Correlated`] for message types by delegating to the field
/// holding their [`CorrelationId`].
///
/// ```
/// use tether::{CorrelationId, correlated};
///
/// #[derive(Debug, Default)]
/// struct Ping {
///     id: CorrelationId,
///     seq: i32,
/// }
///
/// correlated!(Ping => id);
/// ```
///
/// The payload half stays with the message: `serialize` starts with
/// [`Correlated::write_correlation`] and the decoder with
/// [`CorrelationId::read_from`].
#[macro_export]
macro_rules! correlated {
    ($($ty:ty => $field:tt),+ $(,)?) => {
        $(
            impl $crate::protocol::Correlated for $ty {
                fn correlation_id(&self) -> &$crate::protocol::CorrelationId {
                    &self.$field
                }

                fn set_correlation_id(&mut self, id: $crate::protocol::CorrelationId) {
                    self.$field = id;
                }
            }
        )+
    };
}
