//! Type-tagged message codec.
//!
//! A [`Registry`] maps non-negative `i32` headers to the logic that decodes,
//! encodes and recognises one kind of message. A frame on the wire is the
//! big-endian header followed by whatever the entry's encoder wrote.
//!
//! Outgoing messages are matched in two steps. Entries registered for a
//! concrete type ([`Registry::register_type`]) are found by `TypeId`. Anything
//! else is offered to the predicate entries in ascending header order, and the
//! first predicate that accepts the message wins.
use std::{
    any::{Any, TypeId},
    collections::{BTreeMap, HashMap},
    fmt,
    io::{Read, Write},
    sync::Arc,
};

use log::trace;

use super::{
    message::{Family, FromWire, Message},
    primitive,
};
use crate::error::{Error, Result};

type Predicate<F> = Box<dyn Fn(&dyn Message<F>) -> bool + Send + Sync>;
type Decoder<F> = Box<dyn Fn(&mut dyn Read) -> Result<Arc<dyn Message<F>>> + Send + Sync>;
type Encoder<F> = Box<dyn Fn(&dyn Message<F>, &mut dyn Write) -> Result<()> + Send + Sync>;

struct Entry<F: Family> {
    matches: Predicate<F>,
    decode: Decoder<F>,
    encode: Encoder<F>,
}

/// Header-to-codec table for one message family.
///
/// Registration needs `&mut self`; share the finished registry behind an `Arc`
/// so connections can only read it.
pub struct Registry<F: Family> {
    entries: BTreeMap<i32, Entry<F>>,
    typed: HashMap<TypeId, i32>,
}

impl<F: Family> Registry<F> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            typed: HashMap::new(),
        }
    }

    /// Binds `id` to an explicit predicate, decoder and encoder.
    ///
    /// Predicates are consulted in ascending header order; keep them disjoint.
    pub fn register<P, D, E>(&mut self, id: i32, matches: P, decode: D, encode: E) -> Result<()>
    where
        P: Fn(&dyn Message<F>) -> bool + Send + Sync + 'static,
        D: Fn(&mut dyn Read) -> Result<Arc<dyn Message<F>>> + Send + Sync + 'static,
        E: Fn(&dyn Message<F>, &mut dyn Write) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(
            id,
            Entry {
                matches: Box::new(matches),
                decode: Box::new(decode),
                encode: Box::new(encode),
            },
        )
    }

    /// Binds `id` to `M`, decoding through [`FromWire::read_from`] and encoding
    /// through [`Message::serialize`].
    pub fn register_type<M>(&mut self, id: i32) -> Result<()>
    where
        M: Message<F> + FromWire,
    {
        let type_id = TypeId::of::<M>();
        if let Some(existing) = self.typed.get(&type_id) {
            return Err(Error::configuration(format!(
                "{} already registered under header {existing}",
                std::any::type_name::<M>()
            )));
        }

        self.register(
            id,
            |message| message.is::<M>(),
            |input| Ok(Arc::new(M::read_from(input)?) as Arc<dyn Message<F>>),
            |message, out| message.serialize(out),
        )?;
        self.typed.insert(type_id, id);
        Ok(())
    }

    /// Binds `id` to one shared, payload-free instance. Only that exact instance
    /// encodes under `id`, and decoding yields it again.
    pub fn register_singleton<M>(&mut self, id: i32, singleton: Arc<M>) -> Result<()>
    where
        M: Message<F>,
    {
        let target = Arc::as_ptr(&singleton) as *const () as usize;
        self.register(
            id,
            move |message| message as *const dyn Message<F> as *const () as usize == target,
            move |_| Ok(Arc::clone(&singleton) as Arc<dyn Message<F>>),
            |_, _| Ok(()),
        )
    }

    fn insert(&mut self, id: i32, entry: Entry<F>) -> Result<()> {
        if id < 0 {
            return Err(Error::configuration(format!(
                "header {id} is negative; negative headers are reserved"
            )));
        }
        if self.entries.contains_key(&id) {
            return Err(Error::configuration(format!("duplicate header {id}")));
        }

        self.entries.insert(id, entry);
        Ok(())
    }

    pub fn contains(&self, id: i32) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Header the registry would tag `message` with.
    pub fn header_of(&self, message: &dyn Message<F>) -> Option<i32> {
        let type_id = Any::type_id(message.as_any());
        if let Some(id) = self.typed.get(&type_id) {
            return Some(*id);
        }

        self.entries
            .iter()
            .find(|(_, entry)| (entry.matches)(message))
            .map(|(id, _)| *id)
    }

    /// Writes `message` as one frame: header, then payload.
    ///
    /// The frame is built in memory first, so a failing encoder leaves `out`
    /// untouched.
    pub fn write(&self, out: &mut dyn Write, message: &dyn Message<F>) -> Result<()> {
        let frame = self.encode(message)?;
        out.write_all(&frame)?;
        Ok(())
    }

    /// Encodes a complete frame into memory.
    pub fn encode(&self, message: &dyn Message<F>) -> Result<Vec<u8>> {
        let id = self.header_of(message).ok_or_else(|| {
            Error::configuration(format!("no registered header accepts {message:?}"))
        })?;

        trace!("encoding {message:?} under header {id}");
        let mut frame = Vec::new();
        primitive::write_i32(&mut frame, id)?;
        (self.entries[&id].encode)(message, &mut frame)?;
        Ok(frame)
    }

    /// Reads one frame and decodes its payload.
    pub fn read(&self, input: &mut dyn Read) -> Result<Arc<dyn Message<F>>> {
        let id = primitive::read_i32(input)?;
        let entry = self
            .entries
            .get(&id)
            .ok_or_else(|| Error::protocol(format!("header {id} not registered")))?;

        let message = (entry.decode)(input)?;
        trace!("decoded {message:?} from header {id}");
        Ok(message)
    }
}

impl<F: Family> Default for Registry<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Family> fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("headers", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}
