//! Question and answer over request/reply.
//!
//! A client sends a [`Question`]; the server's answerer produces the text of
//! the [`Answer`], which travels back under the question's correlation ID.
use std::{
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::Arc,
};

use log::{info, warn};

use crate::{
    connection::{Connection, Duplex, Endpoint, ReplyConnection, spawn_client, spawn_server},
    correlated,
    error::Result,
    listener::ConnectionFactory,
    protocol::{
        Correlated, CorrelationId, Family, FromWire, Message, Registry,
        primitive::{read_string, write_string},
    },
};

pub const QUESTION: i32 = 1;
pub const ANSWER: i32 = 2;

pub enum Qa {}

impl Family for Qa {
    type Client = QaClient;
    type Server = QaServer;
}

/// Registry shared by both sides of the protocol.
pub fn registry() -> Result<Registry<Qa>> {
    let mut registry = Registry::new();
    registry.register_type::<Question>(QUESTION)?;
    registry.register_type::<Answer>(ANSWER)?;
    Ok(registry)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Question {
    id: CorrelationId,
    pub text: String,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: CorrelationId::unset(),
            text: text.into(),
        }
    }
}

impl FromWire for Question {
    fn read_from(input: &mut dyn Read) -> Result<Self> {
        Ok(Self {
            id: CorrelationId::read_from(input)?,
            text: read_string(input)?,
        })
    }
}

impl Message<Qa> for Question {
    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        self.write_correlation(out)?;
        write_string(out, &self.text)
    }

    fn on_server(&self, server: &QaServer) {
        let answer = Answer::new((server.answerer)(&self.text));
        if let Err(e) = server.link.send_reply_to(answer, self) {
            warn!("failed to answer {:?}: {e}", self.text);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Answer {
    id: CorrelationId,
    pub text: String,
}

impl Answer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: CorrelationId::unset(),
            text: text.into(),
        }
    }
}

correlated!(Question => id, Answer => id);

impl FromWire for Answer {
    fn read_from(input: &mut dyn Read) -> Result<Self> {
        Ok(Self {
            id: CorrelationId::read_from(input)?,
            text: read_string(input)?,
        })
    }
}

impl Message<Qa> for Answer {
    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        self.write_correlation(out)?;
        write_string(out, &self.text)
    }

    fn on_client(&self, _client: &QaClient) {
        info!("answer: {}", self.text);
    }

    fn as_reply(&self) -> Option<&dyn Correlated> {
        Some(self)
    }
}

/// Asking side of the protocol.
#[derive(Debug)]
pub struct QaClient {
    link: ReplyConnection<Qa>,
}

impl QaClient {
    pub fn connect<A: ToSocketAddrs>(address: A) -> Result<Arc<Self>> {
        let connection = Connection::connect(address, Arc::new(registry()?))?;
        Self::start(connection)
    }

    /// Wraps `connection` and starts its read loop.
    pub fn start(connection: Connection<Qa>) -> Result<Arc<Self>> {
        let client = Arc::new(Self {
            link: ReplyConnection::new(connection),
        });
        spawn_client::<Qa>(Arc::clone(&client))?;
        Ok(client)
    }

    /// Sends `question` and hands the answer text to `on_answer` once it
    /// arrives. `on_answer` is dropped unused if the connection closes first.
    pub fn ask<C>(&self, question: &str, on_answer: C) -> Result<CorrelationId>
    where
        C: FnOnce(String) + Send + 'static,
    {
        self.link
            .send_and_await(Question::new(question), move |reply| {
                match reply.downcast_ref::<Answer>() {
                    Some(answer) => on_answer(answer.text.clone()),
                    None => warn!("expected an answer, got {reply:?}"),
                }
            })
    }

    pub fn connection(&self) -> &Connection<Qa> {
        self.link.connection()
    }
}

impl Endpoint<Qa> for QaClient {
    type Link = ReplyConnection<Qa>;

    fn link(&self) -> &ReplyConnection<Qa> {
        &self.link
    }
}

/// Produces the answer text for a question.
pub type Answerer = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Answering side of the protocol, one per accepted connection.
pub struct QaServer {
    link: ReplyConnection<Qa>,
    answerer: Answerer,
}

impl QaServer {
    pub fn start<S: Duplex>(
        stream: S,
        registry: Arc<Registry<Qa>>,
        answerer: Answerer,
    ) -> Result<Arc<Self>> {
        let server = Arc::new(Self {
            link: ReplyConnection::new(Connection::new(stream, registry)?),
            answerer,
        });
        spawn_server::<Qa>(Arc::clone(&server))?;
        Ok(server)
    }

    /// Factory for a [`Listener`](crate::Listener) serving every accepted
    /// stream with `answerer`.
    pub fn factory(registry: Arc<Registry<Qa>>, answerer: Answerer) -> impl ConnectionFactory {
        move |stream: TcpStream| {
            if let Err(e) = Self::start(stream, Arc::clone(&registry), Arc::clone(&answerer)) {
                warn!("failed to start question server: {e}");
            }
        }
    }

    pub fn connection(&self) -> &Connection<Qa> {
        self.link.connection()
    }
}

impl std::fmt::Debug for QaServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QaServer").field("link", &self.link).finish()
    }
}

impl Endpoint<Qa> for QaServer {
    type Link = ReplyConnection<Qa>;

    fn link(&self) -> &ReplyConnection<Qa> {
        &self.link
    }

    fn read(&self) -> Result<Arc<dyn Message<Qa>>> {
        let message = self.link.read()?;
        info!("read {message:?} from {}", self.link.connection().peer());
        Ok(message)
    }
}
