//! Live connections to a single peer.
//!
//! A [`Connection`] owns one [`Duplex`] stream. Inbound traffic is consumed by a
//! dedicated read loop, started with [`spawn_client`] or [`spawn_server`], which
//! decodes one message at a time and hands the receiving [`Endpoint`] to the
//! message's own effect. Outbound traffic goes through [`Connection::send`] on
//! whatever thread calls it.
//!
//! # Endpoints
//!
//! The value a message acts on is the endpoint, not the bare connection. An
//! endpoint is any type that can reach its connection through a [`Link`]:
//! a plain [`Connection`], a [`ReplyConnection`], or an application type
//! wrapping either. [`Family`] fixes which endpoint type each side uses.
//!
//! # Failure
//!
//! Connections never recover. The first I/O failure, undecodable frame or
//! panicking effect moves the connection to [`State::Disconnected`], shuts the
//! stream down and ends the read loop. Errors on the read thread are logged,
//! never returned to application code.
//!
//! # Concurrency
//!
//! Sends from different threads are serialised by a per-connection write lock
//! and each frame is written whole, so frames never interleave. Effects run one
//! at a time on the read thread, in arrival order; a slow effect delays every
//! message behind it.
mod reply;
mod stream;

use std::{
    io::{self, BufReader, Read, Write},
    net::{TcpStream, ToSocketAddrs},
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use log::{debug, error, info, trace, warn};

use crate::{
    config::ConnectionConfig,
    error::{Error, Result},
    protocol::{Family, Message, Registry},
};

pub use reply::ReplyConnection;
pub use stream::Duplex;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Disconnected,
}

type Hook = Box<dyn FnOnce() + Send>;

/// One peer's stream, bound to the registry of its message family.
pub struct Connection<F: Family> {
    peer: String,
    registry: Arc<Registry<F>>,
    reader: Mutex<BufReader<Box<dyn Read + Send>>>,
    writer: Mutex<Box<dyn Write + Send>>,
    stream: Box<dyn Duplex>,
    running: AtomicBool,
    hooks: Mutex<Vec<Hook>>,
}

impl<F: Family> Connection<F> {
    /// Wraps an established stream. No I/O happens until a read loop is spawned
    /// or a message is sent.
    pub fn new<S: Duplex>(stream: S, registry: Arc<Registry<F>>) -> Result<Self> {
        Self::with_config(stream, registry, ConnectionConfig::default())
    }

    pub fn with_config<S: Duplex>(
        stream: S,
        registry: Arc<Registry<F>>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        stream.set_timeouts(config.read_timeout, config.write_timeout)?;
        let reader: Box<dyn Read + Send> = Box::new(stream.try_clone()?);
        let writer: Box<dyn Write + Send> = Box::new(stream.try_clone()?);

        Ok(Self {
            peer: stream.peer(),
            registry,
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            stream: Box::new(stream),
            running: AtomicBool::new(true),
            hooks: Mutex::new(Vec::new()),
        })
    }

    /// Opens a TCP connection to `address`.
    pub fn connect<A: ToSocketAddrs>(address: A, registry: Arc<Registry<F>>) -> Result<Self> {
        Self::new(TcpStream::connect(address)?, registry)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn registry(&self) -> &Arc<Registry<F>> {
        &self.registry
    }

    pub fn state(&self) -> State {
        if self.running.load(Ordering::Acquire) {
            State::Running
        } else {
            State::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == State::Running
    }

    /// Blocks until one whole message has been decoded from the stream.
    pub fn read(&self) -> Result<Arc<dyn Message<F>>> {
        let mut reader = lock(&self.reader);
        self.registry.read(&mut *reader)
    }

    /// Writes `message` as a single frame.
    ///
    /// Stream failures disconnect the connection and are logged rather than
    /// returned. A message the registry cannot encode is returned as an error
    /// and leaves the stream untouched. Sending on a disconnected connection
    /// does nothing.
    pub fn send(&self, message: &dyn Message<F>) -> Result<()> {
        if !self.is_connected() {
            debug!("dropping {message:?}: connection to {} is closed", self.peer);
            return Ok(());
        }

        let frame = self.registry.encode(message)?;
        let written = {
            let mut writer = lock(&self.writer);
            writer.write_all(&frame).and_then(|_| writer.flush())
        };

        match written {
            Ok(()) => trace!("sent {message:?} to {} ({} bytes)", self.peer, frame.len()),
            Err(e) => {
                warn!("disconnecting from {} after failed send: {e}", self.peer);
                self.disconnect();
            }
        }
        Ok(())
    }

    /// Shuts the stream down and runs the disconnect hooks. Only the first call
    /// has any effect.
    ///
    /// The cloned read and write handles are closed here. The read handle is
    /// left for drop if a read is still in progress on another thread. The
    /// original stream stays open until the connection itself is dropped.
    pub fn disconnect(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        info!("disconnecting from {}", self.peer);
        if let Err(e) = self.stream.shutdown() {
            debug!("shutdown of stream to {} failed: {e}", self.peer);
        }

        let closed: Box<dyn Write + Send> = Box::new(io::sink());
        *lock(&self.writer) = closed;
        let reader = match self.reader.try_lock() {
            Ok(reader) => Some(reader),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        };
        if let Some(mut reader) = reader {
            let closed: Box<dyn Read + Send> = Box::new(io::empty());
            *reader = BufReader::new(closed);
        }

        let hooks = std::mem::take(&mut *lock(&self.hooks));
        for hook in hooks {
            hook();
        }
    }

    /// Registers cleanup to run once the connection disconnects. Runs
    /// immediately if it already has.
    pub fn on_disconnect<H>(&self, hook: H)
    where
        H: FnOnce() + Send + 'static,
    {
        {
            let mut hooks = lock(&self.hooks);
            if self.is_connected() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }
}

impl<F: Family> std::fmt::Debug for Connection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

impl<F: Family> Drop for Connection<F> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Access to the connection underneath an endpoint, plus the raw per-message
/// read step.
pub trait Link<F: Family>: Send + Sync + 'static {
    fn connection(&self) -> &Connection<F>;

    fn read(&self) -> Result<Arc<dyn Message<F>>> {
        self.connection().read()
    }
}

impl<F: Family> Link<F> for Connection<F> {
    fn connection(&self) -> &Connection<F> {
        self
    }
}

/// The value messages act on when received.
pub trait Endpoint<F: Family>: Send + Sync + 'static {
    type Link: Link<F>;

    fn link(&self) -> &Self::Link;

    /// Read step of the read loop. Override to inspect or post-process each
    /// message; delegate to the link to keep its decoding behavior.
    fn read(&self) -> Result<Arc<dyn Message<F>>> {
        self.link().read()
    }
}

impl<F: Family> Endpoint<F> for Connection<F> {
    type Link = Self;

    fn link(&self) -> &Self {
        self
    }
}

/// Which effect a read loop invokes.
pub trait Side<F: Family>: 'static {
    type Endpoint: Endpoint<F>;

    const NAME: &'static str;

    fn apply(message: &dyn Message<F>, endpoint: &Self::Endpoint);
}

pub enum ClientSide {}

impl<F: Family> Side<F> for ClientSide
where
    F::Client: Endpoint<F>,
{
    type Endpoint = F::Client;

    const NAME: &'static str = "client";

    fn apply(message: &dyn Message<F>, endpoint: &F::Client) {
        message.on_client(endpoint)
    }
}

pub enum ServerSide {}

impl<F: Family> Side<F> for ServerSide
where
    F::Server: Endpoint<F>,
{
    type Endpoint = F::Server;

    const NAME: &'static str = "server";

    fn apply(message: &dyn Message<F>, endpoint: &F::Server) {
        message.on_server(endpoint)
    }
}

/// Starts the read loop for `endpoint` on a new thread.
pub fn spawn<F, S>(endpoint: Arc<S::Endpoint>) -> Result<JoinHandle<()>>
where
    F: Family,
    S: Side<F>,
{
    let name = format!("{}-{}", S::NAME, endpoint.link().connection().peer());
    thread::Builder::new()
        .name(name)
        .spawn(move || run::<F, S>(&endpoint))
        .map_err(Error::Io)
}

/// Starts a read loop that applies [`Message::on_client`].
pub fn spawn_client<F>(endpoint: Arc<F::Client>) -> Result<JoinHandle<()>>
where
    F: Family,
    F::Client: Endpoint<F>,
{
    spawn::<F, ClientSide>(endpoint)
}

/// Starts a read loop that applies [`Message::on_server`].
pub fn spawn_server<F>(endpoint: Arc<F::Server>) -> Result<JoinHandle<()>>
where
    F: Family,
    F::Server: Endpoint<F>,
{
    spawn::<F, ServerSide>(endpoint)
}

fn run<F: Family, S: Side<F>>(endpoint: &S::Endpoint) {
    let connection = endpoint.link().connection();
    debug!("{} read loop started for {}", S::NAME, connection.peer());

    loop {
        let step = panic::catch_unwind(AssertUnwindSafe(|| -> Result<()> {
            let message = endpoint.read()?;
            S::apply(&*message, endpoint);
            Ok(())
        }));

        match step {
            Ok(Ok(())) => continue,
            Ok(Err(e)) if connection.is_connected() => {
                warn!("disconnecting {} on account of: {e}", connection.peer());
            }
            Ok(Err(e)) => debug!("read loop for {} ended: {e}", connection.peer()),
            Err(_) => error!(
                "{} read loop for {} panicked; disconnecting",
                S::NAME,
                connection.peer()
            ),
        }
        break;
    }

    connection.disconnect();
}
