//! Accepting inbound connections.
//!
//! A [`Listener`] binds a TCP port and, once spawned, accepts connections on its
//! own thread, passing each stream to a [`ConnectionFactory`]. The factory picks
//! the endpoint type, wraps the stream and starts its read loop.
//!
//! # Example
//! ```no_run
//! use std::net::TcpStream;
//!
//! use tether::Listener;
//!
//! let listener = Listener::bind("127.0.0.1:4018", |stream: TcpStream| {
//!     println!("accepted {:?}", stream.peer_addr());
//! })
//! .unwrap();
//!
//! let handle = listener.spawn().unwrap();
//! handle.terminate();
//! handle.join();
//! ```
use std::{
    fmt,
    io::ErrorKind,
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
};

use log::{debug, error, info, warn};

use crate::{
    config::ListenerConfig,
    connection::lock,
    error::{Error, Result},
};

/// Turns accepted streams into running connections.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// Called once per accepted stream, on the accept thread. A panic here is
    /// logged and drops that stream; the listener keeps accepting.
    fn create_connection(&self, stream: TcpStream);
}

impl<T> ConnectionFactory for T
where
    T: Fn(TcpStream) + Send + Sync + 'static,
{
    fn create_connection(&self, stream: TcpStream) {
        self(stream)
    }
}

/// A bound port that has not started accepting yet.
pub struct Listener {
    listener: TcpListener,
    address: SocketAddr,
    factory: Arc<dyn ConnectionFactory>,
    config: ListenerConfig,
}

impl Listener {
    /// Binds `address`. Failing to bind is a configuration error, reported here
    /// rather than from the accept thread.
    pub fn bind<A, C>(address: A, factory: C) -> Result<Self>
    where
        A: ToSocketAddrs + fmt::Debug,
        C: ConnectionFactory,
    {
        Self::bind_with_config(address, factory, ListenerConfig::default())
    }

    pub fn bind_with_config<A, C>(address: A, factory: C, config: ListenerConfig) -> Result<Self>
    where
        A: ToSocketAddrs + fmt::Debug,
        C: ConnectionFactory,
    {
        let bind_failure =
            |e: std::io::Error| Error::configuration(format!("failed to bind {address:?}: {e}"));

        let listener = TcpListener::bind(&address).map_err(bind_failure)?;
        let local = listener.local_addr().map_err(bind_failure)?;
        listener.set_nonblocking(true).map_err(bind_failure)?;

        Ok(Self {
            listener,
            address: local,
            factory: Arc::new(factory),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Starts accepting on a dedicated thread.
    pub fn spawn(self) -> Result<ListenerHandle> {
        let open = Arc::new(Mutex::new(true));
        let address = self.address;

        let flag = Arc::clone(&open);
        let thread = thread::Builder::new()
            .name(format!("listener-{address}"))
            .spawn(move || self.accept_loop(&flag))?;

        info!("listening at {address}");
        Ok(ListenerHandle {
            address,
            open,
            thread: Some(thread),
        })
    }

    fn accept_loop(self, open: &Mutex<bool>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    // Held across the factory call so `terminate` waits for it.
                    let open = lock(open);
                    if !*open {
                        debug!("refusing {peer}: listener on {} terminated", self.address);
                        break;
                    }
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("dropping {peer}: failed to configure stream: {e}");
                        continue;
                    }

                    debug!("accepted connection from {peer}");
                    let created = panic::catch_unwind(AssertUnwindSafe(|| {
                        self.factory.create_connection(stream)
                    }));
                    if created.is_err() {
                        error!("connection factory panicked on {peer}; still accepting");
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if !*lock(open) {
                        break;
                    }
                    thread::sleep(self.config.accept_poll);
                }
                Err(e) => {
                    warn!("failed to accept connection on {}: {e}", self.address);
                    if !*lock(open) {
                        break;
                    }
                    thread::sleep(self.config.accept_poll);
                }
            }
        }

        info!("listener on {} stopped", self.address);
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.address)
            .field("config", &self.config)
            .finish()
    }
}

/// Control over a running accept loop. Dropping the handle terminates it.
#[derive(Debug)]
pub struct ListenerHandle {
    address: SocketAddr,
    open: Arc<Mutex<bool>>,
    thread: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn is_open(&self) -> bool {
        *lock(&self.open)
    }

    /// Stops accepting. Once this returns the factory is not called again;
    /// connections it already created keep running.
    ///
    /// Waits for an in-progress factory call, so must not be called from inside
    /// the factory.
    pub fn terminate(&self) {
        let mut open = lock(&self.open);
        if *open {
            *open = false;
            info!("terminating listener on {}", self.address);
        }
    }

    /// Waits for the accept thread to finish. Call [`terminate`](Self::terminate)
    /// first or this blocks forever.
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("accept thread for {} panicked", self.address);
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    use super::*;

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn counting() -> (Arc<AtomicUsize>, impl ConnectionFactory) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let factory = move |_stream: TcpStream| {
            counter.fetch_add(1, Ordering::SeqCst);
        };
        (count, factory)
    }

    #[test]
    fn accepted_streams_reach_factory() {
        let (count, factory) = counting();
        let handle = Listener::bind("127.0.0.1:0", factory)
            .unwrap()
            .spawn()
            .unwrap();

        let _a = TcpStream::connect(handle.local_addr()).unwrap();
        let _b = TcpStream::connect(handle.local_addr()).unwrap();

        assert!(wait_until(|| count.load(Ordering::SeqCst) == 2));
    }

    #[test]
    fn no_connections_after_terminate() {
        let (count, factory) = counting();
        let config = ListenerConfig::default().accept_poll(Duration::from_millis(5));
        let handle = Listener::bind_with_config("127.0.0.1:0", factory, config)
            .unwrap()
            .spawn()
            .unwrap();
        let address = handle.local_addr();

        let _first = TcpStream::connect(address).unwrap();
        assert!(wait_until(|| count.load(Ordering::SeqCst) == 1));

        handle.terminate();
        assert!(!handle.is_open());
        let _late = TcpStream::connect(address);
        handle.join();

        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_factory_keeps_accepting() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let factory = move |_stream: TcpStream| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("first connection rejected");
            }
        };
        let handle = Listener::bind("127.0.0.1:0", factory)
            .unwrap()
            .spawn()
            .unwrap();

        let _first = TcpStream::connect(handle.local_addr()).unwrap();
        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1));

        let _second = TcpStream::connect(handle.local_addr()).unwrap();
        assert!(wait_until(|| calls.load(Ordering::SeqCst) == 2));
        assert!(handle.is_open());

        handle.terminate();
        handle.join();
    }

    #[test]
    fn bind_conflict_is_configuration_error() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = taken.local_addr().unwrap();

        let err = Listener::bind(address, |_stream: TcpStream| {}).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn terminate_is_idempotent() {
        let handle = Listener::bind("127.0.0.1:0", |_stream: TcpStream| {})
            .unwrap()
            .spawn()
            .unwrap();

        handle.terminate();
        handle.terminate();
        handle.join();
    }
}
