//! Request/reply correlation on top of a [`Connection`].
//!
//! [`ReplyConnection::send_and_await`] stamps a fresh [`CorrelationId`] on a
//! request and remembers a callback under it. When a message playing the reply
//! role arrives carrying that ID, the read loop removes the entry and runs the
//! callback, on the read thread, before the reply's own effect. Replies nobody is
//! waiting for are dropped.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use log::{debug, trace};

use super::{Connection, Endpoint, Link, lock};
use crate::{
    error::Result,
    protocol::{Correlated, CorrelationId, Family, Message},
};

type Callback<F> = Box<dyn FnOnce(Arc<dyn Message<F>>) + Send>;
type Pending<F> = Arc<Mutex<HashMap<CorrelationId, Callback<F>>>>;

/// A connection that can pair outgoing requests with incoming replies.
pub struct ReplyConnection<F: Family> {
    connection: Connection<F>,
    pending: Pending<F>,
}

impl<F: Family> ReplyConnection<F> {
    pub fn new(connection: Connection<F>) -> Self {
        let pending: Pending<F> = Arc::new(Mutex::new(HashMap::new()));

        // Callbacks can never fire once the stream is gone.
        let table = Arc::clone(&pending);
        let peer = connection.peer().to_string();
        connection.on_disconnect(move || {
            let dropped = lock(&table).drain().count();
            if dropped > 0 {
                debug!("discarding {dropped} unanswered requests to {peer}");
            }
        });

        Self {
            connection,
            pending,
        }
    }

    pub fn connection(&self) -> &Connection<F> {
        &self.connection
    }

    pub fn send(&self, message: &dyn Message<F>) -> Result<()> {
        self.connection.send(message)
    }

    pub fn disconnect(&self) {
        self.connection.disconnect()
    }

    /// Number of requests still waiting for a reply.
    pub fn pending(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Sends `repliable` under a fresh correlation ID and runs `on_reply` with
    /// the first reply carrying that ID.
    ///
    /// The callback runs on the read thread and blocks further reads until it
    /// returns; hand long work to another thread.
    pub fn send_and_await<M, C>(&self, mut repliable: M, on_reply: C) -> Result<CorrelationId>
    where
        M: Message<F> + Correlated,
        C: FnOnce(Arc<dyn Message<F>>) + Send + 'static,
    {
        let id = CorrelationId::generate();
        lock(&self.pending).insert(id.clone(), Box::new(on_reply));
        repliable.set_correlation_id(id.clone());

        if let Err(e) = self.connection.send(&repliable) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }
        if !self.connection.is_connected() {
            lock(&self.pending).remove(&id);
        }
        Ok(id)
    }

    /// Sends `reply` carrying the correlation ID of `repliable`.
    pub fn send_reply_to<M>(&self, mut reply: M, repliable: &dyn Correlated) -> Result<()>
    where
        M: Message<F> + Correlated,
    {
        reply.set_correlation_id(repliable.correlation_id().clone());
        self.connection.send(&reply)
    }

    /// Reads one message, delivering it to its waiting callback first if it is
    /// a reply.
    pub fn read(&self) -> Result<Arc<dyn Message<F>>> {
        let message = self.connection.read()?;

        if let Some(reply) = message.as_reply() {
            let id = reply.correlation_id();
            let waiting = lock(&self.pending).remove(id);
            match waiting {
                Some(callback) => {
                    trace!("delivering {message:?} to request {id}");
                    callback(Arc::clone(&message));
                }
                None => debug!("dropping {message:?}: no request pending under '{id}'"),
            }
        }

        Ok(message)
    }
}

impl<F: Family> std::fmt::Debug for ReplyConnection<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyConnection")
            .field("connection", &self.connection)
            .field("pending", &self.pending())
            .finish()
    }
}

impl<F: Family> Link<F> for ReplyConnection<F> {
    fn connection(&self) -> &Connection<F> {
        &self.connection
    }

    fn read(&self) -> Result<Arc<dyn Message<F>>> {
        ReplyConnection::read(self)
    }
}

impl<F: Family> Endpoint<F> for ReplyConnection<F> {
    type Link = Self;

    fn link(&self) -> &Self {
        self
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        sync::{
            atomic::{AtomicUsize, Ordering},
            mpsc,
        },
        time::Duration,
    };

    use super::*;
    use crate::{
        connection::{spawn_client, spawn_server},
        protocol::{
            FromWire, Registry,
            primitive::{read_i32, read_string, write_i32, write_string},
        },
    };

    const WAIT: Duration = Duration::from_secs(5);

    enum Math {}

    impl Family for Math {
        type Client = ReplyConnection<Math>;
        type Server = ReplyConnection<Math>;
    }

    /// Asks the server to double a number.
    #[derive(Debug, Default)]
    struct Double {
        id: CorrelationId,
        value: i32,
    }

    impl Message<Math> for Double {
        fn serialize(&self, out: &mut dyn Write) -> Result<()> {
            self.write_correlation(out)?;
            write_i32(out, self.value)
        }

        fn on_server(&self, server: &ReplyConnection<Math>) {
            // negative input answers twice, to exercise duplicate replies
            let times = if self.value < 0 { 2 } else { 1 };
            for _ in 0..times {
                let result = Doubled {
                    id: CorrelationId::unset(),
                    value: self.value * 2,
                };
                server.send_reply_to(result, self).unwrap();
            }
        }
    }

    impl FromWire for Double {
        fn read_from(input: &mut dyn Read) -> Result<Self> {
            Ok(Self {
                id: CorrelationId::read_from(input)?,
                value: read_i32(input)?,
            })
        }
    }

    #[derive(Debug, PartialEq)]
    struct Doubled {
        id: CorrelationId,
        value: i32,
    }

    crate::correlated!(Double => id, Doubled => id);

    impl Message<Math> for Doubled {
        fn serialize(&self, out: &mut dyn Write) -> Result<()> {
            self.write_correlation(out)?;
            write_i32(out, self.value)
        }

        fn as_reply(&self) -> Option<&dyn Correlated> {
            Some(self)
        }
    }

    impl FromWire for Doubled {
        fn read_from(input: &mut dyn Read) -> Result<Self> {
            Ok(Self {
                id: CorrelationId::read_from(input)?,
                value: read_i32(input)?,
            })
        }
    }

    #[derive(Debug)]
    struct Note(String);

    impl Message<Math> for Note {
        fn serialize(&self, out: &mut dyn Write) -> Result<()> {
            write_string(out, &self.0)
        }
    }

    impl FromWire for Note {
        fn read_from(input: &mut dyn Read) -> Result<Self> {
            read_string(input).map(Note)
        }
    }

    fn registry() -> Arc<Registry<Math>> {
        let mut registry = Registry::new();
        registry.register_type::<Double>(1).unwrap();
        registry.register_type::<Doubled>(2).unwrap();
        registry.register_type::<Note>(3).unwrap();
        Arc::new(registry)
    }

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn running_pair() -> Arc<ReplyConnection<Math>> {
        let (client, server) = pair();
        let registry = registry();
        let client = Arc::new(ReplyConnection::new(
            Connection::new(client, Arc::clone(&registry)).unwrap(),
        ));
        let server = Arc::new(ReplyConnection::new(
            Connection::new(server, registry).unwrap(),
        ));
        spawn_server::<Math>(server).unwrap();
        spawn_client::<Math>(Arc::clone(&client)).unwrap();
        client
    }

    fn wait_for_empty(connection: &ReplyConnection<Math>) {
        let deadline = std::time::Instant::now() + WAIT;
        while connection.pending() > 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn reply_resolves_callback() {
        let client = running_pair();
        let (tx, rx) = mpsc::channel();

        client
            .send_and_await(
                Double {
                    value: 21,
                    ..Default::default()
                },
                move |reply| {
                    let result = reply.downcast_ref::<Doubled>().unwrap();
                    tx.send(result.value).unwrap();
                },
            )
            .unwrap();

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 42);
        wait_for_empty(&client);
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn duplicate_reply_delivered_once() {
        let client = running_pair();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (tx, rx) = mpsc::channel();

        client
            .send_and_await(
                Double {
                    value: -4,
                    ..Default::default()
                },
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
        // a later request proves both replies to the first have been read
        client
            .send_and_await(
                Double {
                    value: 1,
                    ..Default::default()
                },
                move |_| tx.send(()).unwrap(),
            )
            .unwrap();

        rx.recv_timeout(WAIT).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn concurrent_requests_resolve_independently() {
        let client = running_pair();
        let (tx, rx) = mpsc::channel();

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let client = Arc::clone(&client);
                let tx = tx.clone();
                std::thread::spawn(move || {
                    client
                        .send_and_await(
                            Double {
                                value: i,
                                ..Default::default()
                            },
                            move |reply| {
                                let value = reply.downcast_ref::<Doubled>().unwrap().value;
                                tx.send((i, value)).unwrap();
                            },
                        )
                        .unwrap();
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let mut results: Vec<_> = (0..8).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        results.sort();
        assert_eq!(results, (0..8).map(|i| (i, i * 2)).collect::<Vec<_>>());
    }

    #[test]
    fn read_returns_the_frame_it_inspected() {
        let (client, mut raw) = pair();
        let registry = registry();
        let client = ReplyConnection::new(Connection::new(client, Arc::clone(&registry)).unwrap());

        let reply = Doubled {
            id: CorrelationId::from("nobody-asked"),
            value: 7,
        };
        raw.write_all(&registry.encode(&reply).unwrap()).unwrap();
        raw.write_all(&registry.encode(&Note("next".into())).unwrap())
            .unwrap();

        let first = client.read().unwrap();
        assert_eq!(first.downcast_ref::<Doubled>(), Some(&reply));

        let second = client.read().unwrap();
        assert_eq!(second.downcast_ref::<Note>().unwrap().0, "next");
    }

    #[test]
    fn unknown_reply_is_dropped() {
        let (client, mut raw) = pair();
        let registry = registry();
        let client = ReplyConnection::new(Connection::new(client, Arc::clone(&registry)).unwrap());
        let id = client
            .send_and_await(Double::default(), |_| panic!("wrong request resolved"))
            .unwrap();

        let stray = Doubled {
            id: CorrelationId::generate(),
            value: 0,
        };
        raw.write_all(&registry.encode(&stray).unwrap()).unwrap();

        client.read().unwrap();
        assert!(id.is_set());
        assert_eq!(client.pending(), 1);
    }

    #[test]
    fn reply_to_copies_correlation_id() {
        let (server, mut raw) = pair();
        let registry = registry();
        let server = ReplyConnection::new(Connection::new(server, Arc::clone(&registry)).unwrap());
        let request = Double {
            id: CorrelationId::from("abc"),
            value: 3,
        };

        server
            .send_reply_to(
                Doubled {
                    id: CorrelationId::unset(),
                    value: 6,
                },
                &request,
            )
            .unwrap();

        let message = registry.read(&mut raw).unwrap();
        let reply = message.downcast_ref::<Doubled>().unwrap();
        assert_eq!(reply.id, CorrelationId::from("abc"));
    }

    #[test]
    fn disconnect_discards_pending() {
        let (client, _raw) = pair();
        let client = ReplyConnection::new(Connection::new(client, registry()).unwrap());
        client
            .send_and_await(Double::default(), |_| {})
            .unwrap();
        assert_eq!(client.pending(), 1);

        client.disconnect();
        assert_eq!(client.pending(), 0);

        client
            .send_and_await(Double::default(), |_| {})
            .unwrap();
        assert_eq!(client.pending(), 0);
    }

    #[test]
    fn rejected_request_is_not_left_pending() {
        #[derive(Debug, Default)]
        struct Stray(CorrelationId);

        crate::correlated!(Stray => 0);

        impl Message<Math> for Stray {}

        let (client, _raw) = pair();
        let client = ReplyConnection::new(Connection::new(client, registry()).unwrap());

        assert!(client.send_and_await(Stray::default(), |_| {}).is_err());
        assert_eq!(client.pending(), 0);
    }
}
