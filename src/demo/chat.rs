//! Line-based chat room.
//!
//! Every line a client says is relayed by the server to every other member of
//! the [`Room`].
use std::{
    collections::HashMap,
    io::{Read, Write},
    net::{TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use log::{debug, info, warn};

use crate::{
    connection::{Connection, Duplex, Endpoint, lock, spawn_client, spawn_server},
    error::Result,
    listener::ConnectionFactory,
    protocol::{
        Family, FromWire, Message, Registry,
        primitive::{read_string, write_string},
    },
};

pub const CHAT_MESSAGE: i32 = 1;

pub enum Chat {}

impl Family for Chat {
    type Client = ChatClient;
    type Server = ChatServer;
}

pub fn registry() -> Result<Registry<Chat>> {
    let mut registry = Registry::new();
    registry.register_type::<ChatMessage>(CHAT_MESSAGE)?;
    Ok(registry)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub text: String,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

impl FromWire for ChatMessage {
    fn read_from(input: &mut dyn Read) -> Result<Self> {
        read_string(input).map(Self::new)
    }
}

impl Message<Chat> for ChatMessage {
    fn serialize(&self, out: &mut dyn Write) -> Result<()> {
        write_string(out, &self.text)
    }

    fn on_client(&self, client: &ChatClient) {
        (client.on_line)(&self.text);
    }

    fn on_server(&self, server: &ChatServer) {
        server.relay(self);
    }
}

type LineHandler = Box<dyn Fn(&str) + Send + Sync>;

pub struct ChatClient {
    link: Connection<Chat>,
    on_line: LineHandler,
}

impl ChatClient {
    /// Connects to a chat server. `on_line` runs on the read thread for every
    /// line relayed from other members.
    pub fn connect<A, H>(address: A, on_line: H) -> Result<Arc<Self>>
    where
        A: ToSocketAddrs,
        H: Fn(&str) + Send + Sync + 'static,
    {
        let connection = Connection::connect(address, Arc::new(registry()?))?;
        let client = Arc::new(Self {
            link: connection,
            on_line: Box::new(on_line),
        });
        spawn_client::<Chat>(Arc::clone(&client))?;
        Ok(client)
    }

    pub fn say(&self, text: &str) -> Result<()> {
        self.link.send(&ChatMessage::new(text))
    }

    pub fn connection(&self) -> &Connection<Chat> {
        &self.link
    }
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("link", &self.link)
            .finish()
    }
}

impl Endpoint<Chat> for ChatClient {
    type Link = Connection<Chat>;

    fn link(&self) -> &Connection<Chat> {
        &self.link
    }
}

/// Members currently connected to one chat server.
///
/// The room only holds weak references; a member leaves when its connection
/// disconnects.
#[derive(Debug, Default)]
pub struct Room {
    members: Mutex<HashMap<u64, Weak<ChatServer>>>,
    next_id: AtomicU64,
}

impl Room {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enter(self: &Arc<Self>, member: &Arc<ChatServer>) {
        lock(&self.members).insert(member.id, Arc::downgrade(member));

        let room = Arc::downgrade(self);
        let id = member.id;
        member.link.on_disconnect(move || {
            if let Some(room) = room.upgrade() {
                lock(&room.members).remove(&id);
                debug!("member {id} left the room");
            }
        });
    }

    // Collected up front so no send happens under the lock.
    fn members(&self) -> Vec<Arc<ChatServer>> {
        lock(&self.members)
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

/// Server half of one member's connection.
#[derive(Debug)]
pub struct ChatServer {
    id: u64,
    link: Connection<Chat>,
    room: Arc<Room>,
}

impl ChatServer {
    pub fn start<S: Duplex>(
        stream: S,
        registry: Arc<Registry<Chat>>,
        room: Arc<Room>,
    ) -> Result<Arc<Self>> {
        let server = Arc::new(Self {
            id: room.next_id.fetch_add(1, Ordering::Relaxed),
            link: Connection::new(stream, registry)?,
            room: Arc::clone(&room),
        });

        room.enter(&server);
        spawn_server::<Chat>(Arc::clone(&server))?;
        info!("member {} joined from {}", server.id, server.link.peer());
        Ok(server)
    }

    pub fn factory(registry: Arc<Registry<Chat>>, room: Arc<Room>) -> impl ConnectionFactory {
        move |stream: TcpStream| {
            if let Err(e) = Self::start(stream, Arc::clone(&registry), Arc::clone(&room)) {
                warn!("failed to admit chat member: {e}");
            }
        }
    }

    fn relay(&self, message: &ChatMessage) {
        info!("member {}: {}", self.id, message.text);

        for member in self.room.members() {
            if member.id == self.id {
                continue;
            }
            if let Err(e) = member.link.send(message) {
                warn!("failed to relay to member {}: {e}", member.id);
            }
        }
    }
}

impl Endpoint<Chat> for ChatServer {
    type Link = Connection<Chat>;

    fn link(&self) -> &Connection<Chat> {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, sync::mpsc, time::Duration};

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn lines_reach_other_members_only() {
        let acceptor = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = acceptor.local_addr().unwrap();
        let registry = Arc::new(registry().unwrap());
        let room = Room::new();

        let (alice_tx, alice_rx) = mpsc::channel();
        let alice_tx = Mutex::new(alice_tx);
        let alice = ChatClient::connect(address, move |line| {
            let _ = lock(&alice_tx).send(line.to_string());
        })
        .unwrap();
        let (stream, _) = acceptor.accept().unwrap();
        let _alice_server = ChatServer::start(stream, Arc::clone(&registry), Arc::clone(&room));

        let (bob_tx, bob_rx) = mpsc::channel();
        let bob_tx = Mutex::new(bob_tx);
        let _bob = ChatClient::connect(address, move |line| {
            let _ = lock(&bob_tx).send(line.to_string());
        })
        .unwrap();
        let (stream, _) = acceptor.accept().unwrap();
        let _bob_server = ChatServer::start(stream, registry, Arc::clone(&room));

        assert_eq!(room.len(), 2);
        alice.say("hello").unwrap();

        assert_eq!(bob_rx.recv_timeout(WAIT).unwrap(), "hello");
        assert!(alice_rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn disconnected_member_leaves_room() {
        let acceptor = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = acceptor.local_addr().unwrap();
        let room = Room::new();

        let client = ChatClient::connect(address, |_| {}).unwrap();
        let (stream, _) = acceptor.accept().unwrap();
        let _server =
            ChatServer::start(stream, Arc::new(registry().unwrap()), Arc::clone(&room)).unwrap();
        assert_eq!(room.len(), 1);

        client.connection().disconnect();

        let deadline = std::time::Instant::now() + WAIT;
        while !room.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(room.is_empty());
    }
}
