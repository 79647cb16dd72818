use std::{
    sync::{Arc, Mutex, mpsc},
    thread,
    time::{Duration, Instant},
};

use tether::{
    Listener,
    demo::chat::{self, ChatClient, ChatServer, Room},
};

const WAIT: Duration = Duration::from_secs(5);

fn listening_client(address: std::net::SocketAddr) -> (Arc<ChatClient>, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let client = ChatClient::connect(address, move |line| {
        let _ = tx.lock().unwrap().send(line.to_string());
    })
    .unwrap();
    (client, rx)
}

#[test]
fn room_relays_through_listener() {
    let _ = env_logger::builder().is_test(true).try_init();

    let room = Room::new();
    let registry = Arc::new(chat::registry().unwrap());
    let handle = Listener::bind("127.0.0.1:0", ChatServer::factory(registry, Arc::clone(&room)))
        .unwrap()
        .spawn()
        .unwrap();

    let (alice, _alice_lines) = listening_client(handle.local_addr());
    let (_bob, bob_lines) = listening_client(handle.local_addr());
    let (_carol, carol_lines) = listening_client(handle.local_addr());

    let deadline = Instant::now() + WAIT;
    while room.len() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(room.len(), 3);

    alice.say("first").unwrap();
    alice.say("second").unwrap();

    for lines in [&bob_lines, &carol_lines] {
        assert_eq!(lines.recv_timeout(WAIT).unwrap(), "first");
        assert_eq!(lines.recv_timeout(WAIT).unwrap(), "second");
    }

    handle.terminate();
    handle.join();
}
