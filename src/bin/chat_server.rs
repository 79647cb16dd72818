use std::{error::Error, sync::Arc, sync::mpsc};

use clap::Parser;
use tether::{
    Listener,
    demo::chat::{self, ChatServer, Room},
};

#[derive(Debug, Parser)]
#[command(version, about = "Relay chat lines between connected clients", long_about = None)]
struct Cli {
    /// Listen for new connections on port
    #[arg(long, default_value_t = 4018)]
    port: u16,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let registry = Arc::new(chat::registry()?);
    let room = Room::new();

    let listener = Listener::bind(("0.0.0.0", cli.port), ChatServer::factory(registry, room))?;
    let handle = listener.spawn()?;
    println!("waiting on {}", handle.local_addr());

    let (stop, stopped) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop.send(());
    })?;
    stopped.recv()?;

    handle.terminate();
    handle.join();
    Ok(())
}
