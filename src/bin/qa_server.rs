use std::{
    error::Error,
    io::{self, BufRead, Write},
    sync::{Arc, Mutex, mpsc},
};

use clap::Parser;
use tether::{
    Listener,
    demo::qa::{self, Answerer, QaServer},
};

#[derive(Debug, Parser)]
#[command(version, about = "Answer questions typed at the terminal", long_about = None)]
struct Cli {
    /// Listen for new connections on port
    #[arg(long, default_value_t = 4018)]
    port: u16,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let registry = Arc::new(qa::registry()?);

    // One prompt at a time, even with several clients connected.
    let stdin = Mutex::new(io::stdin());
    let answerer: Answerer = Arc::new(move |question: &str| {
        let terminal = stdin.lock().unwrap_or_else(|e| e.into_inner());
        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "question: {question}\n> ");
        let _ = stdout.flush();

        let mut answer = String::new();
        let _ = terminal.lock().read_line(&mut answer);
        answer.trim_end().to_string()
    });

    let listener = Listener::bind(("0.0.0.0", cli.port), QaServer::factory(registry, answerer))?;
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
