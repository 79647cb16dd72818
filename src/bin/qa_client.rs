use std::{
    error::Error,
    io::{self, BufRead},
    net::SocketAddr,
    sync::mpsc,
};

use clap::Parser;
use tether::demo::qa::QaClient;

#[derive(Debug, Parser)]
#[command(version, about = "Ask a question read from stdin", long_about = None)]
struct Cli {
    /// Address of the question server
    #[arg(long, default_value = "127.0.0.1:4018")]
    address: SocketAddr,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let client = QaClient::connect(cli.address)?;

    let mut question = String::new();
    io::stdin().lock().read_line(&mut question)?;

    let (tx, rx) = mpsc::channel();
    client.ask(question.trim_end(), move |answer| {
        let _ = tx.send(answer);
    })?;

    match rx.recv() {
        Ok(answer) => println!("answer: {answer}"),
        Err(_) => eprintln!("connection closed before an answer arrived"),
    }

    client.connection().disconnect();
    Ok(())
}
