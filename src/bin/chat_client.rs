use std::{
    error::Error,
    io::{self, BufRead},
    net::SocketAddr,
};

use clap::Parser;
use tether::demo::chat::ChatClient;

#[derive(Debug, Parser)]
#[command(version, about = "Send stdin lines to a chat server", long_about = None)]
struct Cli {
    /// Address of the chat server
    #[arg(long, default_value = "127.0.0.1:4018")]
    address: SocketAddr,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let client = ChatClient::connect(cli.address, |line| println!("{line}"))?;

    for line in io::stdin().lock().lines() {
        let line = line?;
        if !client.connection().is_connected() {
            eprintln!("disconnected from {}", cli.address);
            break;
        }
        client.say(&line)?;
    }

    client.connection().disconnect();
    Ok(())
}
