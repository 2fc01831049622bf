use std::time::Duration;

use burrow::{Cli, ClientArgs, Commands, ServerArgs};
use clap::Parser;
use tokio::{
    net::TcpStream,
    time::{sleep, timeout},
};

// Parse server arguments the same way the binary would.
pub fn server_args(args: &[&str]) -> ServerArgs {
    let mut full = vec!["burrow", "server"];
    full.extend_from_slice(args);
    match Cli::parse_from(full).command {
        Commands::Server(args) => args,
        _ => unreachable!(),
    }
}

// Parse client arguments the same way the binary would.
pub fn client_args(args: &[&str]) -> ClientArgs {
    let mut full = vec!["burrow", "client"];
    full.extend_from_slice(args);
    match Cli::parse_from(full).command {
        Commands::Client(args) => args,
        _ => unreachable!(),
    }
}

// Block until something is listening on the given address.
pub async fn wait_for_port(addr: &str) {
    if timeout(Duration::from_secs(5), async {
        while TcpStream::connect(addr).await.is_err() {
            sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .is_err()
    {
        panic!("Timeout waiting for {addr} to start listening.");
    }
}
