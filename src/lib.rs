//! A bidirectional TCP/UDP tunnel, multiplexing port-forwarding streams
//! over a single HTTP-upgraded WebSocket carrying an inner SSH session.

pub mod client;
pub mod config;
mod droppable_handle;
mod envelope;
mod error;
mod keys;
mod remote;
pub mod server;
mod shutdown;
mod socks;
mod tunnel;
mod users;
mod ws;

pub use client::Client;
pub use config::{Cli, ClientArgs, Commands, ServerArgs};
pub use envelope::{BUILD_VERSION, PROTOCOL_VERSION};
pub use server::Server;
