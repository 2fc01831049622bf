use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser, Subcommand};

// CLI configuration for the tunnel binary.
#[doc(hidden)]
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[doc(hidden)]
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the tunnel server.
    Server(ServerArgs),
    /// Run the tunnel client.
    Client(ClientArgs),
}

// CLI configuration for the server role.
#[doc(hidden)]
#[derive(Debug, Args, PartialEq)]
pub struct ServerArgs {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0", value_name = "ADDRESS")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, short, default_value_t = 8080, value_name = "PORT")]
    pub port: u16,

    /// Seed string for a deterministic host key. Mutually exclusive
    /// with --keyfile.
    #[arg(long, value_name = "SEED", conflicts_with = "keyfile")]
    pub key: Option<String>,

    /// File path to the server's host key. Created when missing.
    #[arg(long, value_name = "FILE")]
    pub keyfile: Option<PathBuf>,

    /// Credentials of a single allowed user, in user:pass form.
    #[arg(long, value_name = "USER:PASS", env = "CHISEL_AUTH")]
    pub auth: Option<String>,

    /// Path to a users file mapping user:pass strings to arrays of
    /// address regexes. Reloaded on change.
    #[arg(long, value_name = "FILE")]
    pub authfile: Option<PathBuf>,

    /// Interval between transport keep-alives. Set to 0s to disable.
    #[arg(long, default_value = "25s", value_parser = parse_duration, value_name = "DURATION")]
    pub keepalive: Duration,

    /// URL of an HTTP server that non-tunnel requests are proxied to.
    #[arg(long, value_name = "URL")]
    pub backend: Option<String>,

    /// Allow clients to access the internal SOCKS5 proxy.
    #[arg(long)]
    pub socks5: bool,

    /// Allow clients to specify reverse port forwarding remotes.
    #[arg(long)]
    pub reverse: bool,
}

// CLI configuration for the client role.
#[doc(hidden)]
#[derive(Debug, Args, PartialEq)]
pub struct ClientArgs {
    /// URL of the tunnel server.
    #[arg(value_name = "SERVER")]
    pub server: String,

    /// Remotes in the <local-host>:<local-port>:<remote-host>:<remote-port>
    /// shorthand, with optional R: prefix and /udp suffix.
    #[arg(value_name = "REMOTE", required = true)]
    pub remotes: Vec<String>,

    /// Expected SHA256 fingerprint of the server's public key. A mismatch
    /// closes the connection.
    #[arg(long, value_name = "FINGERPRINT")]
    pub fingerprint: Option<String>,

    /// Credentials for authentication, in user:pass form.
    #[arg(long, value_name = "USER:PASS", env = "CHISEL_AUTH")]
    pub auth: Option<String>,

    /// Interval between transport keep-alives. Set to 0s to disable.
    #[arg(long, default_value = "25s", value_parser = parse_duration, value_name = "DURATION")]
    pub keepalive: Duration,

    /// Maximum number of connection retries before exiting.
    /// -1 retries forever.
    #[arg(long, default_value_t = -1, value_name = "COUNT", allow_hyphen_values = true)]
    pub max_retry_count: i32,

    /// Maximum wait time between connection retries.
    #[arg(long, default_value = "5m", value_parser = parse_duration, value_name = "DURATION")]
    pub max_retry_interval: Duration,

    /// An optional HTTP CONNECT or SOCKS5 proxy used to reach the server.
    /// Credentials can be specified in the URL.
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    /// Hostname sent in the Host header and used for TLS verification,
    /// when it differs from the server URL.
    #[arg(long, value_name = "HOSTNAME")]
    pub hostname: Option<String>,

    /// Skip verification of the server's TLS certificate chain and host
    /// name. The server's public key is still verified via --fingerprint.
    #[arg(long)]
    pub tls_skip_verify: bool,

    /// Path to a PEM-encoded CA certificate bundle used to verify the
    /// server, instead of the operating system's CAs.
    #[arg(long, value_name = "FILE")]
    pub tls_ca: Option<PathBuf>,

    /// Path to a PEM-encoded certificate for client authentication.
    /// Requires --tls-key.
    #[arg(long, value_name = "FILE")]
    pub tls_cert: Option<PathBuf>,

    /// Path to the PEM-encoded private key matching --tls-cert.
    #[arg(long, value_name = "FILE")]
    pub tls_key: Option<PathBuf>,
}

fn parse_duration(value: &str) -> color_eyre::Result<Duration> {
    Ok(humantime::Duration::from_str(value)?.into())
}
