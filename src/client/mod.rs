use std::{sync::Arc, time::Duration};

use color_eyre::eyre::WrapErr;
use rustls::{ClientConfig, RootCertStore};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, pem::PemObject};
use rustls_platform_verifier::BuilderVerifierExt;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;

mod connection;
mod tls;

use crate::{
    config::ClientArgs,
    error::TunnelError,
    remote::{Remote, reversed},
    shutdown::wait_for_signal,
    tunnel::{Tunnel, TunnelConfig},
    users::parse_auth,
};

// Outer proxy used to reach the server, parsed from the --proxy URL.
pub(crate) enum OuterProxy {
    HttpConnect {
        host: String,
        port: u16,
        // Pre-encoded Proxy-Authorization value.
        basic_auth: Option<String>,
    },
    Socks {
        host: String,
        port: u16,
        auth: Option<(String, String)>,
    },
}

// A tunnel client. Connects out to a server, authenticates, exchanges its
// remotes, and keeps the session alive with reconnection and backoff.
pub struct Client {
    pub(crate) url: Url,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) hostname: Option<String>,
    pub(crate) tls: Option<(TlsConnector, ServerName<'static>)>,
    pub(crate) proxy: Option<OuterProxy>,
    pub(crate) user: String,
    pub(crate) pass: String,
    pub(crate) fingerprint: String,
    pub(crate) remotes: Vec<Remote>,
    pub(crate) keepalive: Duration,
    pub(crate) max_retry_count: i32,
    pub(crate) max_retry_interval: Duration,
    pub(crate) tunnel: Arc<Tunnel>,
}

impl Client {
    pub async fn new(args: ClientArgs) -> color_eyre::Result<Self> {
        // The outer URL is spoken over WebSocket, whatever the user typed.
        let server = if args.server.starts_with("http://") || args.server.starts_with("https://") {
            args.server.clone()
        } else {
            format!("http://{}", args.server)
        };
        let mut url = Url::parse(&server).wrap_err("invalid server URL")?;
        let scheme = match url.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => return Err(color_eyre::eyre::eyre!("invalid server scheme '{other}'")),
        };
        url.set_scheme(scheme)
            .map_err(|_| color_eyre::eyre::eyre!("invalid server URL"))?;
        let host = url
            .host_str()
            .ok_or_else(|| color_eyre::eyre::eyre!("server URL has no host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| color_eyre::eyre::eyre!("server URL has no port"))?;

        let tls = if url.scheme() == "wss" {
            let server_name = ServerName::try_from(
                args.hostname.clone().unwrap_or_else(|| host.clone()),
            )
            .wrap_err("invalid TLS server name")?;
            Some((
                TlsConnector::from(Arc::new(build_tls_config(&args)?)),
                server_name,
            ))
        } else {
            None
        };

        let proxy = match args.proxy.as_deref() {
            Some(proxy) => Some(parse_proxy(proxy)?),
            None => None,
        };

        // Decode and validate the remotes before ever dialing out.
        let mut remotes = Vec::with_capacity(args.remotes.len());
        let mut has_reverse = false;
        let mut has_socks = false;
        let mut has_stdio = false;
        for spec in &args.remotes {
            let remote = Remote::decode(spec)
                .wrap_err_with(|| format!("failed to decode remote '{spec}'"))?;
            has_socks |= remote.socks;
            has_reverse |= remote.reverse;
            if remote.stdio {
                if has_stdio {
                    return Err(TunnelError::DuplicateStdio.into());
                }
                has_stdio = true;
            }
            if !remote.reverse && !remote.stdio && !remote.can_listen().await {
                return Err(TunnelError::CannotListen(remote.to_string()).into());
            }
            remotes.push(remote);
        }

        let (user, pass) = parse_auth(args.auth.as_deref().unwrap_or_default());
        let tunnel = Tunnel::new(TunnelConfig {
            // The client always accepts inbound listeners.
            inbound: true,
            outbound: has_reverse,
            socks: has_reverse && has_socks,
            keep_alive: args.keepalive,
            hooks: None,
        });
        Ok(Client {
            url,
            host,
            port,
            hostname: args.hostname,
            tls,
            proxy,
            user,
            pass,
            fingerprint: args.fingerprint.unwrap_or_default(),
            remotes,
            keepalive: args.keepalive,
            max_retry_count: args.max_retry_count,
            max_retry_interval: args.max_retry_interval,
            tunnel,
        })
    }

    // Run the client until the token is cancelled or retries are exhausted.
    pub async fn run(&self, cancel: CancellationToken) -> color_eyre::Result<()> {
        let via = match &self.proxy {
            Some(OuterProxy::HttpConnect { host, port, .. }) => format!(" via {host}:{port}"),
            Some(OuterProxy::Socks { host, port, .. }) => format!(" via socks {host}:{port}"),
            None => String::new(),
        };
        info!(server = %self.url, "Connecting{via}");
        let inbound = reversed(&self.remotes, false);
        let connection = async {
            let result = self.connection_loop(cancel.clone()).await;
            // Once the loop gives up, the proxies have nothing to serve.
            cancel.cancel();
            result
        };
        if inbound.is_empty() {
            return connection.await;
        }
        let proxies = async {
            let result = self.tunnel.bind_remotes(cancel.clone(), inbound).await;
            if result.is_err() {
                cancel.cancel();
            }
            result
        };
        tokio::try_join!(connection, proxies)?;
        Ok(())
    }
}

fn build_tls_config(args: &ClientArgs) -> color_eyre::Result<ClientConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let builder = ClientConfig::builder();
    let builder = if args.tls_skip_verify {
        info!("TLS verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(tls::SkipServerVerification::new()))
    } else if let Some(ca) = &args.tls_ca {
        info!(path = %ca.display(), "TLS verification using a CA file");
        let mut roots = RootCertStore::empty();
        roots.add_parsable_certificates(
            CertificateDer::pem_file_iter(ca)
                .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
                .wrap_err("failed to parse the CA file")?,
        );
        builder.with_root_certificates(roots)
    } else {
        builder.with_platform_verifier()?
    };
    match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => {
            let certs = CertificateDer::pem_file_iter(cert)
                .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
                .wrap_err("failed to parse the client certificate")?;
            let key =
                PrivateKeyDer::from_pem_file(key).wrap_err("failed to parse the client key")?;
            Ok(builder.with_client_auth_cert(certs, key)?)
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(TunnelError::IncompleteClientCert.into()),
    }
}

fn parse_proxy(proxy: &str) -> color_eyre::Result<OuterProxy> {
    let url = Url::parse(proxy).wrap_err("invalid proxy URL")?;
    let host = url
        .host_str()
        .ok_or_else(|| color_eyre::eyre::eyre!("proxy URL has no host"))?
        .to_string();
    match url.scheme() {
        "http" | "https" => {
            let port = url.port_or_known_default().unwrap_or(80);
            let basic_auth = if url.username().is_empty() {
                None
            } else {
                use base64::Engine;
                let credentials = format!(
                    "{}:{}",
                    url.username(),
                    url.password().unwrap_or_default()
                );
                Some(format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(credentials)
                ))
            };
            Ok(OuterProxy::HttpConnect {
                host,
                port,
                basic_auth,
            })
        }
        "socks" | "socks5" | "socks5h" => {
            let port = url.port().unwrap_or(1080);
            let auth = if url.username().is_empty() {
                None
            } else {
                Some((
                    url.username().to_string(),
                    url.password().unwrap_or_default().to_string(),
                ))
            };
            Ok(OuterProxy::Socks { host, port, auth })
        }
        other => Err(TunnelError::UnsupportedProxyScheme(other.to_string()).into()),
    }
}

// Main entrypoint of the client role.
#[doc(hidden)]
pub async fn entrypoint(args: ClientArgs) -> color_eyre::Result<()> {
    let client = Client::new(args).await?;
    let cancel = CancellationToken::new();
    let signal_guard = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down.");
        signal_guard.cancel();
    });
    client.run(cancel).await
}
