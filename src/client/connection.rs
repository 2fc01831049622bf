use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use color_eyre::eyre::{Report, eyre};
use russh::{ChannelMsg, Disconnect, client::Msg, keys::PublicKey};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::{sleep, timeout},
};
use tokio_tungstenite::tungstenite::{client::IntoClientRequest, http::header};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    client::{Client, OuterProxy},
    envelope::{Envelope, PROTOCOL_VERSION, env_duration},
    error::TunnelError,
    keys::{fingerprint, verify_fingerprint},
    tunnel::SshLink,
    ws::{BoxedIo, WebSocketRw, websocket_config},
};

// Errors during the SSH handshake. Fingerprint mismatches are surfaced
// through the handler, everything else comes from the transport.
#[derive(thiserror::Error, Debug)]
pub(crate) enum HandshakeError {
    #[error(transparent)]
    Ssh(#[from] russh::Error),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

// Outcome of a single connection attempt. The loop centralizes retry
// classification on these flags.
struct AttemptOutcome {
    // Whether the connection was held long enough to reset the backoff.
    connected: bool,
    retry: bool,
    error: Option<Report>,
}

impl AttemptOutcome {
    fn failed(retry: bool, error: Report) -> Self {
        AttemptOutcome {
            connected: false,
            retry,
            error: Some(error),
        }
    }
}

// Exponential backoff with a cap, reset after every stable connection.
pub(crate) struct Backoff {
    attempt: u32,
    max: Duration,
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);

impl Backoff {
    pub(crate) fn new(max: Duration) -> Self {
        Backoff { attempt: 0, max }
    }

    pub(crate) fn attempt(&self) -> u32 {
        self.attempt
    }

    pub(crate) fn next(&mut self) -> Duration {
        let delay = BACKOFF_BASE
            .saturating_mul(1u32.checked_shl(self.attempt).unwrap_or(u32::MAX))
            .min(self.max);
        self.attempt += 1;
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(unix)]
async fn wait_for_hangup() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::hangup()) {
        Ok(mut hangup) => {
            hangup.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_hangup() {
    std::future::pending::<()>().await;
}

impl Client {
    // Retry loop around single connection attempts. Terminates on
    // cancellation, a non-retriable error, or exhausted retries.
    pub(crate) async fn connection_loop(&self, cancel: CancellationToken) -> color_eyre::Result<()> {
        let mut backoff = Backoff::new(self.max_retry_interval);
        loop {
            let outcome = self.connection_once(&cancel).await;
            if outcome.connected {
                backoff.reset();
            }
            let attempt = backoff.attempt();
            if let Some(error) = outcome.error {
                if attempt > 0 && self.max_retry_count >= 0 {
                    info!(%error, attempt, max = self.max_retry_count, "Connection error");
                } else if attempt > 0 {
                    info!(%error, attempt, "Connection error");
                } else {
                    info!(%error, "Connection error");
                }
            }
            if cancel.is_cancelled() {
                info!("Cancelled");
                return Ok(());
            }
            if !outcome.retry
                || (self.max_retry_count >= 0 && attempt as i32 >= self.max_retry_count)
            {
                info!("Give up");
                return Ok(());
            }
            let delay = backoff.next();
            info!(delay = %humantime::format_duration(delay), "Retrying...");
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancelled");
                    return Ok(());
                }
                // A hangup signal forces an immediate retry.
                _ = wait_for_hangup() => {}
                _ = sleep(delay) => {}
            }
        }
    }

    // One full connection attempt: outer dial, WebSocket handshake, SSH
    // handshake, config exchange, then serve until disconnected.
    async fn connection_once(&self, cancel: &CancellationToken) -> AttemptOutcome {
        if cancel.is_cancelled() {
            return AttemptOutcome::failed(false, eyre!("cancelled"));
        }
        let ws_timeout = env_duration("WS_TIMEOUT", Duration::from_secs(45));
        let ssh_timeout = env_duration("SSH_TIMEOUT", Duration::from_secs(30));

        let stream = match timeout(ws_timeout, self.dial_outer()).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(error)) => return AttemptOutcome::failed(true, error),
            Err(_) => return AttemptOutcome::failed(true, eyre!("outer dial timed out")),
        };
        let mut request = match self.url.as_str().into_client_request() {
            Ok(request) => request,
            Err(error) => return AttemptOutcome::failed(false, error.into()),
        };
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            http::HeaderValue::from_static(PROTOCOL_VERSION),
        );
        if let Some(hostname) = &self.hostname
            && let Ok(value) = http::HeaderValue::from_str(hostname)
        {
            request.headers_mut().insert(header::HOST, value);
        }
        let ws = match timeout(
            ws_timeout,
            tokio_tungstenite::client_async_with_config(
                request,
                stream,
                Some(websocket_config()),
            ),
        )
        .await
        {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(error)) => return AttemptOutcome::failed(true, error.into()),
            Err(_) => return AttemptOutcome::failed(true, eyre!("WebSocket handshake timed out")),
        };

        debug!("Handshaking...");
        let config = Arc::new(russh::client::Config {
            keepalive_interval: (self.keepalive > Duration::ZERO).then_some(self.keepalive),
            // A reply must arrive within one interval, or the connection is
            // considered dead.
            keepalive_max: 1,
            ..Default::default()
        });
        let closed = CancellationToken::new();
        let handler = ClientHandler {
            tunnel: Arc::clone(&self.tunnel),
            fingerprint: self.fingerprint.clone(),
            session_token: cancel.child_token(),
            closed: closed.clone(),
        };
        let mut handle = match timeout(
            ssh_timeout,
            russh::client::connect_stream(config, WebSocketRw::new(ws), handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(HandshakeError::Tunnel(error))) => {
                // Fingerprint mismatches never resolve by retrying.
                return AttemptOutcome::failed(false, error.into());
            }
            Ok(Err(HandshakeError::Ssh(error))) => {
                return AttemptOutcome::failed(true, error.into());
            }
            Err(_) => return AttemptOutcome::failed(true, eyre!("SSH handshake timed out")),
        };
        let t0 = Instant::now();
        match handle.authenticate_password(&self.user, &self.pass).await {
            Ok(result) if result.success() => {}
            Ok(_) => {
                info!("Authentication failed");
                return AttemptOutcome::failed(false, TunnelError::AuthenticationFailed.into());
            }
            Err(error) => return AttemptOutcome::failed(true, error.into()),
        }

        debug!("Sending config");
        match timeout(ssh_timeout, self.send_config(&handle)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                info!("Config verification failed");
                return AttemptOutcome::failed(false, error);
            }
            Err(_) => {
                return AttemptOutcome::failed(false, eyre!("config exchange timed out"));
            }
        }
        info!(latency = ?t0.elapsed(), "Connected");

        let link = Arc::new(ClientLink { handle });
        self.tunnel.bind_link(link.clone());
        tokio::select! {
            _ = cancel.cancelled() => {
                link.close().await;
                // Wait for the session task to wind down.
                let _ = timeout(Duration::from_secs(1), closed.cancelled()).await;
            }
            _ = closed.cancelled() => {}
        }
        self.tunnel.unbind_link();
        info!("Disconnected");
        AttemptOutcome {
            connected: t0.elapsed() > Duration::from_secs(5),
            retry: true,
            error: None,
        }
    }

    // Establish the outer TCP (or TLS) stream, via the configured proxy when
    // there is one.
    async fn dial_outer(&self) -> color_eyre::Result<BoxedIo> {
        let stream: BoxedIo = match &self.proxy {
            None => Box::new(TcpStream::connect((self.host.as_str(), self.port)).await?),
            Some(OuterProxy::HttpConnect {
                host,
                port,
                basic_auth,
            }) => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                Box::new(
                    self.http_connect(stream, basic_auth.as_deref())
                        .await?,
                )
            }
            Some(OuterProxy::Socks { host, port, auth }) => {
                let proxy = (host.as_str(), *port);
                let target = (self.host.as_str(), self.port);
                let stream = match auth {
                    Some((user, pass)) => {
                        tokio_socks::tcp::Socks5Stream::connect_with_password(
                            proxy, target, user, pass,
                        )
                        .await?
                    }
                    None => tokio_socks::tcp::Socks5Stream::connect(proxy, target).await?,
                };
                Box::new(stream.into_inner())
            }
        };
        match &self.tls {
            Some((connector, server_name)) => {
                let tls = connector.connect(server_name.clone(), stream).await?;
                Ok(Box::new(tls))
            }
            None => Ok(stream),
        }
    }

    // Issue an HTTP CONNECT request towards the server through the proxy.
    async fn http_connect(
        &self,
        mut stream: TcpStream,
        basic_auth: Option<&str>,
    ) -> color_eyre::Result<TcpStream> {
        let target = format!("{}:{}", self.host, self.port);
        let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
        if let Some(auth) = basic_auth {
            request.push_str(&format!("Proxy-Authorization: {auth}\r\n"));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;
        let mut response = Vec::with_capacity(512);
        let mut byte = [0u8; 1];
        loop {
            if stream.read(&mut byte).await? == 0 {
                return Err(eyre!("proxy closed the connection"));
            }
            response.push(byte[0]);
            if response.ends_with(b"\r\n\r\n") {
                break;
            }
            if response.len() > 8 * 1024 {
                return Err(eyre!("oversized proxy response"));
            }
        }
        let status = String::from_utf8_lossy(&response);
        let ok = status
            .lines()
            .next()
            .is_some_and(|line| line.split_whitespace().nth(1) == Some("200"));
        if !ok {
            return Err(eyre!(
                "proxy refused the CONNECT request: {}",
                status.lines().next().unwrap_or_default()
            ));
        }
        Ok(stream)
    }

    // Send the config envelope on a dedicated session channel and wait for
    // the server's verdict. A rejection carries the server's error message.
    async fn send_config(
        &self,
        handle: &russh::client::Handle<ClientHandler>,
    ) -> color_eyre::Result<()> {
        let mut channel = handle.channel_open_session().await?;
        let envelope = Envelope::new(&self.remotes);
        channel.exec(true, envelope.encode()).await?;
        let mut rejection = Vec::new();
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => return Ok(()),
                Some(ChannelMsg::Failure) => break,
                Some(ChannelMsg::Data { data }) => rejection.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => rejection.extend_from_slice(&data),
                Some(_) => continue,
                None => {
                    if rejection.is_empty() {
                        return Err(eyre!("connection closed during the config exchange"));
                    }
                    break;
                }
            }
        }
        Err(TunnelError::ConfigRejected(String::from_utf8_lossy(&rejection).into_owned()).into())
    }
}

// SSH client handler: verifies the server key and serves channels the
// server opens for reverse remotes.
pub(crate) struct ClientHandler {
    tunnel: Arc<crate::tunnel::Tunnel>,
    fingerprint: String,
    session_token: CancellationToken,
    closed: CancellationToken,
}

impl russh::client::Handler for ClientHandler {
    type Error = HandshakeError;

    async fn check_server_key(&mut self, key: &PublicKey) -> Result<bool, Self::Error> {
        verify_fingerprint(&self.fingerprint, key)?;
        if !self.fingerprint.is_empty() {
            info!(fingerprint = %fingerprint(key), "Fingerprint verified");
        }
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut russh::client::Session,
    ) -> Result<(), Self::Error> {
        match self
            .tunnel
            .classify(connected_address, connected_port as u16)
        {
            Ok(mode) => {
                self.tunnel.spawn_channel(
                    Box::new(channel.into_stream()),
                    mode,
                    self.session_token.child_token(),
                );
            }
            Err(error) => {
                debug!(%error, "Denied channel request");
                drop(channel);
            }
        }
        Ok(())
    }
}

// The session task owns the handler; its drop marks the disconnect.
impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

// Opens channels over the client side of the SSH connection.
struct ClientLink {
    handle: russh::client::Handle<ClientHandler>,
}

#[async_trait]
impl SshLink for ClientLink {
    async fn open_channel(&self, host: String, port: u16) -> Result<BoxedIo, russh::Error> {
        let channel = self
            .handle
            .channel_open_direct_tcpip(host, port as u32, "127.0.0.1", 0)
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await;
    }
}

impl std::fmt::Debug for ClientLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientLink")
    }
}

#[cfg(test)]
mod backoff_tests {
    use std::time::Duration;

    use super::Backoff;

    #[test]
    fn grows_exponentially_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(5));
        assert_eq!(backoff.next(), Duration::from_secs(1));
        assert_eq!(backoff.next(), Duration::from_secs(2));
        assert_eq!(backoff.next(), Duration::from_secs(4));
        assert_eq!(backoff.next(), Duration::from_secs(5));
        assert_eq!(backoff.next(), Duration::from_secs(5));
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn reset_restarts_the_sequence() {
        let mut backoff = Backoff::new(Duration::from_secs(300));
        backoff.next();
        backoff.next();
        assert_eq!(backoff.attempt(), 2);
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }

    #[test]
    fn large_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(300));
        for _ in 0..64 {
            assert!(backoff.next() <= Duration::from_secs(300));
        }
    }
}
