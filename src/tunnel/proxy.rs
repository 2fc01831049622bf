use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use color_eyre::eyre::WrapErr;
use tokio::{io::copy_bidirectional, net::TcpListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    error::TunnelError,
    remote::{Protocol, Remote},
    tunnel::{Tunnel, udp::UdpProxy},
};

enum Listener {
    Tcp(TcpListener),
    Udp(UdpProxy),
    Stdio,
}

// Inbound listener for one remote. Each accepted connection becomes one SSH
// channel towards the peer.
pub(crate) struct Proxy {
    id: usize,
    remote: Remote,
    tunnel: Arc<Tunnel>,
    listener: Listener,
    conn_seq: AtomicUsize,
}

impl Proxy {
    // Create the proxy and open its local listener. Listen failures are
    // surfaced synchronously.
    pub(crate) async fn bind(
        tunnel: Arc<Tunnel>,
        id: usize,
        remote: Remote,
    ) -> color_eyre::Result<Self> {
        let listener = if remote.stdio {
            Listener::Stdio
        } else {
            match remote.local_proto {
                Protocol::Tcp => {
                    let listener = TcpListener::bind(remote.local_addr())
                        .await
                        .map_err(|_| TunnelError::CannotListen(remote.to_string()))?;
                    info!(proxy = id, remote = %remote, "Listening");
                    Listener::Tcp(listener)
                }
                Protocol::Udp => {
                    let listener = UdpProxy::bind(Arc::clone(&tunnel), &remote)
                        .await
                        .wrap_err_with(|| TunnelError::CannotListen(remote.to_string()))?;
                    info!(proxy = id, remote = %remote, "Listening");
                    Listener::Udp(listener)
                }
            }
        };
        Ok(Proxy {
            id,
            remote,
            tunnel,
            listener,
            conn_seq: AtomicUsize::new(0),
        })
    }

    // Serve until the token is cancelled or the listener fails.
    pub(crate) async fn run(&self, cancel: CancellationToken) -> color_eyre::Result<()> {
        match &self.listener {
            Listener::Tcp(listener) => self.run_tcp(listener, cancel).await,
            Listener::Udp(listener) => listener.run(cancel).await,
            Listener::Stdio => self.run_stdio(cancel).await,
        }
    }

    async fn run_tcp(
        &self,
        listener: &TcpListener,
        cancel: CancellationToken,
    ) -> color_eyre::Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted.wrap_err("accept failed")?;
                    let conn = self.conn_seq.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!(proxy = self.id, conn, %peer, "Open");
                    let tunnel = Arc::clone(&self.tunnel);
                    let remote = self.remote.clone();
                    let cancel = cancel.clone();
                    let id = self.id;
                    tokio::spawn(async move {
                        pipe_remote(tunnel, id, conn, remote, stream, cancel).await;
                    });
                }
            }
        }
    }

    // Forward the process's stdin/stdout over one channel at a time,
    // re-opening on the next available connection until cancelled.
    async fn run_stdio(&self, cancel: CancellationToken) -> color_eyre::Result<()> {
        loop {
            if cancel.is_cancelled() {
                info!(proxy = self.id, "Closed");
                return Ok(());
            }
            let Some(link) = self.tunnel.get_link(&cancel).await else {
                continue;
            };
            let (host, port) = self.remote.channel_target();
            let mut channel = match link.open_channel(host, port).await {
                Ok(channel) => channel,
                Err(error) => {
                    info!(proxy = self.id, %error, "Stream error");
                    continue;
                }
            };
            let mut stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(proxy = self.id, "Closed");
                    return Ok(());
                }
                result = copy_bidirectional(&mut stdio, &mut channel) => {
                    if let Ok((sent, received)) = result {
                        debug!(proxy = self.id, sent, received, "Close");
                    }
                }
            }
        }
    }
}

// Obtain the active SSH connection, open a channel for this remote, and
// splice. An accepted connection with no connection available is dropped
// silently.
async fn pipe_remote(
    tunnel: Arc<Tunnel>,
    proxy: usize,
    conn: usize,
    remote: Remote,
    mut stream: tokio::net::TcpStream,
    cancel: CancellationToken,
) {
    if let Some(hooks) = tunnel.config.hooks.as_ref() {
        hooks.on_connect(&remote.remote_addr());
    }
    let Some(link) = tunnel.get_link(&cancel).await else {
        debug!(proxy, conn, "No remote connection");
        return;
    };
    let (host, port) = remote.channel_target();
    let mut channel = match link.open_channel(host, port).await {
        Ok(channel) => channel,
        Err(error) => {
            info!(proxy, conn, %error, "Stream error");
            return;
        }
    };
    match copy_bidirectional(&mut stream, &mut channel).await {
        Ok((sent, received)) => debug!(proxy, conn, sent, received, "Close"),
        Err(error) => debug!(proxy, conn, %error, "Close"),
    }
    if let Some(hooks) = tunnel.config.hooks.as_ref() {
        hooks.on_close(&remote.remote_addr());
    }
}
