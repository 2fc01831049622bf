use std::{
    fmt, io,
    sync::{
        Arc, RwLock,
        atomic::{AtomicIsize, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    io::copy_bidirectional,
    net::TcpStream,
    task::JoinSet,
    time::sleep,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    envelope::env_duration,
    error::TunnelError,
    remote::Remote,
    socks::SocksServer,
    ws::BoxedIo,
};

pub(crate) mod proxy;
pub(crate) mod udp;

use proxy::Proxy;

// Capability flags for one tunnel endpoint. The tunnel itself is symmetric;
// only these flags (and who dialed whom) differ between client and server.
pub(crate) struct TunnelConfig {
    // Whether this endpoint hosts local listeners that originate channels.
    pub(crate) inbound: bool,
    // Whether this endpoint accepts channels and dials targets.
    pub(crate) outbound: bool,
    // Whether SOCKS channels are served.
    pub(crate) socks: bool,
    // Interval for transport keep-alives. Zero disables them.
    pub(crate) keep_alive: Duration,
    // Optional per-connection lifecycle callbacks.
    pub(crate) hooks: Option<Arc<dyn ConnHooks>>,
}

pub(crate) trait ConnHooks: Send + Sync {
    fn on_connect(&self, target: &str);
    fn on_close(&self, target: &str);
}

// Open/total counters for forwarded connections.
#[derive(Default)]
pub(crate) struct ConnCount {
    open: AtomicIsize,
    total: AtomicUsize,
}

impl ConnCount {
    pub(crate) fn next(&self) -> usize {
        self.total.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn open(&self) {
        self.open.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn close(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn open_count(&self) -> isize {
        self.open.load(Ordering::Acquire)
    }
}

impl fmt::Display for ConnCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}/{}]",
            self.open.load(Ordering::Acquire),
            self.total.load(Ordering::Acquire)
        )
    }
}

// Seam over the two russh connection handles. The client opens direct-tcpip
// channels; the server opens forwarded-tcpip channels. Either way the
// payload is the target host (with an optional `/udp` suffix, or `socks`)
// and port.
#[async_trait]
pub(crate) trait SshLink: Send + Sync {
    async fn open_channel(&self, host: String, port: u16) -> Result<BoxedIo, russh::Error>;
    async fn close(&self);
}

// How an accepted channel is to be served, derived from its open payload.
pub(crate) enum ChannelMode {
    Tcp(String),
    Udp(String),
    Socks,
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelMode::Tcp(target) => f.write_str(target),
            ChannelMode::Udp(target) => write!(f, "{target}/udp"),
            ChannelMode::Socks => f.write_str("socks"),
        }
    }
}

// One tunnel endpoint. Holds at most one active SSH connection at any time,
// guarded by a lock plus a barrier that callers wait on while a connection
// is (re-)established.
pub(crate) struct Tunnel {
    pub(crate) config: TunnelConfig,
    active: RwLock<Option<Arc<dyn SshLink>>>,
    activated: tokio::sync::watch::Sender<bool>,
    pub(crate) conn_stats: ConnCount,
    socks: Option<SocksServer>,
}

impl Tunnel {
    pub(crate) fn new(config: TunnelConfig) -> Arc<Self> {
        let socks = config.socks.then(SocksServer::new);
        debug!(
            inbound = config.inbound,
            outbound = config.outbound,
            socks = config.socks,
            keepalive = ?config.keep_alive,
            "Created tunnel"
        );
        Arc::new(Tunnel {
            config,
            active: RwLock::new(None),
            activated: tokio::sync::watch::Sender::new(false),
            conn_stats: ConnCount::default(),
            socks,
        })
    }

    // Install the active SSH connection. Binding while another connection is
    // installed is a programming error.
    pub(crate) fn bind_link(&self, link: Arc<dyn SshLink>) {
        let mut active = self.active.write().expect("not poisoned");
        if active.is_some() {
            panic!("tunnel already has an active SSH connection");
        }
        *active = Some(link);
        drop(active);
        self.activated.send_replace(true);
        debug!("SSH connected");
    }

    // Clear the active connection and raise the barrier again, so that
    // get_link waits for the next connection.
    pub(crate) fn unbind_link(&self) {
        self.activated.send_replace(false);
        *self.active.write().expect("not poisoned") = None;
        debug!("SSH disconnected");
    }

    // Block until an SSH connection is available, the token is cancelled, or
    // the wait times out (slightly longer than the SSH dial timeout).
    pub(crate) async fn get_link(&self, cancel: &CancellationToken) -> Option<Arc<dyn SshLink>> {
        if cancel.is_cancelled() {
            return None;
        }
        if let Some(link) = self.active.read().expect("not poisoned").clone() {
            return Some(link);
        }
        let mut activated = self.activated.subscribe();
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = sleep(env_duration("SSH_WAIT", Duration::from_secs(35))) => None,
            result = activated.wait_for(|active| *active) => match result {
                Ok(_) => self.active.read().expect("not poisoned").clone(),
                Err(_) => None,
            },
        }
    }

    // Turn the given remotes into local proxies and block until the token is
    // cancelled or any proxy errors, after all proxies have stopped.
    pub(crate) async fn bind_remotes(
        self: &Arc<Self>,
        cancel: CancellationToken,
        remotes: Vec<Remote>,
    ) -> color_eyre::Result<()> {
        if remotes.is_empty() {
            return Err(TunnelError::NoRemotes.into());
        }
        if !self.config.inbound {
            return Err(TunnelError::InboundBlocked.into());
        }
        let mut proxies = Vec::with_capacity(remotes.len());
        for (index, remote) in remotes.into_iter().enumerate() {
            proxies.push(Proxy::bind(Arc::clone(self), index + 1, remote).await?);
        }
        debug!("Bound proxies");
        let stop = cancel.child_token();
        let mut tasks = JoinSet::new();
        for proxy in proxies {
            let stop = stop.clone();
            tasks.spawn(async move { proxy.run(stop).await });
        }
        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    // Stop the sibling proxies and surface the first error.
                    if result.is_ok() {
                        result = Err(error);
                    }
                    stop.cancel();
                }
                Err(join_error) => {
                    if result.is_ok() {
                        result = Err(join_error.into());
                    }
                    stop.cancel();
                }
            }
        }
        debug!("Unbound proxies");
        result
    }

    // Decide how an incoming channel request is served, before accepting it.
    pub(crate) fn classify(&self, host: &str, port: u16) -> Result<ChannelMode, TunnelError> {
        if !self.config.outbound {
            return Err(TunnelError::OutboundBlocked);
        }
        if host == "socks" {
            return if self.socks.is_some() {
                Ok(ChannelMode::Socks)
            } else {
                Err(TunnelError::SocksDisabled)
            };
        }
        match host.strip_suffix("/udp") {
            Some(host) => Ok(ChannelMode::Udp(format!("{host}:{port}"))),
            None => Ok(ChannelMode::Tcp(format!("{host}:{port}"))),
        }
    }

    // Serve one accepted channel in a fresh task.
    pub(crate) fn spawn_channel(
        self: &Arc<Self>,
        stream: BoxedIo,
        mode: ChannelMode,
        cancel: CancellationToken,
    ) {
        let tunnel = Arc::clone(self);
        tokio::spawn(async move {
            tunnel.serve_channel(stream, mode, cancel).await;
        });
    }

    async fn serve_channel(&self, stream: BoxedIo, mode: ChannelMode, cancel: CancellationToken) {
        let id = self.conn_stats.next();
        let target = mode.to_string();
        self.conn_stats.open();
        debug!(conn = id, %target, stats = %self.conn_stats, "Open");
        if let Some(hooks) = self.config.hooks.as_ref() {
            hooks.on_connect(&target);
        }
        let result = match mode {
            ChannelMode::Tcp(target) => self.handle_tcp(stream, &target).await,
            ChannelMode::Udp(target) => udp::serve_outbound(stream, target, cancel).await,
            ChannelMode::Socks => match self.socks.as_ref() {
                Some(socks) => socks.serve(stream).await,
                None => Err(io::Error::other("SOCKS5 is not enabled")),
            },
        };
        self.conn_stats.close();
        if let Some(hooks) = self.config.hooks.as_ref() {
            hooks.on_close(&target);
        }
        match result {
            Ok(()) => debug!(conn = id, stats = %self.conn_stats, "Close"),
            Err(error) => {
                debug!(conn = id, stats = %self.conn_stats, %error, "Close");
            }
        }
    }

    async fn handle_tcp(&self, stream: BoxedIo, target: &str) -> io::Result<()> {
        let mut dst = TcpStream::connect(target).await?;
        let mut src = stream;
        match copy_bidirectional(&mut src, &mut dst).await {
            Ok((sent, received)) => {
                debug!(sent, received, "Spliced");
                Ok(())
            }
            // Trailing EOF after a transfer is a normal close.
            Err(error) if error.kind() == io::ErrorKind::UnexpectedEof => Ok(()),
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tunnel_tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    use super::{ChannelMode, ConnCount, ConnHooks, SshLink, Tunnel, TunnelConfig};
    use crate::ws::BoxedIo;

    struct NullLink;

    #[async_trait]
    impl SshLink for NullLink {
        async fn open_channel(&self, _host: String, _port: u16) -> Result<BoxedIo, russh::Error> {
            Err(russh::Error::Disconnect)
        }

        async fn close(&self) {}
    }

    fn test_tunnel(outbound: bool, socks: bool) -> Arc<Tunnel> {
        Tunnel::new(TunnelConfig {
            inbound: true,
            outbound,
            socks,
            keep_alive: Duration::ZERO,
            hooks: None,
        })
    }

    #[test]
    fn conn_count_tracks_open_and_total() {
        let stats = ConnCount::default();
        assert_eq!(stats.next(), 1);
        assert_eq!(stats.next(), 2);
        stats.open();
        stats.open();
        stats.close();
        assert_eq!(stats.open_count(), 1);
        assert_eq!(stats.to_string(), "[1/2]");
    }

    #[test]
    fn classify_screens_channel_requests() {
        let tunnel = test_tunnel(true, false);
        assert!(matches!(
            tunnel.classify("example.com", 80),
            Ok(ChannelMode::Tcp(target)) if target == "example.com:80"
        ));
        assert!(matches!(
            tunnel.classify("1.1.1.1/udp", 53),
            Ok(ChannelMode::Udp(target)) if target == "1.1.1.1:53"
        ));
        assert!(tunnel.classify("socks", 0).is_err());
        let with_socks = test_tunnel(true, true);
        assert!(matches!(
            with_socks.classify("socks", 0),
            Ok(ChannelMode::Socks)
        ));
        let inbound_only = test_tunnel(false, false);
        assert!(inbound_only.classify("example.com", 80).is_err());
    }

    #[tokio::test]
    async fn get_link_waits_for_bind() {
        let tunnel = test_tunnel(true, false);
        let cancel = CancellationToken::new();
        let waiter = {
            let tunnel = Arc::clone(&tunnel);
            let cancel = cancel.clone();
            tokio::spawn(async move { tunnel.get_link(&cancel).await.is_some() })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        tunnel.bind_link(Arc::new(NullLink));
        assert!(waiter.await.unwrap());

        // After unbinding, the barrier is raised again.
        tunnel.unbind_link();
        let cancelled = CancellationToken::new();
        cancelled.cancel();
        assert!(tunnel.get_link(&cancelled).await.is_none());

        // And a rebind lowers it once more.
        tunnel.bind_link(Arc::new(NullLink));
        assert!(tunnel.get_link(&cancel).await.is_some());
    }

    #[tokio::test]
    #[should_panic(expected = "active SSH connection")]
    async fn double_bind_panics() {
        let tunnel = test_tunnel(true, false);
        tunnel.bind_link(Arc::new(NullLink));
        tunnel.bind_link(Arc::new(NullLink));
    }

    #[derive(Default)]
    struct Recorder {
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    impl ConnHooks for Recorder {
        fn on_connect(&self, _target: &str) {
            self.connects.fetch_add(1, Ordering::AcqRel);
        }

        fn on_close(&self, _target: &str) {
            self.closes.fetch_add(1, Ordering::AcqRel);
        }
    }

    #[tokio::test]
    async fn serve_channel_dials_and_reports_lifecycle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let hooks = Arc::new(Recorder::default());
        let tunnel = Tunnel::new(TunnelConfig {
            inbound: true,
            outbound: true,
            socks: false,
            keep_alive: Duration::ZERO,
            hooks: Some(Arc::clone(&hooks) as Arc<dyn ConnHooks>),
        });
        let (mut local, channel) = tokio::io::duplex(1024);
        let mode = tunnel
            .classify(&target.ip().to_string(), target.port())
            .unwrap();
        tunnel.spawn_channel(Box::new(channel), mode, CancellationToken::new());

        local.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        drop(local);

        tokio::time::timeout(Duration::from_secs(5), async {
            while hooks.closes.load(Ordering::Acquire) == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("the close hook never fired");
        assert_eq!(hooks.connects.load(Ordering::Acquire), 1);
        assert_eq!(tunnel.conn_stats.open_count(), 0);
    }
}
