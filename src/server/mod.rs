use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use color_eyre::eyre::WrapErr;
use http::{HeaderValue, Method, StatusCode, Uri, header};
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Request, Response, body::Incoming, server::conn::http1, service::service_fn};
use hyper_util::{
    client::legacy::{Client as BackendClient, connect::HttpConnector},
    rt::{TokioExecutor, TokioIo},
};
use tokio::{net::TcpListener, time::sleep};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{handshake::derive_accept_key, protocol::Role},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

mod session;

use crate::{
    config::ServerArgs,
    envelope::{BUILD_VERSION, PROTOCOL_VERSION, env_duration},
    keys::{fingerprint, generate_key, load_or_create_key},
    shutdown::wait_for_signal,
    users::{AddressPattern, User, UserIndex, parse_auth},
    ws::{WebSocketRw, websocket_config},
};

type ResponseBody = BoxBody<Bytes, hyper::Error>;

// A tunnel server. Listens for HTTP connections, upgrades tunnel clients to
// WebSocket + SSH sessions, and serves plain HTTP for everything else.
pub struct Server {
    pub(crate) index: Arc<UserIndex>,
    pub(crate) ssh_config: Arc<russh::server::Config>,
    pub(crate) reverse: bool,
    pub(crate) socks5: bool,
    pub(crate) keepalive: Duration,
    host: String,
    port: u16,
    backend: Option<Url>,
    backend_client: BackendClient<HttpConnector, Incoming>,
    session_seq: AtomicUsize,
}

impl Server {
    pub async fn new(args: ServerArgs) -> color_eyre::Result<Arc<Self>> {
        let key = match (&args.key, &args.keyfile) {
            (_, Some(path)) => load_or_create_key(path).await?,
            (Some(seed), None) => generate_key(Some(seed)),
            (None, None) => generate_key(None),
        };
        info!(fingerprint = %fingerprint(key.public_key()), "Server key");

        let index = match &args.authfile {
            Some(path) => {
                info!(path = %path.display(), "Loading the users configuration");
                Arc::new(UserIndex::watch(path.clone()).await?)
            }
            None => Arc::new(UserIndex::new()),
        };
        if let Some(auth) = &args.auth {
            let (name, pass) = parse_auth(auth);
            if name.is_empty() {
                return Err(crate::error::TunnelError::InvalidAuth.into());
            }
            index.add_user(User {
                name,
                pass,
                addrs: vec![AddressPattern::Any],
            });
        }

        let backend = match &args.backend {
            Some(backend) => {
                info!(%backend, "Reverse proxy enabled");
                Some(Url::parse(backend).wrap_err("invalid backend URL")?)
            }
            None => None,
        };

        let ssh_config = Arc::new(russh::server::Config {
            auth_rejection_time: Duration::from_secs(2),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keepalive_interval: (args.keepalive > Duration::ZERO).then_some(args.keepalive),
            // A reply must arrive within one interval, or the connection is
            // considered dead.
            keepalive_max: 1,
            keys: vec![key],
            ..Default::default()
        });

        Ok(Arc::new(Server {
            index,
            ssh_config,
            reverse: args.reverse,
            socks5: args.socks5,
            keepalive: args.keepalive,
            host: args.host,
            port: args.port,
            backend,
            backend_client: BackendClient::builder(TokioExecutor::new()).build_http(),
            session_seq: AtomicUsize::new(0),
        }))
    }

    // Serve until the token is cancelled.
    pub async fn run(self: &Arc<Self>, cancel: CancellationToken) -> color_eyre::Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .wrap_err("error listening on the server address")?;
        let mut extras = Vec::new();
        if self.reverse {
            extras.push("reverse port forwarding enabled");
        }
        if self.socks5 {
            extras.push("SOCKS5 enabled");
        }
        info!(
            addr = %listener.local_addr()?,
            extras = %extras.join(", "),
            "Listening"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            debug!(%error, "Accept error");
                            continue;
                        }
                    };
                    let server = Arc::clone(self);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |request: Request<Incoming>| {
                            let server = Arc::clone(&server);
                            let cancel = cancel.clone();
                            async move { Ok::<_, Infallible>(server.handle_request(request, peer, cancel).await) }
                        });
                        let connection = http1::Builder::new()
                            .serve_connection(io, service)
                            .with_upgrades();
                        if let Err(error) = connection.await {
                            debug!(%peer, %error, "HTTP connection error");
                        }
                    });
                }
            }
        }
    }

    // Dispatch an incoming HTTP request: tunnel upgrade, reverse proxy
    // fallback, or the built-in endpoints.
    async fn handle_request(
        self: Arc<Self>,
        mut request: Request<Incoming>,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Response<ResponseBody> {
        let is_upgrade = request
            .headers()
            .get(header::UPGRADE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("websocket"));
        let protocol = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        if is_upgrade && protocol.starts_with("chisel-") {
            if protocol == PROTOCOL_VERSION {
                return self.upgrade_session(&mut request, peer, cancel);
            }
            info!(
                %peer, got = %protocol, expected = PROTOCOL_VERSION,
                "Ignored client connection using an unexpected protocol"
            );
        }
        if self.backend.is_some() {
            return self.proxy_to_backend(request, peer).await;
        }
        match (request.method(), request.uri().path()) {
            (&Method::GET, "/health") => plain_response(StatusCode::OK, "OK\n"),
            (&Method::GET, "/version") => plain_response(StatusCode::OK, BUILD_VERSION),
            _ => plain_response(StatusCode::NOT_FOUND, "Not found"),
        }
    }

    // Reply with the WebSocket accept handshake and hand the upgraded
    // connection to a new SSH session.
    fn upgrade_session(
        self: Arc<Self>,
        request: &mut Request<Incoming>,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Response<ResponseBody> {
        let Some(accept) = request
            .headers()
            .get(header::SEC_WEBSOCKET_KEY)
            .map(|key| derive_accept_key(key.as_bytes()))
        else {
            return plain_response(StatusCode::BAD_REQUEST, "Missing Sec-WebSocket-Key");
        };
        let upgrade = hyper::upgrade::on(request);
        tokio::spawn(async move {
            match upgrade.await {
                Ok(upgraded) => self.websocket_session(upgraded, peer, cancel).await,
                Err(error) => debug!(%peer, %error, "Failed to upgrade"),
            }
        });
        let mut response = Response::new(empty_body());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(PROTOCOL_VERSION),
        );
        if let Ok(accept) = HeaderValue::from_str(&accept) {
            headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        }
        response
    }

    // One client session: WebSocket framing, SSH handshake, config
    // negotiation, then channel servicing until either side ends it.
    async fn websocket_session(
        self: Arc<Self>,
        upgraded: hyper::upgrade::Upgraded,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) {
        let id = self.session_seq.fetch_add(1, Ordering::AcqRel) + 1;
        info!(session = id, %peer, "Client connected");
        let ws = WebSocketStream::from_raw_socket(
            TokioIo::new(upgraded),
            Role::Server,
            Some(websocket_config()),
        )
        .await;
        let session_token = cancel.child_token();
        let config_token = CancellationToken::new();
        let handler = session::SessionHandler::new(
            Arc::clone(&self),
            id,
            peer,
            session_token.clone(),
            config_token.clone(),
        );
        let ssh_config = Arc::clone(&self.ssh_config);
        let mut session =
            match russh::server::run_stream(ssh_config, WebSocketRw::new(ws), handler).await {
                Ok(session) => session,
                Err(error) => {
                    debug!(session = id, %peer, %error, "Failed to handshake");
                    return;
                }
            };
        // The first request must be the config exchange, within a bounded
        // wait.
        let config_timeout = env_duration("CONFIG_TIMEOUT", Duration::from_secs(10));
        let watchdog = async {
            tokio::select! {
                _ = config_token.cancelled() => std::future::pending::<()>().await,
                _ = sleep(config_timeout) => {}
            }
        };
        tokio::select! {
            result = &mut session => {
                match result {
                    Ok(_) => debug!(session = id, %peer, "Closed connection"),
                    Err(error) => debug!(session = id, %peer, %error, "Closed connection"),
                }
                return;
            }
            _ = watchdog => {
                debug!(session = id, %peer, "Timeout waiting for configuration");
            }
            _ = session_token.cancelled() => {
                debug!(session = id, %peer, "Session cancelled");
            }
        }
        let _ = session
            .handle()
            .disconnect(russh::Disconnect::ByApplication, "".into(), "English".into())
            .await;
        let _ = session.await;
    }

    // Forward a non-tunnel request to the configured backend.
    async fn proxy_to_backend(
        &self,
        mut request: Request<Incoming>,
        peer: SocketAddr,
    ) -> Response<ResponseBody> {
        let backend = self.backend.as_ref().expect("backend is configured");
        let path = request
            .uri()
            .path_and_query()
            .map(|path| path.as_str())
            .unwrap_or("/");
        let uri: Uri = match format!(
            "{}://{}{}",
            backend.scheme(),
            backend.authority(),
            path
        )
        .parse()
        {
            Ok(uri) => uri,
            Err(error) => {
                debug!(%peer, %error, "Invalid backend URI");
                return plain_response(StatusCode::BAD_GATEWAY, "Bad gateway");
            }
        };
        *request.uri_mut() = uri;
        if let Ok(host) = HeaderValue::from_str(backend.authority()) {
            request.headers_mut().insert(header::HOST, host);
        }
        match self.backend_client.request(request).await {
            Ok(response) => response.map(BodyExt::boxed),
            Err(error) => {
                debug!(%peer, %error, "Backend request failed");
                plain_response(StatusCode::BAD_GATEWAY, "Bad gateway")
            }
        }
    }
}

fn empty_body() -> ResponseBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<ResponseBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(body.as_bytes()))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}

// Main entrypoint of the server role.
#[doc(hidden)]
pub async fn entrypoint(args: ServerArgs) -> color_eyre::Result<()> {
    let server = Server::new(args).await?;
    let cancel = CancellationToken::new();
    let signal_guard = cancel.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutting down.");
        signal_guard.cancel();
    });
    server.run(cancel).await
}
