use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use russh::{
    Channel, ChannelId, CryptoVec, Disconnect,
    server::{Auth, Handler, Msg, Session},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    droppable_handle::DroppableHandle,
    envelope::{BUILD_VERSION, Envelope},
    error::TunnelError,
    remote::reversed,
    server::Server,
    tunnel::{SshLink, Tunnel, TunnelConfig},
    users::User,
    ws::BoxedIo,
};

// Per-session SSH handler. Authenticates against the user index, enforces
// the config-first ordering, and dispatches channels to the session tunnel.
pub(crate) struct SessionHandler {
    server: Arc<Server>,
    id: usize,
    peer: SocketAddr,
    // The authenticated user, when the index is non-empty.
    user: Option<Arc<User>>,
    // Set once the config exchange succeeds. No channel is served before.
    tunnel: Option<Arc<Tunnel>>,
    session_token: CancellationToken,
    config_token: CancellationToken,
    // The session channel the config exchange rides on.
    session_channel: Option<Channel<Msg>>,
    _reverse_task: Option<DroppableHandle<()>>,
}

impl SessionHandler {
    pub(crate) fn new(
        server: Arc<Server>,
        id: usize,
        peer: SocketAddr,
        session_token: CancellationToken,
        config_token: CancellationToken,
    ) -> Self {
        SessionHandler {
            server,
            id,
            peer,
            user: None,
            tunnel: None,
            session_token,
            config_token,
            session_channel: None,
            _reverse_task: None,
        }
    }

    // Reply to a failed config exchange with the error message as payload,
    // then end the session.
    fn reject_config(
        &self,
        channel: ChannelId,
        session: &mut Session,
        error: TunnelError,
    ) -> Result<(), russh::Error> {
        debug!(session = self.id, peer = %self.peer, %error, "Failed");
        session.data(channel, CryptoVec::from_slice(error.to_string().as_bytes()))?;
        session.channel_failure(channel)?;
        self.session_token.cancel();
        Ok(())
    }
}

impl Handler for SessionHandler {
    type Error = russh::Error;

    // Compare the credentials against the user index. An empty index means
    // authentication is not required.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.server.index.len() == 0 {
            return Ok(Auth::Accept);
        }
        match self.server.index.get(user) {
            Some(known) if known.pass == password => {
                debug!(session = self.id, peer = %self.peer, %user, "Authenticated");
                self.user = Some(known);
                Ok(Auth::Accept)
            }
            _ => {
                info!(session = self.id, peer = %self.peer, %user, "Rejected credentials");
                Ok(Auth::Reject {
                    proceed_with_methods: None,
                    partial_success: false,
                })
            }
        }
    }

    // The config exchange rides on one session channel.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.session_channel.is_some() {
            return Ok(false);
        }
        self.session_channel = Some(channel);
        Ok(true)
    }

    // The config envelope arrives as the one exec request of the session.
    // Validate it, reply, and only then start serving channels.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.tunnel.is_some() {
            debug!(session = self.id, peer = %self.peer, "Unexpected request after configuration");
            return session.channel_failure(channel);
        }
        debug!(session = self.id, peer = %self.peer, "Verifying configuration");
        let Ok(envelope) = Envelope::decode(data) else {
            return self.reject_config(channel, session, TunnelError::InvalidConfig);
        };
        if envelope.version != BUILD_VERSION {
            let version = if envelope.version.is_empty() {
                "<unknown>"
            } else {
                envelope.version.as_str()
            };
            info!(
                session = self.id, client = %version, server = BUILD_VERSION,
                "Client version differs from server version"
            );
        }
        let Ok(remotes) = envelope.decode_remotes() else {
            return self.reject_config(channel, session, TunnelError::InvalidConfig);
        };
        let user = if self.server.index.len() > 0 {
            // The password callback stores the user for every authenticated
            // session; a missing entry is a bug, not a recoverable state.
            Some(
                self.user
                    .as_ref()
                    .expect("bug in the SSH auth handler")
                    .clone(),
            )
        } else {
            None
        };
        for remote in &remotes {
            if let Some(user) = &user {
                let addr = remote.user_addr();
                if !user.has_access(&addr) {
                    return self.reject_config(
                        channel,
                        session,
                        TunnelError::AccessDenied(addr),
                    );
                }
            }
            if remote.reverse {
                if !self.server.reverse {
                    debug!(
                        session = self.id, peer = %self.peer,
                        "Denied reverse port forwarding request, please enable --reverse"
                    );
                    return self.reject_config(channel, session, TunnelError::ReverseDisabled);
                }
                if !remote.can_listen().await {
                    return self.reject_config(
                        channel,
                        session,
                        TunnelError::CannotListen(remote.to_string()),
                    );
                }
            }
        }
        session.channel_success(channel)?;
        self.config_token.cancel();

        let tunnel = Tunnel::new(TunnelConfig {
            inbound: self.server.reverse,
            // The server always accepts outbound.
            outbound: true,
            socks: self.server.socks5,
            keep_alive: self.server.keepalive,
            hooks: None,
        });
        tunnel.bind_link(Arc::new(ServerLink {
            handle: session.handle(),
            peer: self.peer,
        }));
        let reverse_remotes = reversed(&remotes, true);
        if !reverse_remotes.is_empty() {
            let reverse_tunnel = Arc::clone(&tunnel);
            let session_token = self.session_token.clone();
            let id = self.id;
            self._reverse_task = Some(DroppableHandle(tokio::spawn(async move {
                if let Err(error) = reverse_tunnel
                    .bind_remotes(session_token.child_token(), reverse_remotes)
                    .await
                {
                    warn!(session = id, %error, "Reverse binding failed");
                }
                // Without its listeners, the session has nothing to serve.
                session_token.cancel();
            })));
        }
        self.tunnel = Some(tunnel);
        Ok(())
    }

    // A forwarding request from the client: reject before the config is
    // accepted, screen it, then serve it on its own task.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if port_to_connect > u16::MAX.into() {
            return Err(russh::Error::Disconnect);
        }
        let Some(tunnel) = &self.tunnel else {
            debug!(session = self.id, peer = %self.peer, "Denied channel before configuration");
            return Ok(false);
        };
        match tunnel.classify(host_to_connect, port_to_connect as u16) {
            Ok(mode) => {
                tunnel.spawn_channel(
                    Box::new(channel.into_stream()),
                    mode,
                    self.session_token.child_token(),
                );
                Ok(true)
            }
            Err(error) => {
                debug!(session = self.id, peer = %self.peer, %error, "Denied outbound connection");
                Ok(false)
            }
        }
    }
}

impl Drop for SessionHandler {
    fn drop(&mut self) {
        info!(session = self.id, peer = %self.peer, "Client disconnected");
    }
}

// Opens channels over the server side of the SSH connection, towards the
// client's reverse targets.
struct ServerLink {
    handle: russh::server::Handle,
    peer: SocketAddr,
}

#[async_trait]
impl SshLink for ServerLink {
    async fn open_channel(&self, host: String, port: u16) -> Result<BoxedIo, russh::Error> {
        let channel = self
            .handle
            .channel_open_forwarded_tcpip(
                host,
                port as u32,
                self.peer.ip().to_string(),
                self.peer.port() as u32,
            )
            .await?;
        Ok(Box::new(channel.into_stream()))
    }

    async fn close(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "".into(), "English".into())
            .await;
    }
}
