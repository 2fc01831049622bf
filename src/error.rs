#[derive(thiserror::Error, Debug)]
pub(crate) enum TunnelError {
    #[error("Invalid remote")]
    InvalidRemote,
    #[error("Missing ports")]
    MissingPorts,
    #[error("Invalid host")]
    InvalidHost,
    #[error("cross-protocol remotes are not supported")]
    CrossProtocol,
    #[error("only TCP SOCKS is supported")]
    SocksProtocol,
    #[error("stdio cannot be reversed")]
    StdioReverse,
    #[error("only one stdio remote is allowed")]
    DuplicateStdio,
    #[error("cannot listen on {0}")]
    CannotListen(String),
    #[error("invalid user:pass string")]
    InvalidAuth,
    #[error("invalid address regex '{0}'")]
    InvalidAddressRegex(String),
    #[error("access to '{0}' denied")]
    AccessDenied(String),
    #[error("reverse port forwarding not enabled on server")]
    ReverseDisabled,
    #[error("SOCKS5 is not enabled")]
    SocksDisabled,
    #[error("denied outbound connection")]
    OutboundBlocked,
    #[error("inbound connections blocked")]
    InboundBlocked,
    #[error("no remotes configured")]
    NoRemotes,
    #[error("invalid config")]
    InvalidConfig,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("config rejected by server: {0}")]
    ConfigRejected(String),
    #[error("invalid fingerprint ({0})")]
    FingerprintMismatch(String),
    #[error("unsupported proxy scheme '{0}' (only http://, https://, socks:// or socks5h:// are supported)")]
    UnsupportedProxyScheme(String),
    #[error("please specify both the client certificate and its key")]
    IncompleteClientCert,
}
