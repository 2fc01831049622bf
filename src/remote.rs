use std::{fmt, str::FromStr, sync::LazyLock};

use regex::Regex;
use tokio::net::{TcpListener, UdpSocket};

use crate::error::TunnelError;

// Shorthand conversions:
//   3000 ->
//     local  0.0.0.0:3000
//     remote 127.0.0.1:3000
//   foobar.com:3000 ->
//     local  0.0.0.0:3000
//     remote foobar.com:3000
//   3000:google.com:80 ->
//     local  0.0.0.0:3000
//     remote google.com:80
//   192.168.0.1:3000:google.com:80 ->
//     local  192.168.0.1:3000
//     remote google.com:80
//   127.0.0.1:1080:socks
//     local  127.0.0.1:1080
//     remote socks
//   stdio:example.com:22
//     local  stdio
//     remote example.com:22
//   1.1.1.1:53/udp
//     local  0.0.0.0:53/udp
//     remote 1.1.1.1:53/udp

const REVERSE_PREFIX: &str = "R:";

// Transport protocol of one side of a remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

// A mapping between a listening endpoint on one side of the tunnel and a
// target endpoint on the other side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Remote {
    pub(crate) local_host: String,
    pub(crate) local_port: u16,
    pub(crate) local_proto: Protocol,
    pub(crate) remote_host: String,
    pub(crate) remote_port: Option<u16>,
    pub(crate) remote_proto: Protocol,
    pub(crate) socks: bool,
    pub(crate) reverse: bool,
    pub(crate) stdio: bool,
}

// Splits on ':' while keeping bracketed IPv6 literals whole.
static TOKENS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\[[^\[\]]+\]|[^\[\]:]+):?").expect("valid regex"));

static L4_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)/(tcp|udp)$").expect("valid regex"));

// Strips an optional `/tcp` or `/udp` suffix from a token.
fn split_l4(token: &str) -> (&str, Option<Protocol>) {
    match L4_SUFFIX.find(token) {
        Some(found) => {
            let proto = match &token[found.start() + 1..] {
                p if p.eq_ignore_ascii_case("udp") => Protocol::Udp,
                _ => Protocol::Tcp,
            };
            (&token[..found.start()], Some(proto))
        }
        None => (token, None),
    }
}

fn parse_port(token: &str) -> Option<u16> {
    token.parse::<u16>().ok().filter(|port| *port > 0)
}

fn is_host(token: &str) -> bool {
    !token.is_empty() && !token.contains(char::is_whitespace) && !token.contains('/')
}

impl Remote {
    // Parse the compact forwarding shorthand. Tokens are consumed right to
    // left: remote fields fill first, then local fields, so that the local
    // side defaults to the remote side when omitted.
    pub(crate) fn decode(spec: &str) -> Result<Self, TunnelError> {
        let (spec, reverse) = match spec.strip_prefix(REVERSE_PREFIX) {
            Some(rest) => (rest, true),
            None => (spec, false),
        };
        let tokens: Vec<&str> = TOKENS
            .captures_iter(spec)
            .filter_map(|capture| capture.get(1))
            .map(|capture| capture.as_str())
            .collect();
        if tokens.is_empty() || tokens.len() >= 5 {
            return Err(TunnelError::InvalidRemote);
        }
        let mut socks = false;
        let mut stdio = false;
        let mut local_host: Option<String> = None;
        let mut local_port: Option<u16> = None;
        let mut local_proto: Option<Protocol> = None;
        let mut remote_host: Option<String> = None;
        let mut remote_port: Option<u16> = None;
        let mut remote_proto: Option<Protocol> = None;
        for (index, token) in tokens.iter().enumerate().rev() {
            if index == tokens.len() - 1 && *token == "socks" {
                socks = true;
                continue;
            }
            if index == 0 && *token == "stdio" {
                stdio = true;
                continue;
            }
            let (token, proto) = split_l4(token);
            if let Some(proto) = proto {
                if remote_port.is_none() {
                    remote_proto = Some(proto);
                } else if local_proto.is_none() {
                    local_proto = Some(proto);
                }
            }
            if let Some(port) = parse_port(token) {
                if !socks && remote_port.is_none() {
                    remote_port = Some(port);
                }
                local_port = Some(port);
                continue;
            }
            if !socks && remote_port.is_none() && local_port.is_none() {
                return Err(TunnelError::MissingPorts);
            }
            if !is_host(token) {
                return Err(TunnelError::InvalidHost);
            }
            if !socks && remote_host.is_none() {
                remote_host = Some(token.to_string());
            } else {
                local_host = Some(token.to_string());
            }
        }
        // Fill in the defaults
        let (local_host, local_port, remote_host) = if socks {
            (
                local_host.unwrap_or_else(|| "127.0.0.1".to_string()),
                local_port.unwrap_or(1080),
                remote_host.unwrap_or_default(),
            )
        } else {
            let Some(local_port) = local_port else {
                return Err(TunnelError::MissingPorts);
            };
            (
                local_host.unwrap_or_else(|| "0.0.0.0".to_string()),
                local_port,
                remote_host.unwrap_or_else(|| "127.0.0.1".to_string()),
            )
        };
        let remote_proto = remote_proto.unwrap_or(Protocol::Tcp);
        let local_proto = local_proto.unwrap_or(remote_proto);
        if local_proto != remote_proto {
            return Err(TunnelError::CrossProtocol);
        }
        if socks && remote_proto != Protocol::Tcp {
            return Err(TunnelError::SocksProtocol);
        }
        if stdio && reverse {
            return Err(TunnelError::StdioReverse);
        }
        Ok(Remote {
            local_host,
            local_port,
            local_proto,
            remote_host,
            remote_port,
            remote_proto,
            socks,
            reverse,
            stdio,
        })
    }

    // The decodable local portion.
    pub(crate) fn local_addr(&self) -> String {
        if self.stdio {
            return "stdio".to_string();
        }
        format!("{}:{}", self.local_host, self.local_port)
    }

    // The decodable remote portion, without the protocol suffix.
    pub(crate) fn remote_addr(&self) -> String {
        if self.socks {
            return "socks".to_string();
        }
        match self.remote_port {
            Some(port) => format!("{}:{}", self.remote_host, port),
            None => format!("{}:", self.remote_host),
        }
    }

    // Host and port as carried in the channel open payload. The host keeps
    // the `/udp` suffix so the peer knows which protocol to dial, or is the
    // literal `socks`.
    pub(crate) fn channel_target(&self) -> (String, u16) {
        if self.socks {
            return ("socks".to_string(), 0);
        }
        let host = match self.remote_proto {
            Protocol::Udp => format!("{}/udp", self.remote_host),
            Protocol::Tcp => self.remote_host.clone(),
        };
        (host, self.remote_port.unwrap_or_default())
    }

    // Re-encode into the shorthand, omitting the default local host.
    pub(crate) fn encode(&self) -> String {
        let local = self
            .local_addr()
            .strip_prefix("0.0.0.0:")
            .map(str::to_string)
            .unwrap_or_else(|| self.local_addr());
        let mut remote = self.remote_addr();
        if self.remote_proto == Protocol::Udp {
            remote.push_str("/udp");
        }
        if self.reverse {
            format!("{REVERSE_PREFIX}{local}:{remote}")
        } else {
            format!("{local}:{remote}")
        }
    }

    // The address checked against a user's allow-list.
    pub(crate) fn user_addr(&self) -> String {
        if self.reverse {
            format!("R:{}:{}", self.local_host, self.local_port)
        } else {
            self.remote_addr()
        }
    }

    // Probe whether the local endpoint is bindable, by binding and
    // immediately dropping a listener in the configured protocol.
    pub(crate) async fn can_listen(&self) -> bool {
        match self.local_proto {
            Protocol::Tcp => TcpListener::bind(self.local_addr()).await.is_ok(),
            Protocol::Udp => UdpSocket::bind(self.local_addr()).await.is_ok(),
        }
    }
}

impl FromStr for Remote {
    type Err = TunnelError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        Remote::decode(spec)
    }
}

impl fmt::Display for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            f.write_str(REVERSE_PREFIX)?;
        }
        let local = self.local_addr();
        f.write_str(local.strip_prefix("0.0.0.0:").unwrap_or(&local))?;
        f.write_str("=>")?;
        let remote = self.remote_addr();
        f.write_str(remote.strip_prefix("127.0.0.1:").unwrap_or(&remote))?;
        if self.remote_proto == Protocol::Udp {
            f.write_str("/udp")?;
        }
        Ok(())
    }
}

// Filter a set of remotes down to the reverse or non-reverse subset.
pub(crate) fn reversed(remotes: &[Remote], reverse: bool) -> Vec<Remote> {
    remotes
        .iter()
        .filter(|remote| remote.reverse == reverse)
        .cloned()
        .collect()
}

#[cfg(test)]
mod remote_tests {
    use super::{Protocol, Remote};
    use crate::error::TunnelError;

    #[test]
    fn parses_single_port() {
        let remote = Remote::decode("3000").unwrap();
        assert_eq!(remote.local_host, "0.0.0.0");
        assert_eq!(remote.local_port, 3000);
        assert_eq!(remote.remote_host, "127.0.0.1");
        assert_eq!(remote.remote_port, Some(3000));
        assert_eq!(remote.remote_proto, Protocol::Tcp);
        assert!(!remote.reverse);
        assert!(!remote.socks);
        assert!(!remote.stdio);
    }

    #[test]
    fn parses_reverse_remote() {
        let remote = Remote::decode("R:2222:127.0.0.1:22").unwrap();
        assert!(remote.reverse);
        assert_eq!(remote.local_host, "0.0.0.0");
        assert_eq!(remote.local_port, 2222);
        assert_eq!(remote.remote_host, "127.0.0.1");
        assert_eq!(remote.remote_port, Some(22));
        assert_eq!(remote.remote_proto, Protocol::Tcp);
        assert_eq!(remote.encode(), "R:2222:127.0.0.1:22");
    }

    #[test]
    fn parses_socks_remote() {
        let remote = Remote::decode("127.0.0.1:1080:socks").unwrap();
        assert!(remote.socks);
        assert_eq!(remote.local_host, "127.0.0.1");
        assert_eq!(remote.local_port, 1080);
        assert_eq!(remote.remote_addr(), "socks");
    }

    #[test]
    fn socks_defaults() {
        let remote = Remote::decode("socks").unwrap();
        assert!(remote.socks);
        assert_eq!(remote.local_host, "127.0.0.1");
        assert_eq!(remote.local_port, 1080);
    }

    #[test]
    fn parses_stdio_remote() {
        let remote = Remote::decode("stdio:example.com:22").unwrap();
        assert!(remote.stdio);
        assert_eq!(remote.remote_host, "example.com");
        assert_eq!(remote.remote_port, Some(22));
        assert_eq!(remote.local_addr(), "stdio");
    }

    #[test]
    fn parses_udp_remote() {
        let remote = Remote::decode("1.1.1.1:53/udp").unwrap();
        assert_eq!(remote.local_proto, Protocol::Udp);
        assert_eq!(remote.remote_proto, Protocol::Udp);
        assert_eq!(remote.local_port, 53);
        assert_eq!(remote.remote_port, Some(53));
        assert_eq!(remote.remote_host, "1.1.1.1");
    }

    #[test]
    fn parses_full_form() {
        let remote = Remote::decode("192.168.0.1:3000:google.com:80").unwrap();
        assert_eq!(remote.local_host, "192.168.0.1");
        assert_eq!(remote.local_port, 3000);
        assert_eq!(remote.remote_host, "google.com");
        assert_eq!(remote.remote_port, Some(80));
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let remote = Remote::decode("[::1]:3000:google.com:80").unwrap();
        assert_eq!(remote.local_host, "[::1]");
        assert_eq!(remote.local_port, 3000);
        assert_eq!(remote.remote_host, "google.com");
    }

    #[test]
    fn rejects_missing_ports() {
        assert!(matches!(
            Remote::decode("foobar.com"),
            Err(TunnelError::MissingPorts)
        ));
    }

    #[test]
    fn rejects_cross_protocol() {
        assert!(matches!(
            Remote::decode("3000/tcp:example.com:4000/udp"),
            Err(TunnelError::CrossProtocol)
        ));
    }

    #[test]
    fn rejects_reversed_stdio() {
        assert!(matches!(
            Remote::decode("R:stdio:example.com:22"),
            Err(TunnelError::StdioReverse)
        ));
    }

    #[test]
    fn rejects_udp_socks() {
        assert!(matches!(
            Remote::decode("1080/udp:socks"),
            Err(TunnelError::SocksProtocol)
        ));
    }

    #[test]
    fn encode_round_trips() {
        for spec in [
            "3000",
            "foobar.com:3000",
            "3000:google.com:80",
            "192.168.0.1:3000:google.com:80",
            "127.0.0.1:1080:socks",
            "stdio:example.com:22",
            "1.1.1.1:53/udp",
            "R:2222:127.0.0.1:22",
            "R:socks",
        ] {
            let first = Remote::decode(spec).unwrap();
            let again = Remote::decode(&first.encode()).unwrap();
            assert_eq!(first, again, "round trip failed for '{spec}'");
        }
    }

    #[test]
    fn user_addr_reflects_direction() {
        assert_eq!(
            Remote::decode("3000:db:3306").unwrap().user_addr(),
            "db:3306"
        );
        assert_eq!(
            Remote::decode("R:7000:127.0.0.1:8080").unwrap().user_addr(),
            "R:0.0.0.0:7000"
        );
    }

    #[tokio::test]
    async fn can_listen_probes_local_endpoint() {
        let free = Remote::decode("127.0.0.1:0:example.com:80");
        // Port 0 is not accepted by the parser, so probe a likely-free port.
        assert!(free.is_err());
        let remote = Remote::decode("127.0.0.1:28964:example.com:80").unwrap();
        assert!(remote.can_listen().await);
        let holder = tokio::net::TcpListener::bind("127.0.0.1:28964")
            .await
            .unwrap();
        assert!(!remote.can_listen().await);
        drop(holder);
    }
}
