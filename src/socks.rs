use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, copy_bidirectional},
    net::TcpStream,
};
use tracing::debug;

use crate::ws::BoxedIo;

const SOCKS_VERSION: u8 = 0x05;

const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xff;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_NETWORK_UNREACHABLE: u8 = 0x03;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

// Minimal SOCKS5 (RFC 1928) endpoint serving CONNECT over an established
// stream. It never listens on a port of its own; channels in SOCKS mode are
// handed to it directly.
pub(crate) struct SocksServer;

impl SocksServer {
    pub(crate) fn new() -> Self {
        SocksServer
    }

    pub(crate) async fn serve(&self, mut stream: BoxedIo) -> io::Result<()> {
        // Method negotiation. Only "no authentication" is offered.
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported SOCKS version",
            ));
        }
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await?;
        if !methods.contains(&METHOD_NO_AUTH) {
            stream
                .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                .await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "no acceptable authentication method",
            ));
        }
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

        // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        if request[0] != SOCKS_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported SOCKS version",
            ));
        }
        let target = match request[3] {
            ATYP_IPV4 => {
                let mut addr = [0u8; 4];
                stream.read_exact(&mut addr).await?;
                let port = read_port(&mut stream).await?;
                format!("{}:{}", Ipv4Addr::from(addr), port)
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                let domain = String::from_utf8(domain).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "invalid domain name")
                })?;
                let port = read_port(&mut stream).await?;
                format!("{domain}:{port}")
            }
            ATYP_IPV6 => {
                let mut addr = [0u8; 16];
                stream.read_exact(&mut addr).await?;
                let port = read_port(&mut stream).await?;
                format!("[{}]:{}", Ipv6Addr::from(addr), port)
            }
            _ => {
                reply(&mut stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unsupported address type",
                ));
            }
        };
        if request[1] != CMD_CONNECT {
            reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unsupported SOCKS command",
            ));
        }
        debug!(%target, "SOCKS connect");
        let mut dst = match TcpStream::connect(&target).await {
            Ok(dst) => dst,
            Err(error) => {
                reply(&mut stream, reply_code(&error)).await?;
                return Err(error);
            }
        };
        reply(&mut stream, REPLY_SUCCEEDED).await?;
        let (sent, received) = copy_bidirectional(&mut stream, &mut dst)
            .await
            .unwrap_or_default();
        debug!(%target, sent, received, "SOCKS closed");
        Ok(())
    }
}

async fn read_port(stream: &mut BoxedIo) -> io::Result<u16> {
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(u16::from_be_bytes(port))
}

// Reply with the given code and an all-zero IPv4 bind address.
async fn reply(stream: &mut BoxedIo, code: u8) -> io::Result<()> {
    stream
        .write_all(&[
            SOCKS_VERSION,
            code,
            0x00,
            ATYP_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ])
        .await?;
    stream.flush().await
}

fn reply_code(error: &io::Error) -> u8 {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        io::ErrorKind::HostUnreachable => REPLY_HOST_UNREACHABLE,
        io::ErrorKind::NetworkUnreachable => REPLY_NETWORK_UNREACHABLE,
        _ => REPLY_GENERAL_FAILURE,
    }
}
