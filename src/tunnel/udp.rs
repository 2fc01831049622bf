use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bytes::{Buf, BufMut, BytesMut};
use color_eyre::eyre::WrapErr;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{
    io::WriteHalf,
    net::{UdpSocket, lookup_host},
    sync::Mutex as AsyncMutex,
};
use tokio_util::{
    codec::{Decoder, Encoder, FramedRead, FramedWrite},
    sync::CancellationToken,
};
use tracing::debug;

use crate::{
    droppable_handle::DroppableHandle,
    remote::Remote,
    tunnel::Tunnel,
    ws::BoxedIo,
};

// Largest UDP payload carried over a channel. Oversized datagrams are
// dropped, never truncated.
pub(crate) const MAX_DATAGRAM: usize = 64 * 1024;
// Slack for the length prefix and the encoded source address.
const MAX_FRAME: usize = MAX_DATAGRAM + 512;
// Idle routing entries are evicted after this long.
const SOURCE_TTL: Duration = Duration::from_secs(30);
// Upper bound on tracked sources per flow.
const MAX_SOURCES: usize = 1024;

// One datagram in flight over a channel. `src` names the originating socket
// so replies can be routed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UdpPacket {
    pub(crate) src: String,
    pub(crate) payload: Vec<u8>,
}

// Length-delimited binary packet framing over a byte stream: a u32
// big-endian length followed by the serialized packet.
pub(crate) struct PacketCodec;

impl Encoder<UdpPacket> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, packet: UdpPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = bincode::serialize(&packet).map_err(io::Error::other)?;
        if payload.len() > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram exceeds the packet size limit",
            ));
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = UdpPacket;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "packet exceeds the frame size limit",
            ));
        }
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }
        src.advance(4);
        let frame = src.split_to(length);
        bincode::deserialize(&frame)
            .map(Some)
            .map_err(io::Error::other)
    }
}

type Uplink = FramedWrite<WriteHalf<BoxedIo>, PacketCodec>;

// Inbound UDP listener for one remote. All local sources share one socket
// and one channel; replies are routed back via the source map.
pub(crate) struct UdpProxy {
    tunnel: Arc<Tunnel>,
    remote: Remote,
    socket: Arc<UdpSocket>,
    sources: Arc<DashMap<String, (SocketAddr, Instant)>>,
}

impl UdpProxy {
    pub(crate) async fn bind(tunnel: Arc<Tunnel>, remote: &Remote) -> color_eyre::Result<Self> {
        let socket = UdpSocket::bind(remote.local_addr()).await?;
        Ok(UdpProxy {
            tunnel,
            remote: remote.clone(),
            socket: Arc::new(socket),
            sources: Arc::new(DashMap::new()),
        })
    }

    pub(crate) async fn run(&self, cancel: CancellationToken) -> color_eyre::Result<()> {
        let mut uplink: Option<(Uplink, DroppableHandle<()>)> = None;
        let mut buf = vec![0u8; MAX_DATAGRAM + 1];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = self.socket.recv_from(&mut buf) => {
                    let (n, src) = received.wrap_err("udp recv failed")?;
                    if n > MAX_DATAGRAM {
                        debug!(%src, size = n, "Dropped oversized datagram");
                        continue;
                    }
                    self.remember_source(src);
                    if uplink.is_none() {
                        uplink = self.open_uplink(&cancel).await;
                        if uplink.is_none() {
                            debug!("No remote connection");
                            continue;
                        }
                    }
                    if let Some((writer, _)) = uplink.as_mut() {
                        let packet = UdpPacket {
                            src: src.to_string(),
                            payload: buf[..n].to_vec(),
                        };
                        if let Err(error) = writer.send(packet).await {
                            debug!(%error, "Uplink failed, dropping channel");
                            uplink = None;
                        }
                    }
                }
            }
        }
    }

    fn remember_source(&self, src: SocketAddr) {
        if self.sources.len() >= MAX_SOURCES {
            self.sources
                .retain(|_, (_, seen)| seen.elapsed() < SOURCE_TTL);
            if self.sources.len() >= MAX_SOURCES {
                // Still full of live sources, evict the stalest.
                if let Some(oldest) = self
                    .sources
                    .iter()
                    .min_by_key(|entry| entry.value().1)
                    .map(|entry| entry.key().clone())
                {
                    self.sources.remove(&oldest);
                }
            }
        }
        self.sources.insert(src.to_string(), (src, Instant::now()));
    }

    // Open one channel towards the peer and start the task routing replies
    // back to their originating sources.
    async fn open_uplink(
        &self,
        cancel: &CancellationToken,
    ) -> Option<(Uplink, DroppableHandle<()>)> {
        let link = self.tunnel.get_link(cancel).await?;
        let (host, port) = self.remote.channel_target();
        let channel = match link.open_channel(host, port).await {
            Ok(channel) => channel,
            Err(error) => {
                debug!(%error, "Stream error");
                return None;
            }
        };
        let (read_half, write_half) = tokio::io::split(channel);
        let mut packets = FramedRead::new(read_half, PacketCodec);
        let socket = Arc::clone(&self.socket);
        let sources = Arc::clone(&self.sources);
        let downlink = DroppableHandle(tokio::spawn(async move {
            while let Some(packet) = packets.next().await {
                let packet = match packet {
                    Ok(packet) => packet,
                    Err(error) => {
                        debug!(%error, "Downlink decode failed");
                        return;
                    }
                };
                let destination = sources.get_mut(&packet.src).map(|mut entry| {
                    let (addr, seen) = entry.value_mut();
                    *seen = Instant::now();
                    *addr
                });
                match destination {
                    Some(addr) => {
                        if let Err(error) = socket.send_to(&packet.payload, addr).await {
                            debug!(%error, "Reply send failed");
                        }
                    }
                    None => debug!(src = %packet.src, "Dropped reply for unknown source"),
                }
            }
        }));
        Some((FramedWrite::new(write_half, PacketCodec), downlink))
    }
}

struct UdpConn {
    socket: Arc<UdpSocket>,
    last_active: Arc<Mutex<Instant>>,
    _reader: DroppableHandle<()>,
}

// Outbound side of a UDP channel: decode packets from the stream, relay each
// datagram to the target from a per-source socket, and route replies back
// tagged with their source.
pub(crate) async fn serve_outbound(
    stream: BoxedIo,
    target: String,
    cancel: CancellationToken,
) -> io::Result<()> {
    let target_addr = lookup_host(&target)
        .await?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "cannot resolve target"))?;
    let (read_half, write_half) = tokio::io::split(stream);
    let mut packets = FramedRead::new(read_half, PacketCodec);
    let writer = Arc::new(AsyncMutex::new(FramedWrite::new(write_half, PacketCodec)));
    let mut conns: HashMap<String, UdpConn> = HashMap::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = packets.next() => {
                let packet = match next {
                    Some(Ok(packet)) => packet,
                    Some(Err(error)) => return Err(error),
                    None => return Ok(()),
                };
                conns.retain(|_, conn| {
                    conn.last_active.lock().expect("not poisoned").elapsed() < SOURCE_TTL
                });
                if !conns.contains_key(&packet.src) {
                    if conns.len() >= MAX_SOURCES {
                        debug!(src = %packet.src, "Dropped datagram, too many sources");
                        continue;
                    }
                    match open_conn(target_addr, packet.src.clone(), Arc::clone(&writer)).await {
                        Ok(conn) => {
                            conns.insert(packet.src.clone(), conn);
                        }
                        Err(error) => {
                            debug!(%error, "Cannot reach target");
                            continue;
                        }
                    }
                }
                let conn = conns.get(&packet.src).expect("just inserted");
                *conn.last_active.lock().expect("not poisoned") = Instant::now();
                if let Err(error) = conn.socket.send(&packet.payload).await {
                    debug!(%error, "Datagram send failed");
                    conns.remove(&packet.src);
                }
            }
        }
    }
}

async fn open_conn(
    target: SocketAddr,
    src: String,
    writer: Arc<AsyncMutex<Uplink>>,
) -> io::Result<UdpConn> {
    let bind_addr = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
    socket.connect(target).await?;
    let last_active = Arc::new(Mutex::new(Instant::now()));
    let reader_socket = Arc::clone(&socket);
    let reader_last = Arc::clone(&last_active);
    let reader = DroppableHandle(tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = match reader_socket.recv(&mut buf).await {
                Ok(n) => n,
                Err(_) => return,
            };
            *reader_last.lock().expect("not poisoned") = Instant::now();
            let packet = UdpPacket {
                src: src.clone(),
                payload: buf[..n].to_vec(),
            };
            if writer.lock().await.send(packet).await.is_err() {
                return;
            }
        }
    }));
    Ok(UdpConn {
        socket,
        last_active,
        _reader: reader,
    })
}

#[cfg(test)]
mod udp_codec_tests {
    use bytes::BytesMut;
    use tokio_util::codec::{Decoder, Encoder};

    use super::{MAX_DATAGRAM, PacketCodec, UdpPacket};

    #[test]
    fn packet_round_trips() {
        let packet = UdpPacket {
            src: "127.0.0.1:53531".to_string(),
            payload: vec![1, 2, 3, 4, 5],
        };
        let mut buf = BytesMut::new();
        PacketCodec.encode(packet.clone(), &mut buf).unwrap();
        let decoded = PacketCodec.decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(packet));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_complete_frame() {
        let packet = UdpPacket {
            src: "10.0.0.1:1000".to_string(),
            payload: vec![9; 128],
        };
        let mut encoded = BytesMut::new();
        PacketCodec.encode(packet.clone(), &mut encoded).unwrap();
        let mut partial = BytesMut::from(&encoded[..7]);
        assert_eq!(PacketCodec.decode(&mut partial).unwrap(), None);
        partial.extend_from_slice(&encoded[7..]);
        assert_eq!(PacketCodec.decode(&mut partial).unwrap(), Some(packet));
    }

    #[test]
    fn oversized_datagrams_are_rejected() {
        let packet = UdpPacket {
            src: "10.0.0.1:1000".to_string(),
            payload: vec![0; MAX_DATAGRAM + 1024],
        };
        let mut buf = BytesMut::new();
        assert!(PacketCodec.encode(packet, &mut buf).is_err());
    }

    #[test]
    fn datagram_boundaries_are_preserved() {
        let first = UdpPacket {
            src: "10.0.0.1:1000".to_string(),
            payload: vec![1; 16],
        };
        let second = UdpPacket {
            src: "10.0.0.2:2000".to_string(),
            payload: vec![2; 32],
        };
        let mut buf = BytesMut::new();
        PacketCodec.encode(first.clone(), &mut buf).unwrap();
        PacketCodec.encode(second.clone(), &mut buf).unwrap();
        assert_eq!(PacketCodec.decode(&mut buf).unwrap(), Some(first));
        assert_eq!(PacketCodec.decode(&mut buf).unwrap(), Some(second));
        assert!(buf.is_empty());
    }
}
