use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Message, protocol::WebSocketConfig},
};

// Any bidirectional byte stream the tunnel can splice or frame over.
pub(crate) trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

pub(crate) type BoxedIo = Box<dyn AsyncIo>;

// Message size ceiling for the outer transport. SSH packets are far smaller,
// so this only guards against a misbehaving peer.
pub(crate) fn websocket_config() -> WebSocketConfig {
    let config = WebSocketConfig::default()
        .max_message_size(Some(16 * 1024 * 1024))
        .max_frame_size(Some(16 * 1024 * 1024));
    match crate::envelope::env_usize("WS_BUFF_SIZE") {
        Some(size) => config
            .write_buffer_size(size)
            .max_write_buffer_size(size.max(usize::from(u16::MAX)) * 2),
        None => config,
    }
}

// Adapts a WebSocket into the byte stream the SSH transport expects. Each
// write becomes one binary message; reads drain one buffered inbound
// message at a time.
pub(crate) struct WebSocketRw<S> {
    inner: WebSocketStream<S>,
    read_buf: BytesMut,
}

impl<S: AsyncRead + AsyncWrite + Unpin> WebSocketRw<S> {
    pub(crate) fn new(inner: WebSocketStream<S>) -> Self {
        WebSocketRw {
            inner,
            read_buf: BytesMut::new(),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WebSocketRw<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.read_buf.is_empty() {
                let n = self.read_buf.len().min(buf.remaining());
                buf.put_slice(&self.read_buf[..n]);
                self.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => self.read_buf.extend_from_slice(&data),
                Some(Ok(Message::Text(data))) => self.read_buf.extend_from_slice(data.as_bytes()),
                // Control frames carry no tunnel payload.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Err(error)) => return Poll::Ready(Err(io::Error::other(error))),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WebSocketRw<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(io::Error::other)?;
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}

#[cfg(test)]
mod websocket_rw_tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};
    use tokio_tungstenite::{WebSocketStream, tungstenite::protocol::Role};

    use super::{WebSocketRw, websocket_config};

    #[tokio::test]
    async fn bytes_round_trip_across_roles() {
        let (client_io, server_io) = duplex(64 * 1024);
        let client =
            WebSocketStream::from_raw_socket(client_io, Role::Client, Some(websocket_config()))
                .await;
        let server =
            WebSocketStream::from_raw_socket(server_io, Role::Server, Some(websocket_config()))
                .await;
        let mut client = WebSocketRw::new(client);
        let mut server = WebSocketRw::new(server);

        let payload = vec![42u8; 70_000];
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.flush().await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        server.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);

        // Partial reads drain the buffered message across calls.
        let mut client = writer.await.unwrap();
        client.write_all(b"abcdef").await.unwrap();
        client.flush().await.unwrap();
        let mut half = [0u8; 3];
        server.read_exact(&mut half).await.unwrap();
        assert_eq!(&half, b"abc");
        server.read_exact(&mut half).await.unwrap();
        assert_eq!(&half, b"def");
    }
}
