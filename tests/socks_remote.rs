use std::{sync::Arc, time::Duration};

use burrow::{Client, Server};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

mod common;

/// This test ensures that a SOCKS remote tunnels SOCKS5 CONNECT requests to
/// the server side.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn socks_remote_connects_through_the_server() {
    // 1. Echo service reachable from the server side.
    let echo = TcpListener::bind("127.0.0.1:24721").await.unwrap();
    let target = echo.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = echo.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                        return;
                    }
                }
            });
        }
    });

    // 2. Server with SOCKS5 enabled, client with a socks remote.
    let cancel = CancellationToken::new();
    let server = Server::new(common::server_args(&[
        "--host=127.0.0.1",
        "--port=24720",
        "--socks5",
    ]))
    .await
    .unwrap();
    let server_cancel = cancel.clone();
    tokio::spawn(async move { server.run(server_cancel).await });
    common::wait_for_port("127.0.0.1:24720").await;

    let client = Arc::new(
        Client::new(common::client_args(&[
            "http://127.0.0.1:24720",
            "127.0.0.1:24722:socks",
        ]))
        .await
        .unwrap(),
    );
    let client_cancel = cancel.clone();
    let client_clone = Arc::clone(&client);
    tokio::spawn(async move { client_clone.run(client_cancel).await });
    common::wait_for_port("127.0.0.1:24722").await;

    // 3. Speak SOCKS5 through the tunneled listener.
    let mut stream = TcpStream::connect("127.0.0.1:24722").await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    timeout(Duration::from_secs(5), stream.read_exact(&mut choice))
        .await
        .expect("timeout during method negotiation")
        .unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    let ip = match target.ip() {
        std::net::IpAddr::V4(ip) => ip.octets(),
        _ => unreachable!(),
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&ip);
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();
    let mut response = [0u8; 10];
    timeout(Duration::from_secs(5), stream.read_exact(&mut response))
        .await
        .expect("timeout waiting for the CONNECT reply")
        .unwrap();
    assert_eq!(response[1], 0x00, "expected a success reply");

    stream.write_all(b"through socks").await.unwrap();
    let mut buf = [0u8; 13];
    timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("timeout waiting for the echo")
        .unwrap();
    assert_eq!(&buf, b"through socks");

    cancel.cancel();
}
