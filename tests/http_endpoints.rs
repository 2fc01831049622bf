use std::time::Duration;

use burrow::{BUILD_VERSION, Server};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

mod common;

async fn http_get(addr: &str, path: &str, extra_headers: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request =
        format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\n{extra_headers}Connection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .expect("timeout reading the response")
        .unwrap();
    response
}

/// This test ensures that the non-tunnel HTTP surface serves the health and
/// version endpoints and a 404 for everything else.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn serves_health_version_and_404() {
    let cancel = CancellationToken::new();
    let server = Server::new(common::server_args(&[
        "--host=127.0.0.1",
        "--port=24680",
    ]))
    .await
    .unwrap();
    let server_cancel = cancel.clone();
    tokio::spawn(async move { server.run(server_cancel).await });
    common::wait_for_port("127.0.0.1:24680").await;

    let health = http_get("127.0.0.1:24680", "/health", "").await;
    assert!(health.starts_with("HTTP/1.1 200"), "got: {health}");
    assert!(health.ends_with("OK\n"), "got: {health}");

    let version = http_get("127.0.0.1:24680", "/version", "").await;
    assert!(version.starts_with("HTTP/1.1 200"), "got: {version}");
    assert!(version.ends_with(BUILD_VERSION), "got: {version}");

    let missing = http_get("127.0.0.1:24680", "/anything-else", "").await;
    assert!(missing.starts_with("HTTP/1.1 404"), "got: {missing}");

    cancel.cancel();
}

/// This test ensures that an upgrade with a mismatched tunnel protocol
/// version is ignored and falls through to plain HTTP handling.
#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn mismatched_protocol_falls_through() {
    let cancel = CancellationToken::new();
    let server = Server::new(common::server_args(&[
        "--host=127.0.0.1",
        "--port=24690",
    ]))
    .await
    .unwrap();
    let server_cancel = cancel.clone();
    tokio::spawn(async move { server.run(server_cancel).await });
    common::wait_for_port("127.0.0.1:24690").await;

    let headers = "Upgrade: websocket\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Protocol: chisel-v99\r\n";
    let response = http_get("127.0.0.1:24690", "/", headers).await;
    assert!(
        response.starts_with("HTTP/1.1 404"),
        "expected a fall-through 404, got: {response}"
    );

    cancel.cancel();
}
