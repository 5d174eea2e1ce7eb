//! Rendezvous end-to-end tests

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use repeater_e2e::peers::{
    connect_client, connect_server, expect_eof, pad_block, read_with_timeout,
};
use repeater_e2e::TestRelay;

/// Initialize tracing for tests
fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("repeater_server=debug,repeater_e2e=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn happy_path_rendezvous_is_byte_transparent() {
    init_test();

    let relay = TestRelay::start().await;
    let block_len = relay.config.block_len;

    // Server parks first, gets no response.
    let mut server = connect_server(relay.server_addr, "abcd", block_len)
        .await
        .expect("server should connect");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Viewer arrives, receives the banner, and pairs.
    let mut client = connect_client(relay.client_addr, "abcd", block_len)
        .await
        .expect("client should connect");

    client.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), server.read_exact(&mut buf))
        .await
        .expect("server read timed out")
        .unwrap();
    assert_eq!(&buf, b"hello");

    server.write_all(b"world").await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("client read timed out")
        .unwrap();
    assert_eq!(&buf, b"world");

    // Viewer closes; server sees EOF.
    drop(client);
    expect_eof(&mut server, Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn client_can_park_before_the_server_arrives() {
    init_test();

    let relay = TestRelay::start().await;
    let block_len = relay.config.block_len;

    let mut client = connect_client(relay.client_addr, "swap", block_len)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut server = connect_server(relay.server_addr, "swap", block_len)
        .await
        .unwrap();

    server.write_all(b"fb-update").await.unwrap();
    let mut buf = [0u8; 9];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
        .await
        .expect("client read timed out")
        .unwrap();
    assert_eq!(&buf, b"fb-update");
}

#[tokio::test]
async fn refuse_mode_closes_the_second_server() {
    init_test();

    let relay = TestRelay::start_with(|config| config.refuse = true).await;
    let block_len = relay.config.block_len;

    let mut first = connect_server(relay.server_addr, "x", block_len).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = connect_server(relay.server_addr, "x", block_len).await.unwrap();
    expect_eof(&mut second, Duration::from_secs(5)).await.unwrap();

    // The incumbent still pairs with a later viewer.
    let mut client = connect_client(relay.client_addr, "x", block_len).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), first.read_exact(&mut buf))
        .await
        .expect("first server read timed out")
        .unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn replace_mode_closes_the_first_server() {
    init_test();

    let relay = TestRelay::start_with(|config| config.refuse = false).await;
    let block_len = relay.config.block_len;

    let mut first = connect_server(relay.server_addr, "x", block_len).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut second = connect_server(relay.server_addr, "x", block_len).await.unwrap();
    expect_eof(&mut first, Duration::from_secs(5)).await.unwrap();

    // The replacement pairs with a later viewer.
    let mut client = connect_client(relay.client_addr, "x", block_len).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tokio::time::timeout(Duration::from_secs(5), second.read_exact(&mut buf))
        .await
        .expect("second server read timed out")
        .unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn server_greeting_without_id_is_closed() {
    init_test();

    let relay = TestRelay::start().await;
    let block_len = relay.config.block_len;

    let mut stream = TcpStream::connect(relay.server_addr).await.unwrap();
    stream
        .write_all(&pad_block(b"127.0.0.1:5900", block_len))
        .await
        .unwrap();

    expect_eof(&mut stream, Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn short_greeting_is_closed() {
    init_test();

    let relay = TestRelay::start().await;

    let mut stream = TcpStream::connect(relay.server_addr).await.unwrap();
    stream.write_all(b"ID:trunc").await.unwrap();
    stream.shutdown().await.unwrap();

    expect_eof(&mut stream, Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn silent_connection_is_closed_at_the_deadline() {
    init_test();

    let relay =
        TestRelay::start_with(|config| config.init_timeout = Duration::from_millis(300)).await;

    let mut stream = TcpStream::connect(relay.server_addr).await.unwrap();
    expect_eof(&mut stream, Duration::from_secs(5)).await.unwrap();
}

#[tokio::test]
async fn banner_can_be_suppressed() {
    init_test();

    let relay = TestRelay::start_with(|config| config.send_banner = false).await;
    let block_len = relay.config.block_len;

    let mut client = TcpStream::connect(relay.client_addr).await.unwrap();
    let mut buf = [0u8; 1];
    let silent = read_with_timeout(&mut client, &mut buf, Duration::from_millis(200)).await;
    assert!(silent.is_err(), "no banner bytes should arrive");

    // Rendezvous still works without the banner.
    client
        .write_all(&pad_block(b"ID:quiet", block_len))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut server = connect_server(relay.server_addr, "quiet", block_len).await.unwrap();

    client.write_all(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    tokio::time::timeout(Duration::from_secs(5), server.read_exact(&mut buf))
        .await
        .expect("server read timed out")
        .unwrap();
    assert_eq!(&buf, b"hi");
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stale_server_is_swept_and_the_id_reusable() {
    init_test();

    let relay = TestRelay::start_with(|config| {
        config.clean = true;
        config.sweep_interval = Duration::from_millis(200);
    })
    .await;
    let block_len = relay.config.block_len;

    let server = connect_server(relay.server_addr, "y", block_len).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Server silently goes away; the sweep evicts it.
    drop(server);
    tokio::time::sleep(Duration::from_millis(600)).await;

    // A viewer for the same id parks instead of pairing with a dead socket.
    let mut client = connect_client(relay.client_addr, "y", block_len).await.unwrap();
    let mut buf = [0u8; 1];
    let parked = read_with_timeout(&mut client, &mut buf, Duration::from_millis(300)).await;
    assert!(parked.is_err(), "viewer should stay parked, not paired");

    // A fresh server completes the rendezvous.
    let mut server = connect_server(relay.server_addr, "y", block_len).await.unwrap();
    client.write_all(b"again").await.unwrap();
    let mut buf = [0u8; 5];
    tokio::time::timeout(Duration::from_secs(5), server.read_exact(&mut buf))
        .await
        .expect("server read timed out")
        .unwrap();
    assert_eq!(&buf, b"again");
}

#[tokio::test]
async fn shutdown_closes_parked_connections() {
    init_test();

    let mut relay = TestRelay::start().await;
    let block_len = relay.config.block_len;

    let mut server = connect_server(relay.server_addr, "bye", block_len).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    relay.shutdown();
    expect_eof(&mut server, Duration::from_secs(5)).await.unwrap();
}
