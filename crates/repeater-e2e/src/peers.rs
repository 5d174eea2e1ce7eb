//! Scriptable viewer and server peers speaking the repeater greeting.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use repeater_protocol::RFB_BANNER;

const BANNER_DEADLINE: Duration = Duration::from_secs(5);

/// Pad a greeting payload with NULs to the relay's block size.
pub fn pad_block(payload: &[u8], block_len: usize) -> Vec<u8> {
    assert!(
        payload.len() <= block_len,
        "payload longer than greeting block"
    );
    let mut block = payload.to_vec();
    block.resize(block_len, 0);
    block
}

/// Connect to the server port and announce an id.
pub async fn connect_server(addr: SocketAddr, id: &str, block_len: usize) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)
        .await
        .context("connecting to server port")?;
    stream
        .write_all(&pad_block(format!("ID:{id}").as_bytes(), block_len))
        .await
        .context("sending server greeting")?;
    Ok(stream)
}

/// Connect to the viewer port, consume the banner, and announce an id.
pub async fn connect_client(addr: SocketAddr, id: &str, block_len: usize) -> Result<TcpStream> {
    let mut stream = connect_client_banner(addr).await?;
    stream
        .write_all(&pad_block(format!("ID:{id}").as_bytes(), block_len))
        .await
        .context("sending viewer greeting")?;
    Ok(stream)
}

/// Connect to the viewer port, consume the banner, and name a direct target.
pub async fn connect_client_direct(
    addr: SocketAddr,
    target: &str,
    block_len: usize,
) -> Result<TcpStream> {
    let mut stream = connect_client_banner(addr).await?;
    stream
        .write_all(&pad_block(target.as_bytes(), block_len))
        .await
        .context("sending direct-dial greeting")?;
    Ok(stream)
}

/// Connect to the viewer port and verify the RFB banner.
pub async fn connect_client_banner(addr: SocketAddr) -> Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)
        .await
        .context("connecting to viewer port")?;
    let mut banner = [0u8; RFB_BANNER.len()];
    tokio::time::timeout(BANNER_DEADLINE, stream.read_exact(&mut banner))
        .await
        .context("waiting for banner")?
        .context("reading banner")?;
    ensure!(&banner == RFB_BANNER, "unexpected banner: {banner:?}");
    Ok(stream)
}

/// Read with a timeout, failing on timeout or error.
pub async fn read_with_timeout(
    stream: &mut TcpStream,
    buf: &mut [u8],
    timeout: Duration,
) -> Result<usize, String> {
    match tokio::time::timeout(timeout, stream.read(buf)).await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(format!("Read error: {}", e)),
        Err(_) => Err("Read timeout".to_string()),
    }
}

/// Assert the far side closed the connection within the deadline.
pub async fn expect_eof(stream: &mut TcpStream, within: Duration) -> Result<()> {
    let mut buf = [0u8; 64];
    loop {
        let n = tokio::time::timeout(within, stream.read(&mut buf))
            .await
            .context("expected EOF, read timed out")?
            .context("expected EOF, got error")?;
        if n == 0 {
            return Ok(());
        }
        // Drain any bytes still in flight before the close.
    }
}
