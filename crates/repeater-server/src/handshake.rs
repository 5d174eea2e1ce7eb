//! Reads and classifies the greeting block on a freshly accepted socket.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use repeater_protocol::{classify, GreetingError, Intent, Role, RFB_BANNER};

/// Knobs the handshake reader needs from the relay configuration.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeSettings {
    pub block_len: usize,
    pub send_banner: bool,
    pub deadline: Duration,
}

/// A connection that completed its greeting exchange.
#[derive(Debug)]
pub struct HandshakeEvent {
    pub role: Role,
    pub intent: Intent,
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("failed to send banner: {0}")]
    Banner(std::io::Error),
    #[error("no greeting block within the deadline")]
    Timeout,
    #[error("connection closed before a full greeting block arrived")]
    ShortBlock,
    #[error("greeting read failed: {0}")]
    Io(std::io::Error),
    #[error(transparent)]
    Greeting(#[from] GreetingError),
}

/// Run the greeting exchange on an accepted socket.
///
/// Viewers are first sent the RFB banner (unless suppressed), then a full
/// greeting block is read under the deadline. Any failure consumes the
/// stream; dropping it closes the socket.
pub async fn read_greeting(
    mut stream: TcpStream,
    role: Role,
    peer_addr: SocketAddr,
    settings: HandshakeSettings,
) -> Result<HandshakeEvent, HandshakeError> {
    if role == Role::Client && settings.send_banner {
        stream
            .write_all(RFB_BANNER)
            .await
            .map_err(HandshakeError::Banner)?;
    }

    let mut block = vec![0u8; settings.block_len];
    match timeout(settings.deadline, stream.read_exact(&mut block)).await {
        Err(_) => return Err(HandshakeError::Timeout),
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(HandshakeError::ShortBlock)
        }
        Ok(Err(e)) => return Err(HandshakeError::Io(e)),
        Ok(Ok(_)) => {}
    }

    let intent = classify(role, &block)?;
    Ok(HandshakeEvent {
        role,
        intent,
        stream,
        peer_addr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const TEST_SETTINGS: HandshakeSettings = HandshakeSettings {
        block_len: 32,
        send_banner: true,
        deadline: Duration::from_millis(500),
    };

    async fn accepted_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let outbound = TcpStream::connect(addr).await.unwrap();
        let (inbound, peer_addr) = listener.accept().await.unwrap();
        (inbound, outbound, peer_addr)
    }

    fn padded(payload: &[u8]) -> Vec<u8> {
        let mut block = payload.to_vec();
        block.resize(TEST_SETTINGS.block_len, 0);
        block
    }

    #[tokio::test]
    async fn viewer_gets_banner_then_id_is_read() {
        let (inbound, mut outbound, peer_addr) = accepted_pair().await;

        let reader = tokio::spawn(read_greeting(inbound, Role::Client, peer_addr, TEST_SETTINGS));

        let mut banner = [0u8; 12];
        outbound.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, RFB_BANNER);

        outbound.write_all(&padded(b"ID:pair1")).await.unwrap();
        let event = reader.await.unwrap().unwrap();
        assert_eq!(
            event.intent,
            Intent::Rendezvous {
                id: "pair1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn banner_can_be_suppressed() {
        let (inbound, mut outbound, peer_addr) = accepted_pair().await;
        let settings = HandshakeSettings {
            send_banner: false,
            ..TEST_SETTINGS
        };

        let reader = tokio::spawn(read_greeting(inbound, Role::Client, peer_addr, settings));
        outbound.write_all(&padded(b"ID:quiet")).await.unwrap();
        let event = reader.await.unwrap().unwrap();

        // Nothing was written back to the peer before the block was read.
        assert_eq!(
            event.intent,
            Intent::Rendezvous {
                id: "quiet".to_string()
            }
        );
        let mut probe = [0u8; 1];
        let pending = timeout(Duration::from_millis(100), outbound.read(&mut probe)).await;
        assert!(pending.is_err(), "no banner bytes should be pending");
    }

    #[tokio::test]
    async fn silence_times_out() {
        let (inbound, _outbound, peer_addr) = accepted_pair().await;
        let err = read_greeting(inbound, Role::Server, peer_addr, TEST_SETTINGS)
            .await
            .unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout));
    }

    #[tokio::test]
    async fn short_block_is_rejected() {
        let (inbound, mut outbound, peer_addr) = accepted_pair().await;

        let reader = tokio::spawn(read_greeting(inbound, Role::Server, peer_addr, TEST_SETTINGS));
        outbound.write_all(b"ID:trunc").await.unwrap();
        drop(outbound);

        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(err, HandshakeError::ShortBlock));
    }

    #[tokio::test]
    async fn server_greeting_without_id_is_malformed() {
        let (inbound, mut outbound, peer_addr) = accepted_pair().await;

        let reader = tokio::spawn(read_greeting(inbound, Role::Server, peer_addr, TEST_SETTINGS));
        outbound.write_all(&padded(b"10.0.0.1:5900")).await.unwrap();

        let err = reader.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            HandshakeError::Greeting(GreetingError::MissingId)
        ));
    }
}
