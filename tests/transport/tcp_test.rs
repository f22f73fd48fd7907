// TCP Transport Tests
// Real sockets on the loopback interface

use async_trait::async_trait;
use gossipmesh::identity::NodeId;
use gossipmesh::protocol::{Envelope, Rejection, Reply};
use gossipmesh::transport::{
    Connection, InboundHandler, TcpTransport, TcpTransportConfig, Transport, TransportConfig,
    TransportError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Answers with the sender so tests can tell calls apart
struct Echo;

#[async_trait]
impl InboundHandler for Echo {
    async fn handle(&self, envelope: Envelope) -> Reply {
        Reply::Peers(vec![envelope.sender().clone()])
    }
}

/// Never answers within any sane timeout
struct Stall;

#[async_trait]
impl InboundHandler for Stall {
    async fn handle(&self, _envelope: Envelope) -> Reply {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Reply::Ack
    }
}

fn free_local_id() -> NodeId {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    NodeId::from(socket.local_addr().unwrap())
}

fn node(port: u16) -> NodeId {
    NodeId::parse(&format!("127.0.0.1:{}", port)).unwrap()
}

async fn read_reply(stream: &mut TcpStream) -> Reply {
    let len = stream.read_u32().await.unwrap() as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    Reply::from_bytes(&buf).unwrap()
}

// ============================================================================
// CONFIG
// ============================================================================

#[test]
fn test_tcp_config_default() {
    let config = TcpTransportConfig::default();

    assert!(config.nodelay);
    assert!(config.base.validate().is_ok());
}

#[test]
fn test_tcp_config_builders() {
    let config = TcpTransportConfig::new()
        .with_nodelay(false)
        .with_base_config(TransportConfig::new().with_message_timeout(Duration::from_secs(1)));

    assert!(!config.nodelay);
    assert_eq!(config.base.message_timeout, Duration::from_secs(1));
}

#[test]
fn test_invalid_base_config() {
    let config = TransportConfig::new().with_max_frame_size(0);
    assert!(matches!(config.validate(), Err(TransportError::InvalidConfig(_))));
}

// ============================================================================
// REQUEST / REPLY
// ============================================================================

#[tokio::test]
async fn test_send_and_receive_reply() {
    let transport = TcpTransport::default();
    let id = free_local_id();
    let listener = transport.listen(&id, Arc::new(Echo)).await.unwrap();
    assert_eq!(listener.local_id(), &id);
    assert!(listener.is_running());

    let connection = transport.dial(&id).await.unwrap();
    for port in 1..=3 {
        let reply = connection
            .send(&Envelope::peer_request("t", node(port), 1))
            .await
            .unwrap();
        assert_eq!(reply, Reply::Peers(vec![node(port)]));
    }

    connection.close();
    listener.shutdown().await;
}

#[tokio::test]
async fn test_data_payload_crosses_the_wire() {
    struct Payload;

    #[async_trait]
    impl InboundHandler for Payload {
        async fn handle(&self, envelope: Envelope) -> Reply {
            match envelope.hash() {
                Some(_) => Reply::Ack,
                None => Reply::Rejected(Rejection::Malformed),
            }
        }
    }

    let transport = TcpTransport::default();
    let id = free_local_id();
    let _listener = transport.listen(&id, Arc::new(Payload)).await.unwrap();
    let connection = transport.dial(&id).await.unwrap();

    let env = Envelope::data("t", node(1), 42, vec![7u8; 64 * 1024]);
    assert_eq!(connection.send(&env).await.unwrap(), Reply::Ack);
}

#[tokio::test]
async fn test_closed_connection_refuses_send() {
    let transport = TcpTransport::default();
    let id = free_local_id();
    let _listener = transport.listen(&id, Arc::new(Echo)).await.unwrap();
    let connection = transport.dial(&id).await.unwrap();

    connection.close();

    assert!(connection.is_closed());
    let result = connection.send(&Envelope::peer_request("t", node(1), 1)).await;
    assert!(matches!(result, Err(TransportError::Closed)));
}

#[tokio::test]
async fn test_message_timeout_poisons_connection() {
    let config = TcpTransportConfig::new()
        .with_base_config(TransportConfig::new().with_message_timeout(Duration::from_millis(100)));
    let transport = TcpTransport::new(config);
    let id = free_local_id();
    let _listener = transport.listen(&id, Arc::new(Stall)).await.unwrap();
    let connection = transport.dial(&id).await.unwrap();

    let result = connection.send(&Envelope::peer_request("t", node(1), 1)).await;

    assert!(matches!(result, Err(TransportError::Timeout)));
    assert!(connection.is_closed());
}

// ============================================================================
// FAILURES
// ============================================================================

#[tokio::test]
async fn test_dial_refused() {
    let id = free_local_id();
    let result = TcpTransport::default().dial(&id).await;

    let err = result.err().unwrap();
    assert!(err.is_connection_error());
}

#[tokio::test]
async fn test_bind_in_use_fails() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let id = NodeId::from(occupied.local_addr().unwrap());

    let result = TcpTransport::default().listen(&id, Arc::new(Echo)).await;
    assert!(matches!(result, Err(TransportError::BindFailed(_))));
}

#[tokio::test]
async fn test_malformed_frame_keeps_stream_alive() {
    let transport = TcpTransport::default();
    let id = free_local_id();
    let _listener = transport.listen(&id, Arc::new(Echo)).await.unwrap();

    let mut stream = TcpStream::connect(id.to_socket_addr().unwrap()).await.unwrap();

    let garbage = [0xffu8; 5];
    stream.write_u32(garbage.len() as u32).await.unwrap();
    stream.write_all(&garbage).await.unwrap();
    assert_eq!(
        read_reply(&mut stream).await,
        Reply::Rejected(Rejection::Malformed)
    );

    // Same stream still serves well-formed envelopes
    let request = Envelope::peer_request("t", node(9), 1).to_bytes().unwrap();
    stream.write_u32(request.len() as u32).await.unwrap();
    stream.write_all(&request).await.unwrap();
    assert_eq!(read_reply(&mut stream).await, Reply::Peers(vec![node(9)]));
}

#[tokio::test]
async fn test_oversized_frame_closes_stream() {
    let transport = TcpTransport::default();
    let id = free_local_id();
    let _listener = transport.listen(&id, Arc::new(Echo)).await.unwrap();

    let mut stream = TcpStream::connect(id.to_socket_addr().unwrap()).await.unwrap();
    stream.write_u32(u32::MAX).await.unwrap();

    assert_eq!(
        read_reply(&mut stream).await,
        Reply::Rejected(Rejection::Malformed)
    );
    let mut rest = Vec::new();
    let read = stream.read_to_end(&mut rest).await.unwrap_or(0);
    assert_eq!(read, 0);
}
