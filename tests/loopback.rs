//! 실제 UDP 루프백 위에서의 전체 흐름 테스트

use std::time::Duration;

use microtcp::{Config, Connection, ConnectionState, RecvOutcome};

fn config() -> Config {
    Config {
        handshake_timeout_ms: 500,
        time_wait_ms: 1_000,
        ..Config::loopback()
    }
}

#[tokio::test]
async fn test_loopback_transfer_and_teardown() {
    let mut server = Connection::bind("127.0.0.1:0", config()).await.unwrap();
    let mut client = Connection::bind("127.0.0.1:0", config()).await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();

    let sender = async {
        client.connect(server_addr).await.unwrap();
        assert_eq!(client.send(&payload).await.unwrap(), payload.len());
        client.close().await.unwrap();
        client
    };

    let receiver = async {
        server.accept().await.unwrap();
        let mut received = Vec::new();
        let mut buf = vec![0u8; 4096];
        loop {
            match server.receive(&mut buf).await.unwrap() {
                RecvOutcome::Delivered(n) => received.extend_from_slice(&buf[..n]),
                RecvOutcome::EndOfStream => break,
            }
        }
        server.close().await.unwrap();
        (server, received)
    };

    let (client, (server, received)) = tokio::time::timeout(
        Duration::from_secs(20),
        async { tokio::join!(sender, receiver) },
    )
    .await
    .unwrap();

    assert_eq!(received, payload);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert_eq!(server.state(), ConnectionState::Closed);
    assert!(client.is_released());
    assert!(server.is_released());
    assert_eq!(client.stats().bytes_acked, payload.len() as u64);
    assert_eq!(server.stats().bytes_delivered, payload.len() as u64);
}

#[tokio::test]
async fn test_loopback_handshake_sequence_numbers() {
    let mut server = Connection::bind("127.0.0.1:0", config()).await.unwrap();
    let mut client = Connection::bind("127.0.0.1:0", config()).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let client_addr = client.local_addr().unwrap();

    let (connected, accepted) = tokio::join!(client.connect(server_addr), server.accept());
    connected.unwrap();
    assert_eq!(accepted.unwrap(), client_addr);

    assert_eq!(client.state(), ConnectionState::Established);
    assert_eq!(server.state(), ConnectionState::Established);
    assert_eq!(client.local_seq(), server.local_ack());
    assert_eq!(server.local_seq(), client.local_ack());
    assert_eq!(client.peer_addr(), Some(server_addr));
}

#[tokio::test]
async fn test_loopback_connect_without_listener_times_out() {
    // 아무도 응답하지 않는 주소: 바인드만 하고 읽지 않는다
    let silent = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = silent.local_addr().unwrap();

    let cfg = Config {
        handshake_timeout_ms: 50,
        handshake_attempts: 2,
        ..Config::loopback()
    };
    let mut client = Connection::bind("127.0.0.1:0", cfg).await.unwrap();

    let err = client.connect(target).await.unwrap_err();
    assert!(matches!(err, microtcp::Error::Timeout { .. }));
    assert_eq!(client.state(), ConnectionState::Invalid);
    assert!(client.is_released());
}
