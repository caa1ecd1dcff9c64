
use std::net::SocketAddr;
use std::time::Duration;

use harness::{spawn_relay, tuple_to, DrainThenReplyBackend, TcpEchoBackend};
use rand::RngCore;
use relayd::config::RelayTuple;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn echo_relay_with_half_close() {
    let backend = DrainThenReplyBackend::spawn(b"WORLD\n".to_vec()).await.unwrap();
    let relay = spawn_relay(vec![tuple_to(backend.addr)], 1).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(relay.addr(0)).await.unwrap();
        stream.write_all(b"HELLO\n").await.unwrap();
        stream.shutdown().await.unwrap();

        // The peer still answers after our half-close, then we see EOF.
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"WORLD\n");
    })
    .await
    .expect("half-close roundtrip timed out");

    assert_eq!(&*backend.received.lock().await, b"HELLO\n");
}

#[tokio::test]
async fn sequential_writes_arrive_concatenated_in_order() {
    let backend = DrainThenReplyBackend::spawn(Vec::new()).await.unwrap();
    let relay = spawn_relay(vec![tuple_to(backend.addr)], 1).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(relay.addr(0)).await.unwrap();
        stream.write_all(b"first-").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream.write_all(b"second").await.unwrap();
        stream.shutdown().await.unwrap();

        let mut end = Vec::new();
        stream.read_to_end(&mut end).await.unwrap();
        assert!(end.is_empty());
    })
    .await
    .expect("concatenation roundtrip timed out");

    assert_eq!(&*backend.received.lock().await, b"first-second");
}

#[tokio::test]
async fn large_transfer_is_byte_exact_in_both_directions() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let relay = spawn_relay(vec![tuple_to(backend.addr)], 2).await;

    const LEN: usize = 10_000_000;
    let mut payload = vec![0u8; LEN];
    rand::thread_rng().fill_bytes(&mut payload);

    let echoed = timeout(TEST_TIMEOUT, async {
        let stream = TcpStream::connect(relay.addr(0)).await.unwrap();
        let (mut rd, mut wr) = stream.into_split();

        let to_send = payload.clone();
        let writer = tokio::spawn(async move {
            wr.write_all(&to_send).await.unwrap();
            wr.shutdown().await.unwrap();
        });

        let mut echoed = vec![0u8; LEN];
        rd.read_exact(&mut echoed).await.unwrap();

        // Echo backend sees our FIN, closes, and the relay propagates EOF.
        assert_eq!(rd.read(&mut [0u8; 1]).await.unwrap(), 0);
        writer.await.unwrap();
        echoed
    })
    .await
    .expect("large transfer timed out");

    assert_eq!(echoed, payload);
    assert_eq!(backend.bytes_received.load(std::sync::atomic::Ordering::Relaxed), LEN as u64);
}

#[tokio::test]
async fn outbound_connections_bind_the_configured_source() {
    let backend = DrainThenReplyBackend::spawn(b"ok".to_vec()).await.unwrap();

    // Loopback has the whole 127/8; a distinct source ip is observable.
    let src: SocketAddr = "127.0.0.2:0".parse().unwrap();
    let tuple = RelayTuple {
        listen: "127.0.0.1:0".parse().unwrap(),
        src: Some(src),
        dst: backend.addr,
    };
    let relay = spawn_relay(vec![tuple], 1).await;

    timeout(TEST_TIMEOUT, async {
        let mut stream = TcpStream::connect(relay.addr(0)).await.unwrap();
        stream.write_all(b"hi").await.unwrap();
        stream.shutdown().await.unwrap();
        let mut reply = Vec::new();
        stream.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"ok");
    })
    .await
    .expect("source-bind roundtrip timed out");

    let peers = backend.peers.lock().await;
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].ip(), src.ip());
}
