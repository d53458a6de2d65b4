use std::time::Duration;

use constellation_comm::codec::TableCodec;
use constellation_comm::error::Error;
use constellation_comm::transport::tcp::{parse_address, TcpTransport};
use constellation_comm::transport::Transport;
use constellation_comm::wire::keys;
use constellation_comm::{Comm, Communicator, Direction, TcpBackend, Value};
use tokio::io::AsyncWriteExt;

fn init() {
    constellation_core::logging::try_init().unwrap();
}

/// Listening transport on an ephemeral port, already open
async fn listener() -> (TcpTransport, std::net::SocketAddr) {
    let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    transport.open().await.unwrap();
    let addr = parse_address(&transport.address()).unwrap();
    (transport, addr)
}

#[tokio::test]
async fn tcp_send_receive_single_message() {
    init();
    let (server, addr) = listener().await;

    tokio::spawn(async move {
        let received = server.recv_bytes().await.unwrap();
        server.send_bytes(&received).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = TcpTransport::connect(addr).await.unwrap();
    client.open().await.unwrap();
    client.send_bytes(b"hello world").await.unwrap();
    let response = client.recv_bytes().await.unwrap();

    assert_eq!(response, b"hello world");
}

#[tokio::test]
async fn tcp_multiple_messages_preserve_boundaries() {
    init();
    let (server, addr) = listener().await;

    tokio::spawn(async move {
        for _ in 0..3 {
            let msg = server.recv_bytes().await.unwrap();
            server.send_bytes(&msg).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    });

    let client = TcpTransport::connect(addr).await.unwrap();
    client.open().await.unwrap();
    let messages = vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()];

    for msg in &messages {
        client.send_bytes(msg).await.unwrap();
        let response = client.recv_bytes().await.unwrap();
        assert_eq!(&response, msg);
    }
}

#[tokio::test]
async fn tcp_rejects_oversized_outgoing_frame() {
    init();
    let (_server, addr) = listener().await;
    let client = TcpTransport::builder()
        .address(addr)
        .max_msg_size(8)
        .build()
        .await
        .unwrap();
    client.open().await.unwrap();

    match client.send_bytes(&[0u8; 9]).await {
        Err(Error::InvalidFrame(msg)) => assert!(msg.contains("too large")),
        other => panic!("Expected InvalidFrame error, got {:?}", other),
    }
    assert!(matches!(client.try_send_bytes(&[0u8; 9]), Err(Error::InvalidFrame(_))));
}

#[tokio::test]
async fn tcp_oversized_incoming_frame_ends_the_stream() {
    init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // Frame header claiming 200MB, over the 100MB limit
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        stream.write_u32(200 * 1024 * 1024).await.unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
    });

    let client = TcpTransport::connect(addr).await.unwrap();
    client.open().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), client.recv_bytes())
        .await
        .unwrap();
    assert!(matches!(result, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn connection_closed_error() {
    init();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);
    });

    let client = TcpTransport::connect(addr).await.unwrap();
    client.open().await.unwrap();

    match tokio::time::timeout(Duration::from_secs(1), client.recv_bytes())
        .await
        .unwrap()
    {
        Err(Error::ConnectionClosed) => {}
        other => panic!("Expected ConnectionClosed, got {:?}", other),
    }
}

#[tokio::test]
async fn closed_transport_refuses_io() {
    init();
    let (server, _addr) = listener().await;
    server.close().await.unwrap();
    assert!(!server.is_open());
    assert!(matches!(server.send_bytes(b"x").await, Err(Error::Closed)));
    assert!(matches!(server.try_recv_bytes(), Err(Error::Closed)));
}

#[tokio::test]
async fn comm_over_tcp_negotiates_codec() {
    init();
    let backend = TcpBackend::new();
    let recv = Comm::builder("tcp", Direction::Recv)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    assert!(recv.address().starts_with("tcp://127.0.0.1:"));
    let send = Comm::builder("tcp", Direction::Send)
        .backend(backend)
        .address(recv.address())
        .codec(TableCodec::new("%d\t%f\n", &["step", "dt"]).unwrap())
        .build()
        .await
        .unwrap();

    let row = Value::List(vec![Value::Int(3), Value::Float(0.5)]);
    assert!(send.send(&row).await);

    let msg = recv.recv_message(Some(Duration::from_secs(5))).await;
    assert!(msg.is_success());
    assert_eq!(msg.value, row);
    assert_eq!(msg.header.get(keys::SERITYPE), Some("table"));

    let idle = recv.recv_message(Some(Duration::from_millis(100))).await;
    assert!(idle.is_empty());
}

#[tokio::test]
async fn comm_over_tcp_splits_large_messages() {
    init();
    let backend = TcpBackend::new();
    let recv = Comm::builder("big", Direction::Recv)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let send = Comm::builder("big", Direction::Send)
        .backend(backend)
        .address(recv.address())
        .max_msg_size(1024)
        .build()
        .await
        .unwrap();

    let payload = Value::Bytes((0..3 * 1024).map(|i| (i % 251) as u8).collect());
    assert!(send.send(&payload).await);
    assert_eq!(send.n_work_channels(), 1);

    let (ok, value) = recv.recv(Some(Duration::from_secs(5))).await;
    assert!(ok);
    assert_eq!(value, payload);
}
