use std::time::Duration;

use constellation_comm::{
    BufferBackend, Comm, Communicator, Connection, ConnectionState, Direction, DriverConfig, Error,
    Value,
};

fn init() {
    constellation_core::logging::try_init().unwrap();
}

/// Upstream sender, connection input, connection output, downstream receiver
async fn chain() -> (Comm, Comm, Comm, Comm) {
    let backend = BufferBackend::new();
    let input = Comm::builder("model_a", Direction::Recv)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let upstream = Comm::builder("model_a", Direction::Send)
        .backend(backend.clone())
        .address(input.address())
        .build()
        .await
        .unwrap();
    let downstream = Comm::builder("model_b", Direction::Recv)
        .backend(backend.clone())
        .close_on_eof_recv(false)
        .build()
        .await
        .unwrap();
    let output = Comm::builder("model_b", Direction::Send)
        .backend(backend)
        .address(downstream.address())
        .build()
        .await
        .unwrap();
    (upstream, input, output, downstream)
}

fn scale(value: Value) -> constellation_comm::Result<Option<Value>> {
    match value {
        Value::Int(n) => Ok(Some(Value::Int(n * 10))),
        other => Err(Error::Custom(format!("cannot scale {}", other.kind()))),
    }
}

fn drop_twenty(value: Value) -> constellation_comm::Result<Option<Value>> {
    Ok((value != Value::Int(20)).then_some(value))
}

#[tokio::test]
async fn eof_is_forwarded_exactly_once() {
    init();
    let (upstream, input, output, downstream) = chain().await;
    let handle = Connection::new("a_to_b", Box::new(input), Box::new(output))
        .unwrap()
        .with_translator(scale)
        .with_translator(drop_twenty)
        .spawn();

    for i in 1..=3 {
        assert!(upstream.send(&Value::Int(i)).await);
    }
    assert!(upstream.send_eof().await);

    for expected in [10, 30] {
        let (ok, value) = downstream.recv(Some(Duration::from_secs(2))).await;
        assert!(ok);
        assert_eq!(value, Value::Int(expected));
    }
    assert!(downstream.recv_message(Some(Duration::from_secs(2))).await.is_eof());

    let connection = handle.join().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.close_reason().as_deref(), Some("EOF received"));
    assert_eq!(connection.n_recv(), 3);
    assert_eq!(connection.n_proc(), 2);
    assert_eq!(connection.n_skip(), 1);
    assert_eq!(connection.n_sent(), 2);

    // No second EOF behind the first
    let after = downstream.recv_message(Some(Duration::from_millis(50))).await;
    assert!(after.is_empty());
}

#[tokio::test]
async fn graceful_stop_delivers_pending_messages() {
    init();
    let (upstream, input, output, downstream) = chain().await;
    let config = DriverConfig {
        drain_timeout: Duration::from_secs(5),
        ..DriverConfig::default()
    };
    let handle = Connection::new("a_to_b", Box::new(input), Box::new(output))
        .unwrap()
        .with_config(config)
        .spawn();

    for i in 0..5 {
        assert!(upstream.send(&Value::Int(i)).await);
    }
    handle.stop();

    for i in 0..5 {
        let (ok, value) = downstream.recv(Some(Duration::from_secs(2))).await;
        assert!(ok);
        assert_eq!(value, Value::Int(i));
    }

    let connection = handle.join().await.unwrap();
    assert_eq!(connection.close_reason().as_deref(), Some("stopped"));
    assert_eq!(connection.n_sent(), 5);
    assert!(connection.input().is_closed());
    assert!(connection.output().is_closed());
}

#[tokio::test]
async fn headers_survive_the_hop() {
    init();
    let (upstream, input, output, downstream) = chain().await;
    let handle = Connection::new("a_to_b", Box::new(input), Box::new(output))
        .unwrap()
        .spawn();

    let header = constellation_comm::Header::new().with("step", "7");
    assert!(upstream.send_message(&Value::from("payload"), &header).await);
    let msg = downstream.recv_message(Some(Duration::from_secs(2))).await;
    assert_eq!(msg.value, Value::from("payload"));
    assert_eq!(msg.header.get("step"), Some("7"));

    handle.stop();
    handle.join().await.unwrap();
}
