use std::time::{Duration, Instant};

use constellation_comm::codec::TableCodec;
use constellation_comm::{AsyncComm, BufferBackend, Comm, Communicator, Direction, Value};

fn init() {
    constellation_core::logging::try_init().unwrap();
}

async fn pair(backend: &BufferBackend) -> (Comm, Comm) {
    let recv = Comm::builder("backlog", Direction::Recv)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let send = Comm::builder("backlog", Direction::Send)
        .backend(backend.clone())
        .address(recv.address())
        .build()
        .await
        .unwrap();
    (send, recv)
}

#[tokio::test]
async fn every_message_is_counted_once() {
    init();
    let backend = BufferBackend::with_limits(4, 0);
    let (send, recv) = pair(&backend).await;
    let send = AsyncComm::new(send);
    let recv = AsyncComm::new(recv);

    let n = 50;
    for i in 0..n {
        let started = Instant::now();
        assert!(send.send(&Value::Int(i)).await);
        assert!(started.elapsed() < Duration::from_millis(200));
    }
    assert!(send.backlog_len() > 0);

    for i in 0..n {
        let (ok, value) = recv.recv(Some(Duration::from_secs(2))).await;
        assert!(ok);
        assert_eq!(value, Value::Int(i));
    }
    assert!(send.drain_messages(Direction::Send, Duration::from_secs(2)).await);
    assert_eq!(send.n_msg_direct() + send.n_msg_backlog(), n as u64);
    assert!(send.n_msg_backlog() > 0);
}

#[tokio::test]
async fn eof_follows_backlogged_messages() {
    init();
    let backend = BufferBackend::with_limits(1, 0);
    let (send, recv) = pair(&backend).await;
    let send = AsyncComm::new(send);

    for i in 0..3 {
        assert!(send.send(&Value::Int(i)).await);
    }
    assert!(send.send_eof().await);
    assert!(!send.send_eof().await);

    for i in 0..3 {
        let msg = recv.recv_message(Some(Duration::from_secs(1))).await;
        assert_eq!(msg.value, Value::Int(i));
    }
    assert!(recv.recv_message(Some(Duration::from_secs(1))).await.is_eof());
}

#[tokio::test]
async fn wrapped_comm_stays_reachable() {
    init();
    let backend = BufferBackend::new();
    let (send, _recv) = pair(&backend).await;
    let send = AsyncComm::new(send);
    assert!(send.send(&Value::from("x")).await);
    assert_eq!(send.comm().n_sent(), 1);
    assert_eq!(send.n_msg_direct(), 1);

    send.close(false).await;
    assert!(send.is_closed());
    assert!(send.comm().is_closed());
    assert!(!send.send(&Value::from("y")).await);
}

#[tokio::test]
async fn bad_value_in_backlog_is_dropped_not_fatal() {
    init();
    let backend = BufferBackend::with_limits(1, 0);
    let recv = Comm::builder("rows", Direction::Recv)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let send = Comm::builder("rows", Direction::Send)
        .backend(backend)
        .address(recv.address())
        .codec(TableCodec::new("%d\n", &["n"]).unwrap())
        .build()
        .await
        .unwrap();
    let send = AsyncComm::new(send);

    let row = |n: i64| Value::List(vec![Value::Int(n)]);
    assert!(send.send(&row(1)).await);
    assert!(send.send(&row(2)).await);
    // Queued behind row 2, only fails once the task tries to encode it
    assert!(send.send(&Value::Map(vec![])).await);
    assert!(send.send(&row(3)).await);

    for n in 1..=3 {
        let msg = recv.recv_message(Some(Duration::from_secs(2))).await;
        assert!(msg.is_success());
        assert_eq!(msg.value, row(n));
    }
    assert!(send.drain_messages(Direction::Send, Duration::from_secs(2)).await);
    assert_eq!(send.backlog_len(), 0);
    assert!(send.is_open());
    assert!(send.comm().is_open());

    assert!(send.send(&row(4)).await);
    let msg = recv.recv_message(Some(Duration::from_secs(2))).await;
    assert_eq!(msg.value, row(4));
}
