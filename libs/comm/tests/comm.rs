use std::time::Duration;

use constellation_comm::transport::buffer::DEFAULT_CAPACITY;
use constellation_comm::wire::{self, keys, Header};
use constellation_comm::{BufferBackend, Comm, Communicator, Direction, Value};
use constellation_core::Environment;

fn init() {
    constellation_core::logging::try_init().unwrap();
}

async fn pair(backend: &BufferBackend, name: &str) -> (Comm, Comm) {
    let recv = Comm::builder(name, Direction::Recv)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let send = Comm::builder(name, Direction::Send)
        .backend(backend.clone())
        .address(recv.address())
        .build()
        .await
        .unwrap();
    (send, recv)
}

#[test]
fn header_round_trip() {
    let header = Header::new()
        .with(keys::ID, "abc")
        .with(keys::MODEL, "producer")
        .with("custom", "with spaces");
    let body = b"payload bytes";
    let frame = wire::encode(&header, body).unwrap();

    let (parsed, rest) = wire::parse_header(&frame).unwrap();
    assert_eq!(parsed, header);
    assert_eq!(rest, body);
}

#[test]
fn bare_body_passes_through() {
    let body = b"no header here";
    assert_eq!(wire::encode(&Header::new(), body).unwrap(), body.to_vec());
    let (header, rest) = wire::parse_header(body).unwrap();
    assert!(header.is_empty());
    assert_eq!(rest, body);
}

#[tokio::test]
async fn eof_is_sent_once() {
    init();
    let backend = BufferBackend::new();
    let (send, recv) = pair(&backend, "eof").await;

    assert!(send.send_eof().await);
    assert!(!send.send_eof().await);
    assert!(send.eof_sent());

    let msg = recv.recv_message(Some(Duration::from_secs(1))).await;
    assert!(msg.is_eof());
    let after = recv.recv_message(Some(Duration::from_millis(10))).await;
    assert!(after.is_failure());
}

#[tokio::test]
async fn oversized_message_uses_one_work_channel() {
    init();
    let max = 256;
    let backend = BufferBackend::with_limits(DEFAULT_CAPACITY, max);
    let (send, recv) = pair(&backend, "large").await;

    let payload = Value::Bytes((0..3 * max).map(|i| (i * 7 % 256) as u8).collect());
    assert!(send.send(&payload).await);
    assert_eq!(send.n_work_channels(), 1);

    let msg = recv.recv_message(Some(Duration::from_secs(1))).await;
    assert!(msg.is_success());
    assert_eq!(msg.value, payload);
    assert!(msg.header.contains(keys::SIZE));

    // Only the primary channel is left once the remainder is collected
    assert_eq!(backend.n_channels(), 1);

    let small = Value::Int(1);
    assert!(send.send(&small).await);
    assert_eq!(send.n_work_channels(), 1);
    let (ok, value) = recv.recv(Some(Duration::from_secs(1))).await;
    assert!(ok);
    assert_eq!(value, small);
}

#[tokio::test]
async fn extra_header_entries_arrive() {
    init();
    let backend = BufferBackend::new();
    let (send, recv) = pair(&backend, "extra").await;

    let header = Header::new().with("step", "4");
    assert!(send.send_message(&Value::from("x"), &header).await);
    let msg = recv.recv_message(Some(Duration::from_secs(1))).await;
    assert_eq!(msg.header.get("step"), Some("4"));
    assert!(msg.header.contains(keys::ID));
}

#[tokio::test]
async fn address_comes_from_environment() {
    init();
    let backend = BufferBackend::new();
    let recv = Comm::builder("solver", Direction::Recv)
        .backend(backend.clone())
        .build()
        .await
        .unwrap();
    let env = Environment::new().with("SOLVER_OUT", recv.address());

    let send = Comm::builder("solver", Direction::Send)
        .backend(backend)
        .env(env)
        .build()
        .await
        .unwrap();
    assert_eq!(send.address(), recv.address());

    assert!(send.send(&Value::Int(5)).await);
    assert!(!send.confirm_send(true).await);
    assert_eq!(recv.recv(Some(Duration::from_secs(1))).await, (true, Value::Int(5)));
    assert!(send.confirm_send(false).await);
    assert!(recv.confirm_recv(true).await);
}

#[tokio::test]
async fn closed_comm_fails_fast() {
    init();
    let backend = BufferBackend::new();
    let (send, recv) = pair(&backend, "closed").await;
    send.close(false).await;
    assert!(send.is_closed());
    assert!(!send.send(&Value::Int(1)).await);
    assert!(!send.send_eof().await);

    recv.close(false).await;
    assert_eq!(recv.recv(None).await, (false, Value::Null));
}

#[tokio::test]
async fn close_interrupts_blocked_send() {
    init();
    let backend = BufferBackend::with_limits(1, 0);
    let (send, _recv) = pair(&backend, "stuck").await;
    let send = std::sync::Arc::new(send);
    assert!(send.send(&Value::Int(1)).await);

    let blocked = {
        let send = send.clone();
        tokio::spawn(async move { send.send(&Value::Int(2)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!blocked.is_finished());

    send.close(false).await;
    let sent = tokio::time::timeout(Duration::from_secs(2), blocked)
        .await
        .expect("send still blocked after close")
        .unwrap();
    assert!(!sent);
    assert_eq!(send.n_sent(), 1);
}
