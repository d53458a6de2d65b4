//! Non-blocking wrapper around a [`Comm`]
//!
//! A background task keeps a backlog moving: on the send side it retries the
//! oldest pending message until the transport takes it, on the receive side it
//! pulls messages as they arrive. Callers only touch the backlog, so `send`
//! never waits on the transport and `recv` only waits on the backlog.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::comm::{Comm, DEFAULT_CONFIRM_TIMEOUT};
use crate::communicator::{wait_until_zero, Communicator};
use crate::error::{Error, Result};
use crate::message::{Direction, Flag, Message};
use crate::value::Value;
use crate::wire::Header;

/// Pause before retrying a send the transport refused
const RETRY_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone)]
enum Entry {
    Outbound { value: Value, header: Header },
    OutboundEof,
    Inbound(Message),
}

struct Shared {
    comm: Arc<Comm>,
    backlog: Mutex<VecDeque<Entry>>,
    ready: Notify,
    stop: CancellationToken,
    stopped: AtomicBool,
    failed: AtomicBool,
    n_direct: AtomicU64,
    n_backlog: AtomicU64,
}

impl Shared {
    fn push(&self, entry: Entry) {
        self.backlog.lock().push_back(entry);
        self.ready.notify_one();
    }

    fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    /// Give up on the wrapped communicator and everything still queued
    async fn fail(&self) {
        self.failed.store(true, Ordering::SeqCst);
        let dropped = {
            let mut backlog = self.backlog.lock();
            let n = backlog.len();
            backlog.clear();
            n
        };
        if dropped > 0 {
            warn!(comm = %self.comm.name(), dropped, "discarded backlog");
        }
        self.comm.close(false).await;
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    async fn try_deliver(&self, entry: &Entry) -> Result<()> {
        match entry {
            Entry::Outbound { value, header } => self.comm.try_send(value, header).await,
            Entry::OutboundEof => self.comm.try_send_eof().await,
            Entry::Inbound(_) => Ok(()),
        }
    }

    async fn run_sender(self: Arc<Self>) {
        debug!(comm = %self.comm.name(), "send backlog task started");
        loop {
            let head = self.backlog.lock().front().cloned();
            let Some(entry) = head else {
                tokio::select! {
                    _ = self.ready.notified() => continue,
                    _ = self.stop.cancelled() => break,
                }
            };
            match self.try_deliver(&entry).await {
                Ok(()) => {
                    self.backlog.lock().pop_front();
                    self.n_backlog.fetch_add(1, Ordering::SeqCst);
                    trace!(comm = %self.comm.name(), "backlog message sent");
                }
                Err(e) if e.is_temporary() => {
                    tokio::select! {
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                        _ = self.stop.cancelled() => break,
                    }
                }
                Err(e) if e.is_fatal() || matches!(e, Error::Closed) => {
                    error!(comm = %self.comm.name(), error = %e, "send backlog failed, stopping");
                    self.fail().await;
                    break;
                }
                Err(e) => {
                    // Only this message is bad, the channel is fine
                    warn!(comm = %self.comm.name(), error = %e, "dropping backlogged message");
                    self.backlog.lock().pop_front();
                }
            }
        }
        self.mark_stopped();
        debug!(comm = %self.comm.name(), "send backlog task stopped");
    }

    async fn run_receiver(self: Arc<Self>) {
        debug!(comm = %self.comm.name(), "recv backlog task started");
        loop {
            let msg = tokio::select! {
                msg = self.comm.recv_message(None) => msg,
                _ = self.stop.cancelled() => break,
            };
            match msg.flag {
                Flag::Success | Flag::Signoff | Flag::Skip => self.push(Entry::Inbound(msg)),
                Flag::Eof => {
                    self.push(Entry::Inbound(msg));
                    break;
                }
                Flag::Empty => continue,
                Flag::Failure => {
                    if self.comm.is_closed() {
                        break;
                    }
                    // Undecodable message, the channel itself is fine
                    self.push(Entry::Inbound(msg));
                }
            }
        }
        self.mark_stopped();
        debug!(comm = %self.comm.name(), "recv backlog task stopped");
    }
}

/// Asynchronous wrapper around a communicator
///
/// Only the operations it changes are exposed here; anything else goes
/// through [`AsyncComm::comm`].
pub struct AsyncComm {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AsyncComm {
    /// Wrap an open communicator and start its backlog task
    pub fn new(comm: Comm) -> Self {
        Self::from_shared(Arc::new(comm))
    }

    pub fn from_shared(comm: Arc<Comm>) -> Self {
        let direction = comm.direction();
        let shared = Arc::new(Shared {
            comm,
            backlog: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            stop: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            n_direct: AtomicU64::new(0),
            n_backlog: AtomicU64::new(0),
        });
        let task = match direction {
            Direction::Send => tokio::spawn(shared.clone().run_sender()),
            Direction::Recv => tokio::spawn(shared.clone().run_receiver()),
        };
        Self {
            shared,
            task: Mutex::new(Some(task)),
            closed: AtomicBool::new(false),
        }
    }

    /// The wrapped communicator
    pub fn comm(&self) -> &Arc<Comm> {
        &self.shared.comm
    }

    /// Messages the transport took straight from `send`
    pub fn n_msg_direct(&self) -> u64 {
        self.shared.n_direct.load(Ordering::SeqCst)
    }

    /// Messages delivered by the backlog task
    pub fn n_msg_backlog(&self) -> u64 {
        self.shared.n_backlog.load(Ordering::SeqCst)
    }

    /// Messages waiting in the backlog
    pub fn backlog_len(&self) -> usize {
        self.shared.backlog_len()
    }

    fn task_running(&self) -> bool {
        !self.shared.stopped.load(Ordering::SeqCst)
    }

    async fn enqueue(&self, entry: Entry) -> bool {
        if self.closed.load(Ordering::SeqCst) || !self.task_running() {
            return false;
        }
        if self.shared.backlog_len() > 0 {
            self.shared.push(entry);
            return true;
        }
        match self.shared.try_deliver(&entry).await {
            Ok(()) => {
                self.shared.n_direct.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(e) if e.is_temporary() => {
                trace!(comm = %self.name(), "transport busy, message backlogged");
                self.shared.push(entry);
                true
            }
            Err(Error::Configuration(msg)) => {
                debug!(comm = %self.name(), %msg, "send rejected");
                false
            }
            Err(e) if e.is_fatal() => {
                error!(comm = %self.name(), error = %e, "send failed, closing");
                self.shared.fail().await;
                self.close(false).await;
                false
            }
            Err(e) => {
                warn!(comm = %self.name(), error = %e, "send failed");
                false
            }
        }
    }

    async fn stop_task(&self) {
        self.shared.stop.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(comm = %self.name(), error = %e, "backlog task ended abnormally");
            }
        }
    }
}

#[async_trait::async_trait]
impl Communicator for AsyncComm {
    fn name(&self) -> &str {
        self.shared.comm.name()
    }

    fn address(&self) -> String {
        self.shared.comm.address()
    }

    fn direction(&self) -> Direction {
        self.shared.comm.direction()
    }

    /// Open while not closed and either the task runs or messages remain
    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
            && !self.shared.has_failed()
            && (self.task_running() || self.shared.backlog_len() > 0)
    }

    fn close_on_eof_recv(&self) -> bool {
        self.shared.comm.close_on_eof_recv()
    }

    async fn open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.shared.comm.open().await
    }

    async fn close(&self, linger: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if linger && self.direction() == Direction::Send {
            let shared = self.shared.clone();
            if !wait_until_zero(move || shared.backlog_len(), DEFAULT_CONFIRM_TIMEOUT).await {
                warn!(comm = %self.name(), pending = self.backlog_len(), "closing with backlogged messages");
            }
        }
        self.stop_task().await;
        self.shared.comm.close(linger).await;
        debug!(comm = %self.name(), "closed async communicator");
    }

    async fn send_message(&self, value: &Value, header: &Header) -> bool {
        self.enqueue(Entry::Outbound {
            value: value.clone(),
            header: header.clone(),
        })
        .await
    }

    async fn send_eof(&self) -> bool {
        if self.shared.comm.eof_sent()
            || self
                .shared
                .backlog
                .lock()
                .iter()
                .any(|e| matches!(e, Entry::OutboundEof))
        {
            return false;
        }
        self.enqueue(Entry::OutboundEof).await
    }

    async fn recv_message(&self, timeout: Option<Duration>) -> Message {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.shared.ready.notified();
            let front = self.shared.backlog.lock().pop_front();
            if let Some(Entry::Inbound(msg)) = front {
                return msg;
            }
            if self.closed.load(Ordering::SeqCst) || !self.task_running() {
                return Message::failure();
            }

            let wait = async {
                match deadline {
                    Some(d) => tokio::time::sleep_until(d).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = notified => {}
                _ = wait => {
                    return if self.is_open() { Message::empty() } else { Message::failure() };
                }
            }
        }
    }

    fn n_msg_send(&self) -> usize {
        match self.direction() {
            Direction::Send => self.shared.backlog_len() + self.shared.comm.n_msg_send(),
            Direction::Recv => 0,
        }
    }

    fn n_msg_recv(&self) -> usize {
        match self.direction() {
            Direction::Recv => self.shared.backlog_len() + self.shared.comm.n_msg_recv(),
            Direction::Send => 0,
        }
    }

    async fn drain_messages(&self, direction: Direction, timeout: Duration) -> bool {
        match direction {
            Direction::Send => wait_until_zero(|| self.n_msg_send(), timeout).await,
            Direction::Recv => wait_until_zero(|| self.n_msg_recv(), timeout).await,
        }
    }
}

impl Drop for AsyncComm {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BufferBackend;

    async fn pair(backend: BufferBackend) -> (Comm, Comm) {
        let recv = Comm::builder("async", Direction::Recv)
            .backend(backend.clone())
            .build()
            .await
            .unwrap();
        let send = Comm::builder("async", Direction::Send)
            .backend(backend)
            .address(recv.address())
            .build()
            .await
            .unwrap();
        (send, recv)
    }

    #[tokio::test]
    async fn full_transport_backlogs_instead_of_blocking() {
        let (send, recv) = pair(BufferBackend::with_limits(1, 0)).await;
        let send = AsyncComm::new(send);

        for i in 0..5 {
            let started = std::time::Instant::now();
            assert!(send.send(&Value::Int(i)).await);
            assert!(started.elapsed() < Duration::from_millis(100));
        }
        assert!(send.n_msg_send() > 0);

        for i in 0..5 {
            let (ok, value) = recv.recv(Some(Duration::from_secs(1))).await;
            assert!(ok);
            assert_eq!(value, Value::Int(i));
        }
        assert!(send.drain_messages(Direction::Send, Duration::from_secs(1)).await);
        assert_eq!(send.n_msg_direct() + send.n_msg_backlog(), 5);
    }

    #[tokio::test]
    async fn receiver_backlog_fills_in_background() {
        let (send, recv) = pair(BufferBackend::new()).await;
        let recv = AsyncComm::new(recv);

        assert!(send.send(&Value::Str("a".into())).await);
        assert!(send.send(&Value::Str("b".into())).await);

        let (ok, first) = recv.recv(Some(Duration::from_secs(1))).await;
        assert!(ok);
        assert_eq!(first, Value::Str("a".into()));
        let (ok, second) = recv.recv(Some(Duration::from_secs(1))).await;
        assert!(ok);
        assert_eq!(second, Value::Str("b".into()));

        let (ok, empty) = recv.recv(Some(Duration::from_millis(20))).await;
        assert!(ok);
        assert_eq!(empty, Value::empty());
    }

    #[tokio::test]
    async fn eof_reaches_the_caller_then_closes() {
        let (send, recv) = pair(BufferBackend::new()).await;
        let recv = AsyncComm::new(recv);

        assert!(send.send(&Value::Int(1)).await);
        assert!(send.send_eof().await);

        assert!(recv.recv_message(Some(Duration::from_secs(1))).await.is_success());
        assert!(recv.recv_message(Some(Duration::from_secs(1))).await.is_eof());
        assert!(recv.recv_message(Some(Duration::from_millis(10))).await.is_failure());
        assert!(recv.is_closed());
    }

    #[tokio::test]
    async fn eof_is_only_sent_once() {
        let (send, _recv) = pair(BufferBackend::new()).await;
        let send = AsyncComm::new(send);
        assert!(send.send_eof().await);
        assert!(!send.send_eof().await);
    }

    #[tokio::test]
    async fn closed_inner_comm_fails_the_wrapper() {
        let (send, _recv) = pair(BufferBackend::with_limits(1, 0)).await;
        let send = AsyncComm::new(send);
        for i in 0..3 {
            assert!(send.send(&Value::Int(i)).await);
        }
        assert!(send.backlog_len() > 0);

        send.comm().close(false).await;
        let shared = send.shared.clone();
        assert!(wait_until_zero(move || shared.backlog_len(), Duration::from_secs(1)).await);
        assert!(send.is_closed());
        assert!(!send.send(&Value::Int(9)).await);
    }

    #[tokio::test]
    async fn lingering_close_flushes_backlog() {
        let (send, recv) = pair(BufferBackend::with_limits(1, 0)).await;
        let send = AsyncComm::new(send);
        for i in 0..3 {
            assert!(send.send(&Value::Int(i)).await);
        }

        let reader = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let (_, v) = recv.recv(Some(Duration::from_secs(2))).await;
                seen.push(v);
            }
            seen
        });
        send.close(true).await;
        assert!(send.is_closed());
        assert_eq!(
            reader.await.unwrap(),
            vec![Value::Int(0), Value::Int(1), Value::Int(2)]
        );
    }
}
