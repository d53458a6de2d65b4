use std::time::Duration;

use crate::message::{Direction, Flag, Message};
use crate::value::Value;
use crate::wire::Header;
use crate::error::Result;

/// Uniform send/receive contract
///
/// Implemented by plain communicators, the async wrapper, composites and the
/// RPC pair, so anything that moves messages can sit on either side of a
/// connection driver. Send and receive report outcomes through `bool` and
/// [`Message::flag`]; they never surface transport errors as `Err`.
#[async_trait::async_trait]
pub trait Communicator: Send + Sync {
    fn name(&self) -> &str;

    fn address(&self) -> String;

    fn direction(&self) -> Direction;

    fn is_open(&self) -> bool;

    fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// Whether receiving EOF closes this communicator
    fn close_on_eof_recv(&self) -> bool {
        true
    }

    async fn open(&self) -> Result<()>;

    /// Close, first waiting for outstanding messages when `linger` is set
    async fn close(&self, linger: bool);

    /// Send a value with extra header entries
    async fn send_message(&self, value: &Value, header: &Header) -> bool;

    /// Send end-of-stream; false if it was already sent
    async fn send_eof(&self) -> bool;

    /// Receive one message
    ///
    /// `None` waits indefinitely, `Some(Duration::ZERO)` only takes what is
    /// already there. A timeout yields [`Flag::Empty`].
    async fn recv_message(&self, timeout: Option<Duration>) -> Message;

    /// Messages sent but not yet taken by the peer
    fn n_msg_send(&self) -> usize;

    /// Messages waiting to be received
    fn n_msg_recv(&self) -> usize;

    /// Wait until the counter for `direction` reaches zero
    async fn drain_messages(&self, direction: Direction, timeout: Duration) -> bool;

    async fn send(&self, value: &Value) -> bool {
        self.send_message(value, &Header::new()).await
    }

    /// Receive a value
    ///
    /// A timeout gives `(true, Value::empty())` while the communicator is
    /// open. EOF gives `(false, _)` when it closed the communicator and
    /// `(true, Value::Null)` otherwise; use [`Communicator::recv_message`]
    /// to tell EOF apart from data.
    async fn recv(&self, timeout: Option<Duration>) -> (bool, Value) {
        let msg = self.recv_message(timeout).await;
        match msg.flag {
            Flag::Success => (true, msg.value),
            Flag::Empty | Flag::Skip | Flag::Signoff => (self.is_open(), Value::empty()),
            Flag::Eof => (!self.close_on_eof_recv(), Value::Null),
            Flag::Failure => (false, Value::Null),
        }
    }

    /// Report whether everything sent has been taken, waiting unless
    /// `noblock` is set
    async fn confirm_send(&self, noblock: bool) -> bool {
        if noblock {
            return self.n_msg_send() == 0;
        }
        self.drain_messages(Direction::Send, crate::comm::DEFAULT_CONFIRM_TIMEOUT)
            .await
    }

    /// Report whether everything waiting has been received, waiting unless
    /// `noblock` is set
    async fn confirm_recv(&self, noblock: bool) -> bool {
        if noblock {
            return self.n_msg_recv() == 0;
        }
        self.drain_messages(Direction::Recv, crate::comm::DEFAULT_CONFIRM_TIMEOUT)
            .await
    }

    /// Drain in this communicator's own direction
    async fn wait_for_confirm(&self, timeout: Duration) -> bool {
        self.drain_messages(self.direction(), timeout).await
    }
}

/// Poll a counter until it reaches zero or the timeout passes
///
/// Transports do not report consumption by the peer, so this samples.
pub async fn wait_until_zero(counter: impl Fn() -> usize, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if counter() == 0 {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(crate::comm::DRAIN_POLL).await;
    }
}
