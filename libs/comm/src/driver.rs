//! Connection driver: pumps messages from one communicator to another
//!
//! A [`Connection`] receives from its input, runs the value through its
//! translators and forwards the result to its output until the input reports
//! EOF, a translator fails, a send fails or the owner stops it through the
//! [`ConnectionHandle`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use constellation_core::Environment;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::communicator::Communicator;
use crate::error::{Error, Result};
use crate::message::{Direction, Flag, Message};
use crate::value::Value;
use crate::wire::{keys, Header};

/// ENV for how long the first send may retry, in seconds
pub const TIMEOUT_SEND_1ST_ENV: &str = "CONSTELLATION_TIMEOUT_SEND_1ST";

/// ENV for the receive poll interval, in milliseconds
pub const RECV_POLL_ENV: &str = "CONSTELLATION_RECV_POLL_MS";

/// ENV for how long a graceful stop waits for each drain, in seconds
pub const DRAIN_TIMEOUT_ENV: &str = "CONSTELLATION_DRAIN_TIMEOUT";

const FIRST_SEND_RETRY: Duration = Duration::from_millis(10);

/// Header keys that describe one frame and are not forwarded
const FRAME_KEYS: &[&str] = &[
    keys::ID,
    keys::SIZE,
    keys::ADDRESS,
    keys::SERITYPE,
    keys::FORMAT_STR,
    keys::FIELD_NAMES,
    keys::FIELD_UNITS,
];

/// Turns a value into the value to forward
///
/// `Ok(None)` skips the message, `Err` stops the connection.
pub type Translator = Box<dyn Fn(Value) -> Result<Option<Value>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// How long the first send of a session keeps retrying
    pub timeout_send_1st: Duration,
    /// Receive timeout between checks for stop requests
    pub recv_poll: Duration,
    /// Upper bound for each drain during a graceful stop
    pub drain_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            timeout_send_1st: Duration::from_secs(60),
            recv_poll: Duration::from_millis(50),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl DriverConfig {
    /// Defaults overridden by the environment; unparsable values are ignored
    pub fn from_env(env: &Environment) -> Self {
        let mut config = Self::default();
        if let Some(secs) = env.parse::<f64>(TIMEOUT_SEND_1ST_ENV).filter(|s| *s >= 0.0) {
            config.timeout_send_1st = Duration::from_secs_f64(secs);
        }
        if let Some(ms) = env.parse::<u64>(RECV_POLL_ENV) {
            config.recv_poll = Duration::from_millis(ms);
        }
        if let Some(secs) = env.parse::<f64>(DRAIN_TIMEOUT_ENV).filter(|s| *s >= 0.0) {
            config.drain_timeout = Duration::from_secs_f64(secs);
        }
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    BeforeLoop,
    Receiving,
    Received,
    Processing,
    Processed,
    Sending,
    Sent,
    AfterLoop,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which end of the connection an exited model was attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelSide {
    /// The model produced this connection's input
    Input,
    /// The model consumed this connection's output
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Run,
    Stop,
    ModelExited(ModelSide),
}

pub struct Connection {
    name: String,
    input: Box<dyn Communicator>,
    output: Box<dyn Communicator>,
    translators: Vec<Translator>,
    config: DriverConfig,
    state: Mutex<ConnectionState>,
    close_reason: Mutex<Option<String>>,
    n_recv: AtomicU64,
    n_proc: AtomicU64,
    n_sent: AtomicU64,
    n_skip: AtomicU64,
    first_send_done: AtomicBool,
    eof_forwarded: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("input", &self.input.name())
            .field("output", &self.output.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(
        name: impl Into<String>,
        input: Box<dyn Communicator>,
        output: Box<dyn Communicator>,
    ) -> Result<Self> {
        let name = name.into();
        if input.direction() != Direction::Recv {
            return Err(Error::configuration(format!(
                "input '{}' of connection '{name}' does not receive",
                input.name()
            )));
        }
        if output.direction() != Direction::Send {
            return Err(Error::configuration(format!(
                "output '{}' of connection '{name}' does not send",
                output.name()
            )));
        }
        Ok(Self {
            name,
            input,
            output,
            translators: Vec::new(),
            config: DriverConfig::default(),
            state: Mutex::new(ConnectionState::BeforeLoop),
            close_reason: Mutex::new(None),
            n_recv: AtomicU64::new(0),
            n_proc: AtomicU64::new(0),
            n_sent: AtomicU64::new(0),
            n_skip: AtomicU64::new(0),
            first_send_done: AtomicBool::new(false),
            eof_forwarded: AtomicBool::new(false),
        })
    }

    /// Append a translator; translators run in the order they were added
    pub fn with_translator(
        mut self,
        translator: impl Fn(Value) -> Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        self.translators.push(Box::new(translator));
        self
    }

    pub fn with_config(mut self, config: DriverConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &dyn Communicator {
        self.input.as_ref()
    }

    pub fn output(&self) -> &dyn Communicator {
        self.output.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    pub fn n_recv(&self) -> u64 {
        self.n_recv.load(Ordering::SeqCst)
    }

    pub fn n_proc(&self) -> u64 {
        self.n_proc.load(Ordering::SeqCst)
    }

    pub fn n_sent(&self) -> u64 {
        self.n_sent.load(Ordering::SeqCst)
    }

    pub fn n_skip(&self) -> u64 {
        self.n_skip.load(Ordering::SeqCst)
    }

    /// Start the pump loop on the runtime
    pub fn spawn(self) -> ConnectionHandle {
        let connection = Arc::new(self);
        let (control, rx) = watch::channel(Control::Run);
        let task = tokio::spawn(connection.clone().run(rx));
        ConnectionHandle {
            connection,
            control,
            task,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != state {
            trace!(connection = %self.name, from = %*current, to = %state, "state change");
            *current = state;
        }
    }

    fn set_close_reason(&self, reason: impl Into<String>) {
        let mut slot = self.close_reason.lock();
        if slot.is_none() {
            let reason = reason.into();
            info!(connection = %self.name, %reason, "connection closing");
            *slot = Some(reason);
        }
    }

    async fn run(self: Arc<Self>, control: watch::Receiver<Control>) {
        info!(
            connection = %self.name,
            input = %self.input.name(),
            output = %self.output.name(),
            "connection started"
        );
        loop {
            let request = *control.borrow();
            match request {
                Control::Run => {}
                Control::Stop => {
                    self.stop_gracefully().await;
                    break;
                }
                Control::ModelExited(side) => {
                    self.model_exited(side).await;
                    break;
                }
            }

            self.set_state(ConnectionState::Receiving);
            let msg = self.input.recv_message(Some(self.config.recv_poll)).await;
            if !self.handle(msg).await {
                break;
            }
        }
        self.set_state(ConnectionState::AfterLoop);
        self.set_state(ConnectionState::Closed);
        info!(
            connection = %self.name,
            n_recv = self.n_recv(),
            n_sent = self.n_sent(),
            n_skip = self.n_skip(),
            reason = ?self.close_reason(),
            "connection closed"
        );
    }

    /// Act on one received message; false ends the loop
    async fn handle(&self, msg: Message) -> bool {
        match msg.flag {
            Flag::Empty | Flag::Skip | Flag::Signoff => true,
            Flag::Eof => {
                self.on_eof().await;
                false
            }
            Flag::Failure => {
                if self.input.is_closed() {
                    self.set_close_reason("input closed");
                    self.output.close(true).await;
                    false
                } else {
                    warn!(connection = %self.name, "dropped a message that failed to decode");
                    true
                }
            }
            Flag::Success => {
                self.n_recv.fetch_add(1, Ordering::SeqCst);
                self.set_state(ConnectionState::Received);
                self.route(msg).await
            }
        }
    }

    fn translate(&self, value: Value) -> Result<Option<Value>> {
        let mut value = value;
        for translator in &self.translators {
            match translator(value)? {
                Some(v) => value = v,
                None => return Ok(None),
            }
        }
        Ok(Some(value))
    }

    async fn route(&self, msg: Message) -> bool {
        self.set_state(ConnectionState::Processing);
        let value = match self.translate(msg.value) {
            Ok(Some(value)) => value,
            Ok(None) => {
                self.n_skip.fetch_add(1, Ordering::SeqCst);
                trace!(connection = %self.name, "message skipped");
                return true;
            }
            Err(e) => {
                error!(connection = %self.name, error = %e, "translator failed");
                self.set_close_reason(format!("translator failed: {e}"));
                self.close_both(false).await;
                return false;
            }
        };
        self.n_proc.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Processed);

        let mut header = msg.header.clone();
        for key in FRAME_KEYS {
            header.remove(key);
        }

        self.set_state(ConnectionState::Sending);
        if !self.forward(&value, &header).await {
            error!(connection = %self.name, output = %self.output.name(), "send failed");
            self.set_close_reason("send failed");
            self.close_both(false).await;
            return false;
        }
        self.n_sent.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Sent);
        true
    }

    /// Send one message; the first send of the session retries while the
    /// receiving side comes up
    async fn forward(&self, value: &Value, header: &Header) -> bool {
        if self.first_send_done.load(Ordering::SeqCst) {
            return self.output.send_message(value, header).await;
        }
        let deadline = tokio::time::Instant::now() + self.config.timeout_send_1st;
        loop {
            if self.output.send_message(value, header).await {
                self.first_send_done.store(true, Ordering::SeqCst);
                return true;
            }
            if self.output.is_closed() || tokio::time::Instant::now() >= deadline {
                return false;
            }
            debug!(connection = %self.name, "first send failed, retrying");
            tokio::time::sleep(FIRST_SEND_RETRY).await;
        }
    }

    async fn forward_eof(&self) {
        if self.eof_forwarded.swap(true, Ordering::SeqCst) {
            return;
        }
        if !self.output.send_eof().await {
            warn!(connection = %self.name, "could not forward EOF");
        }
    }

    async fn on_eof(&self) {
        self.set_close_reason("EOF received");
        self.forward_eof().await;
        self.input.close(false).await;
        self.output.close(true).await;
    }

    async fn close_both(&self, linger: bool) {
        self.input.close(false).await;
        self.output.close(linger).await;
    }

    /// Route everything already waiting on the input; true if EOF ended it
    async fn route_remaining(&self) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        while tokio::time::Instant::now() < deadline {
            let msg = self.input.recv_message(Some(Duration::ZERO)).await;
            match msg.flag {
                Flag::Empty => {
                    if self.input.n_msg_recv() == 0 {
                        return false;
                    }
                    tokio::time::sleep(crate::comm::DRAIN_POLL).await;
                }
                Flag::Eof => {
                    self.on_eof().await;
                    return true;
                }
                _ => {
                    if !self.handle(msg).await || self.input.is_closed() {
                        return true;
                    }
                }
            }
        }
        warn!(connection = %self.name, pending = self.input.n_msg_recv(), "input not drained in time");
        false
    }

    async fn stop_gracefully(&self) {
        info!(connection = %self.name, "stopping");
        self.set_close_reason("stopped");
        if self.route_remaining().await {
            return;
        }
        self.input.close(false).await;
        if !self
            .output
            .drain_messages(Direction::Send, self.config.drain_timeout)
            .await
        {
            warn!(connection = %self.name, pending = self.output.n_msg_send(), "output not drained in time");
        }
        self.output.close(false).await;
    }

    async fn model_exited(&self, side: ModelSide) {
        warn!(connection = %self.name, ?side, "model exited");
        self.set_close_reason(format!("model on {} side exited", match side {
            ModelSide::Input => "input",
            ModelSide::Output => "output",
        }));
        match side {
            ModelSide::Output => {
                self.input.close(false).await;
                self.output.close(false).await;
            }
            ModelSide::Input => {
                if !self.route_remaining().await {
                    self.input.close(false).await;
                }
            }
        }
    }
}

/// Control over a running [`Connection`]
pub struct ConnectionHandle {
    connection: Arc<Connection>,
    control: watch::Sender<Control>,
    task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Ask for a graceful stop: drain input, route, drain output, close
    pub fn stop(&self) {
        self.control.send_if_modified(|c| {
            if *c == Control::Run {
                *c = Control::Stop;
                true
            } else {
                false
            }
        });
    }

    /// Report that the model on `side` exited without closing its channel
    pub fn model_exited(&self, side: ModelSide) {
        self.control.send_if_modified(|c| {
            if *c == Control::Run {
                *c = Control::ModelExited(side);
                true
            } else {
                false
            }
        });
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the loop to end
    pub async fn join(self) -> Result<Arc<Connection>> {
        self.task
            .await
            .map_err(|e| Error::Custom(format!("connection task failed: {e}")))?;
        Ok(self.connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::Comm;
    use crate::transport::BufferBackend;

    /// (upstream sender, connection input, connection output, downstream receiver)
    async fn chain() -> (Comm, Comm, Comm, Comm) {
        let backend = BufferBackend::new();
        let input = Comm::builder("in", Direction::Recv)
            .backend(backend.clone())
            .build()
            .await
            .unwrap();
        let upstream = Comm::builder("in", Direction::Send)
            .backend(backend.clone())
            .address(input.address())
            .build()
            .await
            .unwrap();
        let downstream = Comm::builder("out", Direction::Recv)
            .backend(backend.clone())
            .build()
            .await
            .unwrap();
        let output = Comm::builder("out", Direction::Send)
            .backend(backend)
            .address(downstream.address())
            .build()
            .await
            .unwrap();
        (upstream, input, output, downstream)
    }

    #[test]
    fn config_reads_environment() {
        let env = Environment::new()
            .with(TIMEOUT_SEND_1ST_ENV, "2.5")
            .with(RECV_POLL_ENV, "10")
            .with(DRAIN_TIMEOUT_ENV, "soon");
        let config = DriverConfig::from_env(&env);
        assert_eq!(config.timeout_send_1st, Duration::from_millis(2500));
        assert_eq!(config.recv_poll, Duration::from_millis(10));
        assert_eq!(config.drain_timeout, DriverConfig::default().drain_timeout);
    }

    #[tokio::test]
    async fn rejects_swapped_directions() {
        let (upstream, input, _output, _downstream) = chain().await;
        let result = Connection::new("bad", Box::new(upstream), Box::new(input));
        assert!(matches!(result, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn translator_failure_closes_connection() {
        let (upstream, input, output, _downstream) = chain().await;
        let handle = Connection::new("fail", Box::new(input), Box::new(output))
            .unwrap()
            .with_translator(|_| Err(Error::Custom("bad value".into())))
            .spawn();

        assert!(upstream.send(&Value::Int(1)).await);
        let connection = handle.join().await.unwrap();
        assert!(connection.is_closed());
        assert!(connection.close_reason().unwrap().contains("bad value"));
        assert!(connection.input().is_closed());
        assert!(connection.output().is_closed());
    }

    #[tokio::test]
    async fn exited_consumer_closes_both_sides() {
        let (_upstream, input, output, _downstream) = chain().await;
        let handle = Connection::new("exit", Box::new(input), Box::new(output))
            .unwrap()
            .spawn();
        handle.model_exited(ModelSide::Output);
        let connection = handle.join().await.unwrap();
        assert!(connection.input().is_closed());
        assert!(connection.output().is_closed());
    }

    #[tokio::test]
    async fn exited_producer_leaves_output_open() {
        let (upstream, input, output, downstream) = chain().await;
        let handle = Connection::new("exit", Box::new(input), Box::new(output))
            .unwrap()
            .spawn();
        assert!(upstream.send(&Value::Int(7)).await);
        let (ok, value) = downstream.recv(Some(Duration::from_secs(1))).await;
        assert!(ok);
        assert_eq!(value, Value::Int(7));

        handle.model_exited(ModelSide::Input);
        let connection = handle.join().await.unwrap();
        assert!(connection.input().is_closed());
        assert!(connection.output().is_open());
    }
}
