//! Request/response pairing over single-use response channels
//!
//! A [`ClientComm`] sends requests on one shared channel. Each request carries
//! the address of a fresh response channel the client allocated for it. The
//! [`ServerComm`] connects to that address when the request arrives, files
//! the response communicator under a new `response_id`, and uses it exactly
//! once in [`ServerComm::send_to`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::comm::Comm;
use crate::communicator::Communicator;
use crate::error::{Error, Result};
use crate::message::{Direction, Flag, Message};
use crate::transport::Backend;
use crate::value::Value;
use crate::wire::{self, keys, Header};

#[derive(Default)]
struct ServerState {
    /// Open response channels in arrival order
    responses: Vec<(String, Comm)>,
    clients: HashSet<String>,
    all_signed_off: bool,
}

/// Server side of an RPC pair
pub struct ServerComm {
    requests: Comm,
    backend: Arc<dyn Backend>,
    state: Mutex<ServerState>,
}

impl ServerComm {
    pub fn new(requests: Comm) -> Result<Self> {
        if requests.direction() != Direction::Recv {
            return Err(Error::configuration(format!(
                "server '{}' needs a receiving request channel",
                requests.name()
            )));
        }
        let backend = requests.backend().clone();
        Ok(Self {
            requests,
            backend,
            state: Mutex::new(ServerState::default()),
        })
    }

    /// Allocate a new request channel on `backend`
    pub async fn bind(name: impl Into<String>, backend: Arc<dyn Backend>) -> Result<Self> {
        let requests = Comm::builder(name, Direction::Recv)
            .shared_backend(backend)
            .build()
            .await?;
        Self::new(requests)
    }

    pub fn requests(&self) -> &Comm {
        &self.requests
    }

    /// Expect requests from `model` before it has sent any
    pub fn register_client(&self, model: impl Into<String>) {
        let model = model.into();
        debug!(comm = %self.requests.name(), client = %model, "registered client");
        self.state.lock().clients.insert(model);
    }

    pub fn n_clients(&self) -> usize {
        self.state.lock().clients.len()
    }

    /// Responses received requests are still waiting for
    pub fn n_open_responses(&self) -> usize {
        self.state.lock().responses.len()
    }

    pub fn response_ids(&self) -> Vec<String> {
        self.state.lock().responses.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Send the single response for `response_id`
    ///
    /// The entry is removed whether or not the send succeeds; a second call
    /// with the same id is a configuration error.
    pub async fn send_to(&self, response_id: &str, value: &Value) -> Result<()> {
        let comm = {
            let mut state = self.state.lock();
            let index = state
                .responses
                .iter()
                .position(|(id, _)| id == response_id)
                .ok_or_else(|| {
                    Error::configuration(format!("no open response with id '{response_id}'"))
                })?;
            state.responses.remove(index).1
        };
        let result = comm.send_checked(value, &Header::new()).await;
        comm.close(false).await;
        match &result {
            Ok(()) => debug!(comm = %self.requests.name(), response_id, "response sent"),
            Err(e) => warn!(comm = %self.requests.name(), response_id, error = %e, "response failed"),
        }
        result
    }

    async fn open_response(&self, mut msg: Message) -> Message {
        let Some(address) = msg.header.get(keys::RESPONSE_ADDRESS).map(str::to_string) else {
            warn!(comm = %self.requests.name(), "request without a response address");
            return Message::skip(msg.header);
        };
        if let Some(model) = msg.header.get(keys::MODEL) {
            let mut state = self.state.lock();
            if state.clients.insert(model.to_string()) {
                debug!(comm = %self.requests.name(), client = %model, "new client");
            }
        }

        let response = Comm::builder(format!("{}.response", self.requests.name()), Direction::Send)
            .shared_backend(self.backend.clone())
            .address(address.as_str())
            .build()
            .await;
        let response = match response {
            Ok(comm) => comm,
            Err(e) => {
                error!(comm = %self.requests.name(), %address, error = %e, "cannot open response channel");
                return Message::skip(msg.header);
            }
        };

        let response_id = Uuid::new_v4().to_string();
        msg.header.insert(keys::RESPONSE_ID, response_id.clone());
        self.state.lock().responses.push((response_id, response));
        msg
    }

    async fn on_signoff(&self, msg: Message) -> Message {
        let model = msg.header.get(keys::MODEL).unwrap_or_default().to_string();
        let done = {
            let mut state = self.state.lock();
            state.clients.remove(&model);
            let done = state.clients.is_empty() && !state.all_signed_off;
            if done {
                state.all_signed_off = true;
            }
            done
        };
        info!(comm = %self.requests.name(), client = %model, "client signed off");
        if !done {
            return Message::new(Value::Null, msg.header, Flag::Signoff);
        }
        info!(comm = %self.requests.name(), "all clients signed off");
        if self.requests.close_on_eof_recv() {
            self.close(false).await;
        }
        Message::eof()
    }
}

#[async_trait::async_trait]
impl Communicator for ServerComm {
    fn name(&self) -> &str {
        self.requests.name()
    }

    fn address(&self) -> String {
        self.requests.address()
    }

    fn direction(&self) -> Direction {
        Direction::Recv
    }

    fn is_open(&self) -> bool {
        self.requests.is_open()
    }

    fn close_on_eof_recv(&self) -> bool {
        self.requests.close_on_eof_recv()
    }

    async fn open(&self) -> Result<()> {
        self.requests.open().await
    }

    async fn close(&self, linger: bool) {
        let responses = std::mem::take(&mut self.state.lock().responses);
        if !responses.is_empty() {
            warn!(comm = %self.requests.name(), open = responses.len(), "closing with unanswered requests");
        }
        join_all(responses.iter().map(|(_, c)| c.close(false))).await;
        self.requests.close(linger).await;
    }

    /// Route a response by the `response_id` in `header`
    async fn send_message(&self, value: &Value, header: &Header) -> bool {
        let Some(response_id) = header.get(keys::RESPONSE_ID) else {
            warn!(comm = %self.requests.name(), "response without a response id");
            return false;
        };
        self.send_to(response_id, value).await.is_ok()
    }

    async fn send_eof(&self) -> bool {
        false
    }

    async fn recv_message(&self, timeout: Option<Duration>) -> Message {
        if self.state.lock().all_signed_off {
            return Message::failure();
        }
        let msg = self.requests.recv_message(timeout).await;
        match msg.flag {
            Flag::Success => self.open_response(msg).await,
            Flag::Signoff => self.on_signoff(msg).await,
            Flag::Eof => {
                self.state.lock().all_signed_off = true;
                msg
            }
            _ => msg,
        }
    }

    fn n_msg_send(&self) -> usize {
        self.state
            .lock()
            .responses
            .iter()
            .map(|(_, c)| c.n_msg_send())
            .sum()
    }

    fn n_msg_recv(&self) -> usize {
        self.requests.n_msg_recv()
    }

    async fn drain_messages(&self, direction: Direction, timeout: Duration) -> bool {
        match direction {
            Direction::Send => {
                crate::communicator::wait_until_zero(|| self.n_msg_send(), timeout).await
            }
            Direction::Recv => self.requests.drain_messages(direction, timeout).await,
        }
    }
}

struct PendingCall {
    request_id: String,
    response: Arc<Comm>,
}

/// Client side of an RPC pair
pub struct ClientComm {
    requests: Comm,
    backend: Arc<dyn Backend>,
    pending: Mutex<Option<PendingCall>>,
    signed_off: AtomicBool,
}

impl ClientComm {
    pub fn new(requests: Comm) -> Result<Self> {
        if requests.direction() != Direction::Send {
            return Err(Error::configuration(format!(
                "client '{}' needs a sending request channel",
                requests.name()
            )));
        }
        let backend = requests.backend().clone();
        Ok(Self {
            requests,
            backend,
            pending: Mutex::new(None),
            signed_off: AtomicBool::new(false),
        })
    }

    /// Attach to a server's request channel
    pub async fn connect(
        name: impl Into<String>,
        backend: Arc<dyn Backend>,
        address: &str,
    ) -> Result<Self> {
        let requests = Comm::builder(name, Direction::Send)
            .shared_backend(backend)
            .address(address)
            .build()
            .await?;
        Self::new(requests)
    }

    pub fn requests(&self) -> &Comm {
        &self.requests
    }

    /// Id of the request still waiting for its response
    pub fn pending_request(&self) -> Option<String> {
        self.pending.lock().as_ref().map(|p| p.request_id.clone())
    }

    /// Send a request and wait for its response
    pub async fn call(&self, value: &Value, timeout: Option<Duration>) -> Message {
        if !self.send(value).await {
            return Message::failure();
        }
        self.recv_message(timeout).await
    }

    async fn sign_off(&self) {
        if self.signed_off.swap(true, Ordering::SeqCst) || !self.requests.is_open() {
            return;
        }
        let header = Header::new().with(keys::MODEL, self.requests.name());
        let frame = match wire::encode(&header, wire::SIGNOFF_BYTES) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(comm = %self.requests.name(), error = %e, "cannot build sign-off");
                return;
            }
        };
        match self.requests.transport().send_bytes(&frame).await {
            Ok(()) => info!(comm = %self.requests.name(), "signed off"),
            Err(e) => warn!(comm = %self.requests.name(), error = %e, "sign-off failed"),
        }
    }
}

#[async_trait::async_trait]
impl Communicator for ClientComm {
    fn name(&self) -> &str {
        self.requests.name()
    }

    fn address(&self) -> String {
        self.requests.address()
    }

    fn direction(&self) -> Direction {
        Direction::Send
    }

    fn is_open(&self) -> bool {
        self.requests.is_open()
    }

    async fn open(&self) -> Result<()> {
        self.requests.open().await
    }

    /// Sign off, then close the request channel and any pending response
    async fn close(&self, linger: bool) {
        self.sign_off().await;
        let pending = self.pending.lock().take();
        if let Some(call) = pending {
            call.response.close(false).await;
        }
        self.requests.close(linger).await;
    }

    async fn send_message(&self, value: &Value, header: &Header) -> bool {
        if !self.requests.is_open() {
            return false;
        }
        let stale = self.pending.lock().take();
        if let Some(call) = stale {
            warn!(comm = %self.requests.name(), request_id = %call.request_id, "dropping unanswered request");
            call.response.close(false).await;
        }

        let response = Comm::builder(format!("{}.response", self.requests.name()), Direction::Recv)
            .shared_backend(self.backend.clone())
            .build()
            .await;
        let response = match response {
            Ok(comm) => comm,
            Err(e) => {
                warn!(comm = %self.requests.name(), error = %e, "cannot open response channel");
                return false;
            }
        };

        let request_id = Uuid::new_v4().to_string();
        let mut header = header.clone();
        header.insert(keys::REQUEST_ID, request_id.clone());
        header.insert(keys::RESPONSE_ADDRESS, response.address());
        header.insert(keys::MODEL, self.requests.name());

        if !self.requests.send_message(value, &header).await {
            response.close(false).await;
            return false;
        }
        *self.pending.lock() = Some(PendingCall {
            request_id,
            response: Arc::new(response),
        });
        true
    }

    async fn send_eof(&self) -> bool {
        self.requests.send_eof().await
    }

    /// Receive the response to the outstanding request
    ///
    /// A timeout keeps the request outstanding; anything else retires the
    /// response channel.
    async fn recv_message(&self, timeout: Option<Duration>) -> Message {
        let call = self
            .pending
            .lock()
            .as_ref()
            .map(|p| (p.request_id.clone(), p.response.clone()));
        let Some((request_id, response)) = call else {
            warn!(comm = %self.requests.name(), "no request waiting for a response");
            return Message::failure();
        };

        let mut msg = response.recv_message(timeout).await;
        if msg.is_empty() {
            return msg;
        }
        {
            let mut pending = self.pending.lock();
            if pending.as_ref().is_some_and(|p| p.request_id == request_id) {
                *pending = None;
            }
        }
        response.close(false).await;
        msg.header.insert(keys::REQUEST_ID, request_id);
        msg
    }

    fn n_msg_send(&self) -> usize {
        self.requests.n_msg_send()
    }

    fn n_msg_recv(&self) -> usize {
        self.pending
            .lock()
            .as_ref()
            .map(|p| p.response.n_msg_recv())
            .unwrap_or(0)
    }

    async fn drain_messages(&self, direction: Direction, timeout: Duration) -> bool {
        match direction {
            Direction::Send => self.requests.drain_messages(direction, timeout).await,
            Direction::Recv => {
                crate::communicator::wait_until_zero(|| self.n_msg_recv(), timeout).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::BufferBackend;

    async fn pair(name: &str) -> (ServerComm, ClientComm) {
        let backend: Arc<dyn Backend> = Arc::new(BufferBackend::new());
        let server = ServerComm::bind("server", backend.clone()).await.unwrap();
        let client = ClientComm::connect(name, backend, &server.address())
            .await
            .unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn request_carries_reply_route() {
        let (server, client) = pair("client").await;
        assert!(client.send(&Value::Int(2)).await);
        assert!(client.pending_request().is_some());

        let request = server.recv_message(Some(Duration::from_secs(1))).await;
        assert!(request.is_success());
        assert_eq!(request.header.get(keys::MODEL), Some("client"));
        assert!(request.header.contains(keys::REQUEST_ID));
        assert_eq!(server.n_open_responses(), 1);
        assert_eq!(server.n_clients(), 1);

        let response_id = request.header.get(keys::RESPONSE_ID).unwrap();
        server.send_to(response_id, &Value::Int(4)).await.unwrap();
        assert_eq!(server.n_open_responses(), 0);

        let reply = client.recv_message(Some(Duration::from_secs(1))).await;
        assert_eq!(reply.value, Value::Int(4));
        assert!(client.pending_request().is_none());
    }

    #[tokio::test]
    async fn response_timeout_keeps_request_pending() {
        let (_server, client) = pair("client").await;
        assert!(client.send(&Value::Int(1)).await);
        let msg = client.recv_message(Some(Duration::from_millis(20))).await;
        assert!(msg.is_empty());
        assert!(client.pending_request().is_some());
    }

    #[tokio::test]
    async fn requests_need_the_right_direction() {
        let backend: Arc<dyn Backend> = Arc::new(BufferBackend::new());
        let send = Comm::builder("x", Direction::Send)
            .shared_backend(backend)
            .build()
            .await
            .unwrap();
        assert!(matches!(ServerComm::new(send), Err(Error::Configuration(_))));
    }
}
