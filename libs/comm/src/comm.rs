//! Communicator over one transport and one codec
//!
//! [`Comm`] implements the wire protocol on top of a [`Transport`]:
//!
//! - the first data message carries the codec descriptor, so a blank peer
//!   can learn the format
//! - frames larger than the transport allows are split, with the remainder
//!   carried over a single-use work channel
//! - EOF is a fixed body, sent at most once
//! - fatal transport errors close the communicator, everything else shows up
//!   as a failed send or receive

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use constellation_core::Environment;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::codec::{self, Codec};
use crate::communicator::{wait_until_zero, Communicator};
use crate::error::{Error, Result};
use crate::message::{Direction, Flag, Message};
use crate::transport::{Backend, Transport};
use crate::value::Value;
use crate::wire::{self, keys, Header};

/// How long a blocking confirm waits by default
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a receiver waits for the remainder of an oversized message
pub const WORK_CHANNEL_TIMEOUT: Duration = Duration::from_secs(60);

pub(crate) const DRAIN_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct CommState {
    is_open: bool,
    n_sent: u64,
    n_recv: u64,
    eof_sent: bool,
    eof_sending: bool,
    eof_recv: bool,
    close_on_eof_recv: bool,
    descriptor_sent: bool,
}

/// A communicator owning one transport and one codec
pub struct Comm {
    name: String,
    direction: Direction,
    transport: Arc<dyn Transport>,
    backend: Arc<dyn Backend>,
    codec: Mutex<Option<Box<dyn Codec>>>,
    state: Mutex<CommState>,
    max_msg_size: usize,
    closed: CancellationToken,
    n_work_channels: AtomicU64,
}

impl std::fmt::Debug for Comm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Comm")
            .field("name", &self.name)
            .field("address", &self.transport.address())
            .field("direction", &self.direction)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Comm {
    /// Create a builder for a communicator with a logical name
    pub fn builder(name: impl Into<String>, direction: Direction) -> CommBuilder {
        CommBuilder::new(name, direction)
    }

    /// Wrap an already created transport
    pub fn from_transport(
        name: impl Into<String>,
        direction: Direction,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn Backend>,
        codec: Option<Box<dyn Codec>>,
    ) -> Self {
        let max_msg_size = transport.max_msg_size();
        Self {
            name: name.into(),
            direction,
            transport,
            backend,
            codec: Mutex::new(codec),
            state: Mutex::new(CommState {
                close_on_eof_recv: true,
                ..Default::default()
            }),
            max_msg_size,
            closed: CancellationToken::new(),
            n_work_channels: AtomicU64::new(0),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Messages successfully sent
    pub fn n_sent(&self) -> u64 {
        self.state.lock().n_sent
    }

    /// Messages successfully received
    pub fn n_recv(&self) -> u64 {
        self.state.lock().n_recv
    }

    pub fn eof_sent(&self) -> bool {
        self.state.lock().eof_sent
    }

    pub fn eof_received(&self) -> bool {
        self.state.lock().eof_recv
    }

    /// Work channels created to carry oversized messages
    pub fn n_work_channels(&self) -> u64 {
        self.n_work_channels.load(Ordering::SeqCst)
    }

    pub fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    pub fn set_close_on_eof_recv(&self, close: bool) {
        self.state.lock().close_on_eof_recv = close;
    }

    /// Type tag of the codec in use, if one has been chosen
    pub fn seritype(&self) -> Option<&'static str> {
        self.codec.lock().as_ref().map(|c| c.seritype())
    }

    /// Descriptor of the codec in use, if one has been chosen
    pub fn type_descriptor(&self) -> Option<Header> {
        self.codec.lock().as_ref().map(|c| c.type_descriptor())
    }

    fn check_open(&self) -> Result<()> {
        if self.state.lock().is_open {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    /// Serialize a value and build its header
    fn prepare(&self, value: &Value, extra: &Header) -> Result<(Header, Vec<u8>)> {
        let mut slot = self.codec.lock();
        let codec = slot.get_or_insert_with(|| {
            // The default always exists in the registry
            Box::new(codec::ObjectCodec)
        });
        if !codec.is_initialized() {
            codec.infer_from(value)?;
        }
        let body = codec.serialize(value)?;

        let mut header = Header::new();
        if !self.state.lock().descriptor_sent {
            header.extend(&codec.type_descriptor());
        }
        header.extend(extra);
        if !header.is_empty() && !header.contains(keys::ID) {
            header.insert(keys::ID, Uuid::new_v4().to_string());
        }
        Ok((header, body))
    }

    async fn send_frame(&self, frame: &[u8], block: bool) -> Result<()> {
        if block {
            self.send_until_closed(self.transport.as_ref(), frame).await
        } else {
            self.transport.try_send_bytes(frame)
        }
    }

    /// Blocking send that gives up with [`Error::Closed`] once the
    /// communicator is closed
    async fn send_until_closed(&self, transport: &dyn Transport, frame: &[u8]) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            sent = transport.send_bytes(frame) => sent,
        }
    }

    /// Send a message too large for one frame
    ///
    /// The header and the first part of the body go out on the primary
    /// channel; the rest follows on a fresh work channel whose address the
    /// header carries.
    async fn send_large(&self, mut header: Header, body: &[u8], block: bool) -> Result<()> {
        let max = self.max_msg_size;
        let work = self.backend.connect(None, Direction::Send).await?;
        work.open().await?;

        if !header.contains(keys::ID) {
            header.insert(keys::ID, Uuid::new_v4().to_string());
        }
        header.insert(keys::SIZE, body.len().to_string());
        header.insert(keys::ADDRESS, work.address());

        let mut frame = wire::format_header(&header)?;
        if frame.len() >= max {
            let _ = work.close().await;
            return Err(Error::Serialization(format!(
                "header of {} bytes does not fit in a {} byte message",
                frame.len(),
                max
            )));
        }
        let first = max - frame.len();
        frame.extend_from_slice(&body[..first]);

        if let Err(e) = self.send_frame(&frame, block).await {
            let _ = work.close().await;
            return Err(e);
        }
        self.n_work_channels.fetch_add(1, Ordering::SeqCst);
        debug!(
            comm = %self.name,
            work = %work.address(),
            size = body.len(),
            "sending oversized message over work channel"
        );

        let chunk = match work.max_msg_size() {
            0 => max,
            n => n,
        };
        let result = async {
            for part in body[first..].chunks(chunk) {
                self.send_until_closed(work.as_ref(), part).await?;
            }
            Ok::<(), Error>(())
        }
        .await;
        let _ = work.close().await;
        result
    }

    async fn send_value(&self, value: &Value, extra: &Header, block: bool) -> Result<()> {
        self.check_open()?;
        let (header, body) = self.prepare(value, extra)?;
        let had_descriptor = header.contains(keys::SERITYPE);

        let frame_len = wire::format_header(&header)?.len() + body.len();
        if self.max_msg_size > 0 && frame_len > self.max_msg_size {
            self.send_large(header, &body, block).await?;
        } else {
            let frame = wire::encode(&header, &body)?;
            self.send_frame(&frame, block).await?;
        }

        let mut state = self.state.lock();
        state.n_sent += 1;
        if had_descriptor {
            state.descriptor_sent = true;
        }
        trace!(comm = %self.name, n_sent = state.n_sent, "message sent");
        Ok(())
    }

    /// Send without waiting
    ///
    /// Returns [`Error::Temporary`] when the transport cannot take the frame
    /// right now; the caller decides whether to retry. Used by the async
    /// wrapper.
    pub async fn try_send(&self, value: &Value, extra: &Header) -> Result<()> {
        self.send_value(value, extra, false).await
    }

    /// Send, surfacing the error instead of a flag
    pub async fn send_checked(&self, value: &Value, extra: &Header) -> Result<()> {
        self.send_value(value, extra, true).await
    }

    /// Send EOF, surfacing the error; [`Error::Temporary`] when it would block
    pub async fn try_send_eof(&self) -> Result<()> {
        self.check_open()?;
        {
            let mut state = self.state.lock();
            if state.eof_sent || state.eof_sending {
                return Err(Error::configuration("EOF already sent"));
            }
            // No await between the check and the send, so the flag is set
            // only once the frame is out
            self.transport.try_send_bytes(wire::EOF_BYTES)?;
            state.eof_sent = true;
        }
        info!(comm = %self.name, "sent EOF");
        Ok(())
    }

    async fn recv_raw(&self, timeout: Option<Duration>) -> Result<Option<Vec<u8>>> {
        if timeout == Some(Duration::ZERO) {
            return match self.transport.try_recv_bytes() {
                Ok(raw) => Ok(Some(raw)),
                Err(Error::NoMessages) => Ok(None),
                Err(e) => Err(e),
            };
        }

        let wait = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(Error::Closed),
            raw = self.transport.recv_bytes() => raw.map(Some),
            _ = wait => Ok(None),
        }
    }

    /// Collect the remainder of an oversized message from its work channel
    async fn recv_work(&self, header: &Header, mut body: Vec<u8>, size: usize) -> Result<Vec<u8>> {
        let address = header.get(keys::ADDRESS).ok_or_else(|| {
            Error::InvalidFrame("incomplete message without a work channel address".into())
        })?;
        debug!(comm = %self.name, work = %address, size, "receiving remainder from work channel");

        let work = self.backend.connect(Some(address), Direction::Recv).await?;
        work.open().await?;
        body.reserve(size.saturating_sub(body.len()));

        let result = async {
            while body.len() < size {
                let part = tokio::select! {
                    _ = self.closed.cancelled() => return Err(Error::Closed),
                    part = tokio::time::timeout(WORK_CHANNEL_TIMEOUT, work.recv_bytes()) => {
                        part.map_err(|_| Error::Custom("work channel timed out".into()))??
                    }
                };
                body.extend_from_slice(&part);
            }
            if body.len() > size {
                return Err(Error::InvalidFrame(format!(
                    "work channel delivered {} bytes, expected {}",
                    body.len(),
                    size
                )));
            }
            Ok(())
        }
        .await;
        let _ = work.close().await;
        result.map(|_| body)
    }

    /// Pick or refresh the codec from a received header
    fn negotiate(&self, header: &Header) -> Result<()> {
        let mut slot = self.codec.lock();
        let Some(seritype) = header.get(keys::SERITYPE) else {
            slot.get_or_insert_with(|| Box::new(codec::ObjectCodec));
            return Ok(());
        };
        match slot.as_mut() {
            None => {
                *slot = Some(codec::from_descriptor(header)?);
                debug!(comm = %self.name, seritype, "learned codec from peer");
            }
            Some(current) if current.seritype() != seritype => {
                if current.is_initialized() {
                    return Err(Error::Serialization(format!(
                        "peer sends '{seritype}' but this communicator expects '{}'",
                        current.seritype()
                    )));
                }
                *slot = Some(codec::from_descriptor(header)?);
            }
            Some(current) => {
                if !current.is_initialized() {
                    current.update_from_descriptor(header)?;
                }
            }
        }
        Ok(())
    }

    async fn decode(&self, raw: Vec<u8>) -> Result<Message> {
        let (header, body) = wire::parse_header(&raw)?;
        if wire::is_signoff(body) {
            return Ok(Message::new(Value::Null, header, Flag::Signoff));
        }

        let mut body = body.to_vec();
        if let Some(size) = header.get_usize(keys::SIZE) {
            if body.len() < size {
                body = self.recv_work(&header, body, size).await?;
            }
        }

        self.negotiate(&header)?;
        let value = {
            let slot = self.codec.lock();
            let codec = slot
                .as_ref()
                .ok_or_else(|| Error::serialization("no codec available"))?;
            codec.deserialize(&body)?
        };
        Ok(Message::success(value, header))
    }

    async fn on_eof(&self) -> Message {
        let close = {
            let mut state = self.state.lock();
            state.eof_recv = true;
            state.close_on_eof_recv
        };
        info!(comm = %self.name, "received EOF");
        if close {
            self.close(false).await;
        }
        Message::eof()
    }

    async fn close_on_fatal(&self, error: &Error) {
        warn!(comm = %self.name, error = %error, "fatal transport error, closing");
        self.close(false).await;
    }
}

#[async_trait::async_trait]
impl Communicator for Comm {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> String {
        self.transport.address()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn is_open(&self) -> bool {
        self.state.lock().is_open
    }

    fn close_on_eof_recv(&self) -> bool {
        self.state.lock().close_on_eof_recv
    }

    async fn open(&self) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        if self.closed.is_cancelled() {
            return Err(Error::Closed);
        }
        self.transport.open().await?;
        self.state.lock().is_open = true;
        debug!(
            comm = %self.name,
            address = %self.transport.address(),
            direction = %self.direction,
            "opened communicator"
        );
        Ok(())
    }

    async fn close(&self, linger: bool) {
        if !self.is_open() {
            return;
        }
        if linger && !self.drain_messages(self.direction, DEFAULT_CONFIRM_TIMEOUT).await {
            warn!(comm = %self.name, pending = self.transport.n_pending(), "closing with undelivered messages");
        }
        {
            let mut state = self.state.lock();
            if !state.is_open {
                return;
            }
            state.is_open = false;
        }
        self.closed.cancel();
        if let Err(e) = self.transport.close().await {
            warn!(comm = %self.name, error = %e, "transport close failed");
        }
        debug!(comm = %self.name, "closed communicator");
    }

    async fn send_message(&self, value: &Value, header: &Header) -> bool {
        match self.send_value(value, header, true).await {
            Ok(()) => true,
            Err(e) if e.is_fatal() => {
                self.close_on_fatal(&e).await;
                false
            }
            Err(e) => {
                warn!(comm = %self.name, error = %e, "send failed");
                false
            }
        }
    }

    async fn send_eof(&self) -> bool {
        {
            let mut state = self.state.lock();
            if !state.is_open || state.eof_sent || state.eof_sending {
                return false;
            }
            state.eof_sending = true;
        }
        let sent = self
            .send_until_closed(self.transport.as_ref(), wire::EOF_BYTES)
            .await;
        {
            let mut state = self.state.lock();
            state.eof_sending = false;
            state.eof_sent = sent.is_ok();
        }
        match sent {
            Ok(()) => {
                info!(comm = %self.name, "sent EOF");
                true
            }
            Err(e) if e.is_fatal() => {
                self.close_on_fatal(&e).await;
                false
            }
            Err(e) => {
                warn!(comm = %self.name, error = %e, "failed to send EOF");
                false
            }
        }
    }

    async fn recv_message(&self, timeout: Option<Duration>) -> Message {
        if !self.is_open() {
            return Message::failure();
        }

        let raw = match self.recv_raw(timeout).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Message::empty(),
            Err(e) if e.is_temporary() => return Message::empty(),
            Err(Error::Closed) => return Message::failure(),
            Err(e) => {
                self.close_on_fatal(&e).await;
                return Message::failure();
            }
        };

        if wire::is_eof(&raw) {
            return self.on_eof().await;
        }

        match self.decode(raw).await {
            Ok(msg) => {
                if msg.flag == Flag::Success {
                    let mut state = self.state.lock();
                    state.n_recv += 1;
                    trace!(comm = %self.name, n_recv = state.n_recv, "message received");
                }
                msg
            }
            Err(e) => {
                warn!(comm = %self.name, error = %e, "failed to decode message");
                Message::failure()
            }
        }
    }

    fn n_msg_send(&self) -> usize {
        match self.direction {
            Direction::Send => self.transport.n_pending(),
            Direction::Recv => 0,
        }
    }

    fn n_msg_recv(&self) -> usize {
        match self.direction {
            Direction::Recv => self.transport.n_pending(),
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

/// Builder for configuring a [`Comm`]
pub struct CommBuilder {
    name: String,
    direction: Direction,
    address: Option<String>,
    backend: Option<Arc<dyn Backend>>,
    codec: Option<Box<dyn Codec>>,
    max_msg_size: Option<usize>,
    close_on_eof_recv: bool,
    env: Option<Environment>,
}

impl CommBuilder {
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
            address: None,
            backend: None,
            codec: None,
            max_msg_size: None,
            close_on_eof_recv: true,
            env: None,
        }
    }

    /// Attach to an existing channel
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn backend(mut self, backend: impl Backend + 'static) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    pub fn shared_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Fix the codec instead of negotiating one
    pub fn codec(mut self, codec: impl Codec + 'static) -> Self {
        self.codec = Some(Box::new(codec));
        self
    }

    /// Split messages above `size` bytes even if the transport takes more
    pub fn max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = Some(size);
        self
    }

    pub fn close_on_eof_recv(mut self, close: bool) -> Self {
        self.close_on_eof_recv = close;
        self
    }

    /// Resolve the address from `NAME_IN` / `NAME_OUT` when none is given
    pub fn env(mut self, env: Environment) -> Self {
        self.env = Some(env);
        self
    }

    /// Create and open the communicator
    ///
    /// Without an address or environment a new channel is allocated; with an
    /// environment the address must resolve.
    pub async fn build(self) -> Result<Comm> {
        let backend = self
            .backend
            .ok_or_else(|| Error::configuration(format!("no backend for '{}'", self.name)))?;

        let address = match (self.address, &self.env) {
            (Some(a), _) => Some(a),
            (None, Some(env)) => Some(env.resolve_address(&self.name, self.direction.env_suffix())?),
            (None, None) => None,
        };

        let transport = backend.connect(address.as_deref(), self.direction).await?;
        let mut comm = Comm::from_transport(self.name, self.direction, transport, backend, self.codec);
        if let Some(limit) = self.max_msg_size.filter(|n| *n > 0) {
            comm.max_msg_size = match comm.max_msg_size {
                0 => limit,
                t => t.min(limit),
            };
        }
        comm.set_close_on_eof_recv(self.close_on_eof_recv);
        comm.open().await?;
        Ok(comm)
    }
}
