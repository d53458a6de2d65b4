use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::Direction;
use crate::transport::{Backend, Transport};

/// Default number of frames a buffer channel holds before senders block
pub const DEFAULT_CAPACITY: usize = 1024;

const SCHEME: &str = "buffer://";

struct Queue {
    sender: flume::Sender<Vec<u8>>,
    receiver: flume::Receiver<Vec<u8>>,
    handles: usize,
}

struct BufferHub {
    queues: Mutex<HashMap<String, Queue>>,
    capacity: usize,
    max_msg_size: usize,
}

/// In-process backend: channels are bounded queues keyed by address
///
/// Clones share the same set of channels, so two communicators created from
/// clones of one backend can talk to each other.
#[derive(Clone)]
pub struct BufferBackend {
    hub: Arc<BufferHub>,
}

impl Default for BufferBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferBackend {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_CAPACITY, 0)
    }

    /// Create a backend with a queue capacity and a frame size limit
    /// (0 = unlimited)
    pub fn with_limits(capacity: usize, max_msg_size: usize) -> Self {
        Self {
            hub: Arc::new(BufferHub {
                queues: Mutex::new(HashMap::new()),
                capacity: capacity.max(1),
                max_msg_size,
            }),
        }
    }

    /// Number of live channels
    pub fn n_channels(&self) -> usize {
        self.hub.queues.lock().len()
    }

    fn attach(&self, address: &str) -> BufferTransport {
        let mut queues = self.hub.queues.lock();
        let queue = queues.entry(address.to_string()).or_insert_with(|| {
            let (sender, receiver) = flume::bounded(self.hub.capacity);
            Queue {
                sender,
                receiver,
                handles: 0,
            }
        });
        queue.handles += 1;
        BufferTransport {
            address: address.to_string(),
            sender: queue.sender.clone(),
            receiver: queue.receiver.clone(),
            max_msg_size: self.hub.max_msg_size,
            open: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            hub: self.hub.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Backend for BufferBackend {
    fn kind(&self) -> &'static str {
        "buffer"
    }

    async fn connect(
        &self,
        address: Option<&str>,
        _direction: Direction,
    ) -> Result<Arc<dyn Transport>> {
        let address = match address {
            Some(a) if a.starts_with(SCHEME) => a.to_string(),
            Some(a) => {
                return Err(Error::configuration(format!(
                    "'{a}' is not a buffer address"
                )))
            }
            None => format!("{SCHEME}{}", Uuid::new_v4()),
        };
        Ok(Arc::new(self.attach(&address)))
    }
}

/// One end of an in-process channel
pub struct BufferTransport {
    address: String,
    sender: flume::Sender<Vec<u8>>,
    receiver: flume::Receiver<Vec<u8>>,
    max_msg_size: usize,
    open: AtomicBool,
    detached: AtomicBool,
    hub: Arc<BufferHub>,
}

impl BufferTransport {
    fn check(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        if self.max_msg_size > 0 && bytes.len() > self.max_msg_size {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes (limit {})",
                bytes.len(),
                self.max_msg_size
            )));
        }
        Ok(())
    }

    /// Drop this handle from the hub; an empty channel with no handles left
    /// is forgotten, a non-empty one waits for its reader
    fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut queues = self.hub.queues.lock();
        if let Some(queue) = queues.get_mut(&self.address) {
            queue.handles = queue.handles.saturating_sub(1);
            if queue.handles == 0 && queue.receiver.is_empty() {
                queues.remove(&self.address);
                trace!(address = %self.address, "buffer channel released");
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for BufferTransport {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.detach();
        Ok(())
    }

    async fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.check(bytes)?;
        self.sender
            .send_async(bytes.to_vec())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    fn try_send_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.check(bytes)?;
        match self.sender.try_send(bytes.to_vec()) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(Error::Temporary),
            Err(flume::TrySendError::Disconnected(_)) => Err(Error::ConnectionClosed),
        }
    }

    async fn recv_bytes(&self) -> Result<Vec<u8>> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        self.receiver
            .recv_async()
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    fn try_recv_bytes(&self) -> Result<Vec<u8>> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        match self.receiver.try_recv() {
            Ok(bytes) => Ok(bytes),
            Err(flume::TryRecvError::Empty) => Err(Error::NoMessages),
            Err(flume::TryRecvError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    fn n_pending(&self) -> usize {
        self.receiver.len()
    }
}

impl Drop for BufferTransport {
    fn drop(&mut self) {
        self.detach();
    }
}
