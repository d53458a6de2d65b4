use std::sync::Arc;

use crate::error::Result;
use crate::message::Direction;

pub mod buffer;
pub mod tcp;

pub use self::buffer::{BufferBackend, BufferTransport};
pub use self::tcp::{TcpBackend, TcpTransport, TcpTransportBuilder};

/// Transport trait for sending and receiving raw frames
///
/// Each transport instance is one end of one channel. Methods take `&self`
/// so a communicator can close a transport while another task is waiting
/// in [`Transport::recv_bytes`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Address a peer uses to reach the other end of this channel
    fn address(&self) -> String;

    /// Largest frame the transport accepts, 0 for unlimited
    fn max_msg_size(&self) -> usize;

    fn is_open(&self) -> bool;

    /// Make the transport usable
    async fn open(&self) -> Result<()>;

    /// Close the transport connection
    async fn close(&self) -> Result<()>;

    /// Send a frame, waiting for room if needed
    async fn send_bytes(&self, bytes: &[u8]) -> Result<()>;

    /// Send a frame if it can go out right now, [`Error::Temporary`] otherwise
    ///
    /// [`Error::Temporary`]: crate::error::Error::Temporary
    fn try_send_bytes(&self, bytes: &[u8]) -> Result<()>;

    /// Wait for the next frame
    ///
    /// Must be cancel-safe: dropping the future loses no frame.
    async fn recv_bytes(&self) -> Result<Vec<u8>>;

    /// Take a frame if one is ready, [`Error::NoMessages`] otherwise
    ///
    /// [`Error::NoMessages`]: crate::error::Error::NoMessages
    fn try_recv_bytes(&self) -> Result<Vec<u8>>;

    /// Frames queued on this channel that the receiving end has not taken yet
    fn n_pending(&self) -> usize;
}

/// Factory for transports of one kind
///
/// Communicators use the backend to create their own transport and the
/// single-use channels they need later: work channels for oversized messages
/// and RPC response channels.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Short name of the transport kind, e.g. `buffer` or `tcp`
    fn kind(&self) -> &'static str;

    /// Create a transport
    ///
    /// With `None` a new channel is allocated and its address is available
    /// from [`Transport::address`]; with an address the transport attaches to
    /// that existing channel.
    async fn connect(
        &self,
        address: Option<&str>,
        direction: Direction,
    ) -> Result<Arc<dyn Transport>>;
}
