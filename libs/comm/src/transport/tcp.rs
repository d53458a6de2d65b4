use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::message::Direction;
use crate::transport::{Backend, Transport};

const SCHEME: &str = "tcp://";

/// Frames larger than this are rejected (100MB, to prevent DOS)
pub const MAX_FRAME_LEN: usize = 100 * 1024 * 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_LINGER: Duration = Duration::from_secs(30);
const DEFAULT_CAPACITY: usize = 1024;
const CONNECT_RETRY: Duration = Duration::from_millis(20);

enum Role {
    Listen(TcpListener),
    Connect(SocketAddr),
}

/// TCP transport with length-prefix framing
///
/// Frames are sent with a 4-byte big-endian length prefix. A transport
/// created without a peer address binds a listener and serves the first peer
/// that connects; one created with an address connects to it, retrying until
/// the connect timeout. A background task owns the socket so that sends can
/// be queued without blocking and receives are cancel-safe.
pub struct TcpTransport {
    address: String,
    role: Mutex<Option<Role>>,
    outbound_tx: Mutex<Option<flume::Sender<Vec<u8>>>>,
    outbound_rx: flume::Receiver<Vec<u8>>,
    inbound_tx: Mutex<Option<flume::Sender<Vec<u8>>>>,
    inbound_rx: flume::Receiver<Vec<u8>>,
    open: AtomicBool,
    max_msg_size: usize,
    connect_timeout: Duration,
    send_timeout: Option<Duration>,
    linger: Duration,
    connected: Arc<AtomicBool>,
    cancel: CancellationToken,
    reader_cancel: CancellationToken,
}

impl TcpTransport {
    /// Connect to a remote TCP address with default settings
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::builder().address(addr).build().await
    }

    /// Bind a listener on a local address with default settings
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        Self::builder().bind(addr).build().await
    }

    /// Create a builder for configuring the transport
    pub fn builder() -> TcpTransportBuilder {
        TcpTransportBuilder::new()
    }

    fn outbound(&self) -> Result<flume::Sender<Vec<u8>>> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        self.outbound_tx.lock().clone().ok_or(Error::Closed)
    }

    /// Stop accepting frames
    ///
    /// Receiving stops at once. Queued frames get `linger` to go out before
    /// the socket task is cancelled; an idle, unconnected socket is dropped
    /// immediately.
    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.role.lock().take();
        // Dropping the sender lets the writer finish what is queued and shut
        // down the write half.
        self.outbound_tx.lock().take();
        self.reader_cancel.cancel();
        if self.cancel.is_cancelled() {
            return;
        }
        let busy = self.connected.load(Ordering::SeqCst) || !self.outbound_rx.is_empty();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if busy => {
                let cancel = self.cancel.clone();
                let linger = self.linger;
                handle.spawn(async move {
                    tokio::time::sleep(linger).await;
                    cancel.cancel();
                });
            }
            _ => self.cancel.cancel(),
        }
    }

    fn check_len(&self, bytes: &[u8]) -> Result<()> {
        let limit = if self.max_msg_size > 0 {
            self.max_msg_size
        } else {
            MAX_FRAME_LEN
        };
        if bytes.len() > limit {
            return Err(Error::InvalidFrame(format!(
                "Message too large: {} bytes",
                bytes.len()
            )));
        }
        Ok(())
    }
}

async fn establish(role: Role, connect_timeout: Duration) -> Result<TcpStream> {
    match role {
        Role::Listen(listener) => {
            let (stream, peer) = listener.accept().await?;
            debug!(%peer, "accepted TCP peer");
            Ok(stream)
        }
        Role::Connect(addr) => {
            let deadline = tokio::time::Instant::now() + connect_timeout;
            loop {
                match TcpStream::connect(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) if tokio::time::Instant::now() < deadline => {
                        trace!(%addr, error = %e, "connect failed, retrying");
                        tokio::time::sleep(CONNECT_RETRY).await;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<Vec<u8>> {
    // Read length prefix
    let len = reader.read_u32().await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::ConnectionClosed
        } else {
            e.into()
        }
    })? as usize;

    if len > MAX_FRAME_LEN {
        return Err(Error::InvalidFrame(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    // Read data
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::ConnectionClosed
        } else {
            e.into()
        }
    })?;
    Ok(buf)
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    bytes: &[u8],
    send_timeout: Option<Duration>,
) -> Result<()> {
    let send_op = async {
        // Write length prefix (4 bytes, big-endian)
        writer.write_u32(bytes.len() as u32).await?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok::<(), Error>(())
    };

    if let Some(timeout) = send_timeout {
        tokio::time::timeout(timeout, send_op)
            .await
            .map_err(|_| Error::Custom("Send timeout exceeded".to_string()))?
    } else {
        send_op.await
    }
}

async fn reader_loop(mut reader: OwnedReadHalf, inbound: flume::Sender<Vec<u8>>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) => {
                if inbound.send_async(frame).await.is_err() {
                    break;
                }
            }
            Err(Error::ConnectionClosed) => {
                trace!("TCP peer closed the connection");
                break;
            }
            Err(e) => {
                warn!(error = %e, "TCP read failed");
                break;
            }
        }
    }
}

async fn writer_loop(
    mut writer: OwnedWriteHalf,
    outbound: flume::Receiver<Vec<u8>>,
    send_timeout: Option<Duration>,
) {
    while let Ok(frame) = outbound.recv_async().await {
        if let Err(e) = write_frame(&mut writer, &frame, send_timeout).await {
            warn!(error = %e, "TCP write failed");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
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
        let role = self.role.lock().take();
        let Some(role) = role else {
            // Already running, or closed for good
            return if self.is_open() { Ok(()) } else { Err(Error::Closed) };
        };
        let inbound = self.inbound_tx.lock().take().ok_or(Error::Closed)?;
        let outbound = self.outbound_rx.clone();
        let cancel = self.cancel.clone();
        let reader_cancel = self.reader_cancel.clone();
        let connected = self.connected.clone();
        let connect_timeout = self.connect_timeout;
        let send_timeout = self.send_timeout;
        let address = self.address.clone();

        tokio::spawn(async move {
            let stream = tokio::select! {
                stream = establish(role, connect_timeout) => stream,
                _ = cancel.cancelled() => return,
            };
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(%address, error = %e, "TCP connection failed");
                    return;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%address, error = %e, "failed to set TCP_NODELAY");
            }
            let (reader, writer) = stream.into_split();
            connected.store(true, Ordering::SeqCst);

            tokio::spawn(async move {
                tokio::select! {
                    _ = reader_loop(reader, inbound) => {}
                    _ = reader_cancel.cancelled() => {}
                }
            });

            tokio::select! {
                _ = writer_loop(writer, outbound, send_timeout) => {}
                _ = cancel.cancelled() => {}
            }
        });

        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown();
        Ok(())
    }

    async fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.check_len(bytes)?;
        self.outbound()?
            .send_async(bytes.to_vec())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    fn try_send_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.check_len(bytes)?;
        match self.outbound()?.try_send(bytes.to_vec()) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => Err(Error::Temporary),
            Err(flume::TrySendError::Disconnected(_)) => Err(Error::ConnectionClosed),
        }
    }

    async fn recv_bytes(&self) -> Result<Vec<u8>> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        self.inbound_rx
            .recv_async()
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    fn try_recv_bytes(&self) -> Result<Vec<u8>> {
        if !self.is_open() {
            return Err(Error::Closed);
        }
        match self.inbound_rx.try_recv() {
            Ok(bytes) => Ok(bytes),
            Err(flume::TryRecvError::Empty) => Err(Error::NoMessages),
            Err(flume::TryRecvError::Disconnected) => Err(Error::ConnectionClosed),
        }
    }

    fn n_pending(&self) -> usize {
        self.outbound_rx.len() + self.inbound_rx.len()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Builder for configuring TCP transport
#[derive(Default, Clone)]
pub struct TcpTransportBuilder {
    address: Option<SocketAddr>,
    bind: Option<SocketAddr>,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    linger: Option<Duration>,
    max_msg_size: usize,
    capacity: Option<usize>,
}

impl TcpTransportBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the address to connect to
    pub fn address(mut self, addr: SocketAddr) -> Self {
        self.address = Some(addr);
        self
    }

    /// Listen on a local address instead of connecting
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = Some(addr);
        self
    }

    /// Set the connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set the send timeout
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// How long queued frames may keep the socket alive after close
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = Some(linger);
        self
    }

    /// Largest frame accepted, 0 for the protocol limit
    pub fn max_msg_size(mut self, size: usize) -> Self {
        self.max_msg_size = size;
        self
    }

    /// Frames buffered in each direction
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Create the transport with the configured settings
    pub async fn build(self) -> Result<TcpTransport> {
        let (role, address) = match (self.address, self.bind) {
            (Some(addr), _) => (Role::Connect(addr), addr),
            (None, Some(bind)) => {
                let listener = TcpListener::bind(bind).await?;
                let local = listener.local_addr()?;
                (Role::Listen(listener), local)
            }
            (None, None) => {
                return Err(Error::Custom("Address not set".to_string()));
            }
        };

        let capacity = self.capacity.unwrap_or(DEFAULT_CAPACITY).max(1);
        let (outbound_tx, outbound_rx) = flume::bounded(capacity);
        let (inbound_tx, inbound_rx) = flume::bounded(capacity);

        Ok(TcpTransport {
            address: format!("{SCHEME}{address}"),
            role: Mutex::new(Some(role)),
            outbound_tx: Mutex::new(Some(outbound_tx)),
            outbound_rx,
            inbound_tx: Mutex::new(Some(inbound_tx)),
            inbound_rx,
            open: AtomicBool::new(false),
            max_msg_size: self.max_msg_size,
            connect_timeout: self.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT),
            send_timeout: self.send_timeout,
            linger: self.linger.unwrap_or(DEFAULT_LINGER),
            connected: Arc::new(AtomicBool::new(false)),
            cancel: CancellationToken::new(),
            reader_cancel: CancellationToken::new(),
        })
    }
}

/// Backend creating TCP transports
///
/// New channels listen on `bind_ip` with an ephemeral port.
#[derive(Clone)]
pub struct TcpBackend {
    bind_ip: IpAddr,
    template: TcpTransportBuilder,
}

impl Default for TcpBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpBackend {
    pub fn new() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            template: TcpTransportBuilder::new(),
        }
    }

    /// Use a configured builder as the template for every transport
    pub fn with_builder(mut self, template: TcpTransportBuilder) -> Self {
        self.template = template;
        self
    }

    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.bind_ip = ip;
        self
    }
}

/// Parse `tcp://host:port` (the scheme is optional)
pub fn parse_address(address: &str) -> Result<SocketAddr> {
    let raw = address.strip_prefix(SCHEME).unwrap_or(address);
    raw.parse()
        .map_err(|e| Error::configuration(format!("bad TCP address '{address}': {e}")))
}

#[async_trait::async_trait]
impl Backend for TcpBackend {
    fn kind(&self) -> &'static str {
        "tcp"
    }

    async fn connect(
        &self,
        address: Option<&str>,
        _direction: Direction,
    ) -> Result<Arc<dyn Transport>> {
        let mut builder = self.template.clone();
        builder.address = None;
        builder.bind = None;
        let builder = match address {
            Some(a) => builder.address(parse_address(a)?),
            None => builder.bind(SocketAddr::new(self.bind_ip, 0)),
        };
        Ok(Arc::new(builder.build().await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses() {
        assert_eq!(
            parse_address("tcp://127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert_eq!(
            parse_address("127.0.0.1:1").unwrap(),
            "127.0.0.1:1".parse().unwrap()
        );
        assert!(matches!(
            parse_address("buffer://x"),
            Err(Error::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn builder_requires_an_address() {
        assert!(TcpTransport::builder().build().await.is_err());
    }
}
