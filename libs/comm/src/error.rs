use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The transport is open but the operation would block right now
    #[error("Operation would block")]
    Temporary,

    /// Nothing to receive right now
    #[error("No messages available")]
    NoMessages,

    /// The transport is unusable; the owning communicator closes
    #[error("Fatal transport error: {0}")]
    Fatal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Communicator closed")]
    Closed,

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error(transparent)]
    Core(#[from] constellation_core::Error),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn serialization(msg: impl ToString) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// True for errors that a caller should retry rather than escalate
    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary | Self::NoMessages)
    }

    /// True for errors after which the transport can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::Io(_) | Self::ConnectionClosed)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
