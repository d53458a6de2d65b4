use std::fmt;

use crate::value::Value;
use crate::wire::Header;

/// Which way a communicator moves messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    /// Suffix appended to a logical name to find its address
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Direction::Send => "_OUT",
            Direction::Recv => "_IN",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Recv => write!(f, "recv"),
        }
    }
}

/// Outcome attached to a received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Success,
    Failure,
    Eof,
    /// Nothing arrived before the timeout
    Empty,
    /// A message was consumed but carries nothing for the caller
    Skip,
    /// An RPC client announced it will send no more requests
    Signoff,
}

/// A decoded message together with its envelope and outcome
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub value: Value,
    pub header: Header,
    pub flag: Flag,
}

impl Message {
    pub fn new(value: Value, header: Header, flag: Flag) -> Self {
        Self { value, header, flag }
    }

    pub fn success(value: Value, header: Header) -> Self {
        Self::new(value, header, Flag::Success)
    }

    pub fn failure() -> Self {
        Self::new(Value::Null, Header::new(), Flag::Failure)
    }

    pub fn eof() -> Self {
        Self::new(Value::Null, Header::new(), Flag::Eof)
    }

    pub fn empty() -> Self {
        Self::new(Value::empty(), Header::new(), Flag::Empty)
    }

    pub fn skip(header: Header) -> Self {
        Self::new(Value::Null, header, Flag::Skip)
    }

    pub fn is_success(&self) -> bool {
        self.flag == Flag::Success
    }

    pub fn is_eof(&self) -> bool {
        self.flag == Flag::Eof
    }

    pub fn is_failure(&self) -> bool {
        self.flag == Flag::Failure
    }

    pub fn is_empty(&self) -> bool {
        self.flag == Flag::Empty
    }
}
