//! Composite communicator: one logical channel over several children
//!
//! Children live in an ordered arena and are addressed by index. The pattern
//! decides how one logical message maps onto them:
//!
//! | pattern       | direction | behaviour                                        |
//! |---------------|-----------|--------------------------------------------------|
//! | `Broadcast`   | send      | same message to every child                      |
//! | `Scatter`     | send      | element `i` of a list to child `i`               |
//! | `Cycle`       | both      | round-robin, one child per call                  |
//! | `Gather`      | recv      | one message from every child, as a list          |
//! | `Concatenate` | recv      | like `Gather`, parts joined into one value       |

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::comm::Comm;
use crate::communicator::{wait_until_zero, Communicator};
use crate::error::{Error, Result};
use crate::message::{Direction, Flag, Message};
use crate::transport::Backend;
use crate::value::Value;
use crate::wire::Header;

/// Separator between child addresses in a composite address
pub const ADDRESS_SEP: &str = ",";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pattern {
    Broadcast,
    Scatter,
    Cycle,
    Gather,
    Concatenate,
}

impl Pattern {
    pub fn supports(&self, direction: Direction) -> bool {
        match self {
            Pattern::Broadcast | Pattern::Scatter => direction == Direction::Send,
            Pattern::Gather | Pattern::Concatenate => direction == Direction::Recv,
            Pattern::Cycle => true,
        }
    }

    /// Default pattern for a direction
    pub fn default_for(direction: Direction) -> Self {
        match direction {
            Direction::Send => Pattern::Broadcast,
            Direction::Recv => Pattern::Gather,
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Pattern::Broadcast => "broadcast",
            Pattern::Scatter => "scatter",
            Pattern::Cycle => "cycle",
            Pattern::Gather => "gather",
            Pattern::Concatenate => "concatenate",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for Pattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "broadcast" => Ok(Pattern::Broadcast),
            "scatter" => Ok(Pattern::Scatter),
            "cycle" => Ok(Pattern::Cycle),
            "gather" => Ok(Pattern::Gather),
            "concatenate" => Ok(Pattern::Concatenate),
            other => Err(Error::configuration(format!("unknown pattern '{other}'"))),
        }
    }
}

#[derive(Debug)]
struct CompositeState {
    curr_index: usize,
    /// Messages already received per child, waiting for the set to complete
    slots: Vec<Option<Message>>,
    /// Children that delivered EOF to a cycling receiver
    finished: Vec<bool>,
}

pub struct CompositeComm {
    name: String,
    direction: Direction,
    pattern: Pattern,
    children: Vec<Box<dyn Communicator>>,
    state: Mutex<CompositeState>,
    open: AtomicBool,
    close_on_eof_recv: AtomicBool,
}

impl fmt::Debug for CompositeComm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeComm")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("pattern", &self.pattern)
            .field("children", &self.children.len())
            .finish()
    }
}

impl CompositeComm {
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        pattern: Pattern,
        children: Vec<Box<dyn Communicator>>,
    ) -> Result<Self> {
        let name = name.into();
        if children.is_empty() {
            return Err(Error::configuration(format!("composite '{name}' has no children")));
        }
        if !pattern.supports(direction) {
            return Err(Error::configuration(format!(
                "pattern '{pattern}' cannot {direction}"
            )));
        }
        if let Some(child) = children.iter().find(|c| c.direction() != direction) {
            return Err(Error::configuration(format!(
                "child '{}' of '{name}' has direction {}, expected {direction}",
                child.name(),
                child.direction()
            )));
        }
        let n = children.len();
        debug!(comm = %name, %pattern, children = n, "created composite communicator");
        Ok(Self {
            name,
            direction,
            pattern,
            children,
            state: Mutex::new(CompositeState {
                curr_index: 0,
                slots: vec![None; n],
                finished: vec![false; n],
            }),
            open: AtomicBool::new(true),
            close_on_eof_recv: AtomicBool::new(true),
        })
    }

    /// Build one [`Comm`] child per address in a comma separated list
    pub async fn from_address(
        name: impl Into<String>,
        direction: Direction,
        pattern: Pattern,
        backend: Arc<dyn Backend>,
        address: &str,
    ) -> Result<Self> {
        let name = name.into();
        let mut children: Vec<Box<dyn Communicator>> = Vec::new();
        for (i, part) in address
            .split(ADDRESS_SEP)
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .enumerate()
        {
            let child = Comm::builder(format!("{name}[{i}]"), direction)
                .shared_backend(backend.clone())
                .address(part)
                .build()
                .await?;
            children.push(Box::new(child));
        }
        Self::new(name, direction, pattern, children)
    }

    pub fn pattern(&self) -> Pattern {
        self.pattern
    }

    pub fn n_children(&self) -> usize {
        self.children.len()
    }

    pub fn child(&self, index: usize) -> Option<&dyn Communicator> {
        self.children.get(index).map(|c| c.as_ref())
    }

    pub fn set_close_on_eof_recv(&self, close: bool) {
        self.close_on_eof_recv.store(close, Ordering::SeqCst);
    }

    /// Messages held for an incomplete gather
    pub fn n_partial(&self) -> usize {
        self.state.lock().slots.iter().filter(|s| s.is_some()).count()
    }

    fn advance(&self) -> usize {
        let mut state = self.state.lock();
        let index = state.curr_index;
        state.curr_index = (index + 1) % self.children.len();
        index
    }

    async fn send_all(&self, value: &Value, header: &Header) -> bool {
        let results = join_all(self.children.iter().map(|c| c.send_message(value, header))).await;
        results.into_iter().all(|ok| ok)
    }

    async fn scatter(&self, value: &Value, header: &Header) -> bool {
        let parts = match value.as_list() {
            Some(parts) if parts.len() == self.children.len() => parts,
            _ => {
                warn!(
                    comm = %self.name,
                    kind = value.kind(),
                    children = self.children.len(),
                    "scatter needs a list with one element per child"
                );
                return false;
            }
        };
        let results = join_all(
            self.children
                .iter()
                .zip(parts)
                .map(|(child, part)| child.send_message(part, header)),
        )
        .await;
        results.into_iter().all(|ok| ok)
    }

    async fn cycle_send(&self, value: &Value, header: &Header) -> bool {
        let index = self.state.lock().curr_index;
        if !self.children[index].send_message(value, header).await {
            return false;
        }
        self.advance();
        true
    }

    async fn on_all_eof(&self) -> Message {
        info!(comm = %self.name, "all children reached EOF");
        if self.close_on_eof_recv.load(Ordering::SeqCst) {
            self.close(false).await;
        }
        Message::eof()
    }

    async fn cycle_recv(&self, timeout: Option<Duration>) -> Message {
        let n = self.children.len();
        let index = {
            let mut state = self.state.lock();
            let mut found = None;
            for _ in 0..n {
                let i = state.curr_index;
                if !state.finished[i] {
                    found = Some(i);
                    break;
                }
                state.curr_index = (i + 1) % n;
            }
            found
        };
        let Some(index) = index else {
            return self.on_all_eof().await;
        };

        let msg = self.children[index].recv_message(timeout).await;
        match msg.flag {
            Flag::Success | Flag::Signoff => {
                self.advance();
                msg
            }
            Flag::Eof => {
                let all_done = {
                    let mut state = self.state.lock();
                    state.finished[index] = true;
                    state.curr_index = (index + 1) % n;
                    state.finished.iter().all(|f| *f)
                };
                debug!(comm = %self.name, child = index, "child reached EOF");
                if all_done {
                    self.on_all_eof().await
                } else {
                    Message::skip(Header::new())
                }
            }
            Flag::Empty | Flag::Skip => msg,
            Flag::Failure => {
                if self.children[index].is_closed() {
                    warn!(comm = %self.name, child = index, "child closed, closing composite");
                    self.close(false).await;
                }
                msg
            }
        }
    }

    async fn gather(&self, timeout: Option<Duration>) -> Message {
        let waiting: Vec<usize> = {
            let state = self.state.lock();
            (0..self.children.len())
                .filter(|i| state.slots[*i].is_none())
                .collect()
        };
        let received = join_all(
            waiting
                .iter()
                .map(|&i| async move { (i, self.children[i].recv_message(timeout).await) }),
        )
        .await;

        let mut failed = None;
        {
            let mut state = self.state.lock();
            for (i, msg) in received {
                match msg.flag {
                    Flag::Success | Flag::Eof => state.slots[i] = Some(msg),
                    Flag::Failure => failed = Some(i),
                    Flag::Empty | Flag::Skip | Flag::Signoff => {}
                }
            }
        }
        if let Some(child) = failed {
            warn!(comm = %self.name, child, "child failed during gather, closing composite");
            self.close(false).await;
            return Message::failure();
        }

        let complete = {
            let mut state = self.state.lock();
            if state.slots.iter().all(|s| s.is_some()) {
                Some(state.slots.iter_mut().filter_map(Option::take).collect::<Vec<_>>())
            } else {
                None
            }
        };
        let Some(parts) = complete else {
            return Message::empty();
        };

        let n_eof = parts.iter().filter(|m| m.is_eof()).count();
        if n_eof == parts.len() {
            return self.on_all_eof().await;
        }
        if n_eof > 0 {
            error!(
                comm = %self.name,
                eof = n_eof,
                children = parts.len(),
                "only some children reached EOF, closing composite"
            );
            self.close(false).await;
            return Message::failure();
        }

        let mut header = Header::new();
        let mut values = Vec::with_capacity(parts.len());
        for part in parts {
            if header.is_empty() {
                header = part.header;
            }
            values.push(part.value);
        }
        let value = match self.pattern {
            Pattern::Concatenate => Value::concat(values),
            _ => Value::List(values),
        };
        Message::success(value, header)
    }
}

#[async_trait::async_trait]
impl Communicator for CompositeComm {
    fn name(&self) -> &str {
        &self.name
    }

    fn address(&self) -> String {
        self.children
            .iter()
            .map(|c| c.address())
            .collect::<Vec<_>>()
            .join(ADDRESS_SEP)
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.children.iter().any(|c| c.is_open())
    }

    fn close_on_eof_recv(&self) -> bool {
        self.close_on_eof_recv.load(Ordering::SeqCst)
    }

    async fn open(&self) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        for child in &self.children {
            child.open().await?;
        }
        Ok(())
    }

    async fn close(&self, linger: bool) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        join_all(self.children.iter().map(|c| c.close(linger))).await;
        debug!(comm = %self.name, "closed composite communicator");
    }

    async fn send_message(&self, value: &Value, header: &Header) -> bool {
        if !self.is_open() {
            return false;
        }
        match self.pattern {
            Pattern::Broadcast => self.send_all(value, header).await,
            Pattern::Scatter => self.scatter(value, header).await,
            Pattern::Cycle => self.cycle_send(value, header).await,
            Pattern::Gather | Pattern::Concatenate => false,
        }
    }

    async fn send_eof(&self) -> bool {
        if !self.is_open() {
            return false;
        }
        let results = join_all(self.children.iter().map(|c| c.send_eof())).await;
        results.into_iter().all(|ok| ok)
    }

    async fn recv_message(&self, timeout: Option<Duration>) -> Message {
        if !self.open.load(Ordering::SeqCst) {
            return Message::failure();
        }
        match self.pattern {
            Pattern::Cycle => self.cycle_recv(timeout).await,
            Pattern::Gather | Pattern::Concatenate => self.gather(timeout).await,
            Pattern::Broadcast | Pattern::Scatter => Message::failure(),
        }
    }

    fn n_msg_send(&self) -> usize {
        self.children.iter().map(|c| c.n_msg_send()).sum()
    }

    fn n_msg_recv(&self) -> usize {
        self.children.iter().map(|c| c.n_msg_recv()).sum::<usize>() + self.n_partial()
    }

    async fn drain_messages(&self, direction: Direction, timeout: Duration) -> bool {
        match direction {
            Direction::Send => wait_until_zero(|| self.n_msg_send(), timeout).await,
            Direction::Recv => {
                wait_until_zero(
                    || self.children.iter().map(|c| c.n_msg_recv()).sum::<usize>(),
                    timeout,
                )
                .await
            }
        }
    }
}
