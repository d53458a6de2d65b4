//! Constellation Comm - communicators between independently running models
//!
//! Layers, bottom up:
//!
//! - [`transport`]: raw frame channels ([`BufferBackend`] in process,
//!   [`TcpBackend`] over sockets) behind the [`Transport`] / [`Backend`] traits
//! - [`codec`]: value serializers selected by their `seritype` tag
//! - [`wire`]: the `header + body` envelope, EOF and sign-off bodies
//! - [`Comm`]: one transport plus one codec, implementing [`Communicator`]
//! - [`AsyncComm`], [`CompositeComm`], [`ClientComm`] / [`ServerComm`]:
//!   communicators built from other communicators
//! - [`driver`]: a loop pumping messages from one communicator to another
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use constellation_comm::{BufferBackend, Comm, Communicator, Direction, Value};
//!
//! # async fn example() -> constellation_comm::Result<()> {
//! let backend = BufferBackend::new();
//! let rx = Comm::builder("model", Direction::Recv)
//!     .backend(backend.clone())
//!     .build()
//!     .await?;
//! let tx = Comm::builder("model", Direction::Send)
//!     .backend(backend)
//!     .address(rx.address())
//!     .build()
//!     .await?;
//!
//! tx.send(&Value::from("hello")).await;
//! let (ok, value) = rx.recv(Some(Duration::from_secs(1))).await;
//! assert!(ok);
//! assert_eq!(value, Value::from("hello"));
//! # Ok(())
//! # }
//! ```

pub mod async_comm;
pub mod codec;
pub mod comm;
pub mod communicator;
pub mod composite;
pub mod driver;
pub mod error;
pub mod message;
pub mod registry;
pub mod rpc;
pub mod transport;
pub mod value;
pub mod wire;

pub use async_comm::AsyncComm;
pub use comm::{Comm, CommBuilder};
pub use communicator::Communicator;
pub use composite::{CompositeComm, Pattern};
pub use driver::{Connection, ConnectionHandle, ConnectionState, DriverConfig, ModelSide, Translator};
pub use error::{Error, Result};
pub use message::{Direction, Flag, Message};
pub use registry::CommRegistry;
pub use rpc::{ClientComm, ServerComm};
pub use transport::{Backend, BufferBackend, TcpBackend, Transport};
pub use value::Value;
pub use wire::Header;
