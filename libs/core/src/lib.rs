//! Constellation Core - process-level plumbing shared by every library
//!
//! - [`env::Environment`]: an explicit snapshot of settings used for address
//!   resolution and tunables
//! - [`logging`]: `tracing` subscriber setup
//! - [`Error`]: the common error type

pub mod env;
pub mod error;
pub mod logging;

pub use env::Environment;
pub use error::{Error, Result};
