//! Logging setup
//!
//! Filters come from the `CONSTELLATION_LOG` environment variable using
//! `EnvFilter` syntax (e.g. `info,constellation_comm::driver=debug`). The
//! default level is `info`.

use std::sync::Once;

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// ENV used to set the log filter
pub const FILTER_ENV: &str = "CONSTELLATION_LOG";

const DEFAULT_FILTER_LEVEL: &str = "info";

static INIT: Once = Once::new();

fn filter() -> EnvFilter {
    EnvFilter::try_from_env(FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER_LEVEL))
}

/// Install the global fmt subscriber once
///
/// Later calls are no-ops.
pub fn init() {
    INIT.call_once(|| {
        if let Err(e) = install() {
            eprintln!("failed to initialise logging: {e}");
        }
    });
}

/// Install the subscriber unless one is already set
///
/// Tests call this from every case, since several tests share a process.
/// Only a failure to install with no subscriber in place is an error.
pub fn try_init() -> Result<()> {
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }
    match install() {
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        result => result,
    }
}

fn install() -> Result<()> {
    let filter = filter();
    let directives = filter.to_string();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|e| Error::Logging(e.to_string()))?;
    tracing::debug!(filter = %directives, "logging initialised");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_accepted() {
        try_init().unwrap();
        try_init().unwrap();
        assert!(tracing::dispatcher::has_been_set());
        // init does not panic when a subscriber is already set
        init();
    }

    #[test]
    fn direct_install_reports_existing_subscriber() {
        try_init().unwrap();
        assert!(matches!(install(), Err(Error::Logging(_))));
    }
}
