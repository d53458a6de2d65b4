use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Snapshot of key/value settings
///
/// Communicators never read the process environment directly. A session
/// captures it once with [`Environment::from_process`] (or builds one by hand
/// in tests) and hands it to whoever needs to resolve addresses or tunables.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Create an empty environment
    pub fn new() -> Self {
        Self::default()
    }

    /// Capture the current process environment
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Add a variable, builder style
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.vars.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Parse a variable, ignoring values that fail to parse
    pub fn parse<T: FromStr>(&self, key: &str) -> Option<T> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    /// Look up the address registered for a logical channel name
    ///
    /// The key is `name` followed by `suffix` (e.g. `_IN`, `_OUT`). A name that
    /// already carries the suffix is used as the key verbatim, so a key can be
    /// handed back in and resolve to the same address. Upper-cased keys are
    /// tried when the exact key is missing.
    pub fn resolve_address(&self, name: &str, suffix: &str) -> Result<String> {
        let key = if name.ends_with(suffix) {
            name.to_string()
        } else {
            format!("{name}{suffix}")
        };

        self.get(&key)
            .or_else(|| self.get(&key.to_uppercase()))
            .map(str::to_string)
            .ok_or_else(|| {
                Error::configuration(format!(
                    "no address registered for '{name}' (expected environment key '{key}')"
                ))
            })
    }

    /// Split a key produced by [`Environment::resolve_address`] back into the
    /// logical name and the suffix that matched
    pub fn split_key<'a>(key: &'a str, suffixes: &[&'static str]) -> Option<(&'a str, &'static str)> {
        suffixes
            .iter()
            .find_map(|s| key.strip_suffix(s).map(|name| (name, *s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_suffixed_key() {
        let env = Environment::new().with("model_IN", "buffer://abc");
        assert_eq!(env.resolve_address("model", "_IN").unwrap(), "buffer://abc");
        assert_eq!(env.resolve_address("model_IN", "_IN").unwrap(), "buffer://abc");
    }

    #[test]
    fn falls_back_to_uppercase_key() {
        let env = Environment::new().with("MODEL_OUT", "tcp://127.0.0.1:9000");
        assert_eq!(
            env.resolve_address("model", "_OUT").unwrap(),
            "tcp://127.0.0.1:9000"
        );
    }

    #[test]
    fn missing_address_is_configuration_error() {
        let env = Environment::new();
        match env.resolve_address("ghost", "_IN") {
            Err(Error::Configuration(msg)) => assert!(msg.contains("ghost_IN")),
            other => panic!("expected configuration error, got {:?}", other),
        }
    }

    #[test]
    fn split_key_recovers_name() {
        assert_eq!(
            Environment::split_key("model_OUT", &["_IN", "_OUT"]),
            Some(("model", "_OUT"))
        );
        assert_eq!(Environment::split_key("model", &["_IN", "_OUT"]), None);
    }

    #[test]
    fn parse_ignores_garbage() {
        let env = Environment::new().with("N", "12").with("BAD", "twelve");
        assert_eq!(env.parse::<u64>("N"), Some(12));
        assert_eq!(env.parse::<u64>("BAD"), None);
        assert_eq!(env.parse::<u64>("MISSING"), None);
    }
}
