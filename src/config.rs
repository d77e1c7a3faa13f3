//! Host-process configuration: CLI surface, environment variables, and
//! persisted state are a concern of the host binary, not the core
//! sequencing logic. TOML-deserialized via `serde`.

use crate::error::{Error, ErrorKind, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address the server listens on, e.g. `"127.0.0.1:7750"`.
    pub listen_addr: String,
    /// Per-session outbound byte-queue soft limit. Reserved for a future
    /// backpressure warning; nothing in the crate reads it yet.
    pub queue_capacity: usize,
    /// `log`/`env_logger` level filter, e.g. `"info"`.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen_addr: "127.0.0.1:7750".to_string(),
            queue_capacity: 4096,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Config> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::new(ErrorKind::Internal, format!("reading config {:?}: {}", path.as_ref(), e))
        })?;
        toml::from_str(&text)
            .map_err(|e| Error::new(ErrorKind::Internal, format!("parsing config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "127.0.0.1:7750");
        assert!(config.queue_capacity > 0);
    }

    #[test]
    fn parses_partial_toml_over_defaults() {
        let config: Config = toml::from_str("log_level = \"debug\"\n").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.listen_addr, Config::default().listen_addr);
    }
}
