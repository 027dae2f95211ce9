//! Typed configuration for the terminal session subsystem.
//!
//! Mirrors the "Recognized options" table in the subsystem specification.
//! Defaults are applied first, then overridden by an optional TOML file, then
//! by environment variables (`TERMBROKER_*`), matching the layered
//! defaults-then-override idiom the rest of this codebase uses for daemon
//! configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Replay ring buffer capacity, in bytes.
    pub buffer_bytes: usize,
    /// Sweep threshold for detached sessions, in seconds.
    pub idle_timeout_seconds: u64,
    /// Sweeper poll interval, in seconds.
    pub sweep_interval_seconds: u64,
    /// Input Validator size cap, in bytes.
    pub input_max_bytes: usize,
    /// Per-axis resize cap (rows and cols).
    pub resize_max_dim: u16,
    /// SIGTERM -> SIGKILL grace period, in seconds.
    pub child_grace_seconds: u64,
    /// Connect-time deadline for spawn + first Status send, in seconds.
    pub spawn_deadline_seconds: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_bytes: 65536,
            idle_timeout_seconds: 300,
            sweep_interval_seconds: 60,
            input_max_bytes: 2048,
            resize_max_dim: 500,
            child_grace_seconds: 2,
            spawn_deadline_seconds: 10,
        }
    }
}

impl Config {
    /// Load defaults, apply an optional TOML file, then apply environment
    /// variable overrides (`TERMBROKER_BUFFER_BYTES`, etc).
    pub fn from_env_and_file(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = path {
            let contents = std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("failed to read config file {}: {}", path.display(), e)
            })?;
            config = toml::from_str(&contents).map_err(|e| {
                anyhow::anyhow!("failed to parse config file {}: {}", path.display(), e)
            })?;
        }

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_usize("TERMBROKER_BUFFER_BYTES") {
            self.buffer_bytes = v;
        }
        if let Some(v) = env_u64("TERMBROKER_IDLE_TIMEOUT_SECONDS") {
            self.idle_timeout_seconds = v;
        }
        if let Some(v) = env_u64("TERMBROKER_SWEEP_INTERVAL_SECONDS") {
            self.sweep_interval_seconds = v;
        }
        if let Some(v) = env_usize("TERMBROKER_INPUT_MAX_BYTES") {
            self.input_max_bytes = v;
        }
        if let Some(v) = env_u16("TERMBROKER_RESIZE_MAX_DIM") {
            self.resize_max_dim = v;
        }
        if let Some(v) = env_u64("TERMBROKER_CHILD_GRACE_SECONDS") {
            self.child_grace_seconds = v;
        }
        if let Some(v) = env_u64("TERMBROKER_SPAWN_DEADLINE_SECONDS") {
            self.spawn_deadline_seconds = v;
        }
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_u16(key: &str) -> Option<u16> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.buffer_bytes, 65536);
        assert_eq!(config.idle_timeout_seconds, 300);
        assert_eq!(config.sweep_interval_seconds, 60);
        assert_eq!(config.input_max_bytes, 2048);
        assert_eq!(config.resize_max_dim, 500);
        assert_eq!(config.child_grace_seconds, 2);
        assert_eq!(config.spawn_deadline_seconds, 10);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "buffer_bytes = 1024\nidle_timeout_seconds = 30\n").unwrap();

        let config = Config::from_env_and_file(Some(&path)).unwrap();
        assert_eq!(config.buffer_bytes, 1024);
        assert_eq!(config.idle_timeout_seconds, 30);
        // Unset fields keep defaults.
        assert_eq!(config.sweep_interval_seconds, 60);
    }
}


