use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{fs, path::Path};

use crate::core::backend::disk::DiskQueueOptions;
use crate::core::sweep::DEFAULT_WORKER_WAIT;

/// Longest accepted message timeout (one day).
pub const MAX_MSG_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ChannelConfig {
    /// Capacity of the in-memory lane before messages overflow to the backend.
    pub mem_queue_size: usize,
    /// How long a delivered message may stay unfinished before it is requeued.
    pub msg_timeout_ms: u64,
    /// Idle wait of the timeout and deferred sweep workers.
    pub worker_wait_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            mem_queue_size: 10_000,
            msg_timeout_ms: 60_000,
            worker_wait_ms: DEFAULT_WORKER_WAIT.as_millis() as u64,
        }
    }
}

impl ChannelConfig {
    pub fn msg_timeout(&self) -> Duration {
        Duration::from_millis(self.msg_timeout_ms)
    }

    pub fn worker_wait(&self) -> Duration {
        Duration::from_millis(self.worker_wait_ms)
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BackendConfig {
    pub data_path: PathBuf,
    pub max_bytes_per_file: u64,
    pub sync_every: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("."),
            max_bytes_per_file: 104_857_600,
            sync_every: 2500,
        }
    }
}

impl BackendConfig {
    pub fn disk_queue_options(&self) -> DiskQueueOptions {
        DiskQueueOptions {
            data_path: self.data_path.clone(),
            max_bytes_per_file: self.max_bytes_per_file,
            sync_every: self.sync_every,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub backend: BackendConfig,
}

impl Config {
    pub fn from_toml(raw: &str) -> Result<Config, anyhow::Error> {
        let config: Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), anyhow::Error> {
        anyhow::ensure!(self.channel.msg_timeout_ms > 0, "channel.msg_timeout_ms must be > 0");
        anyhow::ensure!(
            self.channel.msg_timeout_ms <= MAX_MSG_TIMEOUT_MS,
            "channel.msg_timeout_ms must be <= {MAX_MSG_TIMEOUT_MS}"
        );
        anyhow::ensure!(self.channel.worker_wait_ms > 0, "channel.worker_wait_ms must be > 0");
        anyhow::ensure!(
            self.backend.max_bytes_per_file > 0,
            "backend.max_bytes_per_file must be > 0"
        );
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, anyhow::Error> {
    let raw: String = fs::read_to_string(path)?;
    Config::from_toml(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg = Config::from_toml("").unwrap();
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.channel.worker_wait(), DEFAULT_WORKER_WAIT);
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let cfg = Config::from_toml("[channel]\nmem_queue_size = 5\n").unwrap();
        assert_eq!(cfg.channel.mem_queue_size, 5);
        assert_eq!(cfg.channel.msg_timeout_ms, 60_000);
        assert_eq!(cfg.backend.sync_every, 2500);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        assert!(Config::from_toml("[channel]\nmsg_timeout_ms = 0\n").is_err());
    }

    #[test]
    fn oversized_timeout_is_rejected() {
        let raw = format!("[channel]\nmsg_timeout_ms = {}\n", MAX_MSG_TIMEOUT_MS + 1);
        assert!(Config::from_toml(&raw).is_err());
        let raw = format!("[channel]\nmsg_timeout_ms = {MAX_MSG_TIMEOUT_MS}\n");
        assert!(Config::from_toml(&raw).is_ok());
    }
}
