//! Bridge Configuration
//!
//! Handles parsing and management of netbridge.toml configuration files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config value: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Name of the configuration file searched for by [`BridgeConfig::find_and_load`].
pub const CONFIG_FILE_NAME: &str = "netbridge.toml";

/// Root configuration structure matching netbridge.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct BridgeConfig {
    /// Wrapper pool capacities
    #[serde(default)]
    pub pool: PoolConfig,

    /// Threadsafe executor settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Background worker pool
    #[serde(default)]
    pub worker: WorkerConfig,

    /// UDP socket tuning
    #[serde(default)]
    pub udp: UdpConfig,

    /// Native timer wheel
    #[serde(default)]
    pub timer: TimerConfig,
}

impl BridgeConfig {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: BridgeConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Find and load configuration by searching up from the given directory.
    ///
    /// Falls back to the defaults when no file exists up to the root.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Ok(Self::default());
            }
        }
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.executor.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "executor.queue_capacity must be positive".to_string(),
            ));
        }
        if self.executor.drain_budget == 0 {
            return Err(ConfigError::Invalid(
                "executor.drain_budget must be positive".to_string(),
            ));
        }
        if self.worker.threads == 0 {
            return Err(ConfigError::Invalid(
                "worker.threads must be positive".to_string(),
            ));
        }
        if self.udp.max_datagram == 0 || self.udp.max_datagram > 65_535 {
            return Err(ConfigError::Invalid(format!(
                "udp.max_datagram out of range: {}",
                self.udp.max_datagram
            )));
        }
        Ok(())
    }
}

/// Maximum number of idle wrappers kept per entity kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    #[serde(default = "default_socket_max")]
    pub socket_max: usize,

    #[serde(default = "default_session_max")]
    pub session_max: usize,

    #[serde(default = "default_channel_max")]
    pub channel_max: usize,

    #[serde(default = "default_message_max")]
    pub message_max: usize,
}

fn default_socket_max() -> usize {
    16
}

fn default_session_max() -> usize {
    256
}

fn default_channel_max() -> usize {
    1024
}

fn default_message_max() -> usize {
    1024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            socket_max: default_socket_max(),
            session_max: default_session_max(),
            channel_max: default_channel_max(),
            message_max: default_message_max(),
        }
    }
}

/// Threadsafe executor settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutorConfig {
    /// Bounded queue size per executor; submissions beyond it are rejected
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Items run per executor in one drain step
    #[serde(default = "default_drain_budget")]
    pub drain_budget: usize,

    /// Task records retained for reuse across all executors
    #[serde(default = "default_record_pool_capacity")]
    pub record_pool_capacity: usize,
}

fn default_queue_capacity() -> usize {
    0xFFFF
}

fn default_drain_budget() -> usize {
    1024
}

fn default_record_pool_capacity() -> usize {
    4096
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            drain_budget: default_drain_budget(),
            record_pool_capacity: default_record_pool_capacity(),
        }
    }
}

/// Background worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_threads")]
    pub threads: usize,
}

fn default_worker_threads() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_worker_threads(),
        }
    }
}

/// UDP socket settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UdpConfig {
    #[serde(default = "default_server_buffer")]
    pub server_recv_buffer: usize,

    #[serde(default = "default_server_buffer")]
    pub server_send_buffer: usize,

    #[serde(default = "default_client_buffer")]
    pub client_recv_buffer: usize,

    #[serde(default = "default_client_buffer")]
    pub client_send_buffer: usize,

    /// Largest datagram read from the OS in one receive
    #[serde(default = "default_max_datagram")]
    pub max_datagram: usize,

    /// Datagrams read per socket per poll before yielding
    #[serde(default = "default_recv_batch")]
    pub recv_batch: usize,
}

fn default_server_buffer() -> usize {
    4 * 1024 * 1024
}

fn default_client_buffer() -> usize {
    256 * 1024
}

fn default_max_datagram() -> usize {
    65_507
}

fn default_recv_batch() -> usize {
    64
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            server_recv_buffer: default_server_buffer(),
            server_send_buffer: default_server_buffer(),
            client_recv_buffer: default_client_buffer(),
            client_send_buffer: default_client_buffer(),
            max_datagram: default_max_datagram(),
            recv_batch: default_recv_batch(),
        }
    }
}

/// Native timer wheel settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimerConfig {
    #[serde(default = "default_resolution_ms")]
    pub resolution_ms: u64,
}

fn default_resolution_ms() -> u64 {
    1
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            resolution_ms: default_resolution_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.pool.socket_max, 16);
        assert_eq!(config.executor.queue_capacity, 0xFFFF);
        assert_eq!(config.worker.threads, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[pool]
session_max = 8
message_max = 2

[executor]
queue_capacity = 128

[worker]
threads = 2
"#;

        let config: BridgeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.pool.session_max, 8);
        assert_eq!(config.pool.message_max, 2);
        assert_eq!(config.pool.socket_max, 16);
        assert_eq!(config.executor.queue_capacity, 128);
        assert_eq!(config.executor.drain_budget, 1024);
        assert_eq!(config.worker.threads, 2);
        assert_eq!(config.udp.max_datagram, 65_507);
    }

    #[test]
    fn test_validate_rejects_zero_threads() {
        let mut config = BridgeConfig::default();
        config.worker.threads = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_save_and_find() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();

        let mut config = BridgeConfig::default();
        config.pool.channel_max = 7;
        config.save(&dir.path().join(CONFIG_FILE_NAME)).unwrap();

        let found = BridgeConfig::find_and_load(&nested).unwrap();
        assert_eq!(found, config);
    }

    #[test]
    fn test_missing_file() {
        let result = BridgeConfig::load(Path::new("/nonexistent/netbridge.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }
}
