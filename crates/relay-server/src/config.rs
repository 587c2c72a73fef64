//! Server configuration.
//!
//! Configuration is layered, lowest precedence first:
//! - Built-in defaults
//! - TOML configuration file
//! - Environment variables (`RELAY_*`, nested keys separated by `__`)
//! - Command line arguments

use anyhow::{Context, Result};
use relay_core::{HubConfig, QueuePolicy};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Files searched when no explicit path is given.
const DEFAULT_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Hub configuration.
    #[serde(default)]
    pub hub: HubSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the STOMP WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Directory served for every other path, if set.
    #[serde(default)]
    pub static_dir: Option<PathBuf>,
}

/// Subscription queue kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueKind {
    #[default]
    Unbounded,
    Blocking,
    DropNewest,
}

/// Hub configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSection {
    /// Subscription queue kind.
    #[serde(default)]
    pub queue: QueueKind,

    /// Capacity of bounded subscription queues.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Depth of the hub's command channel.
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,

    /// Destinations registered at startup.
    #[serde(default)]
    pub destinations: Vec<String>,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default)]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_ws_path() -> String {
    "/stomp".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_command_capacity() -> usize {
    1024
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            hub: HubSection::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            static_dir: None,
        }
    }
}

impl Default for HubSection {
    fn default() -> Self {
        Self {
            queue: QueueKind::default(),
            queue_capacity: default_queue_capacity(),
            command_capacity: default_command_capacity(),
            destinations: Vec::new(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, or from the first default path that
    /// exists, with environment overrides on top.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit file is missing, or if any source
    /// cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        match path {
            Some(path) => {
                builder = builder.add_source(
                    config::File::from(path)
                        .format(config::FileFormat::Toml)
                        .required(true),
                );
            }
            None => {
                if let Some(found) = Self::find_default_file() {
                    tracing::debug!(path = %found.display(), "Using config file");
                    builder = builder.add_source(
                        config::File::from(found.as_path()).format(config::FileFormat::Toml),
                    );
                }
            }
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("RELAY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to load configuration")?;

        settings
            .try_deserialize()
            .context("Invalid configuration")
    }

    fn find_default_file() -> Option<PathBuf> {
        DEFAULT_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listen address: {}:{}", self.host, self.port))
    }

    /// The subscription queue policy selected by `hub.queue`.
    #[must_use]
    pub fn queue_policy(&self) -> QueuePolicy {
        match self.hub.queue {
            QueueKind::Unbounded => QueuePolicy::Unbounded,
            QueueKind::Blocking => QueuePolicy::Blocking(self.hub.queue_capacity),
            QueueKind::DropNewest => QueuePolicy::DropNewest(self.hub.queue_capacity),
        }
    }

    /// Hub settings derived from this configuration.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            queue_policy: self.queue_policy(),
            command_capacity: self.hub.command_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 8080);
        assert_eq!(config.transport.websocket_path, "/stomp");
        assert_eq!(config.queue_policy(), QueuePolicy::Unbounded);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        assert_eq!(config.bind_addr().unwrap().port(), 8080);

        let bad = Config {
            host: "not a host".to_string(),
            ..Config::default()
        };
        assert!(bad.bind_addr().is_err());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [hub]
            queue = "drop-newest"
            queue_capacity = 16
            destinations = ["/topic/news", "/queue/jobs"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.queue_policy(), QueuePolicy::DropNewest(16));
        assert_eq!(config.hub.destinations.len(), 2);
        assert_eq!(config.hub_config().command_capacity, 1024);
    }

    #[test]
    fn test_load_explicit_file() {
        let path = std::env::temp_dir().join(format!("relay-test-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "port = 7000\n[hub]\nqueue = \"blocking\"\nqueue_capacity = 8\n",
        )
        .unwrap();

        let loaded = Config::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded.port, 7000);
        assert_eq!(loaded.queue_policy(), QueuePolicy::Blocking(8));
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let path = Path::new("/nonexistent/relay.toml");
        assert!(Config::load(Some(path)).is_err());
    }
}
