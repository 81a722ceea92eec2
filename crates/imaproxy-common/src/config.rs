//! Configuration for IMAProxy

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Listener TLS configuration
    #[serde(default)]
    pub tls: TlsConfig,

    /// Process configuration (workers, privilege drop)
    #[serde(default)]
    pub process: ProcessConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Plugin configuration
    #[serde(default)]
    pub plugins: PluginConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            tls: TlsConfig::default(),
            process: ProcessConfig::default(),
            logging: LoggingConfig::default(),
            plugins: PluginConfig::default(),
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Upstream IMAP server URL (`imap:`, `imaps:`, `tls:` or `ssl:` scheme)
    #[serde(default = "default_imap_server")]
    pub imap_server: String,

    /// Local TCP port to listen on
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,

    /// Seconds between TCP keepalive probes on the upstream side (0 = off)
    #[serde(default)]
    pub keep_alive: u64,

    /// Do not verify the upstream certificate
    #[serde(default)]
    pub tls_nocheck_certs: bool,

    /// Emit per-connection lifecycle log lines
    #[serde(default = "default_connection_log")]
    pub connection_log: bool,

    /// Upstream read timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            imap_server: default_imap_server(),
            bind_port: default_bind_port(),
            keep_alive: 0,
            tls_nocheck_certs: false,
            connection_log: default_connection_log(),
            upstream_timeout_secs: default_upstream_timeout(),
        }
    }
}

fn default_imap_server() -> String {
    "imap://localhost:143".to_string()
}

fn default_bind_port() -> u16 {
    8143
}

fn default_connection_log() -> bool {
    true
}

fn default_upstream_timeout() -> u64 {
    1800
}

/// Listener TLS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Listen with TLS
    #[serde(default)]
    pub ssl: bool,

    /// Path to the PEM private key
    pub ssl_key: Option<PathBuf>,

    /// Path to the PEM certificate
    pub ssl_cert: Option<PathBuf>,

    /// Path to the PEM CA bundle appended to the served chain
    pub ssl_ca: Option<PathBuf>,
}

/// Process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// If greater than zero, pre-fork that many worker processes
    #[serde(default)]
    pub workers: u32,

    /// Drop to this UID after binding the listen port
    pub user_uid: Option<u32>,

    /// Drop to this GID after binding the listen port
    pub user_gid: Option<u32>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Prefix log lines with ANSI color codes
    #[serde(default = "default_use_colors")]
    pub use_colors: bool,

    /// Let plugins log internal state
    #[serde(default)]
    pub debug_log: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            use_colors: default_use_colors(),
            debug_log: false,
        }
    }
}

fn default_use_colors() -> bool {
    true
}

/// Plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Plugins to attach to each connection, in order
    #[serde(default = "default_enabled_plugins")]
    pub enabled: Vec<String>,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_plugins(),
        }
    }
}

fn default_enabled_plugins() -> Vec<String> {
    vec!["capability-rewriter".to_string(), "folder-filter".to_string()]
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Load configuration from the default locations, falling back to
    /// built-in defaults when no file exists
    pub fn load() -> crate::Result<Self> {
        let paths = [
            std::path::PathBuf::from("./imaproxy.toml"),
            std::path::PathBuf::from("/etc/imaproxy/imaproxy.toml"),
        ];

        for path in paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Config::default())
    }
}
