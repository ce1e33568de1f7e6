//! Configuration for fleet, read from `.fleet/fleet.toml`.
//!
//! Layering is file → environment → CLI. Secrets fall back to the
//! environment when the file leaves them unset; `FLEET_DB_PATH` and
//! `FLEET_PORT` override the file.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 3000
//!
//! [database]
//! path = ".fleet/fleet.db"
//!
//! [provider]
//! base_url = "https://cloud.blackbox.ai"
//! request_timeout_secs = 30
//!
//! [webhooks]
//! deduplicate = true
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::hub::gateway;
use crate::hub::github;

pub const CONFIG_FILE: &str = "fleet.toml";
pub const DEFAULT_CONFIG_DIR: &str = ".fleet";

pub const ENV_API_KEY: &str = "BLACKBOX_API_KEY";
pub const ENV_WEBHOOK_SECRET: &str = "BLACKBOX_WEBHOOK_SECRET";
pub const ENV_DB_PATH: &str = "FLEET_DB_PATH";
pub const ENV_PORT: &str = "FLEET_PORT";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Permissive CORS for a separately served dashboard.
    pub dev_mode: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            dev_mode: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".fleet/fleet.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSection {
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub wait_timeout_secs: u64,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: gateway::DEFAULT_BASE_URL.to_string(),
            api_key: None,
            request_timeout_secs: gateway::DEFAULT_REQUEST_TIMEOUT.as_secs(),
            poll_interval_secs: gateway::DEFAULT_POLL_INTERVAL.as_secs(),
            wait_timeout_secs: gateway::DEFAULT_WAIT_TIMEOUT.as_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhooksSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Skip replayed started/completed/failed/cancelled deliveries.
    pub deduplicate: bool,
}

impl Default for WebhooksSection {
    fn default() -> Self {
        Self {
            secret: None,
            deduplicate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GithubSection {
    pub api_url: String,
}

impl Default for GithubSection {
    fn default() -> Self {
        Self {
            api_url: github::DEFAULT_API_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
    /// Directory for a daily rolling log file, in addition to stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            dir: None,
        }
    }
}

/// The complete fleet.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetToml {
    pub server: ServerSection,
    pub database: DatabaseSection,
    pub provider: ProviderSection,
    pub webhooks: WebhooksSection,
    pub github: GithubSection,
    pub logging: LoggingSection,
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl FleetToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse fleet.toml")
    }

    /// Load `<dir>/fleet.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Render for `fleet config show`. Secrets are never part of the output.
    pub fn to_toml_string(&self) -> Result<String> {
        let mut redacted = self.clone();
        redacted.provider.api_key = None;
        redacted.webhooks.secret = None;
        toml::to_string_pretty(&redacted).context("Failed to serialize fleet.toml")
    }

    pub fn api_key(&self) -> Option<String> {
        self.provider
            .api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| env_non_empty(ENV_API_KEY))
    }

    pub fn webhook_secret(&self) -> Option<String> {
        self.webhooks
            .secret
            .clone()
            .filter(|s| !s.is_empty())
            .or_else(|| env_non_empty(ENV_WEBHOOK_SECRET))
    }

    pub fn db_path(&self) -> PathBuf {
        env_non_empty(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| self.database.path.clone())
    }

    /// Port from `FLEET_PORT` when it parses, else the file value.
    pub fn port(&self) -> u16 {
        match env_non_empty(ENV_PORT).map(|p| p.parse::<u16>()) {
            Some(Ok(port)) => port,
            Some(Err(_)) => {
                tracing::warn!(var = ENV_PORT, "ignoring unparseable port");
                self.server.port
            }
            None => self.server.port,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_secs.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.provider.poll_interval_secs.max(1))
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.wait_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = FleetToml::parse("").unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.path, PathBuf::from(".fleet/fleet.db"));
        assert_eq!(config.provider.base_url, "https://cloud.blackbox.ai");
        assert_eq!(config.provider.request_timeout_secs, 30);
        assert!(config.webhooks.deduplicate);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = FleetToml::parse(
            r#"
            [server]
            port = 8080

            [webhooks]
            deduplicate = false

            [logging]
            format = "json"
            level = "fleet=debug"
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert!(!config.webhooks.deduplicate);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "fleet=debug");
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        assert!(FleetToml::parse("[server\nport = ").is_err());
        assert!(FleetToml::parse("[server]\nport = \"eighty\"").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = FleetToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_load_or_default_reads_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "[database]\npath = \"/var/lib/fleet/fleet.db\"\n",
        )
        .unwrap();
        let config = FleetToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/fleet/fleet.db"));
    }

    #[test]
    fn test_secret_file_value_wins_over_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_WEBHOOK_SECRET).ok();
        unsafe { std::env::set_var(ENV_WEBHOOK_SECRET, "from-env") };

        let from_file = FleetToml::parse("[webhooks]\nsecret = \"from-file\"").unwrap();
        assert_eq!(from_file.webhook_secret().as_deref(), Some("from-file"));
        let unset = FleetToml::default();
        assert_eq!(unset.webhook_secret().as_deref(), Some("from-env"));

        match saved {
            Some(val) => unsafe { std::env::set_var(ENV_WEBHOOK_SECRET, val) },
            None => unsafe { std::env::remove_var(ENV_WEBHOOK_SECRET) },
        }
    }

    #[test]
    fn test_port_env_override() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_PORT).ok();
        let config = FleetToml::default();

        unsafe { std::env::set_var(ENV_PORT, "4100") };
        assert_eq!(config.port(), 4100);
        unsafe { std::env::set_var(ENV_PORT, "not-a-port") };
        assert_eq!(config.port(), 3000);
        unsafe { std::env::remove_var(ENV_PORT) };
        assert_eq!(config.port(), 3000);

        if let Some(val) = saved {
            unsafe { std::env::set_var(ENV_PORT, val) };
        }
    }

    #[test]
    fn test_show_redacts_secrets() {
        let mut config = FleetToml::default();
        config.provider.api_key = Some("bb-secret-key".to_string());
        config.webhooks.secret = Some("whsec".to_string());
        let rendered = config.to_toml_string().unwrap();
        assert!(!rendered.contains("bb-secret-key"));
        assert!(!rendered.contains("whsec"));
        assert!(rendered.contains("[server]"));
    }
}
