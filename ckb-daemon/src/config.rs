//! Daemon configuration (spec §6.4). Loaded from a TOML file the same way
//! `helix::config::Config::load` reads `~/.helix.toml`, with an environment
//! override layered on afterward.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_debounce_ms() -> u64 {
    300
}
fn default_check_interval_secs() -> u64 {
    60
}
fn default_worker_count() -> usize {
    2
}
fn default_retry_interval_secs() -> u64 {
    60
}
fn default_webhook_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_seconds() -> u64 {
    60
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            enabled: true,
            debounce_ms: default_debounce_ms(),
            ignore_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhooksConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        WebhooksConfig {
            worker_count: default_worker_count(),
            retry_interval_secs: default_retry_interval_secs(),
            timeout_secs: default_webhook_timeout_secs(),
            max_retries: default_max_retries(),
            retry_delay_seconds: default_retry_delay_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub token_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub webhooks: WebhooksConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub shutdown_timeout_secs: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            bind: default_bind(),
            port: default_port(),
            watch: WatchConfig::default(),
            scheduler: SchedulerConfig::default(),
            webhooks: WebhooksConfig::default(),
            auth: AuthConfig::default(),
            shutdown_timeout_secs: None,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, falling back to defaults if it doesn't exist, then
    /// apply the `CKB_DAEMON_TOKEN` environment override.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let s = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&s).with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            DaemonConfig::default()
        };

        cfg.apply_env_overrides();
        Ok(cfg)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("CKB_DAEMON_TOKEN") {
            self.auth.token = Some(token);
            self.auth.enabled = true;
        }
    }

    pub fn resolved_token(&self) -> Result<Option<String>> {
        if let Some(token) = &self.auth.token {
            return Ok(Some(token.clone()));
        }
        if let Some(token_file) = &self.auth.token_file {
            let token = std::fs::read_to_string(token_file)
                .with_context(|| format!("failed to read token file {}", token_file))?;
            return Ok(Some(token.trim().to_string()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let cfg = DaemonConfig::load(&dir.path().join("nope.toml"))?;
        assert_eq!(cfg.port, 8090);
        assert_eq!(cfg.webhooks.max_retries, 3);
        Ok(())
    }

    #[test]
    fn partial_config_fills_defaults() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = 9999\n")?;
        let cfg = DaemonConfig::load(&path)?;
        assert_eq!(cfg.port, 9999);
        assert_eq!(cfg.bind, "127.0.0.1");
        assert_eq!(cfg.scheduler.check_interval_secs, 60);
        Ok(())
    }

    #[test]
    fn env_override_sets_token_and_enables_auth() -> Result<()> {
        let dir = TempDir::new()?;
        std::env::set_var("CKB_DAEMON_TOKEN", "s3cr3t");
        let cfg = DaemonConfig::load(&dir.path().join("nope.toml"))?;
        assert_eq!(cfg.auth.token.as_deref(), Some("s3cr3t"));
        assert!(cfg.auth.enabled);
        std::env::remove_var("CKB_DAEMON_TOKEN");
        Ok(())
    }
}
