//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Caller keys are loaded from the AUTHORIZATION env var or
//! `authorization_file`, never stored in the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

/// Inbound listener settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Optional path segment in front of the chat and token routes
    pub api_prefix: Option<String>,
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5005)),
            api_prefix: None,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// `api_prefix` as a route prefix: empty, or `/segment` with no trailing slash.
    pub fn route_prefix(&self) -> String {
        match self.api_prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(p) if !p.is_empty() => format!("/{p}"),
            _ => String::new(),
        }
    }
}

/// Upstream chat backend settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    pub stream_idle_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://chatgpt.com".into(),
            timeout_secs: 60,
            stream_idle_timeout_secs: 60,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                         (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36"
                .into(),
        }
    }
}

impl UpstreamConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_secs)
    }
}

/// Credential pool and retry settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub token_file: PathBuf,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub scheduled_refresh: bool,
    pub refresh_interval_secs: u64,
    pub revalidate_after_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            token_file: PathBuf::from("data/token.txt"),
            max_retries: 3,
            retry_backoff_ms: 100,
            scheduled_refresh: false,
            refresh_interval_secs: 4 * 24 * 60 * 60,
            revalidate_after_secs: 60 * 60,
        }
    }
}

/// Passthrough gateway settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub redirect_prefix: String,
    pub seed_cookie: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redirect_prefix: "c/".into(),
            seed_cookie: "seed_token".into(),
        }
    }
}

/// Caller key allow-list
#[derive(Debug, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(skip)]
    pub authorization: Vec<Secret<String>>,
    /// File with one caller key per line (alternative to AUTHORIZATION env var)
    #[serde(default)]
    pub authorization_file: Option<PathBuf>,
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_keys<'a>(items: impl Iterator<Item = &'a str>) -> Vec<Secret<String>> {
    items
        .map(str::trim)
        .filter(|k| !k.is_empty() && !k.starts_with('#'))
        .map(|k| Secret::new(k.to_owned()))
        .collect()
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Environment overrides: API_PREFIX, SCHEDULED_REFRESH, ENABLE_GATEWAY.
    /// Caller key resolution order:
    /// 1. AUTHORIZATION env var (comma separated)
    /// 2. authorization_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> common::Result<()> {
        if let Ok(prefix) = std::env::var("API_PREFIX") {
            self.server.api_prefix = Some(prefix);
        }
        if let Some(flag) = env_flag("SCHEDULED_REFRESH") {
            self.pool.scheduled_refresh = flag;
        }
        if let Some(flag) = env_flag("ENABLE_GATEWAY") {
            self.gateway.enabled = flag;
        }

        if let Ok(keys) = std::env::var("AUTHORIZATION") {
            self.auth.authorization = parse_keys(keys.split(','));
        } else if let Some(ref key_file) = self.auth.authorization_file {
            let keys = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read authorization_file {}: {e}",
                    key_file.display()
                ))
            })?;
            self.auth.authorization = parse_keys(keys.lines());
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        let base = &self.upstream.base_url;
        if !base.starts_with("http://") && !base.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {base}"
            )));
        }
        if self.upstream.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }
        if self.upstream.stream_idle_timeout_secs == 0 {
            return Err(common::Error::Config(
                "stream_idle_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if self.pool.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be greater than 0".into(),
            ));
        }
        if self.pool.scheduled_refresh && self.pool.refresh_interval_secs == 0 {
            return Err(common::Error::Config(
                "refresh_interval_secs must be greater than 0 when scheduled_refresh is on".into(),
            ));
        }
        if let Some(prefix) = self.server.api_prefix.as_deref()
            && prefix.chars().any(|c| c.is_whitespace() || c == '?' || c == '#')
        {
            return Err(common::Error::Config(format!(
                "api_prefix must be a plain path segment, got: {prefix:?}"
            )));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("chat-gateway.toml")
    }
}
