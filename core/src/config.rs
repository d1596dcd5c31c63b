//! Service configuration.
//!
//! Loaded from TOML at `~/.config/vigil/config.toml` (overridable with the
//! `VIGIL_CONFIG` environment variable or an explicit path). Every field has
//! a serde default so a missing file or a partial document still yields a
//! runnable configuration.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::Deserialize;
use serde::Serialize;
use vigil_protocol::BroadcastPayload;

use crate::error::Result;
use crate::error::SwitchError;

pub const CONFIG_ENV_VAR: &str = "VIGIL_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VigilConfig {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub timer: TimerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Unix socket the daemon listens on.
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    /// How often the expiration poller wakes up.
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimerConfig {
    /// Window granted by every reset.
    #[serde(default = "default_reset_window_seconds")]
    pub reset_window_seconds: i64,
    /// Length of the grace countdown once armed.
    #[serde(default = "default_grace_window_seconds")]
    pub grace_window_seconds: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// `sqlite` or `memory`.
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Operators allowed to log in.
    #[serde(default)]
    pub operators: Vec<OperatorConfig>,
    /// Validity window of an issued session token.
    #[serde(default = "default_session_ttl_seconds")]
    pub session_ttl_seconds: i64,
    /// Shared credential for `switch.claim` callers. Unset disables them;
    /// the in-process poller does not need it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperatorConfig {
    pub identity: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BroadcastConfig {
    /// Webhook the terminal broadcast is POSTed to. Unset means every
    /// broadcast attempt is recorded as failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_publish_timeout_seconds")]
    pub timeout_seconds: u64,
    /// Pool the armed payload is drawn from, uniformly at random.
    #[serde(default = "default_candidates")]
    pub candidates: Vec<BroadcastPayload>,
}

fn default_socket_path() -> PathBuf {
    vigil_data_dir().join("vigil.sock")
}

fn default_poll_interval_seconds() -> u64 {
    2
}

fn default_reset_window_seconds() -> i64 {
    // Seven days.
    604_800
}

fn default_grace_window_seconds() -> i64 {
    // One hour.
    3_600
}

fn default_storage_backend() -> String {
    "sqlite".to_string()
}

fn default_db_path() -> PathBuf {
    vigil_data_dir().join("vigil.db")
}

fn default_session_ttl_seconds() -> i64 {
    3_600
}

fn default_publish_timeout_seconds() -> u64 {
    10
}

fn default_candidates() -> Vec<BroadcastPayload> {
    vec![BroadcastPayload {
        text: "The operators of this switch have gone silent.".to_string(),
        url: String::new(),
    }]
}

/// Data directory for the socket and the default database.
pub fn vigil_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vigil")
}

fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR)
        && !path.is_empty()
    {
        return PathBuf::from(path);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vigil")
        .join("config.toml")
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            poll_interval_seconds: default_poll_interval_seconds(),
        }
    }
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            reset_window_seconds: default_reset_window_seconds(),
            grace_window_seconds: default_grace_window_seconds(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            path: default_db_path(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            operators: Vec::new(),
            session_ttl_seconds: default_session_ttl_seconds(),
            service_token: None,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_seconds: default_publish_timeout_seconds(),
            candidates: default_candidates(),
        }
    }
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            timer: TimerConfig::default(),
            storage: StorageConfig::default(),
            auth: AuthConfig::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

impl VigilConfig {
    /// Load from `path`, or from `VIGIL_CONFIG` / the default location when
    /// `path` is `None`. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map_or_else(default_config_path, Path::to_path_buf);
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }
        let raw = std::fs::read_to_string(&path).map_err(|e| {
            SwitchError::config_with(
                format!("failed to read {}", path.display()),
                Box::new(e),
            )
        })?;
        let config = Self::parse(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|e| SwitchError::config_with("invalid config file", Box::new(e)))
    }

    /// Reject configurations that cannot run; warn about the merely dubious.
    pub fn validate(&self) -> Result<()> {
        if self.timer.reset_window_seconds <= 0 {
            return Err(SwitchError::config("timer.reset_window_seconds must be positive"));
        }
        if self.timer.grace_window_seconds <= 0 {
            return Err(SwitchError::config("timer.grace_window_seconds must be positive"));
        }
        if self.service.poll_interval_seconds == 0 {
            return Err(SwitchError::config("service.poll_interval_seconds must be positive"));
        }
        if self.auth.session_ttl_seconds <= 0 {
            return Err(SwitchError::config("auth.session_ttl_seconds must be positive"));
        }
        if self.broadcast.candidates.is_empty() {
            return Err(SwitchError::config("broadcast.candidates must not be empty"));
        }
        match self.storage.backend.as_str() {
            "sqlite" | "memory" => {}
            other => {
                return Err(SwitchError::config(format!(
                    "unknown storage backend '{other}' (expected 'sqlite' or 'memory')"
                )));
            }
        }
        if self.auth.operators.is_empty() {
            tracing::warn!("no operators configured; auth.login will always fail");
        }
        if self.broadcast.endpoint.is_none() {
            tracing::warn!(
                "broadcast.endpoint not set; a lapsed grace cycle will be recorded as failed"
            );
        }
        Ok(())
    }

    pub fn reset_window(&self) -> Duration {
        Duration::seconds(self.timer.reset_window_seconds)
    }

    pub fn grace_window(&self) -> Duration {
        Duration::seconds(self.timer.grace_window_seconds)
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(self.auth.session_ttl_seconds)
    }

    pub fn poll_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.service.poll_interval_seconds)
    }

    pub fn publish_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.broadcast.timeout_seconds)
    }
}
