use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::notifications::ReconnectPolicy;

pub const ENV_CONFIG_FILE: &str = "INCIDENT_DESK_CONFIG";
pub const ENV_API_URL: &str = "INCIDENT_DESK_API_URL";
pub const ENV_WS_URL: &str = "INCIDENT_DESK_WS_URL";
pub const ENV_STORE_PATH: &str = "INCIDENT_DESK_STORE";
pub const ENV_USE_KEYRING: &str = "INCIDENT_DESK_USE_KEYRING";
pub const ENV_USERNAME: &str = "INCIDENT_DESK_USERNAME";
pub const ENV_PASSWORD: &str = "INCIDENT_DESK_PASSWORD";

pub const KEY_ACCESS_TOKEN: &str = "access_token";
pub const KEY_REFRESH_TOKEN: &str = "refresh_token";
pub const KEY_USER: &str = "user";
pub const KEY_USER_TYPE: &str = "user_type";

pub const PATH_LOGIN: &str = "/auth/login/";
pub const PATH_LOGOUT: &str = "/auth/logout/";
pub const PATH_PROFILE: &str = "/auth/profile/";
pub const PATH_TOKEN_REFRESH: &str = "/auth/token/refresh/";
pub const PATH_NOTIFICATIONS: &str = "/notifications/";

const DEFAULT_API_URL: &str = "http://localhost:8000/api";
const DEFAULT_WS_URL: &str = "ws://localhost:8000/ws/notifications/";
const APP_DIR: &str = "incident-desk";
const STORE_FILE: &str = "session.json";
const USER_AGENT: &str = concat!("incident-desk/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("invalid config file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },
  #[error("invalid url for {field}: {value}")]
  InvalidUrl { field: &'static str, value: String },
}

/// On-disk shape; every field is optional so a file only has to name what it overrides.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ConfigFile {
  api_base_url: Option<String>,
  ws_url: Option<String>,
  store_path: Option<PathBuf>,
  use_keyring: Option<bool>,
  request_timeout_seconds: Option<u64>,
  ping_interval_seconds: Option<u64>,
  reconnect_base_delay_ms: Option<u64>,
  reconnect_max_delay_ms: Option<u64>,
  max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
  pub api_base_url: String,
  pub ws_url: String,
  pub store_path: PathBuf,
  /// Keep the session in the OS keychain instead of `store_path`.
  pub use_keyring: bool,
  pub user_agent: String,
  pub request_timeout: Duration,
  pub ping_interval: Duration,
  pub reconnect: ReconnectPolicy,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      api_base_url: DEFAULT_API_URL.to_string(),
      ws_url: DEFAULT_WS_URL.to_string(),
      store_path: default_store_path(read_env),
      use_keyring: false,
      user_agent: USER_AGENT.to_string(),
      request_timeout: Duration::from_secs(30),
      ping_interval: Duration::from_secs(30),
      reconnect: ReconnectPolicy::default(),
    }
  }
}

impl ClientConfig {
  /// Defaults, then `INCIDENT_DESK_CONFIG` (if set), then individual env overrides.
  pub fn load() -> Result<Self, ConfigError> {
    let mut config = Self::default();
    if let Some(path) = read_env(ENV_CONFIG_FILE) {
      config = config.merge_file(Path::new(&path))?;
    }
    config.apply_env(read_env);
    config.validate()?;
    Ok(config)
  }

  pub fn merge_file(self, path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let file: ConfigFile = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
      path: path.to_path_buf(),
      source,
    })?;
    Ok(self.merge(file))
  }

  fn merge(mut self, file: ConfigFile) -> Self {
    if let Some(v) = file.api_base_url {
      self.api_base_url = v;
    }
    if let Some(v) = file.ws_url {
      self.ws_url = v;
    }
    if let Some(v) = file.store_path {
      self.store_path = v;
    }
    if let Some(v) = file.use_keyring {
      self.use_keyring = v;
    }
    if let Some(v) = file.request_timeout_seconds {
      self.request_timeout = Duration::from_secs(v.max(1));
    }
    if let Some(v) = file.ping_interval_seconds {
      self.ping_interval = Duration::from_secs(v.max(1));
    }
    if let Some(v) = file.reconnect_base_delay_ms {
      self.reconnect.base_delay = Duration::from_millis(v.max(1));
    }
    if let Some(v) = file.reconnect_max_delay_ms {
      self.reconnect.max_delay = Duration::from_millis(v.max(1));
    }
    if let Some(v) = file.max_reconnect_attempts {
      self.reconnect.max_attempts = v;
    }
    self
  }

  fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup(ENV_API_URL) {
      self.api_base_url = v;
    }
    if let Some(v) = lookup(ENV_WS_URL) {
      self.ws_url = v;
    }
    if let Some(v) = lookup(ENV_STORE_PATH) {
      self.store_path = PathBuf::from(v);
    }
    if let Some(v) = lookup(ENV_USE_KEYRING) {
      self.use_keyring = matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    check_url("api_base_url", &self.api_base_url, &["http", "https"])?;
    check_url("ws_url", &self.ws_url, &["ws", "wss"])?;
    Ok(())
  }
}

fn check_url(field: &'static str, value: &str, schemes: &[&str]) -> Result<(), ConfigError> {
  match url::Url::parse(value) {
    Ok(u) if schemes.contains(&u.scheme()) => Ok(()),
    _ => Err(ConfigError::InvalidUrl {
      field,
      value: value.to_string(),
    }),
  }
}

/// Per-user data directory: `$XDG_DATA_HOME`, then `~/.local/share`, then
/// `%APPDATA%`. Falls back to the working directory when none is set.
fn default_store_path(lookup: impl Fn(&str) -> Option<String>) -> PathBuf {
  let base = lookup("XDG_DATA_HOME")
    .map(PathBuf::from)
    .filter(|p| p.is_absolute())
    .or_else(|| lookup("HOME").map(|home| PathBuf::from(home).join(".local").join("share")))
    .or_else(|| lookup("APPDATA").map(PathBuf::from));
  match base {
    Some(dir) => dir.join(APP_DIR).join(STORE_FILE),
    None => PathBuf::from(format!("{APP_DIR}-{STORE_FILE}")),
  }
}

fn read_env(key: &str) -> Option<String> {
  let v = std::env::var(key).ok()?;
  let trimmed = v.trim();
  if trimmed.is_empty() {
    None
  } else {
    Some(trimmed.to_string())
  }
}
