use crate::reconcile::LoopSettings;
use crate::runner::ChannelPreference;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Picked up from the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "telewrap.toml";

/// Lower bound for the update cadence, in seconds.
const MIN_UPDATE_INTERVAL: f64 = 0.5;
/// Upper bound for the update cadence, in seconds.
const MAX_UPDATE_INTERVAL: f64 = 86_400.0;

/// Top-level configuration loaded from telewrap.toml (or a YAML file).
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WrapperConfig {
    pub telegram: TelegramConfig,
    pub settings: SettingsConfig,
    pub push: PushConfig,
    pub files: FilesConfig,
    pub process: ProcessConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct TelegramConfig {
    pub token: Option<String>,
    /// Numeric chat id. Accepted as a TOML/YAML integer or string.
    #[serde(deserialize_with = "string_or_int")]
    pub chat_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Seconds between reconciliation cycles.
    pub update_interval: f64,
    pub log_buffer_size: usize,
    /// Seconds without remote interaction before Zombie mode closes itself.
    pub zombie_idle_timeout: Option<f64>,
    /// Mirror child output on local stdout.
    pub echo_output: bool,
    pub channel: ChannelPreference,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PushConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FilesConfig {
    /// Directory offered for downloads. Defaults to the working directory.
    pub directory: Option<PathBuf>,
    pub recent_limit: usize,
    pub include_hidden: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// After a terminate, a child still alive this long is killed.
    pub terminate_grace_secs: u64,
}

// --- Default implementations ---

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            update_interval: 5.0,
            log_buffer_size: 50,
            zombie_idle_timeout: None,
            echo_output: true,
            channel: ChannelPreference::Auto,
        }
    }
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 5000,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            directory: None,
            recent_limit: 5,
            include_hidden: false,
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            terminate_grace_secs: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Telegram token is required (--token, config file, or TELEGRAM_TOKEN)")]
    MissingToken,

    #[error("Telegram chat id is required (--chat-id, config file, or TELEGRAM_CHAT_ID)")]
    MissingChatId,

    #[error("chat id must be numeric, got {0:?}")]
    InvalidChatId(String),
}

/// Resolved Telegram credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub chat_id: i64,
}

impl WrapperConfig {
    /// Load from `path`. `.yaml`/`.yml` files are parsed as YAML, anything else as TOML.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        );
        if is_yaml {
            serde_yaml::from_str(&contents).map_err(|source| ConfigError::Yaml {
                path: path.to_path_buf(),
                source,
            })
        } else {
            toml::from_str(&contents).map_err(|source| ConfigError::Toml {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    /// Load the explicit file, or `telewrap.toml` in `cwd` if present, or defaults.
    pub fn discover(explicit: Option<&Path>, cwd: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        let implicit = cwd.join(DEFAULT_CONFIG_FILE);
        if implicit.is_file() {
            tracing::debug!(path = %implicit.display(), "using config from working directory");
            return Self::load(&implicit);
        }
        Ok(Self::default())
    }

    /// Fill credentials the file left unset from the environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if self.telegram.token.is_none() {
            self.telegram.token = var("TELEGRAM_TOKEN");
        }
        if self.telegram.chat_id.is_none() {
            self.telegram.chat_id = var("TELEGRAM_CHAT_ID").or_else(|| var("CHAT_ID"));
        }
    }

    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        let token = self
            .telegram
            .token
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(ConfigError::MissingToken)?;
        let raw_chat = self
            .telegram
            .chat_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or(ConfigError::MissingChatId)?;
        let chat_id = raw_chat
            .parse::<i64>()
            .map_err(|_| ConfigError::InvalidChatId(raw_chat.to_string()))?;

        Ok(Credentials {
            token: token.to_string(),
            chat_id,
        })
    }

    /// Cadence between cycles, clamped to half a second .. one day.
    pub fn update_interval(&self) -> Duration {
        let secs = self.settings.update_interval;
        let secs = if secs.is_finite() {
            secs.clamp(MIN_UPDATE_INTERVAL, MAX_UPDATE_INTERVAL)
        } else {
            SettingsConfig::default().update_interval
        };
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::from_secs(5))
    }

    /// `None` when unset, zero, negative, or too large to represent.
    pub fn zombie_idle_timeout(&self) -> Option<Duration> {
        self.settings
            .zombie_idle_timeout
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    pub fn loop_settings(&self, cwd: &Path) -> LoopSettings {
        let files_dir = match &self.files.directory {
            Some(dir) => cwd.join(dir),
            None => cwd.to_path_buf(),
        };

        LoopSettings {
            update_interval: self.update_interval(),
            log_buffer_size: self.settings.log_buffer_size.max(1),
            zombie_idle_timeout: self.zombie_idle_timeout(),
            echo_output: self.settings.echo_output,
            terminate_grace: Duration::from_secs(self.process.terminate_grace_secs),
            push_max_attempts: self.push.max_attempts.max(1),
            push_initial_backoff: Duration::from_millis(self.push.initial_backoff_ms),
            push_max_backoff: Duration::from_millis(self.push.max_backoff_ms),
            files_dir,
            files_limit: self.files.recent_limit,
            include_hidden: self.files.include_hidden,
        }
    }
}

fn string_or_int<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(i64),
        Str(String),
    }

    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Int(n) => n.to_string(),
        Raw::Str(s) => s,
    }))
}
