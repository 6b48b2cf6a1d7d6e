// src/config/mod.rs - Typed configuration tree with snapshot-based reload

use anyhow::{Context, Result};
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;

use crate::types::TextOrList;

/// Validation failures rejected at load/reload time so they can never
/// surface in the middle of a dispatch.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("no channels configured")]
    NoChannels,
    #[error("periodic message '{0}' has a zero interval")]
    ZeroInterval(String),
}

/// Greeting payload for one greetings-table entry. Keys of the table are
/// lower-cased usernames plus the fallback keys `default`, `default_mod`,
/// `default_vip` and `first_time_chatter`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Greeting {
    #[serde(default)]
    pub chat: Option<TextOrList>,
    #[serde(default)]
    pub media: Option<TextOrList>,
    /// Shout-out command template, only honored on exact-username entries.
    #[serde(default)]
    pub shoutout: Option<String>,
}

/// A forbidden-phrase rule: regex search over the sanitized text, firing any
/// configured subset of chat warning, timeout and ban.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForbiddenPhrase {
    pub pattern: String,
    #[serde(skip)]
    pub compiled: Option<Regex>,
    #[serde(default)]
    pub chat: Option<TextOrList>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub ban: bool,
}

/// A triggered-message rule: regex search firing chat (with capture-group
/// substitution), media playback and/or a delayed shout-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredMessage {
    pub pattern: String,
    #[serde(skip)]
    pub compiled: Option<Regex>,
    #[serde(default)]
    pub chat: Option<TextOrList>,
    #[serde(default)]
    pub media: Option<TextOrList>,
    #[serde(default)]
    pub shoutout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodicMessage {
    pub name: String,
    pub interval_minutes: u64,
    #[serde(default)]
    pub chat: Option<TextOrList>,
    #[serde(default)]
    pub media: Option<TextOrList>,
}

/// Alert templates fired when a `!timer` expires; `TIMERNAME` is replaced
/// with the timer's label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimerAlert {
    #[serde(default)]
    pub chat: Option<String>,
    #[serde(default)]
    pub media: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_overlay_port")]
    pub port: u16,
    /// When set, media playback routes to overlay `play_audio` events
    /// instead of the external player command.
    #[serde(default)]
    pub audio_file_path: Option<PathBuf>,
}

fn default_overlay_port() -> u16 {
    8888
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageLinkConfig {
    #[serde(default = "default_image_patterns")]
    pub patterns: Vec<String>,
    #[serde(skip)]
    pub compiled: Vec<Regex>,
    #[serde(default = "default_image_output")]
    pub output_file: PathBuf,
}

impl Default for ImageLinkConfig {
    fn default() -> Self {
        Self {
            patterns: default_image_patterns(),
            compiled: Vec::new(),
            output_file: default_image_output(),
        }
    }
}

fn default_image_patterns() -> Vec<String> {
    vec![
        r"^https://media\.giphy\.com/media/[a-zA-Z0-9]*/giphy\.gif$".to_string(),
        r"^https://media\.giphy\.com/media/[a-zA-Z0-9]*/giphy-downsized-large\.gif$".to_string(),
    ]
}

fn default_image_output() -> PathBuf {
    PathBuf::from("data/giphy_popup.html")
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

/// The full user-editable rule set, deserialized from YAML and validated
/// before it is ever installed as the live snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfig {
    pub bot_name: String,
    /// Opaque credential, may also come from the environment.
    #[serde(default)]
    pub oauth_token: String,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub admin_users: Vec<String>,
    #[serde(default)]
    pub ignore_users: Vec<String>,
    /// Named feature switches gating built-in commands. Absent means off.
    #[serde(default)]
    pub features: HashMap<String, bool>,
    #[serde(default)]
    pub greetings: HashMap<String, Greeting>,
    #[serde(default)]
    pub forbidden_phrases: Vec<ForbiddenPhrase>,
    #[serde(default)]
    pub triggered_messages: Vec<TriggeredMessage>,
    #[serde(default)]
    pub periodic_messages: Vec<PeriodicMessage>,
    /// Literal command text -> file whose random line becomes the reply.
    #[serde(default)]
    pub random_file_line_commands: HashMap<String, PathBuf>,
    /// Literal command word -> canned reply.
    #[serde(default)]
    pub response_commands: HashMap<String, TextOrList>,
    #[serde(default)]
    pub timer_alert: Option<TimerAlert>,
    /// External player invocation with `MEDIAFILE` and `USERNAME`
    /// placeholders, used when no overlay audio path is configured.
    #[serde(default)]
    pub media_player_command: Option<String>,
    #[serde(default)]
    pub overlay: Option<OverlayConfig>,
    #[serde(default)]
    pub image_link: ImageLinkConfig,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl BotConfig {
    /// Compile every regex-bearing rule and reject structural problems.
    /// Called once per load; a config that fails here is discarded whole.
    pub fn compile(&mut self) -> Result<(), ConfigError> {
        if self.channels.is_empty() {
            return Err(ConfigError::NoChannels);
        }
        for rule in &mut self.forbidden_phrases {
            rule.compiled = Some(compile_pattern(&rule.pattern)?);
        }
        for rule in &mut self.triggered_messages {
            rule.compiled = Some(compile_pattern(&rule.pattern)?);
        }
        self.image_link.compiled = self
            .image_link
            .patterns
            .iter()
            .map(|p| compile_pattern(p))
            .collect::<Result<_, _>>()?;
        for entry in &self.periodic_messages {
            if entry.interval_minutes == 0 {
                return Err(ConfigError::ZeroInterval(entry.name.clone()));
            }
        }
        Ok(())
    }

    pub fn primary_channel(&self) -> &str {
        self.channels.first().map(String::as_str).unwrap_or("")
    }

    pub fn feature_enabled(&self, name: &str) -> bool {
        self.features.get(name).copied().unwrap_or(false)
    }

    pub fn is_admin(&self, username: &str) -> bool {
        self.admin_users.iter().any(|u| u.eq_ignore_ascii_case(username))
    }

    pub fn is_ignored(&self, username: &str) -> bool {
        self.ignore_users.iter().any(|u| u.eq_ignore_ascii_case(username))
    }

    /// Resolve the greeting for a user. Chat and media fall through the
    /// precedence chain independently: exact username, then default_mod for
    /// mods, default_vip for VIPs, first_time_chatter for first-ever
    /// chatters, then default. Shout-outs only come from exact entries.
    pub fn resolve_greeting(
        &self,
        username: &str,
        is_mod: bool,
        is_vip: bool,
        first_time: bool,
    ) -> ResolvedGreeting<'_> {
        let by_name = self.greetings.get(&username.to_lowercase());
        let chain = [
            by_name,
            if is_mod { self.greetings.get("default_mod") } else { None },
            if is_vip { self.greetings.get("default_vip") } else { None },
            if first_time { self.greetings.get("first_time_chatter") } else { None },
            self.greetings.get("default"),
        ];
        ResolvedGreeting {
            chat: chain.iter().flatten().find_map(|g| g.chat.as_ref()),
            media: chain.iter().flatten().find_map(|g| g.media.as_ref()),
            shoutout: by_name.and_then(|g| g.shoutout.as_deref()),
        }
    }
}

fn compile_pattern(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[derive(Debug)]
pub struct ResolvedGreeting<'a> {
    pub chat: Option<&'a TextOrList>,
    pub media: Option<&'a TextOrList>,
    pub shoutout: Option<&'a str>,
}

/// Owner of the live configuration snapshot. Dispatches take one `Arc`
/// snapshot up front and keep using it; reload installs a new snapshot only
/// after the replacement parsed and validated, so a bad edit can never tear
/// an in-flight dispatch or take down a running bot.
pub struct ConfigManager {
    path: Option<PathBuf>,
    current: RwLock<Arc<BotConfig>>,
}

impl ConfigManager {
    /// First load. Errors here are fatal to startup.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let config = read_config(&path).await?;
        info!("config file '{}' loaded", path.display());
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Build from an in-memory config (embedding and tests).
    pub fn from_config(mut config: BotConfig) -> Result<Self, ConfigError> {
        config.compile()?;
        Ok(Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub async fn snapshot(&self) -> Arc<BotConfig> {
        Arc::clone(&*self.current.read().await)
    }

    /// Re-read the config file. On failure the previous snapshot stays
    /// installed and the error is returned for the caller to report.
    pub async fn reload(&self) -> Result<()> {
        let path = self
            .path
            .as_ref()
            .context("no config file path to reload from")?;
        let config = read_config(path).await?;
        *self.current.write().await = Arc::new(config);
        info!("config file '{}' reloaded", path.display());
        Ok(())
    }

    /// Flip a feature flag by installing a copy-on-write snapshot.
    pub async fn set_feature(&self, name: &str, enabled: bool) {
        let mut guard = self.current.write().await;
        let mut config = (**guard).clone();
        config.features.insert(name.to_string(), enabled);
        *guard = Arc::new(config);
        info!("feature '{}' {}", name, if enabled { "enabled" } else { "disabled" });
    }
}

async fn read_config(path: &Path) -> Result<BotConfig> {
    let contents = fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: BotConfig = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config
        .compile()
        .with_context(|| format!("invalid config file {}", path.display()))?;
    if config.periodic_messages.is_empty() && config.greetings.is_empty() {
        warn!("config has neither greetings nor periodic messages; most reactions are off");
    }
    Ok(config)
}
