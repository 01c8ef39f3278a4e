//! Teraleech Configuration
//!
//! TOML configuration loading with environment variable support, plus the
//! runtime-mutable settings admins can change from chat.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const BOT_TOKEN_ENV: &str = "BOT_TOKEN";

/// Telegram channel ids are large negative numbers (`-100xxxxxxxxxx`).
const MIN_CHANNEL_ID_MAGNITUDE: i64 = -1_000_000_000_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub aria2: Aria2Config,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub progress: ProgressConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub data_dir: Option<String>,
    pub temp_dir: Option<String>,
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub admins: Vec<i64>,
    pub dump_channel_id: Option<i64>,
    pub force_sub_channel: Option<String>,
    pub api_base_url: Option<String>,
    pub poll_timeout_secs: Option<u64>,
    pub client_recreate_interval_secs: Option<u64>,
}

impl TelegramConfig {
    /// Cloud Bot API unless a local `telegram-bot-api` server is configured.
    pub fn api_base_url(&self) -> &str {
        self.api_base_url
            .as_deref()
            .map(|url| url.trim_end_matches('/'))
            .filter(|url| !url.is_empty())
            .unwrap_or("https://api.telegram.org")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Aria2Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_aria2_host")]
    pub host: String,
    #[serde(default = "default_aria2_port")]
    pub port: u16,
    #[serde(default)]
    pub secret: String,
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_retry_wait")]
    pub retry_wait: u32,
    #[serde(default = "default_split")]
    pub split: u32,
    #[serde(default = "default_min_split_size")]
    pub min_split_size: String,
    #[serde(default = "default_max_connection_per_server")]
    pub max_connection_per_server: u32,
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: u32,
    #[serde(default = "default_metadata_timeout_secs")]
    pub metadata_timeout_secs: u64,
}

impl Default for Aria2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_aria2_host(),
            port: default_aria2_port(),
            secret: String::new(),
            max_tries: default_max_tries(),
            retry_wait: default_retry_wait(),
            split: default_split(),
            min_split_size: default_min_split_size(),
            max_connection_per_server: default_max_connection_per_server(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            metadata_timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

impl Aria2Config {
    pub fn rpc_url(&self) -> String {
        let host = self.host.trim_end_matches('/');
        let host = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{}", host)
        };
        format!("{}:{}/jsonrpc", host, self.port)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            progress_interval_ms: default_progress_interval_ms(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_retry_wait_secs")]
    pub max_retry_wait_secs: u64,
    #[serde(default = "default_max_total_wait_secs")]
    pub max_total_wait_secs: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: default_min_interval_ms(),
            max_retry_wait_secs: default_max_retry_wait_secs(),
            max_total_wait_secs: default_max_total_wait_secs(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_api_templates")]
    pub api_templates: Vec<String>,
    #[serde(default = "default_resolver_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            api_templates: default_api_templates(),
            timeout_secs: default_resolver_timeout_secs(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_aria2_host() -> String {
    "http://localhost".to_string()
}

fn default_aria2_port() -> u16 {
    6800
}

fn default_max_tries() -> u32 {
    50
}

fn default_retry_wait() -> u32 {
    3
}

fn default_split() -> u32 {
    10
}

fn default_min_split_size() -> String {
    "4M".to_string()
}

fn default_max_connection_per_server() -> u32 {
    16
}

fn default_max_concurrent_downloads() -> u32 {
    10
}

fn default_metadata_timeout_secs() -> u64 {
    60
}

fn default_chunk_size() -> usize {
    128 * 1024
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_read_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_progress_interval_ms() -> u64 {
    2000
}

fn default_max_upload_bytes() -> u64 {
    2 * 1024 * 1024 * 1024
}

fn default_min_interval_ms() -> u64 {
    2000
}

fn default_max_retry_wait_secs() -> u64 {
    60
}

fn default_max_total_wait_secs() -> u64 {
    180
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_breaker_cooldown_secs() -> u64 {
    120
}

fn default_api_templates() -> Vec<String> {
    vec![
        "https://teradlrobot.cheemsbackup.workers.dev/?url={}".to_string(),
        "https://teraboxdl.tellycloudapi.workers.dev/?url={}".to_string(),
    ]
}

fn default_resolver_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:126.0) Gecko/20100101 Firefox/126.0"
        .to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("teraleech").join("config.toml"))
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(BOT_TOKEN_ENV) {
            let token = token.trim();
            if !token.is_empty() {
                self.telegram.bot_token = token.to_string();
            }
        }
    }

    pub fn data_dir(&self) -> PathBuf {
        self.core
            .data_dir
            .as_deref()
            .map(expand_home)
            .or_else(|| dirs::data_dir().map(|dir| dir.join("teraleech")))
            .unwrap_or_else(|| PathBuf::from(".teraleech"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.core
            .temp_dir
            .as_deref()
            .map(expand_home)
            .unwrap_or_else(|| self.data_dir().join("temp_downloads"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.telegram.bot_token.trim().is_empty() {
            anyhow::bail!(
                "telegram.bot_token is empty (set it in the config file or via {})",
                BOT_TOKEN_ENV
            );
        }
        if !self.telegram.bot_token.contains(':') {
            anyhow::bail!("telegram.bot_token does not look like a bot token");
        }

        if let Some(dump_id) = self.telegram.dump_channel_id {
            if !is_channel_id(dump_id) {
                anyhow::bail!(
                    "telegram.dump_channel_id {} is not a channel id (expected -100xxxxxxxxxx)",
                    dump_id
                );
            }
        }

        if let Some(target) = &self.telegram.force_sub_channel {
            ForceSubTarget::parse(target)
                .map_err(|e| anyhow::anyhow!("telegram.force_sub_channel: {}", e))?;
        }

        if self.aria2.enabled {
            if self.aria2.host.trim().is_empty() {
                anyhow::bail!("aria2.host cannot be empty when aria2 is enabled");
            }
            if self.aria2.split == 0 || self.aria2.max_connection_per_server == 0 {
                anyhow::bail!("aria2.split and aria2.max_connection_per_server must be > 0");
            }
        }

        if self.download.chunk_size == 0 {
            anyhow::bail!("download.chunk_size must be > 0");
        }
        if self.download.poll_interval_ms == 0 || self.download.progress_interval_ms == 0 {
            anyhow::bail!("download.poll_interval_ms and download.progress_interval_ms must be > 0");
        }
        if self.download.max_upload_bytes == 0 {
            anyhow::bail!("download.max_upload_bytes must be > 0");
        }

        if self.progress.breaker_threshold == 0 {
            anyhow::bail!("progress.breaker_threshold must be > 0");
        }

        if self.resolver.api_templates.is_empty() {
            anyhow::bail!("resolver.api_templates cannot be empty");
        }
        for template in &self.resolver.api_templates {
            if !template.contains("{}") {
                anyhow::bail!(
                    "resolver template '{}' has no '{{}}' placeholder for the share link",
                    template
                );
            }
        }

        Ok(())
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.telegram.admins.contains(&user_id)
    }

    pub fn initial_settings(&self) -> RuntimeSettings {
        RuntimeSettings {
            dump_channel_id: self.telegram.dump_channel_id,
            force_sub: self
                .telegram
                .force_sub_channel
                .as_deref()
                .and_then(|raw| ForceSubTarget::parse(raw).ok().flatten()),
        }
    }
}

fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

fn is_channel_id(id: i64) -> bool {
    id < MIN_CHANNEL_ID_MAGNITUDE
}

fn is_clear_keyword(raw: &str) -> bool {
    matches!(raw.trim().to_lowercase().as_str(), "none" | "clear" | "")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceSubTarget {
    Id(i64),
    Username(String),
}

impl ForceSubTarget {
    /// `Ok(None)` means the input asked to disable the requirement.
    pub fn parse(raw: &str) -> Result<Option<Self>, String> {
        if is_clear_keyword(raw) {
            return Ok(None);
        }
        let raw = raw.trim();
        if let Ok(id) = raw.parse::<i64>() {
            return Ok(Some(ForceSubTarget::Id(id)));
        }
        let name = raw.trim_start_matches('@');
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(format!("'{}' is neither a channel id nor a username", raw));
        }
        Ok(Some(ForceSubTarget::Username(format!("@{}", name))))
    }
}

impl fmt::Display for ForceSubTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForceSubTarget::Id(id) => write!(f, "{}", id),
            ForceSubTarget::Username(name) => write!(f, "{}", name),
        }
    }
}

/// Settings admins can change at runtime. Owned by the bot context and only
/// mutated through the setters below.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeSettings {
    dump_channel_id: Option<i64>,
    force_sub: Option<ForceSubTarget>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingChange<T> {
    Set(T),
    Cleared,
}

impl RuntimeSettings {
    pub fn dump_channel_id(&self) -> Option<i64> {
        self.dump_channel_id
    }

    pub fn force_sub(&self) -> Option<&ForceSubTarget> {
        self.force_sub.as_ref()
    }

    pub fn set_dump_channel(&mut self, raw: &str) -> Result<SettingChange<i64>, String> {
        if is_clear_keyword(raw) {
            self.dump_channel_id = None;
            return Ok(SettingChange::Cleared);
        }
        let id: i64 = raw.trim().parse().map_err(|_| {
            "Invalid channel ID. Please provide a valid integer ID (e.g., -100xxxxxxxxxx).".to_string()
        })?;
        if !is_channel_id(id) {
            return Err(
                "Invalid channel ID format. It should be a large negative number (e.g., -100xxxxxxxxxx)."
                    .to_string(),
            );
        }
        self.dump_channel_id = Some(id);
        Ok(SettingChange::Set(id))
    }

    pub fn set_force_sub(&mut self, raw: &str) -> Result<SettingChange<ForceSubTarget>, String> {
        match ForceSubTarget::parse(raw)? {
            Some(target) => {
                self.force_sub = Some(target.clone());
                Ok(SettingChange::Set(target))
            }
            None => {
                self.force_sub = None;
                Ok(SettingChange::Cleared)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_config(input: &str) -> Config {
        toml::from_str(input).expect("parse config")
    }

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "123:abc"
"#,
        );
        assert!(cfg.validate().is_ok());
        assert!(cfg.aria2.enabled);
        assert_eq!(cfg.aria2.rpc_url(), "http://localhost:6800/jsonrpc");
        assert_eq!(cfg.download.chunk_size, 131072);
        assert_eq!(cfg.download.max_upload_bytes, 2 * 1024 * 1024 * 1024);
        assert_eq!(cfg.resolver.api_templates.len(), 2);
    }

    #[test]
    fn validate_rejects_empty_token() {
        let cfg = parse_config("[core]\n");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_non_channel_dump_id() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "123:abc"
dump_channel_id = 12345
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_template_without_placeholder() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "123:abc"

[resolver]
api_templates = ["https://resolver.example/api"]
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_poll_interval() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "123:abc"

[download]
poll_interval_ms = 0
"#,
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rpc_url_adds_scheme_when_missing() {
        let cfg = Aria2Config {
            host: "127.0.0.1".to_string(),
            port: 6801,
            ..Aria2Config::default()
        };
        assert_eq!(cfg.rpc_url(), "http://127.0.0.1:6801/jsonrpc");
    }

    #[test]
    fn initial_settings_follow_config() {
        let cfg = parse_config(
            r#"
[telegram]
bot_token = "123:abc"
dump_channel_id = -1002281669966
force_sub_channel = "jetmirror"
"#,
        );
        let settings = cfg.initial_settings();
        assert_eq!(settings.dump_channel_id(), Some(-1002281669966));
        assert_eq!(
            settings.force_sub(),
            Some(&ForceSubTarget::Username("@jetmirror".to_string()))
        );
    }

    #[test]
    fn dump_channel_setter_validates_and_clears() {
        let mut settings = RuntimeSettings::default();
        assert!(settings.set_dump_channel("12345").is_err());
        assert!(settings.set_dump_channel("abc").is_err());
        assert_eq!(
            settings.set_dump_channel("-1002281669966"),
            Ok(SettingChange::Set(-1002281669966))
        );
        assert_eq!(settings.dump_channel_id(), Some(-1002281669966));
        assert_eq!(settings.set_dump_channel("none"), Ok(SettingChange::Cleared));
        assert_eq!(settings.dump_channel_id(), None);
    }

    #[test]
    fn force_sub_setter_accepts_ids_and_usernames() {
        let mut settings = RuntimeSettings::default();
        assert_eq!(
            settings.set_force_sub("-100123"),
            Ok(SettingChange::Set(ForceSubTarget::Id(-100123)))
        );
        assert_eq!(
            settings.set_force_sub("@mychannel"),
            Ok(SettingChange::Set(ForceSubTarget::Username(
                "@mychannel".to_string()
            )))
        );
        assert_eq!(settings.set_force_sub("clear"), Ok(SettingChange::Cleared));
        assert!(settings.force_sub().is_none());
    }
}
