use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub crier: CrierConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub idle: IdleConfig,
}

#[derive(Debug, Deserialize)]
pub struct CrierConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// All wall-clock decisions (windows, idle hours) use this one timezone.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Destination whose traffic feeds idle detection.
    pub primary_chat: Option<i64>,
    /// Operator destination for reminders and failure alerts.
    pub notify_chat: Option<i64>,
    /// Lead time for "will be unpinned/deleted soon" reminders.
    #[serde(default = "default_reminder_lead")]
    pub reminder_lead: String,
    /// Throttle between consecutive sends within one tick.
    #[serde(default = "default_send_delay")]
    pub send_delay: String,
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,
}

fn default_version() -> u32 {
    1
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_reminder_lead() -> String {
    "3d".to_string()
}
fn default_send_delay() -> String {
    "5s".to_string()
}
fn default_tick_interval() -> String {
    "1m".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "crier.db".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub api_id: Option<i32>,
    #[serde(default)]
    pub api_hash: Option<String>,
}

/// Global fallback window for `limited` broadcasts, synced to the database at
/// daemon startup.
#[derive(Debug, Deserialize)]
pub struct BroadcastConfig {
    #[serde(default)]
    pub window_enabled: bool,
    #[serde(default = "default_window_start")]
    pub window_start: String,
    #[serde(default = "default_window_end")]
    pub window_end: String,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            window_enabled: false,
            window_start: default_window_start(),
            window_end: default_window_end(),
        }
    }
}

fn default_window_start() -> String {
    "09:00".to_string()
}
fn default_window_end() -> String {
    "23:00".to_string()
}

#[derive(Debug, Deserialize)]
pub struct IdleConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Local hour range within which the filler may act.
    #[serde(default = "default_idle_start_hour")]
    pub start_hour: u32,
    #[serde(default = "default_idle_end_hour")]
    pub end_hour: u32,
    /// How long the primary chat must be quiet before a filler post.
    #[serde(default = "default_idle_threshold")]
    pub threshold: String,
    /// Upper bound of the random delay before a filler post goes out.
    #[serde(default = "default_idle_jitter")]
    pub max_jitter: String,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_hour: default_idle_start_hour(),
            end_hour: default_idle_end_hour(),
            threshold: default_idle_threshold(),
            max_jitter: default_idle_jitter(),
        }
    }
}

fn default_idle_start_hour() -> u32 {
    11
}
fn default_idle_end_hour() -> u32 {
    23
}
fn default_idle_threshold() -> String {
    "2h".to_string()
}
fn default_idle_jitter() -> String {
    "1h".to_string()
}

impl Config {
    /// Resolve the database path (relative to data_dir if not absolute).
    pub fn db_path(&self) -> PathBuf {
        let db_path = Path::new(&self.database.path);
        if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            self.crier.data_dir.join(db_path)
        }
    }

    pub fn timezone(&self) -> chrono_tz::Tz {
        self.crier.timezone.parse().unwrap_or(chrono_tz::UTC)
    }

    pub fn reminder_lead(&self) -> chrono::Duration {
        parse_chrono_duration(&self.crier.reminder_lead).unwrap_or_else(|| chrono::Duration::days(3))
    }

    pub fn send_delay(&self) -> std::time::Duration {
        humantime::parse_duration(&self.crier.send_delay).unwrap_or(std::time::Duration::from_secs(5))
    }

    pub fn tick_interval(&self) -> std::time::Duration {
        humantime::parse_duration(&self.crier.tick_interval).unwrap_or(std::time::Duration::from_secs(60))
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        parse_chrono_duration(&self.idle.threshold).unwrap_or_else(|| chrono::Duration::hours(2))
    }

    pub fn idle_max_jitter(&self) -> std::time::Duration {
        humantime::parse_duration(&self.idle.max_jitter).unwrap_or(std::time::Duration::from_secs(3600))
    }

    /// Global window bounds as minutes since local midnight.
    pub fn window_minutes(&self) -> (i64, i64) {
        (
            parse_hhmm_minutes(&self.broadcast.window_start).unwrap_or(9 * 60),
            parse_hhmm_minutes(&self.broadcast.window_end).unwrap_or(23 * 60),
        )
    }
}

fn parse_chrono_duration(s: &str) -> Option<chrono::Duration> {
    let d = humantime::parse_duration(s).ok()?;
    chrono::Duration::from_std(d).ok()
}

/// Parse "HH:MM" into minutes since midnight.
pub fn parse_hhmm_minutes(s: &str) -> Option<i64> {
    let (h, m) = s.split_once(':')?;
    let hour: i64 = h.parse().ok()?;
    let minute: i64 = m.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some(hour * 60 + minute)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(ConfigError::ReadFile)
        .context("reading config file")?;
    let config: Config = toml::from_str(&content).map_err(ConfigError::Parse)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.crier.version != 1 {
        return Err(ConfigError::Validation(format!(
            "unsupported config version {} (this binary supports version 1)",
            config.crier.version
        ))
        .into());
    }

    config
        .crier
        .timezone
        .parse::<chrono_tz::Tz>()
        .map_err(|_| ConfigError::Validation(format!("unknown timezone '{}'", config.crier.timezone)))?;

    for (name, value) in [
        ("reminder_lead", &config.crier.reminder_lead),
        ("send_delay", &config.crier.send_delay),
        ("tick_interval", &config.crier.tick_interval),
        ("idle.threshold", &config.idle.threshold),
        ("idle.max_jitter", &config.idle.max_jitter),
    ] {
        humantime::parse_duration(value)
            .map_err(|e| ConfigError::Validation(format!("invalid {name} '{value}': {e}")))?;
    }

    for (name, value) in [
        ("broadcast.window_start", &config.broadcast.window_start),
        ("broadcast.window_end", &config.broadcast.window_end),
    ] {
        if parse_hhmm_minutes(value).is_none() {
            return Err(ConfigError::Validation(format!("invalid {name} '{value}': expected HH:MM")).into());
        }
    }

    if config.idle.start_hour > 23 || config.idle.end_hour > 24 {
        return Err(ConfigError::Validation(format!(
            "idle hours {}..{} out of range",
            config.idle.start_hour, config.idle.end_hour
        ))
        .into());
    }

    if config.idle.enabled && config.crier.primary_chat.is_none() {
        return Err(ConfigError::Validation(
            "idle filler is enabled but crier.primary_chat is not set".to_string(),
        )
        .into());
    }

    Ok(())
}
