use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    Validation(String),
}

/// Malformed scheduling input, rejected at post/broadcast creation so it
/// never reaches the scheduler loops.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleInputError {
    #[error("content is empty")]
    EmptyContent,
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),
    #[error("post has no destinations")]
    NoDestinations,
    #[error("end time {end} is not after start time {start}")]
    EndBeforeStart { start: String, end: String },
    #[error("interval must be positive, got {0}")]
    NonPositiveInterval(i64),
    #[error("window minute {0} out of range (0..1440)")]
    WindowMinuteOutOfRange(i64),
}

#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("failed to connect to Telegram: {0}")]
    Connection(String),
}
