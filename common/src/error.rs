use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config document JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config field `{field}`: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClockError {
    #[error("unknown timezone `{0}`")]
    UnknownTimezone(String),
    #[error("timestamp {0} is outside the accepted range")]
    ImplausibleTimestamp(i64),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no reporting url configured")]
    NotConfigured,
    #[error("request failed: {0}")]
    Request(String),
    #[error("server responded with HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Clock(#[from] ClockError),
    #[error("unknown button id {0}")]
    UnknownButton(u8),
    #[error("unknown scene id {0}")]
    UnknownScene(u8),
    #[error("input blocked while the display wakes")]
    InputBlocked,
    #[error("theme `{0}` rejected by display")]
    ThemeRejected(String),
}
