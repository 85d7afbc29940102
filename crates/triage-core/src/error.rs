use thiserror::Error;

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("invalid regex '{pattern}': {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid range '{0}': expected [<>=]*<number>")]
    InvalidRange(String),

    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("unknown rule: {0}")]
    UnknownRule(String),

    #[error("collection not found: {0}")]
    UnknownCollection(String),

    #[error("no provider registered for host '{0}'")]
    UnknownProvider(String),

    #[error("invalid repository url '{0}'")]
    InvalidRepo(String),

    #[error("forge api returned {status} for {url}: {message}")]
    Api {
        status: u16,
        url: String,
        message: String,
    },

    #[error("rate limited until {reset}")]
    RateLimited { reset: chrono::DateTime<chrono::Utc> },

    /// Some collections failed; `updated` says whether others were refreshed.
    #[error("collections failed to update: {}", .failed.join(", "))]
    UpdateFailed { failed: Vec<String>, updated: bool },

    #[error("operation cancelled")]
    Cancelled,

    #[error("cache error: {0}")]
    Cache(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TriageError {
    /// Errors a caller can recover from by serving older cached data.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TriageError::Http(_) | TriageError::Api { .. } | TriageError::RateLimited { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TriageError>;
