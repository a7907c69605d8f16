use thiserror::Error;

#[derive(Error, Debug)]
pub enum HarvestError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("Reddit API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited by Reddit")]
    RateLimited,

    #[error("authentication failed ({status}): {message}")]
    Auth { status: u16, message: String },

    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("comment verification failed for post {post_id}: expected comments, store has 0")]
    VerificationFailed { post_id: String },

    #[error("storage error: {message}")]
    Storage { message: String },

    #[error("invalid queue mutation: {0}")]
    InvalidQueue(String),

    #[error("credential seal error: {0}")]
    Seal(String),

    #[error("scraper {0} not found")]
    ScraperNotFound(String),
}

impl HarvestError {
    /// Whether a failed operation is worth retrying with backoff.
    /// Rate-limit rejections are handled separately and do not consume
    /// retry attempts.
    pub fn is_retriable(&self) -> bool {
        match self {
            HarvestError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            HarvestError::Api { status, .. } => *status >= 500,
            HarvestError::RateLimited => true,
            HarvestError::Storage { .. } => true,
            _ => false,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, HarvestError::RateLimited)
    }

    pub fn storage(message: impl Into<String>) -> Self {
        HarvestError::Storage {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarvestError>;
