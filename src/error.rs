use thiserror::Error;

/// Main error type for the reconciliation engine and its collaborators
#[derive(Error, Debug)]
pub enum SyncError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Ledger subscription errors
    #[error("Subscription setup failed for {topic}: {reason}")]
    SubscriptionSetup { topic: String, reason: String },

    // Descriptive metadata errors
    #[error("Metadata fetch failed: {0}")]
    MetadataFetch(#[from] MetadataFetchError),

    // Submission errors
    #[error("Submission failed: {0}")]
    SubmissionFailed(String),

    // Engine lifecycle
    #[error("Reconciliation engine is not running")]
    EngineClosed,

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Failures from the descriptive-metadata service.
///
/// These never crash the reconciliation loop: the engine keeps its last
/// consistent state and reports the error on the notification channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataFetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("service returned an error: {0}")]
    Service(String),

    #[error("invalid record shape for loan {loan_id}: {reason}")]
    InvalidShape { loan_id: u32, reason: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("request timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("no eligible candidate available")]
    NoCandidate,
}

impl From<reqwest::Error> for MetadataFetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            MetadataFetchError::MalformedResponse(err.to_string())
        } else if err.is_status() {
            MetadataFetchError::Service(err.to_string())
        } else {
            MetadataFetchError::Transport(err.to_string())
        }
    }
}

impl SyncError {
    pub fn subscription_setup(topic: impl ToString, reason: impl ToString) -> Self {
        SyncError::SubscriptionSetup {
            topic: topic.to_string(),
            reason: reason.to_string(),
        }
    }
}
