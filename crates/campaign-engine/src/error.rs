use thiserror::Error;

/// Error types for campaign engine operations
///
/// Covers every failure family the engine can surface, from configuration
/// problems through coordination-store and queue failures to telephony
/// adapter errors. Admission denial is deliberately *not* represented here:
/// a full pool is an expected, retryable outcome reported through
/// [`crate::resource::AdmissionOutcome`], not an error.
///
/// # Examples
///
/// ```
/// use rvoip_campaign_engine::{CampaignError, Result};
///
/// fn lease_batch() -> Result<()> {
///     Err(CampaignError::queue("receipt already acknowledged"))
/// }
///
/// match lease_batch() {
///     Err(CampaignError::Queue(msg)) => println!("queue error: {}", msg),
///     _ => {}
/// }
/// ```
#[derive(Error, Debug)]
pub enum CampaignError {
    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Coordination store errors
    ///
    /// Raised by the shared slot/counter store (SQLite or in-memory) when a
    /// lease row cannot be written, read or deleted.
    #[error("Store error: {0}")]
    Store(String),

    /// Task intake errors (unknown receipts, malformed tasks)
    #[error("Queue error: {0}")]
    Queue(String),

    /// Telephony control adapter errors
    #[error("Telephony error: {0}")]
    Telephony(String),

    /// Campaign orchestration errors
    #[error("Orchestration error: {0}")]
    Orchestration(String),

    /// Requested campaign, call or execution does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Input failed validation
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A concurrency budget is exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The engine event loop is gone
    #[error("Engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Unexpected internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for CampaignError {
    fn from(err: sqlx::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<anyhow::Error> for CampaignError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for CampaignError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl CampaignError {
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    pub fn queue<S: Into<String>>(msg: S) -> Self {
        Self::Queue(msg.into())
    }

    pub fn telephony<S: Into<String>>(msg: S) -> Self {
        Self::Telephony(msg.into())
    }

    pub fn orchestration<S: Into<String>>(msg: S) -> Self {
        Self::Orchestration(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type for campaign engine operations
pub type Result<T> = std::result::Result<T, CampaignError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructor_helpers_format_messages() {
        let err = CampaignError::queue("receipt r-1 unknown");
        assert_eq!(err.to_string(), "Queue error: receipt r-1 unknown");

        let err = CampaignError::not_found("campaign camp-9");
        assert!(matches!(err, CampaignError::NotFound(_)));
    }

    #[test]
    fn test_json_errors_convert() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: CampaignError = parse.unwrap_err().into();
        assert!(matches!(err, CampaignError::Serialization(_)));
    }
}
