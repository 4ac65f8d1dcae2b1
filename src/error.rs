//! Error types for the ingestion core.

use thiserror::Error;

use crate::models::Security;

/// Errors raised while fetching, reconciling or storing equity data
#[derive(Debug, Error)]
pub enum IngestError {
    /// Storage failure, already retried once after a reconnect when transient
    #[error("Database error: {0}")]
    Storage(#[from] sqlx::Error),

    /// Rows that cannot be aligned or keyed; nothing has been written
    #[error("Data shape error: {0}")]
    DataShape(String),

    /// Upstream page or API could not be fetched
    #[error("Fetch error: {0}")]
    Fetch(#[from] reqwest::Error),

    /// Upstream payload did not have the expected layout
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure that happened after some securities were already collected
    #[error("{source} ({} securities collected before the failure)", .securities.len())]
    Partial {
        securities: Vec<Security>,
        #[source]
        source: Box<IngestError>,
    },
}

impl IngestError {
    /// Securities collected before the failure, if any
    pub fn partial_securities(&self) -> Option<&[Security]> {
        match self {
            IngestError::Partial { securities, .. } => Some(securities),
            _ => None,
        }
    }
}

impl From<url::ParseError> for IngestError {
    fn from(err: url::ParseError) -> Self {
        IngestError::Config(format!("invalid URL: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
