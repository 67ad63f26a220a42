use chrono::{DateTime, Utc};
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("prediction run cancelled")]
    Cancelled,

    #[error("invalid time range: end {end} is not after start {start}")]
    InvalidRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("resource gone for {url}: the requested revision is no longer served")]
    ResourceGone { url: String },

    #[error("protocol error: {reason}")]
    Protocol { reason: String },

    #[error("prediction fetch error: {reason}")]
    PredictionFetch { reason: String, retryable: bool },

    #[error("revision resolution failed: {reason}")]
    Revision { reason: String },

    #[error("machine `{machine}` is not served by the project")]
    MachineNotFound { machine: String },

    #[error("unknown data provider `{tag}`, known providers: {known}")]
    UnknownProvider { tag: String, known: String },

    #[error("forwarding error: {reason}")]
    Forward { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl ClientError {
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn resource_gone(url: impl Into<String>) -> Self {
        Self::ResourceGone { url: url.into() }
    }

    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    pub fn prediction_fetch(reason: impl Into<String>, retryable: bool) -> Self {
        Self::PredictionFetch {
            reason: reason.into(),
            retryable,
        }
    }

    pub fn revision(reason: impl Into<String>) -> Self {
        Self::Revision {
            reason: reason.into(),
        }
    }

    pub fn forward(reason: impl Into<String>) -> Self {
        Self::Forward {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::InvalidRange { .. }
            | Self::Configuration { .. }
            | Self::InvalidUrl { .. }
            | Self::ResourceGone { .. }
            | Self::Protocol { .. }
            | Self::Revision { .. }
            | Self::MachineNotFound { .. }
            | Self::UnknownProvider { .. }
            | Self::Internal { .. } => false,
            Self::HttpStatus { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::TOO_MANY_REQUESTS
                    || *status == StatusCode::REQUEST_TIMEOUT
            }
            Self::PredictionFetch { retryable, .. } => *retryable,
            Self::Network { .. } | Self::Forward { .. } => true,
        }
    }
}
