//! Typed error taxonomy shared across the orchestration engine.
//!
//! Every failure that can cross a component boundary is classified as an
//! [`ErrorKind`]. The set is stable on the wire: each variant serialises to a
//! fixed snake_case tag so that persisted records and API responses keep their
//! meaning across versions. Components never raise untyped errors at the API
//! boundary; anything unclassified becomes [`ErrorKind::InternalError`].

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;

/// Classification of a failure, stable on the wire.
///
/// The `user_category` of each kind drives how callers should present the
/// failure: whether the user has to act (fix a key, raise a budget), whether
/// an automatic retry is worthwhile, or whether the run is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Provider credentials were never configured.
    ApiKeyMissing,
    /// Provider rejected the configured credentials.
    ApiKeyInvalid,
    /// Provider returned HTTP 429 or an equivalent throttle signal.
    RateLimited,
    /// Generic non-2xx response from a provider.
    HttpError,
    /// The per-model timeout elapsed before a response arrived.
    Timeout,
    /// Provider answered with empty text.
    EmptyResponse,
    /// Caller-supplied inputs were rejected before any work started.
    ValidationError,
    /// The requested model is not in the catalog or its adapter is unhealthy.
    ModelUnavailable,
    /// The catalog is empty after policy filtering; nothing can run.
    NoModelAvailable,
    /// The session cost cap was reached.
    BudgetExceeded,
    /// The worker pool and its wait queue are saturated.
    SystemOverload,
    /// Cooperative cancellation was requested.
    Cancelled,
    /// Unclassified bug; the blanket catch at the API boundary.
    InternalError,
}

/// How a failure should be presented to the end user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserCategory {
    /// The user must change something (credentials, budget, inputs).
    UserAction,
    /// A retry, possibly after a short wait, is likely to succeed.
    Retryable,
    /// The run is over; retrying the same request changes nothing.
    Terminal,
    /// A bug or hard outage; retrying is unlikely to help.
    Fatal,
}

impl ErrorKind {
    /// Stable wire tag, identical to the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ApiKeyMissing => "api_key_missing",
            ErrorKind::ApiKeyInvalid => "api_key_invalid",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::HttpError => "http_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::EmptyResponse => "empty_response",
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::ModelUnavailable => "model_unavailable",
            ErrorKind::NoModelAvailable => "no_model_available",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::SystemOverload => "system_overload",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InternalError => "internal_error",
        }
    }

    /// Whether the automatic fallback chain should keep trying other models
    /// after seeing this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimited
                | ErrorKind::HttpError
                | ErrorKind::Timeout
                | ErrorKind::EmptyResponse
                | ErrorKind::ModelUnavailable
                | ErrorKind::SystemOverload
        )
    }

    pub fn user_category(&self) -> UserCategory {
        match self {
            ErrorKind::ApiKeyMissing
            | ErrorKind::ApiKeyInvalid
            | ErrorKind::ValidationError
            | ErrorKind::BudgetExceeded => UserCategory::UserAction,
            ErrorKind::RateLimited
            | ErrorKind::HttpError
            | ErrorKind::Timeout
            | ErrorKind::EmptyResponse
            | ErrorKind::ModelUnavailable
            | ErrorKind::SystemOverload => UserCategory::Retryable,
            ErrorKind::Cancelled => UserCategory::Terminal,
            ErrorKind::NoModelAvailable | ErrorKind::InternalError => UserCategory::Fatal,
        }
    }

    /// Short actionable suggestion matching the category.
    pub fn suggestion(&self) -> &'static str {
        match self {
            ErrorKind::ApiKeyMissing => "Configure an API key for at least one provider.",
            ErrorKind::ApiKeyInvalid => "Check that the configured API key is current and has quota.",
            ErrorKind::RateLimited => "The provider is throttling requests; retry in a minute.",
            ErrorKind::HttpError => "The provider returned an error; retrying usually resolves this.",
            ErrorKind::Timeout => "The model took too long to answer; retry or pick a faster model.",
            ErrorKind::EmptyResponse => "The model returned no text; retrying usually resolves this.",
            ErrorKind::ValidationError => "Review the request parameters and submit again.",
            ErrorKind::ModelUnavailable => "The requested model is offline; another model will be tried automatically.",
            ErrorKind::NoModelAvailable => "No model is currently available; check provider configuration.",
            ErrorKind::BudgetExceeded => "The session budget is spent; raise the cap to continue.",
            ErrorKind::SystemOverload => "Too many analyses are running; retry shortly.",
            ErrorKind::Cancelled => "The analysis was cancelled on request.",
            ErrorKind::InternalError => "An unexpected error occurred; check the logs.",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure carrying human-readable detail.
///
/// This is the error type returned by every fallible API in the crate. The
/// `kind` is stable and machine-readable; `message` is for logs and users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "analysis cancelled")
    }

    /// A message suitable for direct display: category framing, detail, and a
    /// suggestion. Technical detail stays in the logs.
    pub fn user_friendly(&self) -> String {
        let framing = match self.kind.user_category() {
            UserCategory::UserAction => "Action required",
            UserCategory::Retryable => "Temporary problem",
            UserCategory::Terminal => "Stopped",
            UserCategory::Fatal => "Analysis unavailable",
        };
        format!("{}: {}. {}", framing, self.message, self.kind.suggestion())
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl Error for TaskError {}
