use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Application-wide error types for trawl.
///
/// Fetch failures are *not* represented here: the dispatcher returns them as
/// typed [`FetchFailure`] values. `AppError` covers configuration, scheduling,
/// extraction and export problems.
#[derive(Error, Debug)]
pub enum AppError {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// A job schedule expression could not be parsed.
    #[error("Invalid schedule '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    /// A URL could not be parsed or has no host.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// HTTP client construction or transport problem outside a fetch attempt.
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Schema reference could not be resolved or parsed.
    #[error("Schema error: {0}")]
    SchemaError(String),

    /// Field extraction failed.
    #[error("Extraction error: {0}")]
    ExtractionError(String),

    /// Writing records to a destination failed.
    #[error("Export error: {0}")]
    ExportError(String),

    /// Unknown job id.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// Scheduler lifecycle misuse (double start, etc).
    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Filesystem error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

/// Coarse retry class of a [`FailureKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help.
    Permanent,
    /// Refused by local policy (robots, proxy requirements, cancellation,
    /// exhausted attempts). Never retried.
    Policy,
}

/// Why a fetch failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum FailureKind {
    RobotsDisallowed,
    Timeout,
    Connection,
    /// HTTP 429.
    RateLimited,
    /// HTTP 5xx.
    ServerError(u16),
    /// Engine detected a captcha challenge page.
    Captcha,
    /// HTTP 4xx other than 429 (and any other non-success status).
    ClientError(u16),
    MalformedUrl,
    DnsNotFound,
    RetriesExhausted,
    NoProxyAvailable,
    Cancelled,
}

impl FailureKind {
    pub fn class(&self) -> FailureClass {
        match self {
            FailureKind::Timeout
            | FailureKind::Connection
            | FailureKind::RateLimited
            | FailureKind::ServerError(_)
            | FailureKind::Captcha => FailureClass::Transient,
            FailureKind::ClientError(_) | FailureKind::MalformedUrl | FailureKind::DnsNotFound => {
                FailureClass::Permanent
            }
            FailureKind::RobotsDisallowed
            | FailureKind::RetriesExhausted
            | FailureKind::NoProxyAvailable
            | FailureKind::Cancelled => FailureClass::Policy,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }

    pub fn is_permanent(&self) -> bool {
        self.class() == FailureClass::Permanent
    }

    /// Classify a non-success HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => FailureKind::RateLimited,
            500..=599 => FailureKind::ServerError(status),
            _ => FailureKind::ClientError(status),
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::RobotsDisallowed => write!(f, "robots-disallowed"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::Connection => write!(f, "connection"),
            FailureKind::RateLimited => write!(f, "rate-limited"),
            FailureKind::ServerError(s) => write!(f, "server-error({s})"),
            FailureKind::Captcha => write!(f, "captcha"),
            FailureKind::ClientError(s) => write!(f, "client-error({s})"),
            FailureKind::MalformedUrl => write!(f, "malformed-url"),
            FailureKind::DnsNotFound => write!(f, "dns-not-found"),
            FailureKind::RetriesExhausted => write!(f, "retries-exhausted"),
            FailureKind::NoProxyAvailable => write!(f, "no-proxy-available"),
            FailureKind::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failed logical fetch, as returned by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct FetchFailure {
    pub kind: FailureKind,
    pub message: String,
    /// Attempt number (1-based) on which the dispatcher gave up.
    pub attempt: u32,
    /// Last underlying failure when `kind` is `RetriesExhausted`.
    pub cause: Option<FailureKind>,
}

impl FetchFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>, attempt: u32) -> Self {
        Self {
            kind,
            message: message.into(),
            attempt,
            cause: None,
        }
    }

    pub fn with_cause(mut self, cause: FailureKind) -> Self {
        self.cause = Some(cause);
        self
    }
}

impl fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cause {
            Some(cause) => write!(
                f,
                "{} after attempt {} (last: {}): {}",
                self.kind, self.attempt, cause, self.message
            ),
            None => write!(
                f,
                "{} on attempt {}: {}",
                self.kind, self.attempt, self.message
            ),
        }
    }
}
