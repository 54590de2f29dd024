//! Request/response types exchanged between the dispatcher and fetch engines.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{FailureKind, FetchFailure};

/// A single engine invocation, built fresh for every attempt.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: String,
    /// Name of the engine the dispatcher picked.
    pub engine: String,
    pub headers: Vec<(String, String)>,
    /// Proxy address (`scheme://host:port`), or `None` for a direct fetch.
    pub proxy: Option<String>,
    pub user_agent: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Per-attempt deadline. Engines should abandon work past this point;
    /// the dispatcher enforces it regardless.
    pub deadline: Instant,
}

impl FetchRequest {
    /// Time left until the deadline (zero if already past).
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

/// What an engine returns when it got *a* response, whatever the status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResponse {
    pub status_code: u16,
    pub body: String,
    pub final_url: String,
}

impl EngineResponse {
    pub fn ok(body: impl Into<String>, final_url: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            body: body.into(),
            final_url: final_url.into(),
        }
    }

    pub fn status(status_code: u16, final_url: impl Into<String>) -> Self {
        Self {
            status_code,
            body: String::new(),
            final_url: final_url.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// An engine-level failure where no usable response was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineError {
    pub kind: FailureKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for EngineError {}

/// A successful logical fetch.
#[derive(Debug, Clone, Serialize)]
pub struct FetchSuccess {
    pub status_code: u16,
    #[serde(skip)]
    pub body: String,
    pub final_url: String,
    pub elapsed_ms: u64,
    /// Attempt on which the fetch succeeded (1-based).
    pub attempt: u32,
    pub proxy: Option<String>,
    pub engine: String,
}

/// Outcome of [`FetchDispatcher::fetch`](crate::dispatcher::FetchDispatcher::fetch).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum FetchResult {
    Success(FetchSuccess),
    Failure(FetchFailure),
}

impl FetchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchResult::Success(_))
    }

    pub fn attempt(&self) -> u32 {
        match self {
            FetchResult::Success(s) => s.attempt,
            FetchResult::Failure(f) => f.attempt,
        }
    }

    pub fn success(&self) -> Option<&FetchSuccess> {
        match self {
            FetchResult::Success(s) => Some(s),
            FetchResult::Failure(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&FetchFailure> {
        match self {
            FetchResult::Success(_) => None,
            FetchResult::Failure(f) => Some(f),
        }
    }
}
