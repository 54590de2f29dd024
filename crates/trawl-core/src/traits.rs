use std::future::Future;

use crate::error::AppError;
use crate::fetch::{EngineError, EngineResponse, FetchRequest};
use crate::job::{ScrapeJob, UrlOutcome};
use crate::models::{ExtractionSchema, Record};

/// Performs one HTTP-level attempt for the dispatcher.
///
/// Engines own rendering and transport; rotation, pacing and retries are
/// the dispatcher's business. A response with a non-2xx status is returned
/// as `Ok` so the dispatcher can classify it.
pub trait FetchEngine: Send + Sync + Clone + 'static {
    /// Registry key used for engine hints (e.g. `"http"`, `"browser"`).
    fn name(&self) -> &str;

    fn perform(
        &self,
        request: &FetchRequest,
    ) -> impl Future<Output = Result<EngineResponse, EngineError>> + Send;
}

/// Maps a raw page body to named field values using a schema.
pub trait Extractor: Send + Sync + Clone + 'static {
    fn extract(
        &self,
        body: &str,
        url: &str,
        schema: &ExtractionSchema,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AppError>;
}

/// Writes extracted records to a destination (file path, table, ...).
pub trait Exporter: Send + Sync + Clone + 'static {
    fn export(
        &self,
        records: &[Record],
        destination: &str,
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Consumes the pages of a fully successful job run.
///
/// Only called when every URL of the run succeeded. Returning an error
/// marks the run `Failed`.
pub trait JobHandler: Send + Sync + Clone + 'static {
    fn handle(
        &self,
        job: &ScrapeJob,
        pages: &[UrlOutcome],
    ) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Solves a captcha challenge detected by an engine.
///
/// Returns extra request headers (cookies, tokens) for the next attempt,
/// or `None` to decline.
pub trait CaptchaSolver: Send + Sync + Clone + 'static {
    fn solve(
        &self,
        url: &str,
        challenge: &str,
    ) -> impl Future<Output = Option<Vec<(String, String)>>> + Send;
}

/// Checks whether a proxy endpoint currently works.
pub trait ProxyProber: Send + Sync {
    fn probe(&self, proxy: &str) -> impl Future<Output = bool> + Send;
}

/// A captcha solver that always declines.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSolver;

impl CaptchaSolver for NullSolver {
    async fn solve(&self, _url: &str, _challenge: &str) -> Option<Vec<(String, String)>> {
        None
    }
}

/// A job handler that discards pages, for fetch-only jobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullHandler;

impl JobHandler for NullHandler {
    async fn handle(&self, _job: &ScrapeJob, _pages: &[UrlOutcome]) -> Result<(), AppError> {
        Ok(())
    }
}
