//! Test utilities: mock implementations of the collaborator traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{AppError, FailureKind, FetchFailure};
use crate::fetch::{EngineError, EngineResponse, FetchRequest, FetchResult, FetchSuccess};
use crate::job::{ScrapeJob, UrlOutcome};
use crate::models::{ExtractionSchema, Record};
use crate::scheduler::{SchedulerEvent, SchedulerReporter};
use crate::traits::{CaptchaSolver, Exporter, Extractor, FetchEngine, JobHandler, ProxyProber};

// ---------------------------------------------------------------------------
// MockEngine
// ---------------------------------------------------------------------------

/// One scripted engine reply.
#[derive(Debug, Clone)]
pub enum MockReply {
    Status(u16, String),
    Error(FailureKind),
    /// Never answers; the dispatcher's deadline has to cut it off.
    Hang,
}

impl MockReply {
    pub fn ok(body: &str) -> Self {
        MockReply::Status(200, body.to_string())
    }

    pub fn status(code: u16) -> Self {
        MockReply::Status(code, String::new())
    }

    pub fn error(kind: FailureKind) -> Self {
        MockReply::Error(kind)
    }
}

/// Replies are consumed in order; the last one repeats forever.
#[derive(Debug, Default)]
struct Script(VecDeque<MockReply>);

impl Script {
    fn next(&mut self) -> Option<MockReply> {
        if self.0.len() > 1 {
            self.0.pop_front()
        } else {
            self.0.front().cloned()
        }
    }
}

/// Scripted fetch engine.
///
/// Requests whose URL contains a registered route pattern use that route's
/// script; everything else uses the default script (200 with a small page
/// unless overridden). Robots requests get a 404 unless routed, so tests
/// that don't care about robots see an allow-all.
#[derive(Clone)]
pub struct MockEngine {
    name: String,
    routes: Arc<Mutex<Vec<(String, Script)>>>,
    default: Arc<Mutex<Script>>,
    latency: Option<Duration>,
    pub requests: Arc<Mutex<Vec<FetchRequest>>>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            name: "mock".into(),
            routes: Arc::new(Mutex::new(vec![(
                "/robots.txt".into(),
                Script(VecDeque::from([MockReply::status(404)])),
            )])),
            default: Arc::new(Mutex::new(Script(VecDeque::from([MockReply::ok(
                "<html><body>default</body></html>",
            )])))),
            latency: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Engine whose default script is `replies`.
    pub fn scripted(replies: Vec<MockReply>) -> Self {
        let engine = Self::new();
        *engine.default.lock().unwrap() = Script(replies.into());
        engine
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Script replies for URLs containing `pattern`. Replaces an existing
    /// route with the same pattern.
    pub fn route(self, pattern: &str, replies: Vec<MockReply>) -> Self {
        {
            let mut routes = self.routes.lock().unwrap();
            routes.retain(|(p, _)| p != pattern);
            routes.push((pattern.to_string(), Script(replies.into())));
        }
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose URL contains `pattern`.
    pub fn requests_to(&self, pattern: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.contains(pattern))
            .count()
    }

    /// Page requests only (robots fetches excluded).
    pub fn page_requests(&self) -> Vec<FetchRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !r.url.ends_with("/robots.txt"))
            .collect()
    }

    fn next_reply(&self, url: &str) -> Option<MockReply> {
        let mut routes = self.routes.lock().unwrap();
        if let Some((_, script)) = routes.iter_mut().find(|(p, _)| url.contains(p.as_str())) {
            return script.next();
        }
        drop(routes);
        self.default.lock().unwrap().next()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchEngine for MockEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&self, request: &FetchRequest) -> Result<EngineResponse, EngineError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.next_reply(&request.url);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match reply {
            Some(MockReply::Status(code, body)) => Ok(EngineResponse {
                status_code: code,
                body,
                final_url: request.url.clone(),
            }),
            Some(MockReply::Error(kind)) => Err(EngineError::new(kind, "scripted failure")),
            Some(MockReply::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(EngineError::new(FailureKind::Timeout, "hung"))
            }
            None => Err(EngineError::new(FailureKind::Connection, "no scripted reply")),
        }
    }
}

// ---------------------------------------------------------------------------
// MockSolver
// ---------------------------------------------------------------------------

/// Captcha solver returning fixed headers.
#[derive(Clone, Default)]
pub struct MockSolver {
    headers: Option<Vec<(String, String)>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockSolver {
    pub fn solving(headers: &[(&str, &str)]) -> Self {
        Self {
            headers: Some(
                headers
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            calls: Arc::default(),
        }
    }

    pub fn declining() -> Self {
        Self::default()
    }
}

impl CaptchaSolver for MockSolver {
    async fn solve(&self, url: &str, _challenge: &str) -> Option<Vec<(String, String)>> {
        self.calls.lock().unwrap().push(url.to_string());
        self.headers.clone()
    }
}

// ---------------------------------------------------------------------------
// MockHandler
// ---------------------------------------------------------------------------

/// Job handler that records calls and can be told to fail.
#[derive(Clone, Default)]
pub struct MockHandler {
    error: Option<String>,
    /// `(job name, pages handed over)` per call.
    pub calls: Arc<Mutex<Vec<(String, usize)>>>,
}

impl MockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl JobHandler for MockHandler {
    async fn handle(&self, job: &ScrapeJob, pages: &[UrlOutcome]) -> Result<(), AppError> {
        self.calls
            .lock()
            .unwrap()
            .push((job.name.clone(), pages.len()));
        match &self.error {
            Some(msg) => Err(AppError::ExportError(msg.clone())),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockExtractor
// ---------------------------------------------------------------------------

/// Extractor returning a fixed field map.
#[derive(Clone)]
pub struct MockExtractor {
    fields: serde_json::Value,
    error: Option<String>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl MockExtractor {
    pub fn new(fields: serde_json::Value) -> Self {
        Self {
            fields,
            error: None,
            calls: Arc::default(),
        }
    }

    pub fn with_error(message: &str) -> Self {
        Self {
            fields: serde_json::Value::Null,
            error: Some(message.to_string()),
            calls: Arc::default(),
        }
    }
}

impl Extractor for MockExtractor {
    fn extract(
        &self,
        _body: &str,
        url: &str,
        _schema: &ExtractionSchema,
    ) -> Result<serde_json::Map<String, serde_json::Value>, AppError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(msg) = &self.error {
            return Err(AppError::ExtractionError(msg.clone()));
        }
        match &self.fields {
            serde_json::Value::Object(map) => Ok(map.clone()),
            other => Err(AppError::ExtractionError(format!(
                "mock fields must be an object, got {other}"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// MockExporter
// ---------------------------------------------------------------------------

/// Exporter that keeps every batch in memory.
#[derive(Clone, Default)]
pub struct MockExporter {
    error: Option<String>,
    /// `(destination, records)` per call.
    pub exports: Arc<Mutex<Vec<(String, Vec<Record>)>>>,
}

impl MockExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            exports: Arc::default(),
        }
    }
}

impl Exporter for MockExporter {
    async fn export(&self, records: &[Record], destination: &str) -> Result<(), AppError> {
        if let Some(msg) = &self.error {
            return Err(AppError::ExportError(msg.clone()));
        }
        self.exports
            .lock()
            .unwrap()
            .push((destination.to_string(), records.to_vec()));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockProber
// ---------------------------------------------------------------------------

/// Prober that reports a fixed set of proxies as working.
#[derive(Clone, Default)]
pub struct MockProber {
    healthy: HashSet<String>,
    pub probed: Arc<Mutex<Vec<String>>>,
}

impl MockProber {
    pub fn healthy(addresses: &[&str]) -> Self {
        Self {
            healthy: addresses.iter().map(|a| a.to_string()).collect(),
            probed: Arc::default(),
        }
    }
}

impl ProxyProber for MockProber {
    async fn probe(&self, proxy: &str) -> bool {
        self.probed.lock().unwrap().push(proxy.to_string());
        self.healthy.contains(proxy)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Scheduler reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.as_str() == label)
            .count()
    }
}

impl SchedulerReporter for MockReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        let label = match &event {
            SchedulerEvent::Started { .. } => "Started",
            SchedulerEvent::JobQueued { .. } => "JobQueued",
            SchedulerEvent::JobStarted { .. } => "JobStarted",
            SchedulerEvent::JobSucceeded { .. } => "JobSucceeded",
            SchedulerEvent::JobFailed { .. } => "JobFailed",
            SchedulerEvent::JobDisabled { .. } => "JobDisabled",
            SchedulerEvent::Stopped => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// A successful outcome for `url` carrying `body`.
pub fn make_page(url: &str, body: &str) -> UrlOutcome {
    UrlOutcome {
        url: url.to_string(),
        result: FetchResult::Success(FetchSuccess {
            status_code: 200,
            body: body.to_string(),
            final_url: url.to_string(),
            elapsed_ms: 1,
            attempt: 1,
            proxy: None,
            engine: "mock".into(),
        }),
    }
}

/// A failed outcome for `url`.
pub fn make_failed_page(url: &str, kind: FailureKind) -> UrlOutcome {
    UrlOutcome {
        url: url.to_string(),
        result: FetchResult::Failure(FetchFailure::new(kind, "scripted", 1)),
    }
}
