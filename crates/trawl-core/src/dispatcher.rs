//! Orchestration of a single logical fetch.
//!
//! For every URL the dispatcher checks robots.txt, waits for a rate-limit
//! slot, picks a proxy and a user agent, calls the engine under a deadline
//! and feeds failures through the retry policy. Ordinary failures come
//! back as [`FetchResult::Failure`]; nothing here panics or returns `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{FailureKind, FetchFailure};
use crate::fetch::{FetchRequest, FetchResult, FetchSuccess};
use crate::proxy::{ProxyOutcome, ProxyPool};
use crate::rate_limit::{Acquire, RateLimitConfig, RateLimiter};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::robots::RobotsCache;
use crate::traits::{CaptchaSolver, FetchEngine, NullSolver};
use crate::user_agent::{UserAgentPolicy, UserAgentPool};
use crate::util::{parse_domain, sleep_or_cancel};

/// Headers sent with every page request unless overridden.
pub fn default_headers() -> Vec<(String, String)> {
    vec![
        (
            "Accept".into(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
        ),
        ("Accept-Language".into(), "en-US,en;q=0.5".into()),
    ]
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deadline for each engine call.
    pub request_timeout: Duration,
    /// Fail instead of fetching directly when no proxy can be selected.
    pub require_proxy: bool,
    pub headers: Vec<(String, String)>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            require_proxy: false,
            headers: default_headers(),
        }
    }
}

/// Fetches URLs through a registry of engines of type `E`.
///
/// All shared components sit behind `Arc`s so that several dispatchers (or
/// the CLI) can share one proxy pool and rate limiter.
pub struct FetchDispatcher<E: FetchEngine, C: CaptchaSolver = NullSolver> {
    default_engine: E,
    engines: HashMap<String, E>,
    robots: Option<Arc<RobotsCache>>,
    limiter: Arc<RateLimiter>,
    proxies: Arc<ProxyPool>,
    agents: Arc<UserAgentPool>,
    retry: RetryPolicy,
    config: DispatcherConfig,
    solver: Option<C>,
}

impl<E: FetchEngine> FetchDispatcher<E, NullSolver> {
    /// Dispatcher with `engine` as the default and only engine, no robots
    /// checks, no proxies and the built-in user agents.
    pub fn new(engine: E) -> Self {
        Self {
            default_engine: engine,
            engines: HashMap::new(),
            robots: None,
            limiter: Arc::new(RateLimiter::new(RateLimitConfig::default())),
            proxies: Arc::new(ProxyPool::empty()),
            agents: Arc::new(UserAgentPool::builtin(UserAgentPolicy::default())),
            retry: RetryPolicy::default(),
            config: DispatcherConfig::default(),
            solver: None,
        }
    }
}

impl<E: FetchEngine, C: CaptchaSolver> FetchDispatcher<E, C> {
    /// Register an additional engine under its name.
    pub fn with_engine(mut self, engine: E) -> Self {
        self.engines.insert(engine.name().to_string(), engine);
        self
    }

    /// Make a registered engine the default. Unknown names are ignored.
    pub fn with_default_engine(mut self, name: &str) -> Self {
        if self.default_engine.name() == name {
            return self;
        }
        match self.engines.remove(name) {
            Some(engine) => {
                let previous = std::mem::replace(&mut self.default_engine, engine);
                self.engines.insert(previous.name().to_string(), previous);
            }
            None => tracing::warn!(engine = %name, "Unknown default engine, keeping current"),
        }
        self
    }

    pub fn with_robots(mut self, robots: Arc<RobotsCache>) -> Self {
        self.robots = Some(robots);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_proxy_pool(mut self, proxies: Arc<ProxyPool>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_user_agents(mut self, agents: Arc<UserAgentPool>) -> Self {
        self.agents = agents;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_solver<S: CaptchaSolver>(self, solver: S) -> FetchDispatcher<E, S> {
        FetchDispatcher {
            default_engine: self.default_engine,
            engines: self.engines,
            robots: self.robots,
            limiter: self.limiter,
            proxies: self.proxies,
            agents: self.agents,
            retry: self.retry,
            config: self.config,
            solver: Some(solver),
        }
    }

    pub fn proxy_pool(&self) -> &Arc<ProxyPool> {
        &self.proxies
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn robots(&self) -> Option<&Arc<RobotsCache>> {
        self.robots.as_ref()
    }

    pub fn user_agents(&self) -> &Arc<UserAgentPool> {
        &self.agents
    }

    pub fn engine_names(&self) -> Vec<&str> {
        let default = self.default_engine.name();
        std::iter::once(default)
            .chain(self.engines.keys().map(String::as_str).filter(|n| *n != default))
            .collect()
    }

    fn select_engine(&self, hint: Option<&str>) -> &E {
        match hint {
            None => &self.default_engine,
            Some(name) if name == self.default_engine.name() => &self.default_engine,
            Some(name) => match self.engines.get(name) {
                Some(engine) => engine,
                None => {
                    tracing::warn!(
                        engine = %name,
                        fallback = %self.default_engine.name(),
                        "Unknown engine hint, using default"
                    );
                    &self.default_engine
                }
            },
        }
    }

    /// Fetch `url`, optionally through the engine named by `engine_hint`.
    pub async fn fetch(&self, url: &str, engine_hint: Option<&str>) -> FetchResult {
        self.fetch_with_cancel(url, engine_hint, &CancellationToken::new())
            .await
    }

    /// Like [`fetch`](Self::fetch), returning `Failure{Cancelled}` promptly
    /// once `cancel` fires, whatever the fetch is waiting on.
    ///
    /// A successful attempt is reported to the proxy pool as a success. Only
    /// transient failures count against the proxy and rotate a sticky user
    /// agent; permanent failures (404, malformed URL, DNS) say nothing about
    /// the proxy and leave its health unchanged.
    pub async fn fetch_with_cancel(
        &self,
        url: &str,
        engine_hint: Option<&str>,
        cancel: &CancellationToken,
    ) -> FetchResult {
        let started = Instant::now();
        let (parsed, domain) = match parse_domain(url) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(%url, error = %e, "Malformed URL");
                return failure(FailureKind::MalformedUrl, e.to_string(), 1);
            }
        };
        if !matches!(parsed.scheme(), "http" | "https") {
            return failure(
                FailureKind::MalformedUrl,
                format!("unsupported scheme '{}'", parsed.scheme()),
                1,
            );
        }

        let engine = self.select_engine(engine_hint);
        let engine_name = engine.name().to_string();
        tracing::debug!(%url, engine = %engine_name, "Engine chosen");

        if let Some(robots) = &self.robots {
            let verdict = tokio::select! {
                _ = cancel.cancelled() => return cancelled(1),
                v = robots.check(engine, &parsed) => v,
            };
            if !verdict.allowed {
                tracing::info!(%url, %domain, "Blocked by robots.txt");
                return failure(FailureKind::RobotsDisallowed, "disallowed by robots.txt", 1);
            }
            if let Some(delay) = verdict.rule.crawl_delay {
                self.limiter.set_domain_delay(&domain, delay);
            }
        }

        let max_attempts = self.retry.max_attempts();
        let mut extra_headers: Vec<(String, String)> = Vec::new();
        let mut last: Option<(FailureKind, String)> = None;

        for attempt in 1..=max_attempts {
            if !self.wait_for_slot(&domain, cancel).await {
                return cancelled(attempt);
            }

            let proxy = match self.proxies.next() {
                Ok(endpoint) => Some(endpoint.address),
                Err(no_proxy) if self.config.require_proxy => {
                    tracing::warn!(%url, attempt, "No proxy available and proxies are required");
                    return failure(FailureKind::NoProxyAvailable, no_proxy.to_string(), attempt);
                }
                Err(_) => {
                    if !self.proxies.is_empty() {
                        tracing::debug!(%url, attempt, "All proxies unavailable, fetching directly");
                    }
                    None
                }
            };
            let user_agent = self.agents.next(&domain);

            let request = FetchRequest {
                url: url.to_string(),
                engine: engine_name.clone(),
                headers: merge_headers(&self.config.headers, &extra_headers),
                proxy: proxy.clone(),
                user_agent,
                attempt,
                deadline: Instant::now() + self.config.request_timeout,
            };
            tracing::debug!(
                %url,
                attempt,
                proxy = proxy.as_deref().unwrap_or("direct"),
                engine = %engine_name,
                "Dispatching attempt"
            );

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return cancelled(attempt),
                r = tokio::time::timeout(self.config.request_timeout, engine.perform(&request)) => r,
            };

            let (kind, message) = match outcome {
                Ok(Ok(resp)) if resp.is_success() => {
                    if let Some(p) = &proxy {
                        self.proxies.report_outcome(p, ProxyOutcome::Success);
                    }
                    let elapsed_ms = started.elapsed().as_millis() as u64;
                    tracing::info!(
                        %url,
                        attempt,
                        status = resp.status_code,
                        elapsed_ms,
                        "Fetch succeeded"
                    );
                    return FetchResult::Success(FetchSuccess {
                        status_code: resp.status_code,
                        body: resp.body,
                        final_url: resp.final_url,
                        elapsed_ms,
                        attempt,
                        proxy,
                        engine: engine_name,
                    });
                }
                Ok(Ok(resp)) => (
                    FailureKind::from_status(resp.status_code),
                    format!("HTTP {}", resp.status_code),
                ),
                Ok(Err(e)) => (e.kind, e.message),
                Err(_) => (
                    FailureKind::Timeout,
                    format!(
                        "no response within {}ms",
                        self.config.request_timeout.as_millis()
                    ),
                ),
            };

            if kind.is_transient() {
                // The target may be blocking this identity: degrade the proxy
                // and move a sticky agent on.
                if let Some(p) = &proxy {
                    self.proxies.report_outcome(p, ProxyOutcome::Failure);
                }
                self.agents.report_failure(&domain);
            }

            if kind == FailureKind::Captcha {
                if let Some(solver) = &self.solver {
                    match solver.solve(url, &message).await {
                        Some(headers) => {
                            tracing::info!(%url, attempt, "Captcha solved");
                            extra_headers = headers;
                        }
                        None => tracing::debug!(%url, attempt, "Captcha solver declined"),
                    }
                }
            }

            match self.retry.should_retry(attempt, kind) {
                RetryDecision::Retry(delay) => {
                    tracing::info!(
                        %url,
                        attempt,
                        kind = %kind,
                        delay_ms = delay.as_millis() as u64,
                        "Retry scheduled"
                    );
                    last = Some((kind, message));
                    if !sleep_or_cancel(delay, cancel).await {
                        return cancelled(attempt);
                    }
                }
                RetryDecision::GiveUp if kind.is_transient() => {
                    tracing::warn!(%url, attempt, kind = %kind, "Retries exhausted");
                    return FetchResult::Failure(
                        FetchFailure::new(FailureKind::RetriesExhausted, message, attempt)
                            .with_cause(kind),
                    );
                }
                RetryDecision::GiveUp => {
                    tracing::warn!(%url, attempt, kind = %kind, error = %message, "Fetch failed");
                    return failure(kind, message, attempt);
                }
            }
        }

        let (kind, message) =
            last.unwrap_or((FailureKind::RetriesExhausted, "no attempts made".into()));
        FetchResult::Failure(
            FetchFailure::new(FailureKind::RetriesExhausted, message, max_attempts)
                .with_cause(kind),
        )
    }

    /// Block until the rate limiter admits a request for `domain`.
    /// Returns `false` if cancelled while waiting.
    async fn wait_for_slot(&self, domain: &str, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            match self.limiter.acquire(domain) {
                Acquire::Allowed => return true,
                Acquire::MustWait(wait) => {
                    tracing::debug!(%domain, delay_ms = wait.as_millis() as u64, "Rate limited, waiting");
                    if !sleep_or_cancel(wait, cancel).await {
                        return false;
                    }
                }
            }
        }
    }
}

fn failure(kind: FailureKind, message: impl Into<String>, attempt: u32) -> FetchResult {
    FetchResult::Failure(FetchFailure::new(kind, message, attempt))
}

fn cancelled(attempt: u32) -> FetchResult {
    failure(FailureKind::Cancelled, "fetch cancelled", attempt)
}

/// `base` with same-named entries replaced by `overrides` (case-insensitive).
fn merge_headers(
    base: &[(String, String)],
    overrides: &[(String, String)],
) -> Vec<(String, String)> {
    let mut merged: Vec<(String, String)> = base
        .iter()
        .filter(|(k, _)| !overrides.iter().any(|(o, _)| o.eq_ignore_ascii_case(k)))
        .cloned()
        .collect();
    merged.extend(overrides.iter().cloned());
    merged
}
