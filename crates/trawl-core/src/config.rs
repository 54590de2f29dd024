//! Scraper configuration: one TOML file, `TRAWL_*` environment overrides,
//! validated once at load time.
//!
//! ```toml
//! request_delay_seconds = 1.5
//! max_requests_per_minute = 20
//! proxy_list_path = "proxies.txt"
//!
//! [[jobs]]
//! name = "quotes"
//! urls = ["https://quotes.toscrape.com/"]
//! schema = "quotes"
//! exporter = "out/quotes.csv"
//! schedule = "@every 30m"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::dispatcher::{DispatcherConfig, FetchDispatcher, default_headers};
use crate::error::AppError;
use crate::job::{NewJob, Schedule};
use crate::proxy::{ProxyPool, ProxyPoolConfig, RotationPolicy};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::retry::RetryPolicy;
use crate::robots::{RobotsCache, RobotsConfig};
use crate::scheduler::SchedulerConfig;
use crate::traits::{CaptchaSolver, FetchEngine};
use crate::user_agent::{BUILTIN_USER_AGENTS, DEFAULT_USER_AGENT, UserAgentPolicy, UserAgentPool};
use crate::util::read_list_file;

/// Prefix for environment overrides (`TRAWL_MAX_RETRIES=5`, ...).
pub const ENV_PREFIX: &str = "TRAWL_";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScraperConfig {
    pub request_delay_seconds: f64,
    pub max_requests_per_minute: u32,
    pub max_retries: u32,
    pub backoff_base_seconds: f64,
    pub backoff_cap_seconds: f64,
    pub jitter_factor: f64,
    pub request_timeout_seconds: f64,

    pub proxy_rotation_policy: RotationPolicy,
    pub proxies: Vec<String>,
    pub proxy_list_path: Option<PathBuf>,
    pub require_proxy: bool,
    pub proxy_failure_threshold: u32,
    pub proxy_cooldown_seconds: u64,
    pub proxy_max_cooldown_seconds: u64,
    pub proxy_max_quarantines: Option<u32>,

    pub user_agent_rotation_policy: UserAgentPolicy,
    pub user_agents: Vec<String>,
    pub user_agent_list_path: Option<PathBuf>,
    pub default_user_agent: String,

    pub respect_robots_txt: bool,
    pub robots_ttl_seconds: u64,
    pub robots_failure_ttl_seconds: u64,
    pub robots_fail_open: bool,
    /// Token matched against robots.txt `User-agent:` groups.
    pub robots_user_agent: String,

    pub job_worker_concurrency: usize,
    pub per_job_url_concurrency: usize,
    pub job_failure_threshold: u32,
    pub scheduler_tick_millis: u64,

    pub default_engine: String,
    /// Extra request headers; override the built-in defaults by name.
    pub headers: BTreeMap<String, String>,
    pub schemas_dir: Option<PathBuf>,
    pub jobs: Vec<JobDefinition>,
}

impl Default for ScraperConfig {
    fn default() -> Self {
        Self {
            request_delay_seconds: 2.0,
            max_requests_per_minute: 30,
            max_retries: 3,
            backoff_base_seconds: 1.0,
            backoff_cap_seconds: 60.0,
            jitter_factor: 0.5,
            request_timeout_seconds: 30.0,
            proxy_rotation_policy: RotationPolicy::RoundRobin,
            proxies: Vec::new(),
            proxy_list_path: None,
            require_proxy: false,
            proxy_failure_threshold: 3,
            proxy_cooldown_seconds: 300,
            proxy_max_cooldown_seconds: 3600,
            proxy_max_quarantines: None,
            user_agent_rotation_policy: UserAgentPolicy::RoundRobin,
            user_agents: Vec::new(),
            user_agent_list_path: None,
            default_user_agent: DEFAULT_USER_AGENT.to_string(),
            respect_robots_txt: true,
            robots_ttl_seconds: 86_400,
            robots_failure_ttl_seconds: 3600,
            robots_fail_open: true,
            robots_user_agent: "trawl".into(),
            job_worker_concurrency: 4,
            per_job_url_concurrency: 5,
            job_failure_threshold: 3,
            scheduler_tick_millis: 1000,
            default_engine: "http".into(),
            headers: BTreeMap::new(),
            schemas_dir: None,
            jobs: Vec::new(),
        }
    }
}

/// A `[[jobs]]` entry.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDefinition {
    pub name: String,
    /// Single-URL shorthand, merged in front of `urls`.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub exporter: Option<String>,
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_schedule() -> String {
    "once".into()
}

fn default_enabled() -> bool {
    true
}

impl JobDefinition {
    pub fn to_new_job(&self) -> Result<NewJob, AppError> {
        let schedule = Schedule::from_str(&self.schedule)?;
        let urls: Vec<String> = self.url.iter().chain(self.urls.iter()).cloned().collect();
        let mut job = NewJob::new(self.name.clone(), urls, schedule);
        job.schema_ref = self.schema.clone();
        job.exporter_ref = self.exporter.clone();
        job.engine = self.engine.clone();
        job.enabled = self.enabled;
        job.validate()?;
        Ok(job)
    }
}

impl ScraperConfig {
    /// Read `path`, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read {}: {e}", path.display()))
        })?;
        let mut config = Self::parse(&content)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, validated. For runs without a
    /// config file.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without validating.
    pub fn parse(content: &str) -> Result<Self, AppError> {
        toml::from_str(content).map_err(|e| AppError::ConfigError(format!("Invalid config: {e}")))
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), AppError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps `TRAWL_*` names to values.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), AppError> {
        fn parsed<T: FromStr>(key: &str, value: &str) -> Result<T, AppError>
        where
            T::Err: std::fmt::Display,
        {
            value
                .trim()
                .parse::<T>()
                .map_err(|e| AppError::ConfigError(format!("{ENV_PREFIX}{key}='{value}': {e}")))
        }

        macro_rules! override_field {
            ($target:expr, $key:literal) => {
                if let Some(value) = lookup(concat!("TRAWL_", $key)) {
                    $target = parsed($key, &value)?;
                }
            };
        }

        override_field!(self.request_delay_seconds, "REQUEST_DELAY_SECONDS");
        override_field!(self.max_requests_per_minute, "MAX_REQUESTS_PER_MINUTE");
        override_field!(self.max_retries, "MAX_RETRIES");
        override_field!(self.backoff_base_seconds, "BACKOFF_BASE_SECONDS");
        override_field!(self.backoff_cap_seconds, "BACKOFF_CAP_SECONDS");
        override_field!(self.jitter_factor, "JITTER_FACTOR");
        override_field!(self.request_timeout_seconds, "REQUEST_TIMEOUT_SECONDS");
        override_field!(self.proxy_rotation_policy, "PROXY_ROTATION_POLICY");
        override_field!(self.require_proxy, "REQUIRE_PROXY");
        override_field!(self.proxy_failure_threshold, "PROXY_FAILURE_THRESHOLD");
        override_field!(self.proxy_cooldown_seconds, "PROXY_COOLDOWN_SECONDS");
        override_field!(self.proxy_max_cooldown_seconds, "PROXY_MAX_COOLDOWN_SECONDS");
        override_field!(self.user_agent_rotation_policy, "USER_AGENT_ROTATION_POLICY");
        override_field!(self.default_user_agent, "DEFAULT_USER_AGENT");
        override_field!(self.respect_robots_txt, "RESPECT_ROBOTS_TXT");
        override_field!(self.robots_ttl_seconds, "ROBOTS_TTL_SECONDS");
        override_field!(self.robots_failure_ttl_seconds, "ROBOTS_FAILURE_TTL_SECONDS");
        override_field!(self.robots_fail_open, "ROBOTS_FAIL_OPEN");
        override_field!(self.robots_user_agent, "ROBOTS_USER_AGENT");
        override_field!(self.job_worker_concurrency, "JOB_WORKER_CONCURRENCY");
        override_field!(self.per_job_url_concurrency, "PER_JOB_URL_CONCURRENCY");
        override_field!(self.job_failure_threshold, "JOB_FAILURE_THRESHOLD");
        override_field!(self.scheduler_tick_millis, "SCHEDULER_TICK_MILLIS");
        override_field!(self.default_engine, "DEFAULT_ENGINE");

        // Empty means "no limit".
        if let Some(value) = lookup("TRAWL_PROXY_MAX_QUARANTINES") {
            self.proxy_max_quarantines = match value.trim() {
                "" => None,
                v => Some(parsed("PROXY_MAX_QUARANTINES", v)?),
            };
        }
        if let Some(list) = lookup("TRAWL_PROXIES") {
            self.proxies = split_list(&list);
        }
        if let Some(list) = lookup("TRAWL_USER_AGENTS") {
            self.user_agents = split_list(&list);
        }

        if let Some(path) = lookup("TRAWL_PROXY_LIST_PATH") {
            self.proxy_list_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("TRAWL_USER_AGENT_LIST_PATH") {
            self.user_agent_list_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup("TRAWL_SCHEMAS_DIR") {
            self.schemas_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |msg: String| Err(AppError::ConfigError(msg));

        for (name, value) in [
            ("request_delay_seconds", self.request_delay_seconds),
            ("backoff_base_seconds", self.backoff_base_seconds),
            ("backoff_cap_seconds", self.backoff_cap_seconds),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be a non-negative number, got {value}"));
            }
        }
        if !self.request_timeout_seconds.is_finite() || self.request_timeout_seconds <= 0.0 {
            return invalid(format!(
                "request_timeout_seconds must be positive, got {}",
                self.request_timeout_seconds
            ));
        }
        if self.backoff_cap_seconds < self.backoff_base_seconds {
            return invalid(format!(
                "backoff_cap_seconds ({}) must be >= backoff_base_seconds ({})",
                self.backoff_cap_seconds, self.backoff_base_seconds
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return invalid(format!(
                "jitter_factor must be between 0 and 1, got {}",
                self.jitter_factor
            ));
        }
        if self.max_requests_per_minute == 0 {
            return invalid("max_requests_per_minute must be >= 1".into());
        }
        if self.job_worker_concurrency == 0 {
            return invalid("job_worker_concurrency must be >= 1".into());
        }
        if self.per_job_url_concurrency == 0 {
            return invalid("per_job_url_concurrency must be >= 1".into());
        }
        if self.proxy_failure_threshold == 0 {
            return invalid("proxy_failure_threshold must be >= 1".into());
        }
        if self.proxy_max_cooldown_seconds < self.proxy_cooldown_seconds {
            return invalid("proxy_max_cooldown_seconds must be >= proxy_cooldown_seconds".into());
        }
        if self.scheduler_tick_millis == 0 {
            return invalid("scheduler_tick_millis must be >= 1".into());
        }
        if self.robots_user_agent.trim().is_empty() {
            return invalid("robots_user_agent cannot be empty".into());
        }
        if self.default_engine.trim().is_empty() {
            return invalid("default_engine cannot be empty".into());
        }

        let mut names = std::collections::HashSet::new();
        for def in &self.jobs {
            if !names.insert(def.name.as_str()) {
                return invalid(format!("Duplicate job name '{}'", def.name));
            }
            def.to_new_job()?;
        }
        Ok(())
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig::new(secs(self.request_delay_seconds), self.max_requests_per_minute)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            secs(self.backoff_base_seconds),
            secs(self.backoff_cap_seconds),
        )
        .with_jitter(self.jitter_factor)
    }

    pub fn proxy_pool_config(&self) -> ProxyPoolConfig {
        ProxyPoolConfig {
            failure_threshold: self.proxy_failure_threshold,
            cooldown: Duration::from_secs(self.proxy_cooldown_seconds),
            max_cooldown: Duration::from_secs(self.proxy_max_cooldown_seconds),
            max_quarantines: self.proxy_max_quarantines,
        }
    }

    pub fn robots_config(&self) -> RobotsConfig {
        RobotsConfig {
            user_agent: self.robots_user_agent.clone(),
            ttl: Duration::from_secs(self.robots_ttl_seconds),
            failure_ttl: Duration::from_secs(self.robots_failure_ttl_seconds),
            fail_open: self.robots_fail_open,
            request_timeout: self.request_timeout(),
        }
    }

    /// Per-request deadline. Out-of-range values map to zero, which
    /// [`validate`](Self::validate) rejects.
    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_seconds)
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let mut headers: Vec<(String, String)> = default_headers()
            .into_iter()
            .filter(|(k, _)| !self.headers.keys().any(|o| o.eq_ignore_ascii_case(k)))
            .collect();
        headers.extend(self.headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        DispatcherConfig {
            request_timeout: self.request_timeout(),
            require_proxy: self.require_proxy,
            headers,
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.scheduler_tick_millis),
            worker_concurrency: self.job_worker_concurrency,
            per_job_url_concurrency: self.per_job_url_concurrency,
            failure_threshold: self.job_failure_threshold,
        }
    }

    /// Inline proxies followed by the list file, if any.
    pub fn load_proxies(&self) -> Result<Vec<String>, AppError> {
        let mut proxies = self.proxies.clone();
        if let Some(path) = &self.proxy_list_path {
            proxies.extend(read_list_file(path)?);
        }
        Ok(proxies)
    }

    /// Inline agents plus the list file; the built-in list when both are empty.
    pub fn load_user_agents(&self) -> Result<Vec<String>, AppError> {
        let mut agents = self.user_agents.clone();
        if let Some(path) = &self.user_agent_list_path {
            agents.extend(read_list_file(path)?);
        }
        if agents.is_empty() {
            agents = BUILTIN_USER_AGENTS.iter().map(|s| s.to_string()).collect();
        }
        Ok(agents)
    }

    pub fn build_proxy_pool(&self) -> Result<ProxyPool, AppError> {
        Ok(ProxyPool::new(
            self.load_proxies()?,
            self.proxy_rotation_policy,
            self.proxy_pool_config(),
        ))
    }

    pub fn build_user_agent_pool(&self) -> Result<UserAgentPool, AppError> {
        Ok(UserAgentPool::new(
            self.load_user_agents()?,
            self.user_agent_rotation_policy,
            self.default_user_agent.clone(),
        ))
    }

    /// Apply every configured component to `dispatcher`.
    pub fn configure_dispatcher<E: FetchEngine, C: CaptchaSolver>(
        &self,
        dispatcher: FetchDispatcher<E, C>,
    ) -> Result<FetchDispatcher<E, C>, AppError> {
        let mut dispatcher = dispatcher
            .with_default_engine(&self.default_engine)
            .with_rate_limiter(Arc::new(RateLimiter::new(self.rate_limit_config())))
            .with_proxy_pool(Arc::new(self.build_proxy_pool()?))
            .with_user_agents(Arc::new(self.build_user_agent_pool()?))
            .with_retry_policy(self.retry_policy())
            .with_config(self.dispatcher_config());
        if self.respect_robots_txt {
            dispatcher = dispatcher.with_robots(Arc::new(RobotsCache::new(self.robots_config())));
        }
        Ok(dispatcher)
    }

    pub fn job_definitions(&self) -> Result<Vec<NewJob>, AppError> {
        self.jobs.iter().map(JobDefinition::to_new_job).collect()
    }
}

/// Comma-separated list; blank entries are dropped.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
