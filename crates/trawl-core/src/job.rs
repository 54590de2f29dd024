use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Serialize, Serializer};
use uuid::Uuid;

use crate::error::AppError;
use crate::fetch::FetchResult;

/// Lifecycle state of a scrape job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Disabled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Disabled => "disabled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// When a job runs.
///
/// Accepted forms:
/// - `once` / `@once`
/// - `@every <n><unit>` with unit `s`, `m`, `h` or `d` (e.g. `@every 15m`)
/// - a cron expression, seconds first (6 or 7 fields). A classic 5-field
///   crontab line is accepted and runs at second 0.
#[derive(Debug, Clone)]
pub enum Schedule {
    Once,
    Interval(Duration),
    Cron(Box<cron::Schedule>),
}

impl Schedule {
    /// First run time for a freshly added (or re-enabled) job.
    pub fn first_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once | Schedule::Interval(_) => Some(now),
            Schedule::Cron(cron) => cron.after(&now).next(),
        }
    }

    /// Run time following a run that finished at `now`. `None` for one-off
    /// jobs.
    pub fn next_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Once => None,
            Schedule::Interval(every) => TimeDelta::from_std(*every).ok().map(|d| now + d),
            Schedule::Cron(cron) => cron.after(&now).next(),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Schedule::Once)
    }
}

impl FromStr for Schedule {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let expr = s.trim();
        let invalid = |reason: &str| AppError::InvalidSchedule {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        if expr.eq_ignore_ascii_case("once") || expr.eq_ignore_ascii_case("@once") {
            return Ok(Schedule::Once);
        }

        if let Some(rest) = expr.strip_prefix("@every") {
            let every = parse_interval(rest.trim()).ok_or_else(|| {
                invalid("expected '@every <n><s|m|h|d>', e.g. '@every 30m'")
            })?;
            if every.is_zero() {
                return Err(invalid("interval must be positive"));
            }
            return Ok(Schedule::Interval(every));
        }

        let fields = expr.split_whitespace().count();
        let normalized = match fields {
            5 => format!("0 {expr}"),
            6 | 7 => expr.to_string(),
            _ => return Err(invalid("expected 'once', '@every <interval>' or a cron expression")),
        };
        cron::Schedule::from_str(&normalized)
            .map(|c| Schedule::Cron(Box::new(c)))
            .map_err(|e| invalid(&e.to_string()))
    }
}

fn parse_interval(text: &str) -> Option<Duration> {
    let split = text.find(|c: char| !c.is_ascii_digit())?;
    let (num, unit) = text.split_at(split);
    let n: u64 = num.parse().ok()?;
    let secs = match unit.trim() {
        "s" | "sec" | "secs" => n,
        "m" | "min" | "mins" => n.checked_mul(60)?,
        "h" | "hr" | "hours" => n.checked_mul(3600)?,
        "d" | "days" => n.checked_mul(86_400)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Once => write!(f, "@once"),
            Schedule::Interval(d) => write!(f, "@every {}s", d.as_secs()),
            Schedule::Cron(c) => write!(f, "{c}"),
        }
    }
}

impl Serialize for Schedule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Result of one URL within a job run.
#[derive(Debug, Clone, Serialize)]
pub struct UrlOutcome {
    pub url: String,
    pub result: FetchResult,
}

impl UrlOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }

    /// Copy without the page body, for keeping in the job's history.
    pub fn without_body(&self) -> Self {
        let mut copy = self.clone();
        if let FetchResult::Success(s) = &mut copy.result {
            s.body = String::new();
        }
        copy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Succeeded,
    Failed,
    /// Interrupted by shutdown; does not count as a failure.
    Cancelled,
}

/// One execution of a job across all its URLs.
#[derive(Debug, Clone, Serialize)]
pub struct JobRunReport {
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: RunStatus,
    /// Per-URL results, in the job's URL order.
    pub outcomes: Vec<UrlOutcome>,
    /// Handler error, if extraction/export failed.
    pub error: Option<String>,
}

impl JobRunReport {
    pub fn failed_urls(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| !o.is_success())
            .map(|o| o.url.as_str())
            .collect()
    }

    pub fn succeeded_urls(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.is_success())
            .map(|o| o.url.as_str())
            .collect()
    }
}

/// A recurring or one-off scrape job owned by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeJob {
    pub id: Uuid,
    pub name: String,
    pub urls: Vec<String>,
    /// Opaque to the scheduler; resolved by the job handler.
    pub schema_ref: Option<String>,
    /// Opaque to the scheduler; resolved by the job handler.
    pub exporter_ref: Option<String>,
    /// Engine hint passed to the dispatcher for every URL.
    pub engine: Option<String>,
    pub schedule: Schedule,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_run: Option<JobRunReport>,
}

/// What [`ScrapeJob::complete`] did to the job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Recurring job back to `Pending`.
    Rescheduled,
    /// One-off job settled in `Succeeded` or `Failed`.
    Settled,
    /// Consecutive failures reached the threshold.
    AutoDisabled,
    /// Disabled while running; stays disabled.
    StillDisabled,
    /// Run was cancelled; job is due again.
    Requeued,
}

impl ScrapeJob {
    pub fn new(new: NewJob, now: DateTime<Utc>) -> Self {
        let (state, next_run_at) = if new.enabled {
            (JobState::Pending, new.schedule.first_run(now))
        } else {
            (JobState::Disabled, None)
        };
        Self {
            id: Uuid::new_v4(),
            name: new.name,
            urls: new.urls,
            schema_ref: new.schema_ref,
            exporter_ref: new.exporter_ref,
            engine: new.engine,
            schedule: new.schedule,
            state,
            created_at: now,
            last_run_at: None,
            next_run_at,
            consecutive_failures: 0,
            last_run: None,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.next_run_at.is_some_and(|t| t <= now)
    }

    pub fn mark_running(&mut self) {
        self.state = JobState::Running;
    }

    /// Apply a finished run to the job.
    pub fn complete(
        &mut self,
        report: JobRunReport,
        now: DateTime<Utc>,
        failure_threshold: u32,
    ) -> Completion {
        let status = report.status;
        if status != RunStatus::Cancelled {
            self.last_run_at = Some(now);
        }
        self.last_run = Some(report);

        if self.state == JobState::Disabled {
            self.next_run_at = None;
            return Completion::StillDisabled;
        }

        match status {
            RunStatus::Cancelled => {
                self.state = JobState::Pending;
                Completion::Requeued
            }
            RunStatus::Succeeded => {
                self.consecutive_failures = 0;
                self.settle_or_reschedule(JobState::Succeeded, now)
            }
            RunStatus::Failed => {
                self.consecutive_failures += 1;
                if failure_threshold > 0 && self.consecutive_failures >= failure_threshold {
                    self.state = JobState::Disabled;
                    self.next_run_at = None;
                    return Completion::AutoDisabled;
                }
                self.settle_or_reschedule(JobState::Failed, now)
            }
        }
    }

    fn settle_or_reschedule(&mut self, outcome: JobState, now: DateTime<Utc>) -> Completion {
        match self.schedule.next_after(now) {
            Some(next) => {
                self.state = JobState::Pending;
                self.next_run_at = Some(next);
                Completion::Rescheduled
            }
            None => {
                self.state = outcome;
                self.next_run_at = None;
                Completion::Settled
            }
        }
    }

    pub fn disable(&mut self) {
        self.state = JobState::Disabled;
        self.next_run_at = None;
    }

    /// Back to `Pending` with a fresh failure count. Has no effect on a
    /// running job.
    pub fn enable(&mut self, now: DateTime<Utc>) {
        if self.state == JobState::Running {
            return;
        }
        self.state = JobState::Pending;
        self.consecutive_failures = 0;
        self.next_run_at = self.schedule.first_run(now);
    }
}

/// Request to add a job to the scheduler.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub urls: Vec<String>,
    pub schedule: Schedule,
    pub schema_ref: Option<String>,
    pub exporter_ref: Option<String>,
    pub engine: Option<String>,
    pub enabled: bool,
}

impl NewJob {
    pub fn new(name: impl Into<String>, urls: Vec<String>, schedule: Schedule) -> Self {
        Self {
            name: name.into(),
            urls,
            schedule,
            schema_ref: None,
            exporter_ref: None,
            engine: None,
            enabled: true,
        }
    }

    pub fn with_schema(mut self, schema_ref: impl Into<String>) -> Self {
        self.schema_ref = Some(schema_ref.into());
        self
    }

    pub fn with_exporter(mut self, exporter_ref: impl Into<String>) -> Self {
        self.exporter_ref = Some(exporter_ref.into());
        self
    }

    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = Some(engine.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Reject jobs without URLs or with unparseable ones.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.urls.is_empty() {
            return Err(AppError::ConfigError(format!(
                "Job '{}' has no URLs",
                self.name
            )));
        }
        for url in &self.urls {
            crate::util::parse_domain(url)?;
        }
        Ok(())
    }
}
