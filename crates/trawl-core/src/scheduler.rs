//! Time-driven job scheduler.
//!
//! A single tick loop finds due jobs, flips them to `Running` and queues
//! their ids on an mpsc channel. A fixed pool of workers drains the queue;
//! each job run fans its URLs out through the dispatcher with a per-job
//! concurrency cap and hands fully successful runs to the [`JobHandler`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::FetchDispatcher;
use crate::error::{AppError, FailureKind};
use crate::job::{Completion, JobRunReport, JobState, NewJob, RunStatus, ScrapeJob, UrlOutcome};
use crate::traits::{CaptchaSolver, FetchEngine, JobHandler, NullSolver};
use crate::util::sleep_or_cancel;

/// Due job ids waiting for a worker.
const QUEUE_CAPACITY: usize = 1024;

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Started {
        workers: usize,
    },
    JobQueued {
        job_id: Uuid,
        name: &'a str,
    },
    JobStarted {
        job_id: Uuid,
        name: &'a str,
        urls: usize,
    },
    JobSucceeded {
        job_id: Uuid,
        name: &'a str,
        elapsed_ms: u64,
    },
    JobFailed {
        job_id: Uuid,
        name: &'a str,
        failed_urls: usize,
        error: Option<&'a str>,
    },
    /// Consecutive failures reached the threshold.
    JobDisabled {
        job_id: Uuid,
        name: &'a str,
        consecutive_failures: u32,
    },
    Stopped,
}

/// Trait for receiving scheduler events (decoupled logging).
///
/// Called inline from the scheduler; implementations must not block.
pub trait SchedulerReporter: Send + Sync {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSchedulerReporter;

impl SchedulerReporter for TracingSchedulerReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Started { workers } => {
                tracing::info!(workers, "Scheduler started");
            }
            SchedulerEvent::JobQueued { job_id, name } => {
                tracing::debug!(%job_id, job = %name, "Job queued");
            }
            SchedulerEvent::JobStarted { job_id, name, urls } => {
                tracing::info!(%job_id, job = %name, urls, "Job run started");
            }
            SchedulerEvent::JobSucceeded {
                job_id,
                name,
                elapsed_ms,
            } => {
                tracing::info!(%job_id, job = %name, elapsed_ms, "Job run succeeded");
            }
            SchedulerEvent::JobFailed {
                job_id,
                name,
                failed_urls,
                error,
            } => {
                tracing::warn!(
                    %job_id,
                    job = %name,
                    failed_urls,
                    error = error.unwrap_or(""),
                    "Job run failed"
                );
            }
            SchedulerEvent::JobDisabled {
                job_id,
                name,
                consecutive_failures,
            } => {
                tracing::warn!(
                    %job_id,
                    job = %name,
                    consecutive_failures,
                    "Job disabled after repeated failures"
                );
            }
            SchedulerEvent::Stopped => {
                tracing::info!("Scheduler stopped");
            }
        }
    }
}

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// Job runs executing at once.
    pub worker_concurrency: usize,
    /// Concurrent fetches inside one job run.
    pub per_job_url_concurrency: usize,
    /// Consecutive failed runs before a job is disabled. `0` never disables.
    pub failure_threshold: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            worker_concurrency: 4,
            per_job_url_concurrency: 5,
            failure_threshold: 3,
        }
    }
}

struct Inner<E: FetchEngine, H: JobHandler, C: CaptchaSolver> {
    dispatcher: Arc<FetchDispatcher<E, C>>,
    handler: H,
    config: SchedulerConfig,
    reporter: Arc<dyn SchedulerReporter>,
    jobs: Mutex<HashMap<Uuid, ScrapeJob>>,
}

struct Running {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Owns every [`ScrapeJob`] and drives them through their schedules.
pub struct JobScheduler<E: FetchEngine, H: JobHandler, C: CaptchaSolver = NullSolver> {
    inner: Arc<Inner<E, H, C>>,
    running: Mutex<Option<Running>>,
}

impl<E: FetchEngine, H: JobHandler, C: CaptchaSolver> JobScheduler<E, H, C> {
    pub fn new(dispatcher: Arc<FetchDispatcher<E, C>>, handler: H, config: SchedulerConfig) -> Self {
        Self::with_reporter(dispatcher, handler, config, Arc::new(TracingSchedulerReporter))
    }

    pub fn with_reporter(
        dispatcher: Arc<FetchDispatcher<E, C>>,
        handler: H,
        config: SchedulerConfig,
        reporter: Arc<dyn SchedulerReporter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                handler,
                config,
                reporter,
                jobs: Mutex::new(HashMap::new()),
            }),
            running: Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> &Arc<FetchDispatcher<E, C>> {
        &self.inner.dispatcher
    }

    pub fn add_job(&self, new: NewJob) -> Result<Uuid, AppError> {
        new.validate()?;
        let job = ScrapeJob::new(new, Utc::now());
        let id = job.id;
        tracing::info!(job_id = %id, job = %job.name, schedule = %job.schedule, "Job added");
        self.inner.lock_jobs().insert(id, job);
        Ok(id)
    }

    /// Jobs are never deleted while the process runs; removing disables.
    pub fn remove_job(&self, id: Uuid) -> Result<(), AppError> {
        self.disable_job(id)
    }

    pub fn disable_job(&self, id: Uuid) -> Result<(), AppError> {
        self.inner.with_job(id, |job| {
            job.disable();
            tracing::info!(job_id = %id, job = %job.name, "Job disabled");
        })
    }

    pub fn enable_job(&self, id: Uuid) -> Result<(), AppError> {
        self.inner.with_job(id, |job| {
            job.enable(Utc::now());
            tracing::info!(job_id = %id, job = %job.name, "Job enabled");
        })
    }

    pub fn get_job(&self, id: Uuid) -> Option<ScrapeJob> {
        self.inner.lock_jobs().get(&id).cloned()
    }

    /// All jobs, oldest first.
    pub fn list_jobs(&self) -> Vec<ScrapeJob> {
        let mut jobs: Vec<ScrapeJob> = self.inner.lock_jobs().values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        jobs
    }

    /// Run every job due at `now` to completion, inline.
    ///
    /// Runs execute with the worker concurrency limit. Used by one-shot runs
    /// and tests; the background loop started by [`start`](Self::start)
    /// does the same thing on every tick.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<JobRunReport> {
        let due = self.inner.collect_due(now);
        let cancel = self.current_token();
        let inner = &self.inner;
        stream::iter(due)
            .map(|id| {
                let cancel = cancel.clone();
                async move { inner.execute(id, &cancel).await }
            })
            .buffer_unordered(self.inner.config.worker_concurrency.max(1))
            .filter_map(|report| async move { report })
            .collect()
            .await
    }

    /// Run one job immediately, outside its schedule.
    pub async fn run_job_now(&self, id: Uuid) -> Result<JobRunReport, AppError> {
        {
            let mut jobs = self.inner.lock_jobs();
            let job = jobs.get_mut(&id).ok_or(AppError::JobNotFound(id))?;
            match job.state {
                JobState::Running => {
                    return Err(AppError::SchedulerError(format!(
                        "Job '{}' is already running",
                        job.name
                    )));
                }
                JobState::Disabled => {
                    return Err(AppError::SchedulerError(format!(
                        "Job '{}' is disabled",
                        job.name
                    )));
                }
                _ => job.mark_running(),
            }
        }
        let cancel = self.current_token();
        self.inner
            .execute(id, &cancel)
            .await
            .ok_or(AppError::JobNotFound(id))
    }

    pub fn is_running(&self) -> bool {
        self.lock_running().is_some()
    }

    /// Spawn the tick loop and the worker pool.
    pub fn start(&self) -> Result<(), AppError> {
        let mut running = self.lock_running();
        if running.is_some() {
            return Err(AppError::SchedulerError("Scheduler already started".into()));
        }

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel::<Uuid>(QUEUE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let workers = self.inner.config.worker_concurrency.max(1);
        self.inner.reporter.report(SchedulerEvent::Started { workers });

        let mut tasks = Vec::with_capacity(workers + 1);
        for worker in 0..workers {
            let inner = Arc::clone(&self.inner);
            let rx = Arc::clone(&rx);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                inner.worker_loop(worker, rx, cancel).await;
            }));
        }
        let inner = Arc::clone(&self.inner);
        let tick_cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            inner.tick_loop(tx, tick_cancel).await;
        }));

        *running = Some(Running { cancel, tasks });
        Ok(())
    }

    /// Cancel in-flight work and wait for every task to exit.
    ///
    /// Runs interrupted here go back to `Pending` without counting as a
    /// failure. Stopping a scheduler that is not running is a no-op.
    pub async fn stop(&self) {
        let Some(running) = self.lock_running().take() else {
            return;
        };
        running.cancel.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Scheduler task panicked");
            }
        }
        let released = self.inner.release_running();
        if released > 0 {
            tracing::info!(released, "Requeued jobs interrupted by shutdown");
        }
        self.inner.reporter.report(SchedulerEvent::Stopped);
    }

    fn current_token(&self) -> CancellationToken {
        self.lock_running()
            .as_ref()
            .map(|r| r.cancel.clone())
            .unwrap_or_default()
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned scheduler mutex");
            poisoned.into_inner()
        })
    }
}

impl<E: FetchEngine, H: JobHandler, C: CaptchaSolver> Inner<E, H, C> {
    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<Uuid, ScrapeJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned job table mutex");
            poisoned.into_inner()
        })
    }

    fn with_job(&self, id: Uuid, f: impl FnOnce(&mut ScrapeJob)) -> Result<(), AppError> {
        let mut jobs = self.lock_jobs();
        let job = jobs.get_mut(&id).ok_or(AppError::JobNotFound(id))?;
        f(job);
        Ok(())
    }

    /// Mark every due job `Running` and return their ids, earliest first.
    fn collect_due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut jobs = self.lock_jobs();
        let mut due: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values_mut()
            .filter(|job| job.is_due(now))
            .map(|job| {
                job.mark_running();
                (job.next_run_at.unwrap_or(now), job.id)
            })
            .collect();
        due.sort();
        due.into_iter().map(|(_, id)| id).collect()
    }

    /// Put jobs left `Running` (queued but never picked up) back to `Pending`.
    fn release_running(&self) -> usize {
        let mut jobs = self.lock_jobs();
        let mut count = 0;
        for job in jobs.values_mut().filter(|j| j.state == JobState::Running) {
            job.state = JobState::Pending;
            count += 1;
        }
        count
    }

    async fn tick_loop(&self, tx: mpsc::Sender<Uuid>, cancel: CancellationToken) {
        loop {
            for id in self.collect_due(Utc::now()) {
                let name = self.lock_jobs().get(&id).map(|j| j.name.clone());
                if let Some(name) = name {
                    self.reporter.report(SchedulerEvent::JobQueued {
                        job_id: id,
                        name: &name,
                    });
                }
                let sent = tokio::select! {
                    _ = cancel.cancelled() => return,
                    r = tx.send(id) => r,
                };
                if sent.is_err() {
                    return;
                }
            }
            if !sleep_or_cancel(self.config.tick_interval, &cancel).await {
                return;
            }
        }
    }

    async fn worker_loop(
        &self,
        worker: usize,
        queue: Arc<tokio::sync::Mutex<mpsc::Receiver<Uuid>>>,
        cancel: CancellationToken,
    ) {
        tracing::debug!(worker, "Worker started");
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                id = async { queue.lock().await.recv().await } => id,
            };
            match next {
                Some(id) => {
                    self.execute(id, &cancel).await;
                }
                None => break,
            }
        }
        tracing::debug!(worker, "Worker stopped");
    }

    /// Run job `id` (already marked `Running`) and record the outcome.
    async fn execute(&self, id: Uuid, cancel: &CancellationToken) -> Option<JobRunReport> {
        let job = self.lock_jobs().get(&id).cloned()?;
        self.reporter.report(SchedulerEvent::JobStarted {
            job_id: id,
            name: &job.name,
            urls: job.urls.len(),
        });

        let started_at = Utc::now();
        let clock = Instant::now();
        let outcomes: Vec<UrlOutcome> = stream::iter(job.urls.clone())
            .map(|url| {
                let dispatcher = Arc::clone(&self.dispatcher);
                let engine_hint = job.engine.clone();
                let cancel = cancel.clone();
                async move {
                    let result = dispatcher
                        .fetch_with_cancel(&url, engine_hint.as_deref(), &cancel)
                        .await;
                    UrlOutcome { url, result }
                }
            })
            .buffered(self.config.per_job_url_concurrency.max(1))
            .collect()
            .await;

        let interrupted = cancel.is_cancelled()
            && outcomes
                .iter()
                .any(|o| o.result.failure().is_some_and(|f| f.kind == FailureKind::Cancelled));

        let (status, error) = if interrupted {
            (RunStatus::Cancelled, None)
        } else if outcomes.iter().all(UrlOutcome::is_success) {
            match self.handler.handle(&job, &outcomes).await {
                Ok(()) => (RunStatus::Succeeded, None),
                Err(e) => (RunStatus::Failed, Some(e.to_string())),
            }
        } else {
            (RunStatus::Failed, None)
        };

        let report = JobRunReport {
            job_id: id,
            started_at,
            finished_at: Utc::now(),
            status,
            outcomes: outcomes.iter().map(UrlOutcome::without_body).collect(),
            error,
        };

        let (completion, failures) = {
            let mut jobs = self.lock_jobs();
            match jobs.get_mut(&id) {
                Some(stored) => {
                    let c = stored.complete(report.clone(), Utc::now(), self.config.failure_threshold);
                    (c, stored.consecutive_failures)
                }
                None => return Some(report),
            }
        };

        match status {
            RunStatus::Succeeded => self.reporter.report(SchedulerEvent::JobSucceeded {
                job_id: id,
                name: &job.name,
                elapsed_ms: clock.elapsed().as_millis() as u64,
            }),
            RunStatus::Failed => self.reporter.report(SchedulerEvent::JobFailed {
                job_id: id,
                name: &job.name,
                failed_urls: report.failed_urls().len(),
                error: report.error.as_deref(),
            }),
            RunStatus::Cancelled => {
                tracing::info!(job_id = %id, job = %job.name, "Job run interrupted, requeued");
            }
        }
        if completion == Completion::AutoDisabled {
            self.reporter.report(SchedulerEvent::JobDisabled {
                job_id: id,
                name: &job.name,
                consecutive_failures: failures,
            });
        }
        Some(report)
    }
}
