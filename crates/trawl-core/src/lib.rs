pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fetch;
pub mod handler;
pub mod job;
pub mod models;
pub mod proxy;
pub mod rate_limit;
pub mod retry;
pub mod robots;
pub mod scheduler;
pub mod schema;
pub mod traits;
pub mod user_agent;
pub mod util;

#[cfg(test)]
pub mod testutil;

pub use config::{JobDefinition, ScraperConfig};
pub use dispatcher::{DispatcherConfig, FetchDispatcher};
pub use error::{AppError, FailureClass, FailureKind, FetchFailure};
pub use fetch::{EngineError, EngineResponse, FetchRequest, FetchResult, FetchSuccess};
pub use handler::ExtractExportHandler;
pub use job::{JobRunReport, JobState, NewJob, RunStatus, Schedule, ScrapeJob, UrlOutcome};
pub use models::{ExtractionSchema, FieldSpec, Record, compute_hash};
pub use proxy::{ProxyHealth, ProxyPool, RotationPolicy};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;
pub use robots::{RobotsCache, RobotsRule};
pub use scheduler::{JobScheduler, SchedulerConfig, SchedulerEvent, SchedulerReporter};
pub use schema::SchemaResolver;
pub use traits::{
    CaptchaSolver, Exporter, Extractor, FetchEngine, JobHandler, NullHandler, NullSolver,
    ProxyProber,
};
pub use user_agent::{UserAgentPolicy, UserAgentPool};
