use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use url::Url;

use trawl_client::{AnyEngine, CssExtractor, FileExporter, HttpProxyProber, ReqwestEngine};
use trawl_core::config::ScraperConfig;
use trawl_core::dispatcher::FetchDispatcher;
use trawl_core::handler::ExtractExportHandler;
use trawl_core::job::{RunStatus, ScrapeJob};
use trawl_core::robots::RobotsCache;
use trawl_core::scheduler::JobScheduler;
use trawl_core::schema::SchemaResolver;
use trawl_core::traits::ProxyProber;

#[derive(Parser)]
#[command(name = "trawl", version, about = "Polite, scheduled web scraping")]
struct Cli {
    /// Allow fetching private/reserved addresses (localhost, 10.0.0.0/8, ...)
    #[arg(long, global = true, env = "TRAWL_ALLOW_PRIVATE", default_value_t = false)]
    allow_private: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured jobs on their schedules until Ctrl-C
    Run {
        /// Path to the TOML config file
        #[arg(short, long, env = "TRAWL_CONFIG")]
        config: PathBuf,

        /// Execute due jobs a single time and exit
        #[arg(long, default_value_t = false)]
        once: bool,
    },

    /// Fetch one URL through the dispatcher and print the result as JSON
    Fetch {
        #[arg(short, long)]
        url: String,

        /// Engine to use (e.g. "http", "browser")
        #[arg(short, long)]
        engine: Option<String>,

        #[arg(short, long, env = "TRAWL_CONFIG")]
        config: Option<PathBuf>,

        /// Also print the response body
        #[arg(long, default_value_t = false)]
        body: bool,
    },

    /// Check whether robots.txt allows a URL
    Robots {
        #[arg(short, long)]
        url: String,

        #[arg(short, long, env = "TRAWL_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Validate a config file and list its jobs
    Validate {
        #[arg(short, long, env = "TRAWL_CONFIG")]
        config: PathBuf,
    },

    /// Probe every configured proxy and print its health
    ProbeProxies {
        #[arg(short, long, env = "TRAWL_CONFIG")]
        config: PathBuf,

        /// URL requested through each proxy
        #[arg(long, default_value = HttpProxyProber::DEFAULT_TARGET)]
        target: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("trawl=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let allow_private = cli.allow_private;

    match cli.command {
        Commands::Run { config, once } => cmd_run(&config, once, allow_private).await,
        Commands::Fetch {
            url,
            engine,
            config,
            body,
        } => cmd_fetch(&url, engine.as_deref(), config.as_deref(), body, allow_private).await,
        Commands::Robots { url, config } => cmd_robots(&url, config.as_deref(), allow_private).await,
        Commands::Validate { config } => cmd_validate(&config),
        Commands::ProbeProxies { config, target } => cmd_probe_proxies(&config, &target).await,
    }
}

/// Load `path` if given, otherwise defaults plus `TRAWL_*` overrides.
fn load_config(path: Option<&Path>) -> Result<ScraperConfig> {
    let config = match path {
        Some(path) => ScraperConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ScraperConfig::from_env().context("Invalid TRAWL_* environment")?,
    };
    Ok(config)
}

fn http_engine(config: &ScraperConfig, allow_private: bool) -> Result<ReqwestEngine> {
    let engine = ReqwestEngine::with_timeout(config.request_timeout())
        .context("Failed to create HTTP client")?;
    Ok(if allow_private {
        engine.allow_private_urls()
    } else {
        engine
    })
}

fn needs_browser(config: &ScraperConfig, hint: Option<&str>) -> bool {
    let is_browser = |name: Option<&str>| name == Some("browser");
    is_browser(Some(&config.default_engine))
        || is_browser(hint)
        || config.jobs.iter().any(|j| is_browser(j.engine.as_deref()))
}

async fn build_dispatcher(
    config: &ScraperConfig,
    allow_private: bool,
    want_browser: bool,
) -> Result<FetchDispatcher<AnyEngine>> {
    #[allow(unused_mut)]
    let mut dispatcher = FetchDispatcher::new(AnyEngine::from(http_engine(config, allow_private)?));

    #[cfg(feature = "browser")]
    if want_browser {
        let browser = trawl_client::BrowserEngine::launch()
            .await
            .context("Failed to launch headless browser")?;
        dispatcher = dispatcher.with_engine(browser.into());
    }
    #[cfg(not(feature = "browser"))]
    if want_browser {
        tracing::warn!("Built without the `browser` feature; browser jobs use the http engine");
    }

    let dispatcher = config.configure_dispatcher(dispatcher)?;
    tracing::info!(
        engines = ?dispatcher.engine_names(),
        proxies = dispatcher.proxy_pool().len(),
        robots = dispatcher.robots().is_some(),
        "Dispatcher ready"
    );
    Ok(dispatcher)
}

/// Resolve every job's schema up front so a typo fails at startup.
fn check_schemas(config: &ScraperConfig, resolver: &SchemaResolver) -> Result<()> {
    for job in &config.jobs {
        if let Some(schema_ref) = &job.schema {
            let schema = resolver
                .resolve(schema_ref)
                .with_context(|| format!("Job '{}'", job.name))?;
            CssExtractor::check_schema(&schema).with_context(|| format!("Job '{}'", job.name))?;
        }
    }
    Ok(())
}

async fn cmd_run(config_path: &Path, once: bool, allow_private: bool) -> Result<()> {
    let config = load_config(Some(config_path))?;
    if config.jobs.is_empty() {
        bail!("No [[jobs]] defined in {}", config_path.display());
    }

    let resolver = SchemaResolver::new(config.schemas_dir.clone());
    check_schemas(&config, &resolver)?;

    let dispatcher =
        Arc::new(build_dispatcher(&config, allow_private, needs_browser(&config, None)).await?);
    let handler = ExtractExportHandler::new(CssExtractor::new(), FileExporter::new(), resolver);
    let scheduler = JobScheduler::new(Arc::clone(&dispatcher), handler, config.scheduler_config());
    for job in config.job_definitions()? {
        let name = job.name.clone();
        let id = scheduler.add_job(job)?;
        tracing::debug!(%id, job = %name, "Job registered");
    }

    if once {
        let reports = scheduler.run_due(Utc::now()).await;
        let failed = reports
            .iter()
            .filter(|r| r.status != RunStatus::Succeeded)
            .count();
        println!("{}", serde_json::to_string_pretty(&reports)?);
        if failed > 0 {
            bail!("{failed} of {} job run(s) did not succeed", reports.len());
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let prober = tokio::spawn(probe_loop(
        Arc::clone(&dispatcher),
        Duration::from_secs(config.proxy_cooldown_seconds.max(1)),
        cancel.clone(),
    ));

    scheduler.start()?;
    tracing::info!(jobs = scheduler.list_jobs().len(), "Scheduler running, Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Shutting down");
    cancel.cancel();
    scheduler.stop().await;
    if let Err(e) = prober.await {
        tracing::error!(error = %e, "Proxy probe task panicked");
    }
    Ok(())
}

/// Periodically give quarantined proxies a chance to come back.
async fn probe_loop(
    dispatcher: Arc<FetchDispatcher<AnyEngine>>,
    every: Duration,
    cancel: CancellationToken,
) {
    let pool = Arc::clone(dispatcher.proxy_pool());
    if pool.is_empty() {
        return;
    }
    let prober = HttpProxyProber::new();
    let mut interval = tokio::time::interval(every);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let restored = pool.probe_quarantined(&prober).await;
                if restored > 0 {
                    tracing::info!(restored, "Proxies restored by probe");
                }
            }
        }
    }
}

async fn cmd_fetch(
    url: &str,
    engine: Option<&str>,
    config_path: Option<&Path>,
    print_body: bool,
    allow_private: bool,
) -> Result<()> {
    let config = load_config(config_path)?;
    let dispatcher =
        build_dispatcher(&config, allow_private, needs_browser(&config, engine)).await?;

    let result = dispatcher.fetch(url, engine).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    match result.success() {
        Some(page) => {
            if print_body {
                println!("{}", page.body);
            }
            Ok(())
        }
        None => bail!("Fetch of {url} failed"),
    }
}

async fn cmd_robots(url: &str, config_path: Option<&Path>, allow_private: bool) -> Result<()> {
    let config = load_config(config_path)?;
    let parsed = Url::parse(url).with_context(|| format!("Invalid URL: {url}"))?;
    let engine = http_engine(&config, allow_private)?;
    let cache = RobotsCache::new(config.robots_config());

    let verdict = cache.check(&engine, &parsed).await;
    let rule = &verdict.rule;
    let summary = serde_json::json!({
        "url": url,
        "allowed": verdict.allowed,
        "agent": config.robots_user_agent,
        "domain": rule.domain,
        "crawl_delay_seconds": rule.crawl_delay.map(|d| d.as_secs_f64()),
        "disallowed_paths": rule.disallowed_paths,
        "sitemaps": rule.sitemaps,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    let config = load_config(Some(config_path))?;
    let resolver = SchemaResolver::new(config.schemas_dir.clone());
    check_schemas(&config, &resolver)?;

    let now = Utc::now();
    println!("Config OK: {}", config_path.display());
    println!(
        "  rate: {}s delay, {} req/min per domain; retries: {}; robots: {}",
        config.request_delay_seconds,
        config.max_requests_per_minute,
        config.max_retries,
        if config.respect_robots_txt { "on" } else { "off" },
    );
    println!(
        "  proxies: {}; user agents: {}",
        config.load_proxies()?.len(),
        config.load_user_agents()?.len()
    );

    if config.jobs.is_empty() {
        println!("\nNo jobs defined.");
        return Ok(());
    }
    println!("\nJobs:");
    for new_job in config.job_definitions()? {
        let job = ScrapeJob::new(new_job, now);
        let next = match job.next_run_at {
            Some(at) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            None => "-".to_string(),
        };
        println!(
            "  {:<24} {:<20} {:>3} url(s)  state={:<9} next={}",
            job.name,
            job.schedule.to_string(),
            job.urls.len(),
            format!("{:?}", job.state),
            next
        );
    }
    Ok(())
}

async fn cmd_probe_proxies(config_path: &Path, target: &str) -> Result<()> {
    let config = load_config(Some(config_path))?;
    let proxies = config.load_proxies()?;
    if proxies.is_empty() {
        println!("No proxies configured.");
        return Ok(());
    }

    let prober = HttpProxyProber::with_target(
        target,
        config.request_timeout(),
    );
    let results: Vec<(String, bool)> = futures::stream::iter(proxies)
        .map(|proxy| {
            let prober = prober.clone();
            async move {
                let ok = prober.probe(&proxy).await;
                (proxy, ok)
            }
        })
        .buffered(8)
        .collect()
        .await;

    let healthy = results.iter().filter(|(_, ok)| *ok).count();
    for (proxy, ok) in &results {
        println!("  {:<8} {proxy}", if *ok { "healthy" } else { "dead" });
    }
    println!("\n{healthy}/{} proxies healthy", results.len());
    Ok(())
}
