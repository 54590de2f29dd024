//! robots.txt fetching, parsing and caching.
//!
//! Matching uses Google's longest-match semantics via the `robotstxt`
//! crate: the group for our own agent token wins, and the `*` group is the
//! fallback. The directives we need outside of matching (disallow list,
//! `Crawl-delay`, `Sitemap`) are pulled out by a small line parser.
//!
//! The cache is read-mostly. A stale or missing entry is refetched by
//! whoever notices first; two tasks noticing at once both fetch, and the
//! last write wins.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use moka::future::Cache;
use robotstxt::DefaultMatcher;
use url::Url;

use crate::fetch::{EngineResponse, FetchRequest};
use crate::traits::FetchEngine;
use crate::util::domain_key;

/// Upper bound on cached domains.
pub const MAX_CACHED_DOMAINS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct RobotsConfig {
    /// Product token matched against `User-agent:` lines.
    pub user_agent: String,
    pub ttl: Duration,
    /// TTL for the fallback verdict cached after a failed fetch.
    pub failure_ttl: Duration,
    /// Allow everything when robots.txt cannot be fetched.
    pub fail_open: bool,
    pub request_timeout: Duration,
}

impl Default for RobotsConfig {
    fn default() -> Self {
        Self {
            user_agent: "trawl".into(),
            ttl: Duration::from_secs(24 * 3600),
            failure_ttl: Duration::from_secs(3600),
            fail_open: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    /// Consult the body.
    Rules,
    AllowAll,
    DenyAll,
}

/// Parsed robots.txt of one domain.
#[derive(Debug, Clone)]
pub struct RobotsRule {
    pub domain: String,
    /// `Disallow:` values of the group that applies to us, in file order.
    pub disallowed_paths: Vec<String>,
    pub crawl_delay: Option<Duration>,
    pub sitemaps: Vec<String>,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    agent: String,
    body: String,
    verdict: Verdict,
}

impl RobotsRule {
    pub fn parse(domain: &str, body: &str, agent: &str, ttl: Duration) -> Self {
        let groups = parse_groups(body);
        let agent_lc = agent.to_ascii_lowercase();
        let group = groups
            .iter()
            .find(|g| {
                g.agents
                    .iter()
                    .any(|a| !a.is_empty() && a != "*" && agent_lc.starts_with(a.as_str()))
            })
            .or_else(|| groups.iter().find(|g| g.agents.iter().any(|a| a == "*")));

        let (disallowed_paths, crawl_delay) = match group {
            Some(g) => (g.disallow.clone(), g.crawl_delay),
            None => (Vec::new(), None),
        };

        Self {
            domain: domain.to_string(),
            disallowed_paths,
            crawl_delay,
            sitemaps: parse_sitemaps(body),
            fetched_at: Utc::now(),
            ttl,
            agent: agent.to_string(),
            body: body.to_string(),
            verdict: Verdict::Rules,
        }
    }

    /// Rule that allows every path (no robots.txt, or fail-open fallback).
    pub fn allow_all(domain: &str, ttl: Duration) -> Self {
        Self::fixed(domain, ttl, Verdict::AllowAll)
    }

    /// Rule that denies every path (fail-closed fallback).
    pub fn deny_all(domain: &str, ttl: Duration) -> Self {
        Self::fixed(domain, ttl, Verdict::DenyAll)
    }

    fn fixed(domain: &str, ttl: Duration, verdict: Verdict) -> Self {
        Self {
            domain: domain.to_string(),
            disallowed_paths: Vec::new(),
            crawl_delay: None,
            sitemaps: Vec::new(),
            fetched_at: Utc::now(),
            ttl,
            agent: String::new(),
            body: String::new(),
            verdict,
        }
    }

    /// Whether `path` (a path or a full URL on this domain) may be fetched.
    pub fn is_allowed(&self, path: &str) -> bool {
        match self.verdict {
            Verdict::AllowAll => true,
            Verdict::DenyAll => false,
            Verdict::Rules if self.body.trim().is_empty() => true,
            Verdict::Rules => {
                let url = if path.contains("://") {
                    path.to_string()
                } else {
                    format!("http://{}{}", self.domain, path)
                };
                let mut matcher = DefaultMatcher::default();
                matcher.one_agent_allowed_by_robots(&self.body, &self.agent, &url)
            }
        }
    }

    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.fetched_at);
        age.to_std().map(|age| age >= self.ttl).unwrap_or(false)
    }
}

#[derive(Debug, Default)]
struct Group {
    agents: Vec<String>,
    disallow: Vec<String>,
    crawl_delay: Option<Duration>,
}

fn directives(body: &str) -> impl Iterator<Item = (String, &str)> {
    body.lines().filter_map(|line| {
        let line = line.split('#').next().unwrap_or("").trim();
        let (key, value) = line.split_once(':')?;
        Some((key.trim().to_ascii_lowercase(), value.trim()))
    })
}

fn parse_groups(body: &str) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    let mut current = Group::default();
    // Consecutive User-agent lines share a group.
    let mut in_agents = false;

    for (key, value) in directives(body) {
        match key.as_str() {
            "user-agent" => {
                if !in_agents && !current.agents.is_empty() {
                    groups.push(std::mem::take(&mut current));
                }
                current.agents.push(value.to_ascii_lowercase());
                in_agents = true;
            }
            "disallow" => {
                in_agents = false;
                if !value.is_empty() {
                    current.disallow.push(value.to_string());
                }
            }
            "crawl-delay" => {
                in_agents = false;
                match value.parse::<f64>() {
                    Ok(secs) if secs.is_finite() && secs >= 0.0 => {
                        current.crawl_delay = Some(Duration::from_secs_f64(secs));
                    }
                    _ => {}
                }
            }
            "sitemap" => {}
            _ => in_agents = false,
        }
    }
    if !current.agents.is_empty() {
        groups.push(current);
    }
    groups
}

fn parse_sitemaps(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case("sitemap")
                .then(|| value.trim().to_string())
        })
        .filter(|v| !v.is_empty())
        .collect()
}

/// Outcome of a robots lookup.
#[derive(Debug, Clone)]
pub struct RobotsVerdict {
    pub allowed: bool,
    pub rule: Arc<RobotsRule>,
}

/// Bounded per-domain robots cache.
pub struct RobotsCache {
    config: RobotsConfig,
    entries: Cache<String, Arc<RobotsRule>>,
}

impl RobotsCache {
    pub fn new(config: RobotsConfig) -> Self {
        Self {
            config,
            entries: Cache::new(MAX_CACHED_DOMAINS),
        }
    }

    pub fn config(&self) -> &RobotsConfig {
        &self.config
    }

    /// Check `url` against its domain's robots.txt, fetching it through
    /// `engine` on a miss or when the cached copy is stale.
    ///
    /// The robots request itself is not rate limited.
    pub async fn check<E: FetchEngine>(&self, engine: &E, url: &Url) -> RobotsVerdict {
        let rule = self.rule_for(engine, url).await;
        let allowed = rule.is_allowed(url.as_str());
        tracing::debug!(domain = %rule.domain, url = %url, allowed, "Robots verdict");
        RobotsVerdict { allowed, rule }
    }

    pub async fn is_allowed<E: FetchEngine>(&self, engine: &E, url: &Url) -> bool {
        self.check(engine, url).await.allowed
    }

    /// Cached rule for `url`'s domain, refreshed if missing or expired.
    pub async fn rule_for<E: FetchEngine>(&self, engine: &E, url: &Url) -> Arc<RobotsRule> {
        let Some(domain) = domain_key(url) else {
            return Arc::new(RobotsRule::allow_all("", self.config.failure_ttl));
        };

        if let Some(rule) = self.entries.get(&domain).await {
            if !rule.is_expired() {
                return rule;
            }
            tracing::debug!(%domain, "Cached robots.txt expired, refetching");
        }

        let rule = Arc::new(self.fetch_rule(engine, url.scheme(), &domain).await);
        self.entries.insert(domain, Arc::clone(&rule)).await;
        rule
    }

    /// Seed or replace a domain's rule.
    pub async fn insert(&self, rule: RobotsRule) {
        self.entries.insert(rule.domain.clone(), Arc::new(rule)).await;
    }

    pub async fn get(&self, domain: &str) -> Option<Arc<RobotsRule>> {
        self.entries.get(domain).await
    }

    async fn fetch_rule<E: FetchEngine>(&self, engine: &E, scheme: &str, domain: &str) -> RobotsRule {
        let robots_url = format!("{scheme}://{domain}/robots.txt");
        let request = FetchRequest {
            url: robots_url.clone(),
            engine: engine.name().to_string(),
            headers: Vec::new(),
            proxy: None,
            user_agent: self.config.user_agent.clone(),
            attempt: 1,
            deadline: Instant::now() + self.config.request_timeout,
        };

        let outcome = tokio::time::timeout(self.config.request_timeout, engine.perform(&request)).await;
        match outcome {
            Ok(Ok(resp)) if resp.is_success() => {
                tracing::debug!(%domain, bytes = resp.body.len(), "Fetched robots.txt");
                RobotsRule::parse(domain, &resp.body, &self.config.user_agent, self.config.ttl)
            }
            Ok(Ok(EngineResponse { status_code, .. })) if (400..500).contains(&status_code) => {
                tracing::debug!(%domain, status_code, "No robots.txt, allowing all");
                RobotsRule::allow_all(domain, self.config.ttl)
            }
            Ok(Ok(resp)) => self.fallback(domain, &format!("status {}", resp.status_code)),
            Ok(Err(e)) => self.fallback(domain, &e.to_string()),
            Err(_) => self.fallback(domain, "timed out"),
        }
    }

    fn fallback(&self, domain: &str, reason: &str) -> RobotsRule {
        tracing::warn!(
            %domain,
            reason,
            fail_open = self.config.fail_open,
            ttl_secs = self.config.failure_ttl.as_secs(),
            "robots.txt fetch failed, caching fallback verdict"
        );
        if self.config.fail_open {
            RobotsRule::allow_all(domain, self.config.failure_ttl)
        } else {
            RobotsRule::deny_all(domain, self.config.failure_ttl)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::testutil::{MockEngine, MockReply};

    const ROBOTS: &str = "\
User-agent: *
Disallow: /private
Crawl-delay: 4

User-agent: trawl
User-agent: otherbot
Disallow: /admin
Disallow: /tmp/
Crawl-delay: 1.5

Sitemap: https://a.test/sitemap.xml
";

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_wildcard_group_applies_to_unknown_agent() {
        let rule = RobotsRule::parse("a.test", ROBOTS, "somebot", Duration::from_secs(60));
        assert!(!rule.is_allowed("/private/x"));
        assert!(rule.is_allowed("/public"));
        assert!(rule.is_allowed("/admin"));
        assert_eq!(rule.disallowed_paths, vec!["/private"]);
        assert_eq!(rule.crawl_delay, Some(Duration::from_secs(4)));
    }

    #[test]
    fn test_own_group_overrides_wildcard() {
        let rule = RobotsRule::parse("a.test", ROBOTS, "trawl", Duration::from_secs(60));
        assert!(!rule.is_allowed("/admin/users"));
        assert!(!rule.is_allowed("https://a.test/tmp/file"));
        assert!(rule.is_allowed("/private/x"));
        assert_eq!(rule.disallowed_paths, vec!["/admin", "/tmp/"]);
        assert_eq!(rule.crawl_delay, Some(Duration::from_millis(1500)));
        assert_eq!(rule.sitemaps, vec!["https://a.test/sitemap.xml"]);
    }

    #[test]
    fn test_longest_match_wins() {
        let body = "User-agent: *\nDisallow: /shop\nAllow: /shop/public\n";
        let rule = RobotsRule::parse("a.test", body, "trawl", Duration::from_secs(60));
        assert!(!rule.is_allowed("/shop/cart"));
        assert!(rule.is_allowed("/shop/public/item"));
    }

    #[test]
    fn test_empty_body_allows_everything() {
        let rule = RobotsRule::parse("a.test", "", "trawl", Duration::from_secs(60));
        assert!(rule.is_allowed("/anything"));
    }

    #[test]
    fn test_expiry() {
        let mut rule = RobotsRule::allow_all("a.test", Duration::from_secs(3600));
        assert!(!rule.is_expired());
        rule.fetched_at = Utc::now() - chrono::Duration::hours(2);
        assert!(rule.is_expired());
    }

    #[tokio::test]
    async fn test_cache_fetches_once_and_answers() {
        let engine = MockEngine::new().route("/robots.txt", vec![MockReply::ok(ROBOTS)]);
        let cache = RobotsCache::new(RobotsConfig::default());

        assert!(!cache.is_allowed(&engine, &url("https://a.test/private/x")).await);
        assert!(cache.is_allowed(&engine, &url("https://a.test/public")).await);
        assert_eq!(engine.requests_to("/robots.txt"), 1);

        let sent = engine.requests();
        assert_eq!(sent[0].url, "https://a.test/robots.txt");
        assert_eq!(sent[0].user_agent, "trawl");
    }

    #[tokio::test]
    async fn test_stale_entry_is_refetched() {
        let engine = MockEngine::new().route(
            "/robots.txt",
            vec![MockReply::ok("User-agent: *\nDisallow: /public\n")],
        );
        let cache = RobotsCache::new(RobotsConfig::default());

        let mut stale = RobotsRule::parse(
            "a.test",
            "User-agent: *\nDisallow: /private\n",
            "trawl",
            Duration::from_secs(3600),
        );
        stale.fetched_at = Utc::now() - chrono::Duration::hours(2);
        cache.insert(stale).await;

        assert!(!cache.is_allowed(&engine, &url("https://a.test/public")).await);
        assert!(cache.is_allowed(&engine, &url("https://a.test/private/x")).await);
        assert_eq!(engine.requests_to("/robots.txt"), 1);
    }

    #[tokio::test]
    async fn test_missing_robots_allows_with_normal_ttl() {
        let engine = MockEngine::new().route("/robots.txt", vec![MockReply::status(404)]);
        let cache = RobotsCache::new(RobotsConfig::default());

        let verdict = cache.check(&engine, &url("https://a.test/x")).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.rule.ttl, Duration::from_secs(24 * 3600));
    }

    #[tokio::test]
    async fn test_failed_fetch_fails_open_with_short_ttl() {
        let engine = MockEngine::new().route(
            "/robots.txt",
            vec![MockReply::error(FailureKind::Connection)],
        );
        let cache = RobotsCache::new(RobotsConfig::default());

        let verdict = cache.check(&engine, &url("https://a.test/private")).await;
        assert!(verdict.allowed);
        assert_eq!(verdict.rule.ttl, Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_failed_fetch_fails_closed_when_configured() {
        let engine = MockEngine::new().route("/robots.txt", vec![MockReply::status(503)]);
        let cache = RobotsCache::new(RobotsConfig {
            fail_open: false,
            ..RobotsConfig::default()
        });

        assert!(!cache.is_allowed(&engine, &url("https://a.test/x")).await);
    }

    #[tokio::test]
    async fn test_domains_cached_separately() {
        let engine = MockEngine::new().route("/robots.txt", vec![MockReply::ok(ROBOTS)]);
        let cache = RobotsCache::new(RobotsConfig::default());

        cache.is_allowed(&engine, &url("https://a.test/")).await;
        cache.is_allowed(&engine, &url("https://b.test/")).await;
        cache.is_allowed(&engine, &url("https://a.test/other")).await;
        assert_eq!(engine.requests_to("/robots.txt"), 2);
        assert!(cache.get("b.test").await.is_some());
    }
}
