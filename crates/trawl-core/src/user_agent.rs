//! Read-only pool of user-agent strings with rotation policies.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Desktop browser agents used when no list is configured.
pub const BUILTIN_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4_1) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.2478.67",
];

/// Fallback agent for an empty pool.
pub const DEFAULT_USER_AGENT: &str = BUILTIN_USER_AGENTS[0];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UserAgentPolicy {
    #[default]
    RoundRobin,
    Random,
    /// Same agent for a domain until a fetch failure rotates it.
    StickyPerDomain,
}

impl FromStr for UserAgentPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(UserAgentPolicy::RoundRobin),
            "random" => Ok(UserAgentPolicy::Random),
            "sticky-per-domain" | "sticky_per_domain" | "sticky" => {
                Ok(UserAgentPolicy::StickyPerDomain)
            }
            _ => Err(format!("Unknown user-agent policy: {s}")),
        }
    }
}

pub struct UserAgentPool {
    agents: Vec<String>,
    policy: UserAgentPolicy,
    default_agent: String,
    cursor: AtomicUsize,
    /// domain -> index into `agents`
    sticky: DashMap<String, usize>,
}

impl UserAgentPool {
    pub fn new(agents: Vec<String>, policy: UserAgentPolicy, default_agent: impl Into<String>) -> Self {
        Self {
            agents,
            policy,
            default_agent: default_agent.into(),
            cursor: AtomicUsize::new(0),
            sticky: DashMap::new(),
        }
    }

    /// Pool seeded with [`BUILTIN_USER_AGENTS`].
    pub fn builtin(policy: UserAgentPolicy) -> Self {
        Self::new(
            BUILTIN_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            policy,
            DEFAULT_USER_AGENT,
        )
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn policy(&self) -> UserAgentPolicy {
        self.policy
    }

    /// Next agent for `domain` under the pool's policy.
    pub fn next(&self, domain: &str) -> String {
        self.next_with(self.policy, domain)
    }

    /// Next agent for `domain` under an explicit policy.
    ///
    /// Never fails: an empty pool yields the configured default agent.
    pub fn next_with(&self, policy: UserAgentPolicy, domain: &str) -> String {
        if self.agents.is_empty() {
            return self.default_agent.clone();
        }
        let idx = match policy {
            UserAgentPolicy::RoundRobin => self.advance(),
            UserAgentPolicy::Random => rand::thread_rng().gen_range(0..self.agents.len()),
            UserAgentPolicy::StickyPerDomain => *self
                .sticky
                .entry(domain.to_string())
                .or_insert_with(|| self.advance()),
        };
        self.agents[idx].clone()
    }

    /// Tell the pool a fetch to `domain` failed. Under the sticky policy
    /// the domain moves on to the next agent.
    pub fn report_failure(&self, domain: &str) {
        if self.policy != UserAgentPolicy::StickyPerDomain || self.agents.len() < 2 {
            return;
        }
        if let Some(mut idx) = self.sticky.get_mut(domain) {
            *idx = (*idx + 1) % self.agents.len();
            tracing::debug!(%domain, "Rotated sticky user agent");
        }
    }

    fn advance(&self) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % self.agents.len()
    }
}
