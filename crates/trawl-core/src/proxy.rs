//! Proxy pool with health tracking and quarantine.
//!
//! # Endpoint health
//!
//! ```text
//! HEALTHY --[N consecutive failures]--> QUARANTINED --[cooldown elapsed]--> HEALTHY
//!                                            |
//!                                            +--[too many quarantines]--> DEAD
//! QUARANTINED / DEAD --[probe success]--> HEALTHY
//! ```
//!
//! Each repeated quarantine doubles the cooldown, up to a cap. A success
//! reported while quarantined does not restore the endpoint; only cooldown
//! expiry or an explicit probe does.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::traits::ProxyProber;

/// How the next proxy is chosen among the selectable ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationPolicy {
    /// Cyclic index over healthy endpoints, wrapping around.
    #[default]
    RoundRobin,
    /// Uniform pick among healthy endpoints.
    Random,
}

impl FromStr for RotationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round-robin" | "round_robin" | "roundrobin" => Ok(RotationPolicy::RoundRobin),
            "random" => Ok(RotationPolicy::Random),
            _ => Err(format!("Unknown rotation policy: {s}")),
        }
    }
}

/// Current health of a proxy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyHealth {
    Healthy,
    /// Excluded from selection until the instant passes.
    Quarantined { until: Instant },
    /// Excluded until a probe succeeds.
    Dead,
}

impl fmt::Display for ProxyHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyHealth::Healthy => write!(f, "healthy"),
            ProxyHealth::Quarantined { .. } => write!(f, "quarantined"),
            ProxyHealth::Dead => write!(f, "dead"),
        }
    }
}

/// A proxy endpoint and its health record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub address: String,
    pub health: ProxyHealth,
    pub last_used_at: Option<Instant>,
    /// Consecutive failures since the last success or restoration.
    pub failure_count: u32,
    /// Consecutive quarantines since the last success.
    pub quarantine_count: u32,
}

impl ProxyEndpoint {
    fn new(address: String) -> Self {
        Self {
            address,
            health: ProxyHealth::Healthy,
            last_used_at: None,
            failure_count: 0,
            quarantine_count: 0,
        }
    }

    /// Lazily promotes an expired quarantine back to healthy.
    fn is_selectable(&mut self, now: Instant) -> bool {
        match self.health {
            ProxyHealth::Healthy => true,
            ProxyHealth::Quarantined { until } if now >= until => {
                tracing::info!(proxy = %self.address, "Proxy cooldown elapsed, restoring");
                self.restore();
                true
            }
            ProxyHealth::Quarantined { .. } | ProxyHealth::Dead => false,
        }
    }

    fn restore(&mut self) {
        self.health = ProxyHealth::Healthy;
        self.failure_count = 0;
    }
}

/// Result of using a proxy, as reported by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyOutcome {
    Success,
    Failure,
}

/// Returned by [`ProxyPool::next`] when nothing can be selected.
///
/// Recoverable: callers fall back to a direct fetch or fail the request,
/// depending on configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoProxyAvailable;

impl fmt::Display for NoProxyAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no proxy available")
    }
}

impl std::error::Error for NoProxyAvailable {}

/// Tunables for quarantine behaviour.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    /// Consecutive failures before an endpoint is quarantined.
    pub failure_threshold: u32,
    /// Cooldown for the first quarantine.
    pub cooldown: Duration,
    /// Upper bound for the doubled cooldown.
    pub max_cooldown: Duration,
    /// Quarantines in a row after which the endpoint is marked dead.
    pub max_quarantines: Option<u32>,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(300),
            max_cooldown: Duration::from_secs(3600),
            max_quarantines: None,
        }
    }
}

impl ProxyPoolConfig {
    fn cooldown_for(&self, quarantine_count: u32) -> Duration {
        let exp = quarantine_count.saturating_sub(1).min(16);
        self.cooldown
            .saturating_mul(1u32 << exp)
            .min(self.max_cooldown)
    }
}

/// Thread-safe pool of proxy endpoints.
///
/// Each endpoint sits behind its own lock, so reports for different
/// proxies never contend.
pub struct ProxyPool {
    endpoints: Vec<Arc<Mutex<ProxyEndpoint>>>,
    index: HashMap<String, usize>,
    policy: RotationPolicy,
    config: ProxyPoolConfig,
    cursor: AtomicUsize,
}

impl ProxyPool {
    pub fn new<I, S>(addresses: I, policy: RotationPolicy, config: ProxyPoolConfig) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut endpoints: Vec<Arc<Mutex<ProxyEndpoint>>> = Vec::new();
        let mut index = HashMap::new();
        for address in addresses {
            let address = address.into();
            if !index.contains_key(&address) {
                index.insert(address.clone(), endpoints.len());
                endpoints.push(Arc::new(Mutex::new(ProxyEndpoint::new(address))));
            }
        }
        Self {
            endpoints,
            index,
            policy,
            config,
            cursor: AtomicUsize::new(0),
        }
    }

    /// A pool with no endpoints; every selection returns `NoProxyAvailable`.
    pub fn empty() -> Self {
        Self::new(Vec::<String>::new(), RotationPolicy::default(), ProxyPoolConfig::default())
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn policy(&self) -> RotationPolicy {
        self.policy
    }

    fn lock(slot: &Mutex<ProxyEndpoint>) -> MutexGuard<'_, ProxyEndpoint> {
        slot.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy mutex");
            poisoned.into_inner()
        })
    }

    /// Select the next proxy using the pool's configured policy.
    pub fn next(&self) -> Result<ProxyEndpoint, NoProxyAvailable> {
        self.next_at(self.policy, Instant::now())
    }

    /// Select the next proxy with an explicit policy.
    pub fn next_with(&self, policy: RotationPolicy) -> Result<ProxyEndpoint, NoProxyAvailable> {
        self.next_at(policy, Instant::now())
    }

    pub(crate) fn next_at(
        &self,
        policy: RotationPolicy,
        now: Instant,
    ) -> Result<ProxyEndpoint, NoProxyAvailable> {
        let n = self.endpoints.len();
        if n == 0 {
            return Err(NoProxyAvailable);
        }

        match policy {
            RotationPolicy::RoundRobin => {
                // Best-effort under concurrent callers: two callers may
                // occasionally land on the same endpoint.
                let start = self.cursor.load(Ordering::Relaxed) % n;
                for i in 0..n {
                    let idx = (start + i) % n;
                    let mut endpoint = Self::lock(&self.endpoints[idx]);
                    if endpoint.is_selectable(now) {
                        endpoint.last_used_at = Some(now);
                        self.cursor.store(idx + 1, Ordering::Relaxed);
                        return Ok(endpoint.clone());
                    }
                }
                Err(NoProxyAvailable)
            }
            RotationPolicy::Random => {
                let candidates: Vec<usize> = (0..n)
                    .filter(|&idx| Self::lock(&self.endpoints[idx]).is_selectable(now))
                    .collect();
                if candidates.is_empty() {
                    return Err(NoProxyAvailable);
                }
                let pick = candidates[rand::thread_rng().gen_range(0..candidates.len())];
                let mut endpoint = Self::lock(&self.endpoints[pick]);
                // Re-check: a concurrent report may have quarantined it.
                if !endpoint.is_selectable(now) {
                    drop(endpoint);
                    return self.next_at(RotationPolicy::RoundRobin, now);
                }
                endpoint.last_used_at = Some(now);
                Ok(endpoint.clone())
            }
        }
    }

    /// Record the outcome of a request made through `address`.
    pub fn report_outcome(&self, address: &str, outcome: ProxyOutcome) {
        self.report_outcome_at(address, outcome, Instant::now());
    }

    pub(crate) fn report_outcome_at(&self, address: &str, outcome: ProxyOutcome, now: Instant) {
        let Some(slot) = self.find(address) else {
            tracing::debug!(proxy = %address, "Outcome reported for unknown proxy");
            return;
        };
        let mut endpoint = Self::lock(slot);

        match (outcome, endpoint.health) {
            (ProxyOutcome::Success, ProxyHealth::Healthy) => {
                endpoint.failure_count = 0;
                endpoint.quarantine_count = 0;
            }
            // No flapping: only cooldown expiry or a probe restores.
            (ProxyOutcome::Success, _) => {}
            (ProxyOutcome::Failure, ProxyHealth::Healthy) => {
                endpoint.failure_count += 1;
                if endpoint.failure_count >= self.config.failure_threshold {
                    endpoint.quarantine_count += 1;
                    let too_many = self
                        .config
                        .max_quarantines
                        .is_some_and(|max| endpoint.quarantine_count > max);
                    if too_many {
                        tracing::warn!(
                            proxy = %endpoint.address,
                            quarantines = endpoint.quarantine_count,
                            "Proxy marked dead"
                        );
                        endpoint.health = ProxyHealth::Dead;
                    } else {
                        let cooldown = self.config.cooldown_for(endpoint.quarantine_count);
                        tracing::warn!(
                            proxy = %endpoint.address,
                            failures = endpoint.failure_count,
                            cooldown_secs = cooldown.as_secs(),
                            "Proxy quarantined"
                        );
                        endpoint.health = ProxyHealth::Quarantined {
                            until: now + cooldown,
                        };
                    }
                }
            }
            (ProxyOutcome::Failure, _) => {
                endpoint.failure_count += 1;
            }
        }
    }

    fn find(&self, address: &str) -> Option<&Arc<Mutex<ProxyEndpoint>>> {
        self.index.get(address).map(|&idx| &self.endpoints[idx])
    }

    /// Copy of every endpoint record, in load order.
    pub fn snapshot(&self) -> Vec<ProxyEndpoint> {
        self.endpoints
            .iter()
            .map(|slot| Self::lock(slot).clone())
            .collect()
    }

    /// Number of endpoints currently selectable.
    pub fn available(&self) -> usize {
        let now = Instant::now();
        self.endpoints
            .iter()
            .filter(|slot| Self::lock(slot).is_selectable(now))
            .count()
    }

    /// Probe every quarantined or dead endpoint and restore those that
    /// respond. Returns how many were restored.
    pub async fn probe_quarantined<P: ProxyProber>(&self, prober: &P) -> usize {
        let targets: Vec<String> = self
            .endpoints
            .iter()
            .filter_map(|slot| {
                let endpoint = Self::lock(slot);
                (endpoint.health != ProxyHealth::Healthy).then(|| endpoint.address.clone())
            })
            .collect();

        let results = futures::future::join_all(targets.iter().map(|addr| async move {
            (addr, prober.probe(addr).await)
        }))
        .await;

        let mut restored = 0;
        for (address, ok) in results {
            if !ok {
                continue;
            }
            if let Some(slot) = self.find(address) {
                let mut endpoint = Self::lock(slot);
                if endpoint.health != ProxyHealth::Healthy {
                    tracing::info!(proxy = %address, "Proxy probe succeeded, restoring");
                    endpoint.restore();
                    endpoint.quarantine_count = 0;
                    restored += 1;
                }
            }
        }
        restored
    }
}
