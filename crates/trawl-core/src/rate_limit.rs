//! Per-domain request pacing.
//!
//! Two independent ceilings apply to every domain:
//!
//! - a politeness delay measured from the domain's last allowed request, and
//! - a sliding 60-second window capping requests per minute.
//!
//! The limiter never sleeps. [`RateLimiter::acquire`] either records the
//! request and returns [`Acquire::Allowed`], or leaves the state untouched
//! and returns [`Acquire::MustWait`] with the time until the next slot. The
//! caller suspends and asks again.
//!
//! ```rust
//! use std::time::Duration;
//! use trawl_core::rate_limit::{Acquire, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::new(Duration::from_secs(2), 30));
//! assert_eq!(limiter.acquire("example.com"), Acquire::Allowed);
//! assert!(matches!(limiter.acquire("example.com"), Acquire::MustWait(_)));
//! assert_eq!(limiter.acquire("other.org"), Acquire::Allowed);
//! ```

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Length of the rolling window for the per-minute cap.
pub const WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Minimum gap between consecutive requests to one domain.
    pub delay: Duration,
    /// Requests allowed per domain in any 60s window. `0` disables the cap.
    pub max_per_minute: u32,
}

impl RateLimitConfig {
    pub fn new(delay: Duration, max_per_minute: u32) -> Self {
        Self {
            delay,
            max_per_minute,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(2),
            max_per_minute: 30,
        }
    }
}

/// Result of [`RateLimiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquire {
    /// The request was recorded; go ahead.
    Allowed,
    /// Nothing was recorded; ask again after this long.
    MustWait(Duration),
}

/// Pacing state of one domain.
#[derive(Debug, Clone)]
pub struct DomainRateState {
    pub domain: String,
    pub last_request_at: Option<Instant>,
    /// Allowed requests inside the current window, oldest first.
    recent: VecDeque<Instant>,
    /// Domain-specific delay (from robots `Crawl-delay`) when larger than
    /// the configured one.
    delay_override: Option<Duration>,
}

impl DomainRateState {
    fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            last_request_at: None,
            recent: VecDeque::new(),
            delay_override: None,
        }
    }

    pub fn window_request_count(&self) -> usize {
        self.recent.len()
    }

    /// Oldest request still inside the window.
    pub fn window_start(&self) -> Option<Instant> {
        self.recent.front().copied()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Shared, per-domain rate limiter.
///
/// Each domain's state sits behind its own mutex, so callers for different
/// domains never contend and callers for the same domain are serialized.
pub struct RateLimiter {
    config: RateLimitConfig,
    domains: DashMap<String, Arc<Mutex<DomainRateState>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            domains: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn acquire(&self, domain: &str) -> Acquire {
        self.acquire_at(domain, Instant::now())
    }

    /// [`acquire`](Self::acquire) against an explicit clock reading.
    pub fn acquire_at(&self, domain: &str, now: Instant) -> Acquire {
        let slot = self.slot(domain);
        let mut state = lock_state(&slot);
        state.prune(now);

        let delay = state
            .delay_override
            .map_or(self.config.delay, |d| d.max(self.config.delay));
        let politeness_wait = state
            .last_request_at
            .map(|last| (last + delay).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);

        let cap = self.config.max_per_minute as usize;
        let window_wait = match state.recent.front() {
            Some(&oldest) if cap > 0 && state.recent.len() >= cap => {
                (oldest + WINDOW).saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        };

        let wait = politeness_wait.max(window_wait);
        if !wait.is_zero() {
            return Acquire::MustWait(wait);
        }

        state.last_request_at = Some(now);
        state.recent.push_back(now);
        Acquire::Allowed
    }

    /// Raise the politeness delay for one domain (robots `Crawl-delay`).
    /// A value below the configured delay has no effect.
    pub fn set_domain_delay(&self, domain: &str, delay: Duration) {
        let slot = self.slot(domain);
        let mut state = lock_state(&slot);
        if delay > self.config.delay && state.delay_override != Some(delay) {
            tracing::debug!(%domain, delay_ms = delay.as_millis() as u64, "Applying crawl delay");
            state.delay_override = Some(delay);
        }
    }

    /// Copy of a domain's current state, if it has been seen.
    pub fn snapshot(&self, domain: &str) -> Option<DomainRateState> {
        let slot = self.domains.get(domain).map(|s| Arc::clone(s.value()))?;
        let state = lock_state(&slot);
        Some(state.clone())
    }

    fn slot(&self, domain: &str) -> Arc<Mutex<DomainRateState>> {
        if let Some(slot) = self.domains.get(domain) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.domains
                .entry(domain.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(DomainRateState::new(domain))))
                .value(),
        )
    }
}

fn lock_state(slot: &Mutex<DomainRateState>) -> MutexGuard<'_, DomainRateState> {
    slot.lock().unwrap_or_else(|poisoned| {
        tracing::warn!("Rate limiter mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn limiter(delay_ms: u64, per_minute: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(
            Duration::from_millis(delay_ms),
            per_minute,
        ))
    }

    #[test]
    fn test_first_request_allowed() {
        let rl = limiter(1000, 10);
        assert_eq!(rl.acquire_at("a.test", Instant::now()), Acquire::Allowed);
    }

    #[test]
    fn test_politeness_delay_measured_from_last_request() {
        let rl = limiter(2000, 100);
        let t0 = Instant::now();
        assert_eq!(rl.acquire_at("a.test", t0), Acquire::Allowed);
        assert_eq!(
            rl.acquire_at("a.test", t0 + Duration::from_millis(500)),
            Acquire::MustWait(Duration::from_millis(1500))
        );
        assert_eq!(
            rl.acquire_at("a.test", t0 + Duration::from_millis(2000)),
            Acquire::Allowed
        );
    }

    #[test]
    fn test_must_wait_does_not_record() {
        let rl = limiter(1000, 100);
        let t0 = Instant::now();
        rl.acquire_at("a.test", t0);
        for ms in [100, 200, 300] {
            rl.acquire_at("a.test", t0 + Duration::from_millis(ms));
        }
        let state = rl.snapshot("a.test").unwrap();
        assert_eq!(state.window_request_count(), 1);
        assert_eq!(state.last_request_at, Some(t0));
    }

    #[test]
    fn test_domains_are_independent() {
        let rl = limiter(5000, 1);
        let t0 = Instant::now();
        assert_eq!(rl.acquire_at("a.test", t0), Acquire::Allowed);
        assert_eq!(rl.acquire_at("b.test", t0), Acquire::Allowed);
        assert!(matches!(rl.acquire_at("a.test", t0), Acquire::MustWait(_)));
    }

    #[test]
    fn test_window_cap_waits_for_oldest_to_expire() {
        let rl = limiter(0, 3);
        let t0 = Instant::now();
        for s in 0..3 {
            assert_eq!(
                rl.acquire_at("a.test", t0 + Duration::from_secs(s)),
                Acquire::Allowed
            );
        }
        // Fourth request at t0+10s: oldest (t0) leaves the window at t0+60s.
        assert_eq!(
            rl.acquire_at("a.test", t0 + Duration::from_secs(10)),
            Acquire::MustWait(Duration::from_secs(50))
        );
        assert_eq!(
            rl.acquire_at("a.test", t0 + Duration::from_secs(60)),
            Acquire::Allowed
        );
        let state = rl.snapshot("a.test").unwrap();
        assert_eq!(state.window_request_count(), 3);
        assert_eq!(state.window_start(), Some(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_wait_is_larger_of_both_ceilings() {
        let rl = limiter(30_000, 1);
        let t0 = Instant::now();
        rl.acquire_at("a.test", t0);
        assert_eq!(
            rl.acquire_at("a.test", t0 + Duration::from_secs(1)),
            Acquire::MustWait(Duration::from_secs(59))
        );
    }

    #[test]
    fn test_zero_cap_disables_window() {
        let rl = limiter(0, 0);
        let t0 = Instant::now();
        for _ in 0..500 {
            assert_eq!(rl.acquire_at("a.test", t0), Acquire::Allowed);
        }
    }

    #[test]
    fn test_crawl_delay_only_raises() {
        let rl = limiter(1000, 100);
        let t0 = Instant::now();
        rl.set_domain_delay("a.test", Duration::from_millis(200));
        rl.acquire_at("a.test", t0);
        assert_eq!(
            rl.acquire_at("a.test", t0 + Duration::from_millis(100)),
            Acquire::MustWait(Duration::from_millis(900))
        );

        rl.set_domain_delay("a.test", Duration::from_secs(5));
        assert_eq!(
            rl.acquire_at("a.test", t0 + Duration::from_secs(1)),
            Acquire::MustWait(Duration::from_secs(4))
        );
        assert_eq!(rl.acquire_at("b.test", t0), Acquire::Allowed);
    }

    #[test]
    fn test_window_never_exceeds_cap_for_random_traffic() {
        let cap = 7u32;
        let rl = limiter(0, cap);
        let mut rng = StdRng::seed_from_u64(42);
        let t0 = Instant::now();
        let mut offset = Duration::ZERO;
        let mut allowed = Vec::new();

        for _ in 0..5_000 {
            offset += Duration::from_millis(rng.gen_range(0..4_000));
            let now = t0 + offset;
            if rl.acquire_at("a.test", now) == Acquire::Allowed {
                allowed.push(now);
            }
        }

        assert!(!allowed.is_empty());
        for (i, start) in allowed.iter().enumerate() {
            let in_window = allowed[i..]
                .iter()
                .take_while(|t| t.duration_since(*start) < WINDOW)
                .count();
            assert!(in_window <= cap as usize, "{in_window} requests in one window");
        }
    }

    #[test]
    fn test_concurrent_same_domain_admits_one() {
        let rl = Arc::new(limiter(10_000, 100));
        let t0 = Instant::now();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let rl = Arc::clone(&rl);
                std::thread::spawn(move || rl.acquire_at("a.test", t0))
            })
            .collect();
        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|a| *a == Acquire::Allowed)
            .count();
        assert_eq!(allowed, 1);
    }
}
