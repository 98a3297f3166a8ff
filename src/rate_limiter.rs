//! Sliding-window admission control.
//!
//! Tracks request timestamps per endpoint key inside a moving window. A
//! full window yields a normal denied decision, never an error; the only
//! failure this module can produce at runtime is a poisoned lock.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{Error, Result};

/// Limits applied to a single endpoint key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointLimit {
    pub max_requests: u32,
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,
}

fn default_max_memory_entries() -> usize {
    10_000
}

impl EndpointLimit {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            max_memory_entries: default_max_memory_entries(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::Config("max_requests must be greater than 0".into()));
        }
        if self.window.is_zero() {
            return Err(Error::Config("window must be greater than 0".into()));
        }
        if self.max_memory_entries == 0 {
            return Err(Error::Config(
                "max_memory_entries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Per-endpoint limits plus a catch-all default for unconfigured keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    pub endpoints: HashMap<String, EndpointLimit>,
    pub default_limit: EndpointLimit,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "/events/screen".to_string(),
            EndpointLimit::new(5, Duration::from_secs(300)),
        );
        endpoints.insert(
            "/events/text".to_string(),
            EndpointLimit::new(20, Duration::from_secs(60)),
        );
        Self {
            endpoints,
            default_limit: EndpointLimit::new(100, Duration::from_secs(60)),
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<()> {
        self.default_limit.validate()?;
        for (key, limit) in &self.endpoints {
            limit
                .validate()
                .map_err(|e| Error::Config(format!("endpoint {key}: {e}")))?;
        }
        Ok(())
    }

    fn limit_for(&self, endpoint: &str) -> &EndpointLimit {
        self.endpoints.get(endpoint).unwrap_or(&self.default_limit)
    }
}

/// Admission decision returned to callers.
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub allowed: bool,
    pub remaining: u32,
    pub limit: u32,
    pub retry_after_secs: Option<u64>,
    pub reset_at: Option<SystemTime>,
}

struct RateWindow {
    timestamps: VecDeque<Instant>,
}

impl RateWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(oldest) = self.timestamps.front() {
            if now.duration_since(*oldest) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-endpoint statistics for the monitoring surface.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub endpoint: String,
    pub current_requests: usize,
    pub max_requests: u32,
    pub window_secs: u64,
    pub remaining: u32,
    pub is_limited: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub total_admitted: u64,
    pub total_denied: u64,
    pub tracked_endpoints: usize,
    pub endpoints: Vec<EndpointStats>,
}

/// Sliding-window rate limiter with per-key windows and bounded memory.
///
/// Independent keys are mutated under independent locks; the shared map
/// is only write-locked when a new key first appears or during cleanup.
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: RwLock<HashMap<String, Arc<Mutex<RateWindow>>>>,
    total_admitted: AtomicU64,
    total_denied: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            windows: RwLock::new(HashMap::new()),
            total_admitted: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
        })
    }

    /// Admit or deny a request against the endpoint's sliding window.
    pub fn admit(&self, endpoint: &str) -> Result<Admission> {
        self.admit_at(endpoint, Instant::now())
    }

    fn admit_at(&self, endpoint: &str, now: Instant) -> Result<Admission> {
        let limit = self.config.limit_for(endpoint).clone();
        let window = self.window_for(endpoint)?;

        let mut state = window
            .lock()
            .map_err(|_| Error::Internal("rate window lock poisoned".into()))?;
        state.prune(now, limit.window);

        let count = state.timestamps.len() as u32;
        if count < limit.max_requests {
            state.timestamps.push_back(now);
            self.total_admitted.fetch_add(1, Ordering::Relaxed);

            let remaining = limit.max_requests - count - 1;
            if remaining <= limit.max_requests / 5 {
                tracing::info!(
                    target: "coalescer::rate_limiter",
                    endpoint,
                    used = count + 1,
                    max = limit.max_requests,
                    "high rate limit usage"
                );
            }

            return Ok(Admission {
                allowed: true,
                remaining,
                limit: limit.max_requests,
                retry_after_secs: None,
                reset_at: None,
            });
        }

        // Window is full: the slot opens when the oldest timestamp ages out.
        let retry_after = state
            .timestamps
            .front()
            .map(|oldest| limit.window.saturating_sub(now.duration_since(*oldest)))
            .unwrap_or(limit.window);

        self.total_denied.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            target: "coalescer::rate_limiter",
            endpoint,
            max = limit.max_requests,
            window_secs = limit.window.as_secs(),
            "rate limit exceeded"
        );

        Ok(Admission {
            allowed: false,
            remaining: 0,
            limit: limit.max_requests,
            retry_after_secs: Some(retry_after.as_secs().max(1)),
            reset_at: Some(SystemTime::now() + retry_after),
        })
    }

    fn window_for(&self, endpoint: &str) -> Result<Arc<Mutex<RateWindow>>> {
        {
            let windows = self
                .windows
                .read()
                .map_err(|_| Error::Internal("rate limiter map lock poisoned".into()))?;
            if let Some(window) = windows.get(endpoint) {
                return Ok(Arc::clone(window));
            }
        }

        let mut windows = self
            .windows
            .write()
            .map_err(|_| Error::Internal("rate limiter map lock poisoned".into()))?;
        let window = windows
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(RateWindow {
                    timestamps: VecDeque::new(),
                }))
            });
        Ok(Arc::clone(window))
    }

    /// Prune expired timestamps, enforce the memory bound, and drop
    /// endpoints whose windows emptied out. Run from the periodic sweep.
    pub fn cleanup(&self) -> Result<usize> {
        let now = Instant::now();
        let mut windows = self
            .windows
            .write()
            .map_err(|_| Error::Internal("rate limiter map lock poisoned".into()))?;

        let before = windows.len();
        windows.retain(|endpoint, window| {
            let Ok(mut state) = window.lock() else {
                return false;
            };
            let limit = self.config.limit_for(endpoint);
            state.prune(now, limit.window);
            while state.timestamps.len() > limit.max_memory_entries {
                state.timestamps.pop_front();
            }
            !state.timestamps.is_empty()
        });
        let removed = before - windows.len();

        if removed > 0 {
            tracing::debug!(
                target: "coalescer::rate_limiter",
                removed,
                "cleanup removed idle endpoints"
            );
        }
        Ok(removed)
    }

    /// Drop the window for one endpoint.
    pub fn reset(&self, endpoint: &str) -> Result<()> {
        let mut windows = self
            .windows
            .write()
            .map_err(|_| Error::Internal("rate limiter map lock poisoned".into()))?;
        windows.remove(endpoint);
        tracing::info!(target: "coalescer::rate_limiter", endpoint, "rate limit reset");
        Ok(())
    }

    /// Drop all windows.
    pub fn reset_all(&self) -> Result<()> {
        let mut windows = self
            .windows
            .write()
            .map_err(|_| Error::Internal("rate limiter map lock poisoned".into()))?;
        windows.clear();
        tracing::info!(target: "coalescer::rate_limiter", "all rate limits reset");
        Ok(())
    }

    pub fn stats(&self) -> Result<RateLimiterStats> {
        let now = Instant::now();
        let windows = self
            .windows
            .read()
            .map_err(|_| Error::Internal("rate limiter map lock poisoned".into()))?;

        let mut endpoints = Vec::with_capacity(windows.len());
        for (endpoint, window) in windows.iter() {
            let mut state = window
                .lock()
                .map_err(|_| Error::Internal("rate window lock poisoned".into()))?;
            let limit = self.config.limit_for(endpoint);
            state.prune(now, limit.window);

            let current = state.timestamps.len();
            endpoints.push(EndpointStats {
                endpoint: endpoint.clone(),
                current_requests: current,
                max_requests: limit.max_requests,
                window_secs: limit.window.as_secs(),
                remaining: limit.max_requests.saturating_sub(current as u32),
                is_limited: current as u32 >= limit.max_requests,
            });
        }
        endpoints.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));

        Ok(RateLimiterStats {
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_denied: self.total_denied.load(Ordering::Relaxed),
            tracked_endpoints: windows.len(),
            endpoints,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_secs: u64) -> RateLimiter {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "/query".to_string(),
            EndpointLimit::new(max_requests, Duration::from_secs(window_secs)),
        );
        RateLimiter::new(RateLimiterConfig {
            endpoints,
            default_limit: EndpointLimit::new(100, Duration::from_secs(60)),
        })
        .unwrap()
    }

    #[test]
    fn test_sliding_window_scenario() {
        // 5 requests per 60s: 5 allowed at t0, denied at t0+10, allowed at t0+61.
        let limiter = limiter(5, 60);
        let t0 = Instant::now();

        for i in 0..5 {
            let admission = limiter.admit_at("/query", t0).unwrap();
            assert!(admission.allowed, "request {i} should be allowed");
        }

        let denied = limiter
            .admit_at("/query", t0 + Duration::from_secs(10))
            .unwrap();
        assert!(!denied.allowed);
        let retry = denied.retry_after_secs.unwrap();
        assert!((49..=51).contains(&retry), "retry_after was {retry}");

        let allowed = limiter
            .admit_at("/query", t0 + Duration::from_secs(61))
            .unwrap();
        assert!(allowed.allowed);
    }

    #[test]
    fn test_remaining_counts_down() {
        let limiter = limiter(3, 60);
        let t0 = Instant::now();
        assert_eq!(limiter.admit_at("/query", t0).unwrap().remaining, 2);
        assert_eq!(limiter.admit_at("/query", t0).unwrap().remaining, 1);
        assert_eq!(limiter.admit_at("/query", t0).unwrap().remaining, 0);
        assert!(!limiter.admit_at("/query", t0).unwrap().allowed);
    }

    #[test]
    fn test_unconfigured_endpoint_uses_default() {
        let limiter = limiter(1, 60);
        let t0 = Instant::now();
        // Default allows 100/minute, so a burst of 50 passes.
        for _ in 0..50 {
            assert!(limiter.admit_at("/unknown", t0).unwrap().allowed);
        }
    }

    #[test]
    fn test_independent_endpoints() {
        let limiter = limiter(1, 60);
        let t0 = Instant::now();
        assert!(limiter.admit_at("/query", t0).unwrap().allowed);
        assert!(!limiter.admit_at("/query", t0).unwrap().allowed);
        // A different key has its own window.
        assert!(limiter.admit_at("/other", t0).unwrap().allowed);
    }

    #[test]
    fn test_reset_clears_window() {
        let limiter = limiter(1, 60);
        let t0 = Instant::now();
        assert!(limiter.admit_at("/query", t0).unwrap().allowed);
        assert!(!limiter.admit_at("/query", t0).unwrap().allowed);

        limiter.reset("/query").unwrap();
        assert!(limiter.admit_at("/query", t0).unwrap().allowed);
    }

    #[test]
    fn test_cleanup_drops_empty_endpoints() {
        let limiter = limiter(5, 60);
        let t0 = Instant::now();
        limiter.admit_at("/query", t0).unwrap();
        assert_eq!(limiter.stats().unwrap().tracked_endpoints, 1);

        // Nothing has expired yet, so the endpoint stays.
        assert_eq!(limiter.cleanup().unwrap(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = RateLimiterConfig {
            endpoints: HashMap::new(),
            default_limit: EndpointLimit::new(10, Duration::from_secs(0)),
        };
        assert!(matches!(RateLimiter::new(config), Err(Error::Config(_))));
    }

    #[test]
    fn test_stats_track_denials() {
        let limiter = limiter(1, 60);
        let t0 = Instant::now();
        limiter.admit_at("/query", t0).unwrap();
        limiter.admit_at("/query", t0).unwrap();
        limiter.admit_at("/query", t0).unwrap();

        let stats = limiter.stats().unwrap();
        assert_eq!(stats.total_admitted, 1);
        assert_eq!(stats.total_denied, 2);
        let ep = &stats.endpoints[0];
        assert_eq!(ep.endpoint, "/query");
        assert!(ep.is_limited);
    }
}
