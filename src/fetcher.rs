use crate::config::ServicePolicy;
use crate::models::FetchOutcome;
use anyhow::{Context, Result};
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const RETRY_AFTER: &str = "retry-after";
pub const RATE_LIMIT_RESET_IN: &str = "x-ratelimit-reset-in";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Per-service request spacing shared by every worker of a run.
///
/// Each service has a "next allowed" instant. Acquiring a slot reserves the
/// later of now and that instant, then pushes it forward by the service's
/// minimum interval, so two workers can never both observe the same gap.
#[derive(Debug, Default)]
pub struct Throttle {
    next_allowed: Mutex<HashMap<String, Instant>>,
}

impl Throttle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for this caller's slot on `service`. Returns the reserved start.
    pub async fn acquire(&self, service: &str, min_interval: Duration) -> Instant {
        let start = {
            let mut slots = self.next_allowed.lock().await;
            let now = Instant::now();
            let next = slots.get(service).copied().unwrap_or(now);
            let start = next.max(now);
            slots.insert(service.to_string(), start + min_interval);
            start
        };
        tokio::time::sleep_until(start).await;
        start
    }

    /// Hold back every later request to `service` until at least `until`.
    pub async fn defer(&self, service: &str, until: Instant) {
        let mut slots = self.next_allowed.lock().await;
        let slot = slots.entry(service.to_string()).or_insert(until);
        if *slot < until {
            *slot = until;
        }
    }
}

fn header_secs(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite())
        .map(|s| s.max(0.0))
}

/// Seconds as a duration, capped at the policy's longest wait.
fn capped_wait(secs: f64, policy: &ServicePolicy) -> Duration {
    Duration::try_from_secs_f64(secs)
        .unwrap_or(Duration::MAX)
        .min(policy.max_wait())
        .saturating_add(policy.padding())
}

/// Wait suggested by a 429 response: retry-after, then the reset window,
/// then the configured default; capped, then padded.
pub fn rate_limit_wait(headers: &HeaderMap, policy: &ServicePolicy) -> Duration {
    let secs = header_secs(headers, RETRY_AFTER)
        .or_else(|| header_secs(headers, RATE_LIMIT_RESET_IN))
        .unwrap_or(policy.default_rate_limit_wait_secs as f64);
    capped_wait(secs, policy)
}

/// Preemptive wait when the remaining quota reported by a successful
/// response is below the policy threshold.
pub fn low_quota_wait(headers: &HeaderMap, policy: &ServicePolicy) -> Option<Duration> {
    let remaining = headers
        .get(RATE_LIMIT_REMAINING)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())?;
    if remaining >= policy.low_quota_threshold {
        return None;
    }
    let secs = header_secs(headers, RATE_LIMIT_RESET_IN).unwrap_or(1.0);
    Some(capped_wait(secs, policy))
}

/// Issues throttled, retried JSON requests on behalf of the service clients.
/// Owns the connection pool and the throttle state for one run.
pub struct RateLimitedFetcher {
    client: Client,
    policies: HashMap<String, ServicePolicy>,
    throttle: Throttle,
}

enum Transient {
    Timeout,
    Error,
}

impl RateLimitedFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            policies: HashMap::new(),
            throttle: Throttle::new(),
        })
    }

    pub fn with_policy(mut self, service: &str, policy: ServicePolicy) -> Self {
        self.policies.insert(service.to_string(), policy);
        self
    }

    pub fn policy(&self, service: &str) -> ServicePolicy {
        self.policies.get(service).cloned().unwrap_or_default()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Take a throttle slot on `service` for a request sent outside `fetch_json`.
    pub async fn wait_turn(&self, service: &str) {
        let policy = self.policy(service);
        self.throttle.acquire(service, policy.min_interval()).await;
    }

    /// Perform one logical request against `service`.
    ///
    /// `build` is invoked once per attempt. Rate limiting waits and retries
    /// without spending attempts; timeouts and transient failures retry with
    /// `k * attempt` backoff and degrade to `Failed` once attempts run out.
    pub async fn fetch_json<F>(&self, service: &str, build: F) -> FetchOutcome
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let policy = self.policy(service);
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            self.throttle.acquire(service, policy.min_interval()).await;
            let failure = match build(&self.client).timeout(policy.timeout()).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let wait = rate_limit_wait(resp.headers(), &policy);
                        warn!("{} rate limited; waiting {:.1}s", service, wait.as_secs_f64());
                        self.throttle.defer(service, Instant::now() + wait).await;
                        continue;
                    }
                    if status == StatusCode::NOT_FOUND {
                        debug!("{} returned 404", service);
                        return FetchOutcome::NotFound;
                    }
                    if status.is_server_error() {
                        (Transient::Error, format!("{} returned {}", service, status))
                    } else if !status.is_success() {
                        return FetchOutcome::Failed(format!("{} returned {}", service, status));
                    } else {
                        let quota_wait = low_quota_wait(resp.headers(), &policy);
                        match resp.json::<serde_json::Value>().await {
                            Ok(body) => {
                                if let Some(wait) = quota_wait {
                                    debug!(
                                        "{} quota nearly exhausted; pausing {:.1}s",
                                        service,
                                        wait.as_secs_f64()
                                    );
                                    let until = Instant::now() + wait;
                                    self.throttle.defer(service, until).await;
                                    tokio::time::sleep_until(until).await;
                                }
                                return FetchOutcome::Data(body);
                            }
                            Err(e) if e.is_timeout() => (Transient::Timeout, e.to_string()),
                            Err(e) => {
                                return FetchOutcome::Failed(format!(
                                    "{} sent an undecodable body: {}",
                                    service, e
                                ))
                            }
                        }
                    }
                }
                Err(e) if e.is_timeout() => (Transient::Timeout, e.to_string()),
                Err(e) => (Transient::Error, e.to_string()),
            };

            attempt += 1;
            let (kind, reason) = failure;
            if attempt >= max_attempts {
                warn!("{} failed after {} attempts: {}", service, attempt, reason);
                return FetchOutcome::Failed(reason);
            }
            let k = match kind {
                Transient::Timeout => policy.timeout_backoff_secs,
                Transient::Error => policy.error_backoff_secs,
            };
            let backoff = Duration::from_secs(k.saturating_mul(attempt as u64));
            warn!(
                "{} request failed (attempt {}/{}): {}. Retrying in {}s",
                service,
                attempt,
                max_attempts,
                reason,
                backoff.as_secs()
            );
            tokio::time::sleep(backoff).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn policy() -> ServicePolicy {
        ServicePolicy {
            default_rate_limit_wait_secs: 10,
            rate_limit_padding_ms: 1000,
            ..ServicePolicy::default()
        }
    }

    #[test]
    fn retry_after_wins_over_reset_window() {
        let mut h = HeaderMap::new();
        h.insert(RETRY_AFTER, HeaderValue::from_static("3"));
        h.insert(RATE_LIMIT_RESET_IN, HeaderValue::from_static("7"));
        assert_eq!(rate_limit_wait(&h, &policy()), Duration::from_secs(4));
    }

    #[test]
    fn reset_window_then_default() {
        let mut h = HeaderMap::new();
        h.insert(RATE_LIMIT_RESET_IN, HeaderValue::from_static("7"));
        assert_eq!(rate_limit_wait(&h, &policy()), Duration::from_secs(8));
        assert_eq!(rate_limit_wait(&HeaderMap::new(), &policy()), Duration::from_secs(11));
    }

    #[test]
    fn garbage_header_falls_back() {
        let mut h = HeaderMap::new();
        h.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(rate_limit_wait(&h, &policy()), Duration::from_secs(11));
    }

    #[test]
    fn huge_server_waits_are_capped() {
        let mut h = HeaderMap::new();
        h.insert(RETRY_AFTER, HeaderValue::from_static("1e30"));
        let cap = Duration::from_secs(3600) + Duration::from_secs(1);
        assert_eq!(rate_limit_wait(&h, &policy()), cap);

        let mut h = HeaderMap::new();
        h.insert(RATE_LIMIT_RESET_IN, HeaderValue::from_static("99999999999999999999"));
        assert_eq!(rate_limit_wait(&h, &policy()), cap);
        h.insert(RATE_LIMIT_REMAINING, HeaderValue::from_static("0"));
        assert_eq!(low_quota_wait(&h, &policy()), Some(cap));

        // an absurd configured cap still yields a deadline that can be added to now
        let wide = ServicePolicy { max_rate_limit_wait_secs: u64::MAX, ..policy() };
        let wait = rate_limit_wait(&h, &wide);
        assert_eq!(wait, Duration::from_secs(86_400) + Duration::from_secs(1));
        let _ = Instant::now() + wait;
    }

    #[test]
    fn low_quota_only_below_threshold() {
        let mut h = HeaderMap::new();
        h.insert(RATE_LIMIT_REMAINING, HeaderValue::from_static("5"));
        assert_eq!(low_quota_wait(&h, &policy()), None);
        h.insert(RATE_LIMIT_REMAINING, HeaderValue::from_static("0"));
        h.insert(RATE_LIMIT_RESET_IN, HeaderValue::from_static("2"));
        assert_eq!(low_quota_wait(&h, &policy()), Some(Duration::from_secs(3)));
        assert_eq!(low_quota_wait(&HeaderMap::new(), &policy()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_consecutive_slots() {
        let t = Throttle::new();
        let gap = Duration::from_millis(1000);
        let a = t.acquire("mb", gap).await;
        let b = t.acquire("mb", gap).await;
        let c = t.acquire("other", gap).await;
        assert!(b - a >= gap);
        assert!(c - a < gap);
    }

    #[tokio::test(start_paused = true)]
    async fn defer_pushes_next_slot() {
        let t = Throttle::new();
        let a = t.acquire("ab", Duration::ZERO).await;
        t.defer("ab", Instant::now() + Duration::from_secs(5)).await;
        let b = t.acquire("ab", Duration::ZERO).await;
        assert!(b - a >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_workers_share_spacing() {
        let t = std::sync::Arc::new(Throttle::new());
        let gap = Duration::from_millis(500);
        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = t.clone();
            handles.push(tokio::spawn(async move { t.acquire("mb", gap).await }));
        }
        let mut starts = Vec::new();
        for h in handles {
            starts.push(h.await.unwrap());
        }
        starts.sort();
        for w in starts.windows(2) {
            assert!(w[1] - w[0] >= gap);
        }
    }
}
