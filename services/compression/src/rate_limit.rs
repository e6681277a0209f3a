//! Per-client request limiting over a sliding time window.

use crate::error::AppError;
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { remaining: usize },
    Limited { retry_after: Duration },
}

/// Counts requests per client address
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Record a request from `client` and decide whether it may proceed
    async fn check(&self, client: IpAddr) -> RateLimitDecision;
}

/// In-memory sliding window limiter.
///
/// Each client keeps the timestamps of its accepted requests inside the
/// window. Rejected requests are not recorded.
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide for a request arriving at `now`
    pub fn check_at(&self, client: IpAddr, now: Instant) -> RateLimitDecision {
        let mut hits = self.hits.lock();
        let timestamps = hits.entry(client).or_default();

        while let Some(&oldest) = timestamps.front() {
            if now.saturating_duration_since(oldest) >= self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() >= self.max_requests {
            let retry_after = timestamps
                .front()
                .map(|&oldest| self.window.saturating_sub(now.saturating_duration_since(oldest)))
                .unwrap_or(self.window);
            return RateLimitDecision::Limited { retry_after };
        }

        timestamps.push_back(now);
        RateLimitDecision::Allowed {
            remaining: self.max_requests - timestamps.len(),
        }
    }

    /// Drop clients with no requests left inside the window
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut hits = self.hits.lock();
        let before = hits.len();

        hits.retain(|_, timestamps| {
            timestamps
                .back()
                .map(|&newest| now.saturating_duration_since(newest) < self.window)
                .unwrap_or(false)
        });

        before - hits.len()
    }

    pub fn sweep(&self) -> usize {
        let removed = self.sweep_at(Instant::now());
        if removed > 0 {
            debug!(removed = removed, "Swept idle rate limit entries");
        }
        removed
    }

    /// Number of clients currently tracked
    pub fn tracked_clients(&self) -> usize {
        self.hits.lock().len()
    }
}

#[async_trait]
impl RateLimiter for SlidingWindowLimiter {
    async fn check(&self, client: IpAddr) -> RateLimitDecision {
        self.check_at(client, Instant::now())
    }
}

/// Shortest pause between sweeps
const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Periodically remove idle entries from the limiter
pub fn spawn_sweeper(limiter: Arc<SlidingWindowLimiter>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let period = limiter.window().max(MIN_SWEEP_PERIOD);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            limiter.sweep();
        }
    })
}

/// Socket peer address of the request, if the server recorded one
fn client_address(request: &Request) -> IpAddr {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Middleware rejecting clients over their budget with 429
pub async fn rate_limit(
    State(limiter): State<Arc<dyn RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_address(&request);

    match limiter.check(client).await {
        RateLimitDecision::Allowed { .. } => next.run(request).await,
        RateLimitDecision::Limited { retry_after } => {
            warn!(client = %client, path = %request.uri().path(), "Rate limit exceeded");
            metrics::counter!("compression.requests.rate_limited").increment(1);

            let error = AppError::RateLimited;
            let mut response = (error.status(), Json(error.to_response(false))).into_response();
            // Round up so clients never retry early
            let seconds = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    #[test]
    fn test_limits_after_threshold() {
        let limiter = SlidingWindowLimiter::new(100, WINDOW);
        let start = Instant::now();

        for i in 0..100 {
            let decision = limiter.check_at(ip(1), start + Duration::from_secs(i));
            assert_eq!(
                decision,
                RateLimitDecision::Allowed {
                    remaining: 99 - i as usize
                }
            );
        }

        let decision = limiter.check_at(ip(1), start + Duration::from_secs(100));
        assert_eq!(
            decision,
            RateLimitDecision::Limited {
                retry_after: WINDOW - Duration::from_secs(100)
            }
        );
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = SlidingWindowLimiter::new(2, WINDOW);
        let now = Instant::now();

        assert!(matches!(limiter.check_at(ip(1), now), RateLimitDecision::Allowed { .. }));
        assert!(matches!(limiter.check_at(ip(1), now), RateLimitDecision::Allowed { .. }));
        assert!(matches!(limiter.check_at(ip(1), now), RateLimitDecision::Limited { .. }));
        assert!(matches!(limiter.check_at(ip(2), now), RateLimitDecision::Allowed { .. }));
    }

    #[test]
    fn test_window_slides() {
        let limiter = SlidingWindowLimiter::new(2, WINDOW);
        let start = Instant::now();

        limiter.check_at(ip(1), start);
        limiter.check_at(ip(1), start + Duration::from_secs(60));
        assert!(matches!(
            limiter.check_at(ip(1), start + Duration::from_secs(120)),
            RateLimitDecision::Limited { .. }
        ));

        // The first request has aged out, one slot frees up
        let later = start + WINDOW + Duration::from_secs(1);
        assert_eq!(
            limiter.check_at(ip(1), later),
            RateLimitDecision::Allowed { remaining: 0 }
        );
        assert!(matches!(
            limiter.check_at(ip(1), later),
            RateLimitDecision::Limited { .. }
        ));
    }

    #[test]
    fn test_rejected_requests_not_counted() {
        let limiter = SlidingWindowLimiter::new(1, WINDOW);
        let start = Instant::now();

        limiter.check_at(ip(1), start);
        for i in 1..50 {
            limiter.check_at(ip(1), start + Duration::from_secs(i));
        }

        assert!(matches!(
            limiter.check_at(ip(1), start + WINDOW),
            RateLimitDecision::Allowed { .. }
        ));
    }

    #[test]
    fn test_trait_object_check() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(SlidingWindowLimiter::new(1, WINDOW));

        assert_eq!(
            tokio_test::block_on(limiter.check(ip(3))),
            RateLimitDecision::Allowed { remaining: 0 }
        );
        assert!(matches!(
            tokio_test::block_on(limiter.check(ip(3))),
            RateLimitDecision::Limited { .. }
        ));
    }

    #[test]
    fn test_sweep_removes_idle_clients() {
        let limiter = SlidingWindowLimiter::new(5, WINDOW);
        let start = Instant::now();

        limiter.check_at(ip(1), start);
        limiter.check_at(ip(2), start + Duration::from_secs(600));
        assert_eq!(limiter.tracked_clients(), 2);

        let removed = limiter.sweep_at(start + WINDOW + Duration::from_secs(1));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_survives_zero_window() {
        let limiter = Arc::new(SlidingWindowLimiter::new(1, Duration::ZERO));
        limiter.check_at(ip(9), Instant::now());

        let handle = spawn_sweeper(limiter.clone());
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!handle.is_finished());
        assert_eq!(limiter.tracked_clients(), 0);
        handle.abort();
    }
}
