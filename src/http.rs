//! Shared HTTP plumbing: client construction, politeness throttling and
//! status classification.
//!
//! A single request here is one attempt. Callers wrap it in
//! [`crate::retry::with_backoff`] to get bounded retries.

use crate::error::{HarvestError, Result};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Build an HTTP client with the given user agent and per-request timeout
pub fn build_client(user_agent: &str, timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .build()
        .map_err(|e| HarvestError::Config(format!("Failed to build HTTP client: {}", e)))
}

/// Enforces a minimum interval between requests to one provider.
///
/// The limiter hands out time slots: each caller reserves the next free slot
/// under the lock, then sleeps outside of it, so concurrent workers are
/// spread out instead of serialized on the mutex.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Limiter allowing `requests_per_second` requests per second
    pub fn per_second(requests_per_second: u32) -> Self {
        let min_interval = if requests_per_second > 0 {
            Duration::from_secs(1) / requests_per_second
        } else {
            Duration::ZERO
        };
        Self::with_interval(min_interval)
    }

    /// Limiter with an explicit minimum interval
    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until this caller may issue its request
    pub async fn acquire(&self) {
        if self.min_interval.is_zero() {
            return;
        }

        let slot = {
            let mut next = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = match *next {
                Some(t) if t > now => t,
                _ => now,
            };
            *next = Some(slot + self.min_interval);
            slot
        };

        let now = Instant::now();
        if slot > now {
            debug!(wait_ms = (slot - now).as_millis() as u64, "Rate limiter: waiting");
            tokio::time::sleep_until(slot).await;
        }
    }
}

/// Parse a `Retry-After` header given in whole seconds
fn retry_after_secs(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Map a non-success status to the error taxonomy.
fn classify_status(status: StatusCode, retry_after: Option<u64>, body: String) -> HarvestError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return HarvestError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return HarvestError::Server {
            code: status.as_u16(),
            message: body,
        };
    }
    HarvestError::Api {
        code: status.as_u16(),
        message: body,
    }
}

/// Issue one throttled GET and return the response body as text.
///
/// # Arguments
///
/// * `client` - Shared HTTP client
/// * `limiter` - Provider rate limiter
/// * `url` - Endpoint URL
/// * `params` - Query parameters
pub async fn get_text(
    client: &Client,
    limiter: &RateLimiter,
    url: &str,
    params: &[(&str, String)],
) -> Result<String> {
    limiter.acquire().await;
    debug!(url = url, "GET");

    let response = client.get(url).query(params).send().await?;
    let status = response.status();

    if status.is_success() {
        return response.text().await.map_err(HarvestError::Network);
    }

    let retry_after = retry_after_secs(&response);
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, retry_after, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(3), String::new()),
            HarvestError::RateLimited {
                retry_after: Some(3)
            }
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None, String::new()),
            HarvestError::Server { code: 502, .. }
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None, String::new()),
            HarvestError::Api { code: 404, .. }
        ));
    }

    #[test]
    fn test_per_second_interval() {
        assert_eq!(
            RateLimiter::per_second(10).min_interval(),
            Duration::from_millis(100)
        );
        assert_eq!(RateLimiter::per_second(0).min_interval(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_spaces_requests() {
        let limiter = RateLimiter::with_interval(Duration::from_millis(500));
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_concurrent_callers() {
        let limiter = RateLimiter::with_interval(Duration::from_millis(200));
        let start = Instant::now();

        tokio::join!(limiter.acquire(), limiter.acquire(), limiter.acquire(), limiter.acquire());

        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_get_text_maps_server_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/thing")
            .match_query(mockito::Matcher::Any)
            .with_status(503)
            .with_body("down")
            .create_async()
            .await;

        let client = build_client("rustharvest-test", Duration::from_secs(5)).expect("client");
        let limiter = RateLimiter::per_second(0);
        let url = format!("{}/thing", server.url());

        let err = get_text(&client, &limiter, &url, &[("a", "1".to_string())])
            .await
            .expect_err("503 should fail");

        assert!(matches!(err, HarvestError::Server { code: 503, .. }));
        assert!(err.is_transient());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_text_reads_retry_after() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/busy")
            .match_query(mockito::Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "7")
            .create_async()
            .await;

        let client = build_client("rustharvest-test", Duration::from_secs(5)).expect("client");
        let limiter = RateLimiter::per_second(0);
        let url = format!("{}/busy", server.url());

        let err = get_text(&client, &limiter, &url, &[])
            .await
            .expect_err("429 should fail");

        assert!(matches!(err, HarvestError::RateLimited { retry_after: Some(7) }));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
        assert!(err.is_transient());
        mock.assert_async().await;
    }
}
