//! REST client for the platform's HTTP API. Every call is gated through
//! the rate limiter and updates bucket accounting from response headers.

pub mod error;
pub mod limit;

use std::time::Duration;

use reqwest::header::HeaderMap;
use tracing::warn;

pub use error::{PlatformError, Result};
pub use limit::{RateBucket, RateLimiter};

/// Attempts per logical call. Throttles and 5xx responses retry within
/// this budget; the rate limiter paces the retries.
const MAX_CALL_ATTEMPTS: u32 = 5;

pub struct PlatformClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    limiter: RateLimiter,
}

impl PlatformClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, limiter: RateLimiter) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
            limiter,
        }
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// POST a JSON body to the platform, gated by the route's bucket.
    ///
    /// 429 responses suspend (per-bucket or globally, as the platform
    /// signals) and retry; they never surface as caller failures unless
    /// the attempt budget runs out.
    pub async fn post_json(
        &self,
        route: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        for attempt in 1..=MAX_CALL_ATTEMPTS {
            self.limiter.gate(route).await;

            let resp = self
                .client
                .post(format!("{}{}", self.base_url, path))
                .bearer_auth(&self.token)
                .json(body)
                .send()
                .await?;

            let status = resp.status();
            let headers = resp.headers().clone();
            self.apply_rate_headers(route, &headers).await;

            match status.as_u16() {
                200..=299 => return Ok(resp.json().await?),
                401 | 403 => {
                    return Err(PlatformError::Auth(format!(
                        "platform rejected credentials with status {status}"
                    )))
                }
                429 => {
                    let retry_after = header_f64(&headers, "Retry-After")
                        .map(Duration::from_secs_f64)
                        .unwrap_or(Duration::from_secs(1));
                    if headers.contains_key("X-RateLimit-Global") {
                        warn!(route, retry_after_ms = retry_after.as_millis() as u64, "Platform-wide cooldown");
                        self.limiter.set_global_cooldown(retry_after).await;
                    } else {
                        warn!(route, retry_after_ms = retry_after.as_millis() as u64, "Route throttled");
                        self.limiter.update(route, 0, retry_after).await;
                    }
                    // Loop: the next gate() suspends until the cooldown ends.
                }
                500..=599 => {
                    let message = resp.text().await.unwrap_or_default();
                    if attempt == MAX_CALL_ATTEMPTS {
                        return Err(PlatformError::Api {
                            status: status.as_u16(),
                            message,
                        });
                    }
                    warn!(route, attempt, status = status.as_u16(), "Platform 5xx, retrying");
                    tokio::time::sleep(Duration::from_millis(250 * attempt as u64)).await;
                }
                _ => {
                    let message = resp.text().await.unwrap_or_default();
                    return Err(PlatformError::Api {
                        status: status.as_u16(),
                        message,
                    });
                }
            }
        }
        Err(PlatformError::RetriesExhausted(route.to_string()))
    }

    /// Fold the platform's remaining-count/reset-after headers into the
    /// route's bucket.
    async fn apply_rate_headers(&self, route: &str, headers: &HeaderMap) {
        let remaining = header_u32(headers, "X-RateLimit-Remaining");
        let reset_after = header_f64(headers, "X-RateLimit-Reset-After");
        if let (Some(remaining), Some(reset_after)) = (remaining, reset_after) {
            self.limiter
                .update(route, remaining, Duration::from_secs_f64(reset_after))
                .await;
        }
    }
}

fn header_u32(headers: &HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

fn header_f64(headers: &HeaderMap, name: &str) -> Option<f64> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}
