//! Request-id assignment, security headers, and per-IP rate limiting
//! (spec §6 "Headers", §5 "rate limiting is token-bucket per client IP").

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::state::AppState;

/// Assign `X-Request-Id` when the caller didn't supply one, and echo it on
/// the response.
pub async fn request_id(mut req: axum::extract::Request, next: Next) -> Response {
    let header_name = axum::http::HeaderName::from_static("x-request-id");
    let request_id = req
        .headers()
        .get(&header_name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.headers_mut().insert(
        header_name.clone(),
        HeaderValue::from_str(&request_id).expect("uuid is a valid header value"),
    );

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(header_name, HeaderValue::from_str(&request_id).expect("uuid is a valid header value"));
    response
}

/// Attach the standard security headers to every response.
pub async fn security_headers(req: axum::extract::Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert("referrer-policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    response
}

/// A fixed-window request counter per client IP (spec §5 "token-bucket per
/// client IP with configurable window and burst").
pub struct RateLimiter {
    window: Duration,
    max: u32,
    bypass: Vec<IpAddr>,
    buckets: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    /// Build a limiter allowing `max` requests per `window` per IP, except
    /// for IPs in `bypass`.
    pub fn new(window: Duration, max: u32, bypass: Vec<IpAddr>) -> Self {
        Self { window, max, bypass, buckets: Mutex::new(HashMap::new()) }
    }

    async fn check(&self, ip: IpAddr) -> bool {
        if self.bypass.contains(&ip) {
            return true;
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let entry = buckets.entry(ip).or_insert((now, 0));

        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }
        if entry.1 >= self.max {
            return false;
        }
        entry.1 += 1;
        true
    }
}

/// Reject requests over the configured rate with `429` and no state
/// mutation (spec §5 "Cancellation/timeouts").
pub async fn rate_limit(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    req: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if state.rate_limiter.check(addr.ip()).await {
        Ok(next.run(req).await)
    } else {
        Err(StatusCode::TOO_MANY_REQUESTS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_max_then_rejects() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2, Vec::new());
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.check(ip).await);
        assert!(limiter.check(ip).await);
        assert!(!limiter.check(ip).await);
    }

    #[tokio::test]
    async fn bypass_ip_is_never_limited() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let limiter = RateLimiter::new(Duration::from_secs(60), 1, vec![ip]);
        for _ in 0..5 {
            assert!(limiter.check(ip).await);
        }
    }
}
