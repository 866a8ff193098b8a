//! Per-client rate limiting for the ceremony endpoints

use crate::config::RateLimitConfig;
use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

/// Fixed-window counter keyed by client address
#[derive(Clone)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    trusted_proxies: Arc<Vec<IpAddr>>,
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    started: Instant,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Throttled {
    pub retry_after: u64,
    pub limit: u32,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            trusted_proxies: Arc::new(Vec::new()),
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, Duration::from_secs(config.window_secs))
            .with_trusted_proxies(config.trusted_proxies.clone())
    }

    pub fn with_trusted_proxies(mut self, proxies: Vec<IpAddr>) -> Self {
        self.trusted_proxies = Arc::new(proxies);
        self
    }

    /// Count one request for `key`
    pub async fn check(&self, key: &str) -> Result<(), Throttled> {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();

        // Occasionally drop windows that have run out
        if rand::random::<f32>() < 0.01 {
            windows.retain(|_, w| now.duration_since(w.started) < self.window);
        }

        let window = windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            started: now,
        });

        if now.duration_since(window.started) >= self.window {
            *window = Window {
                count: 0,
                started: now,
            };
        }

        if window.count >= self.max_requests {
            return Err(Throttled {
                retry_after: self
                    .window
                    .saturating_sub(now.duration_since(window.started))
                    .as_secs(),
                limit: self.max_requests,
            });
        }

        window.count += 1;
        Ok(())
    }

    /// Key requests by peer address. `X-Forwarded-For` is only read when
    /// the peer is a trusted proxy; its first entry is the client.
    fn client_key(&self, request: &Request) -> String {
        let Some(peer) = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0.ip())
        else {
            return "unknown".to_string();
        };

        if !self.trusted_proxies.contains(&peer) {
            return peer.to_string();
        }

        request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok())
            .unwrap_or(peer)
            .to_string()
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<RateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let key = limiter.client_key(&request);

    if let Err(throttled) = limiter.check(&key).await {
        warn!("Rate limit hit for {} on {}", key, request.uri().path());

        let mut response = (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too many requests",
                "retry_after": throttled.retry_after,
                "limit": throttled.limit,
            })),
        )
            .into_response();

        let headers = response.headers_mut();
        headers.insert("X-RateLimit-Limit", HeaderValue::from(throttled.limit));
        headers.insert("X-RateLimit-Remaining", HeaderValue::from_static("0"));
        headers.insert("Retry-After", HeaderValue::from(throttled.retry_after));

        return response;
    }

    next.run(request).await
}
