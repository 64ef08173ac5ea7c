// Credential endpoints get a per-client attempt budget. The throttle is
// layered directly on the routers it protects, so there is no path
// allowlist to keep in sync with the route table: whatever the layer wraps
// is budgeted, keyed by client address and path.

use axum::{
    extract::{ConnectInfo, Request},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Fixed-window throttle: each `(client, path)` pair may spend
/// `max_attempts` within a window; the counter resets when the window
/// rolls over.
pub struct LoginThrottle {
    max_attempts: u32,
    window: Duration,
    windows: RwLock<HashMap<(String, String), AttemptWindow>>,
}

struct AttemptWindow {
    opened: Instant,
    attempts: u32,
}

impl LoginThrottle {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Spend one attempt from the client's current window. On an exhausted
    /// budget, returns the seconds until the window rolls over.
    pub async fn register(&self, client: &str, path: &str) -> Result<(), u64> {
        let now = Instant::now();
        let mut windows = self.windows.write().await;
        let slot = windows
            .entry((client.to_string(), path.to_string()))
            .or_insert(AttemptWindow {
                opened: now,
                attempts: 0,
            });

        if now.duration_since(slot.opened) >= self.window {
            slot.opened = now;
            slot.attempts = 0;
        }

        if slot.attempts >= self.max_attempts {
            let remaining = self.window.saturating_sub(now.duration_since(slot.opened));
            return Err(remaining.as_secs().max(1));
        }

        slot.attempts += 1;
        Ok(())
    }

    /// Drop windows that have rolled over, so idle clients do not
    /// accumulate in the map.
    pub async fn sweep(&self) {
        let now = Instant::now();
        self.windows
            .write()
            .await
            .retain(|_, slot| now.duration_since(slot.opened) < self.window);
    }
}

/// Periodic sweep, spawned once at startup.
pub async fn sweep_loop(throttle: Arc<LoginThrottle>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        throttle.sweep().await;
    }
}

pub async fn throttle_middleware(
    Extension(throttle): Extension<Arc<LoginThrottle>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_address(&request, addr);
    let path = request.uri().path().to_string();

    match throttle.register(&client, &path).await {
        Ok(()) => next.run(request).await,
        Err(retry_after_secs) => {
            tracing::warn!(client = %client, path = %path, "credential attempt budget exhausted");
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                Json(serde_json::json!({ "error": "too many attempts" })),
            )
                .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Proxy-aware client address: first X-Forwarded-For hop, then X-Real-IP,
/// then the socket peer.
fn client_address(request: &Request, addr: SocketAddr) -> String {
    request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|hop| hop.trim().to_string())
        .filter(|hop| !hop.is_empty())
        .or_else(|| {
            request
                .headers()
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
        .unwrap_or_else(|| addr.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[tokio::test]
    async fn budget_is_spent_then_refused_with_retry_hint() {
        let throttle = LoginThrottle::new(2, Duration::from_secs(60));

        assert!(throttle.register("198.51.100.7", "/auth/login").await.is_ok());
        assert!(throttle.register("198.51.100.7", "/auth/login").await.is_ok());

        let refused = throttle.register("198.51.100.7", "/auth/login").await;
        let retry_after = refused.expect_err("third attempt must be refused");
        assert!(retry_after >= 1 && retry_after <= 60);
    }

    #[tokio::test]
    async fn window_rollover_restores_the_budget() {
        let throttle = LoginThrottle::new(1, Duration::from_secs(1));

        assert!(throttle.register("198.51.100.7", "/auth/login").await.is_ok());
        assert!(throttle.register("198.51.100.7", "/auth/login").await.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(throttle.register("198.51.100.7", "/auth/login").await.is_ok());
    }

    #[tokio::test]
    async fn budgets_are_per_client_and_per_path() {
        let throttle = LoginThrottle::new(1, Duration::from_secs(60));

        assert!(throttle.register("198.51.100.7", "/auth/login").await.is_ok());
        assert!(throttle.register("198.51.100.7", "/auth/login").await.is_err());

        // A different client and a different endpoint each have their own
        // window.
        assert!(throttle.register("203.0.113.9", "/auth/login").await.is_ok());
        assert!(throttle
            .register("198.51.100.7", "/auth/forgot-password")
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn sweep_drops_rolled_over_windows_only() {
        let throttle = LoginThrottle::new(3, Duration::from_secs(1));
        throttle.register("stale", "/auth/login").await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        throttle.register("fresh", "/auth/login").await.unwrap();
        throttle.sweep().await;

        let windows = throttle.windows.read().await;
        assert!(!windows.contains_key(&("stale".into(), "/auth/login".into())));
        assert!(windows.contains_key(&("fresh".into(), "/auth/login".into())));
    }

    #[test]
    fn client_address_prefers_the_first_forwarded_hop() {
        let peer: SocketAddr = "192.0.2.1:443".parse().unwrap();

        let forwarded = Request::builder()
            .uri("/auth/login")
            .header("x-forwarded-for", "203.0.113.9, 10.0.0.1")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_address(&forwarded, peer), "203.0.113.9");

        let real_ip = Request::builder()
            .uri("/auth/login")
            .header("x-real-ip", "203.0.113.10")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_address(&real_ip, peer), "203.0.113.10");

        let bare = Request::builder()
            .uri("/auth/login")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_address(&bare, peer), "192.0.2.1");
    }
}
