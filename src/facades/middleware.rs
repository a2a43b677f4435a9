//! Request-framing concerns the engine deliberately knows nothing about
//! (spec §9: "the engine assumes an already-authenticated tenant and
//! principal"). Header extraction + a per-principal sliding-window rate
//! limiter, grounded on `scheduler::rate_limits::SlidingWindow`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::ids::TenantId;
use crate::principal::Principal;

const TENANT_HEADER: &str = "x-asyncgate-tenant";
const PRINCIPAL_KIND_HEADER: &str = "x-asyncgate-principal-kind";
const PRINCIPAL_ID_HEADER: &str = "x-asyncgate-principal-id";

/// The engine assumes the tenant and principal are already resolved —
/// this struct is what a real auth layer would attach to the request
/// after validating a token. Here, trusted headers stand in for that layer
/// (spec §9: request framing and auth are external collaborators).
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant: TenantId,
    pub principal: Principal,
}

pub fn extract_auth(headers: &HeaderMap) -> Result<AuthContext, (StatusCode, String)> {
    let tenant = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<uuid::Uuid>().ok())
        .map(TenantId::from)
        .ok_or((StatusCode::UNAUTHORIZED, format!("missing or invalid {TENANT_HEADER}")))?;

    let kind = headers
        .get(PRINCIPAL_KIND_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or((StatusCode::UNAUTHORIZED, format!("missing {PRINCIPAL_KIND_HEADER}")))?
        .parse()
        .map_err(|e| (StatusCode::UNAUTHORIZED, format!("{e}")))?;
    let id = headers
        .get(PRINCIPAL_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or((StatusCode::UNAUTHORIZED, format!("missing {PRINCIPAL_ID_HEADER}")))?;
    let principal = Principal::new(kind, id).map_err(|e| (StatusCode::UNAUTHORIZED, e))?;

    Ok(AuthContext { tenant, principal })
}

/// A sliding-window counter, identical in shape to `SlidingWindow` — tracks
/// request timestamps in a window and reports whether the cap is reached.
struct SlidingWindow {
    window_secs: i64,
    max_count: u64,
    events: std::collections::VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    fn new(window_secs: i64, max_count: u64) -> Self {
        Self {
            window_secs,
            max_count,
            events: std::collections::VecDeque::new(),
        }
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::seconds(self.window_secs);
        while self.events.front().is_some_and(|t| *t <= cutoff) {
            self.events.pop_front();
        }
    }

    fn check_and_record(&mut self, now: DateTime<Utc>) -> Option<Duration> {
        self.evict(now);
        if self.events.len() as u64 >= self.max_count {
            return self.events.front().map(|oldest| {
                *oldest + Duration::seconds(self.window_secs) - now
            });
        }
        self.events.push_back(now);
        None
    }
}

/// Per-principal request-per-minute limiter shared across the router.
pub struct RateLimiter {
    window_secs: i64,
    max_count: u64,
    windows: Mutex<HashMap<String, SlidingWindow>>,
}

impl RateLimiter {
    pub fn new(window_secs: i64, max_count: u64) -> Arc<Self> {
        Arc::new(Self {
            window_secs,
            max_count,
            windows: Mutex::new(HashMap::new()),
        })
    }

    async fn admit(&self, key: &str) -> Option<Duration> {
        let mut windows = self.windows.lock().await;
        let window = windows
            .entry(key.to_string())
            .or_insert_with(|| SlidingWindow::new(self.window_secs, self.max_count));
        window.check_and_record(Utc::now())
    }
}

pub async fn rate_limit_layer(
    axum::extract::State(limiter): axum::extract::State<Arc<RateLimiter>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let key = extract_auth(&headers)
        .map(|a| a.principal.to_string())
        .unwrap_or_else(|_| "anonymous".to_string());

    if let Some(retry_after) = limiter.admit(&key).await {
        let secs = retry_after.num_seconds().max(1);
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", secs.to_string())],
            format!("{{\"error\":\"RATE_LIMITED\",\"retry_after_secs\":{secs}}}"),
        )
            .into_response();
    }

    next.run(request).await
}
