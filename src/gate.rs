//! Admission control in front of the download pipeline: per-client rate
//! limiting and the CORS origin policy.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{
        HeaderMap, HeaderName, HeaderValue, Method,
        header::{CONTENT_DISPOSITION, ORIGIN},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::{sync::Mutex, time::Instant};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{AppConfig, Environment},
    error::ApiError,
    server::AppState,
};

pub const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const PRUNE_THRESHOLD: usize = 10_000;

static RATELIMIT_POLICY: HeaderName = HeaderName::from_static("ratelimit-policy");
static RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
static RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
static RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Identity the rate limiter keyed this request on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientAddress(pub String);

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    started_at: Instant,
    hits: u32,
}

/// Fixed-window request counter keyed by client identity.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    counters: Mutex<HashMap<String, WindowCounter>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
    window: Duration,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            counters: Mutex::new(HashMap::new()),
        }
    }

    /// Counts one request from `client` and reports whether it is admitted.
    /// Rejected requests still count against the window.
    pub async fn hit(&self, client: &str, now: Instant) -> RateLimitDecision {
        let mut counters = self.counters.lock().await;

        if counters.len() >= PRUNE_THRESHOLD {
            counters.retain(|_, counter| now.duration_since(counter.started_at) < self.window);
        }

        let counter = counters
            .entry(client.to_string())
            .or_insert(WindowCounter {
                started_at: now,
                hits: 0,
            });
        if now.duration_since(counter.started_at) >= self.window {
            *counter = WindowCounter {
                started_at: now,
                hits: 0,
            };
        }
        counter.hits = counter.hits.saturating_add(1);

        RateLimitDecision {
            allowed: counter.hits <= self.limit,
            limit: self.limit,
            remaining: self.limit.saturating_sub(counter.hits),
            reset_after: self
                .window
                .saturating_sub(now.duration_since(counter.started_at)),
            window: self.window,
        }
    }
}

impl RateLimitDecision {
    pub fn reset_seconds(&self) -> u64 {
        let seconds = self.reset_after.as_secs() + u64::from(self.reset_after.subsec_nanos() > 0);
        seconds.max(1)
    }

    /// Writes the IETF draft `RateLimit-*` headers.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        let values = [
            (
                &RATELIMIT_POLICY,
                format!("{};w={}", self.limit, self.window.as_secs()),
            ),
            (&RATELIMIT_LIMIT, self.limit.to_string()),
            (&RATELIMIT_REMAINING, self.remaining.to_string()),
            (&RATELIMIT_RESET, self.reset_seconds().to_string()),
        ];

        for (name, value) in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                headers.insert(name.clone(), value);
            }
        }
    }
}

pub async fn rate_limit(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let client = client_address(state.config.trust_proxy_headers, request.headers(), peer);

    let decision = state.rate_limiter.hit(&client, Instant::now()).await;

    let mut response = if decision.allowed {
        request.extensions_mut().insert(ClientAddress(client));
        next.run(request).await
    } else {
        warn!(client = %client, "Rate limit exceeded");
        ApiError::rate_limited(decision.reset_seconds()).into_response()
    };

    decision.apply_headers(response.headers_mut());
    response
}

fn extract_forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let check_header = |key: &str| {
        headers
            .get(key)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    };

    if let Some(forwarded) = check_header("x-forwarded-for") {
        let first_ip = forwarded
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string);

        if first_ip.is_some() {
            return first_ip;
        }
    }

    check_header("cf-connecting-ip").or_else(|| check_header("x-real-ip"))
}

pub fn client_address(
    trust_proxy_headers: bool,
    headers: &HeaderMap,
    peer: Option<SocketAddr>,
) -> String {
    if trust_proxy_headers && let Some(forwarded) = extract_forwarded_ip(headers) {
        return forwarded;
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Which browser origins may call the API.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allow_any: bool,
    allowed: Arc<HashSet<String>>,
}

impl OriginPolicy {
    pub fn from_config(config: &AppConfig) -> Result<Self, ApiError> {
        let allowed = config
            .allowed_origins
            .iter()
            .map(|origin| {
                normalize_origin(origin).ok_or_else(|| {
                    ApiError::internal(format!(
                        "Invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com"
                    ))
                })
            })
            .collect::<Result<HashSet<_>, _>>()?;

        let allow_any = config.environment == Environment::Development;
        if allow_any {
            warn!("Development mode: CORS accepts every origin.");
        } else {
            info!(
                "CORS allow-list loaded with {} origin(s): {:?}",
                allowed.len(),
                allowed
            );
        }

        Ok(Self {
            allow_any,
            allowed: Arc::new(allowed),
        })
    }

    pub fn allows(&self, origin: &HeaderValue) -> bool {
        if self.allow_any {
            return true;
        }

        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| self.allowed.contains(value));
        debug!(
            "CORS origin check raw={:?} normalized={:?} allowed={}",
            origin, normalized, allowed
        );
        allowed
    }

    pub fn cors_layer(&self) -> CorsLayer {
        let allow_origin = if self.allow_any {
            AllowOrigin::mirror_request()
        } else {
            let policy = self.clone();
            AllowOrigin::predicate(move |origin: &HeaderValue, _| policy.allows(origin))
        };

        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(AllowHeaders::mirror_request())
            .allow_credentials(true)
            .expose_headers([CONTENT_DISPOSITION])
    }
}

/// Turns away browser requests from origins outside the allow-list before
/// they reach any handler. Requests without an `Origin` header pass.
pub async fn reject_disallowed_origin(
    State(policy): State<OriginPolicy>,
    request: Request,
    next: Next,
) -> Response {
    match request.headers().get(ORIGIN) {
        Some(origin) if !policy.allows(origin) => {
            warn!("Rejected request from origin {:?}", origin);
            ApiError::origin_not_allowed().into_response()
        }
        _ => next.run(request).await,
    }
}

fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port() {
        Some(port) if port != default_port => Some(format!("{scheme}://{host}:{port}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}
