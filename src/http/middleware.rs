//! Axum middleware applying route rate limits.
//!
//! Install with `axum::middleware::from_fn_with_state(state, rate_limit)`.
//! Rules are looked up by the matched route pattern. Upstream middleware may
//! attach a [`RequestValues`] to the request extensions for rules to read.
//! Handlers may attach one to the response extensions; its values are merged
//! in before refund filters run.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, MatchedPath, State},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tracing::{debug, warn};

use crate::error::{ErrorEnvelope, RateLimitError};
use crate::ratelimit::{AggregateOutcome, Decision, Evaluation, RateLimiter, RequestValues, RouteTable};

pub const HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const HEADER_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// Shared state for the [`rate_limit`] middleware.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub limiter: RateLimiter,
    pub routes: Arc<RouteTable>,
    /// Whether proxy headers may name the client address
    pub trust_proxy_headers: bool,
}

impl RateLimitState {
    pub fn new(limiter: RateLimiter, routes: RouteTable) -> Self {
        Self {
            limiter,
            routes: Arc::new(routes),
            trust_proxy_headers: false,
        }
    }

    pub fn with_trusted_proxy_headers(mut self, trust: bool) -> Self {
        self.trust_proxy_headers = trust;
        self
    }
}

/// Middleware that evaluates the matched route's rules.
///
/// Admitted requests continue to the handler; denied ones get a JSON error.
/// Quota headers are written on both. Refunds run in a detached task after
/// the response is produced and never affect it.
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let rules = request
        .extensions()
        .get::<MatchedPath>()
        .and_then(|path| state.routes.rules_for(path.as_str()));

    let Some(rules) = rules else {
        return next.run(request).await;
    };

    let mut values = request
        .extensions()
        .get::<RequestValues>()
        .cloned()
        .unwrap_or_default();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    values.set_client_ip(client_ip(peer, request.headers(), state.trust_proxy_headers));

    let Evaluation {
        aggregate,
        compensations,
        decision,
        ..
    } = state.limiter.evaluate(&rules, &values).await;

    let mut response = match decision {
        Decision::Admit => next.run(request).await,
        Decision::Deny(err) => err.into_response(),
    };

    if let Some(aggregate) = aggregate {
        annotate(response.headers_mut(), &aggregate);
    }

    if !compensations.is_empty() {
        if let Some(late) = response.extensions_mut().remove::<RequestValues>() {
            values.merge(late);
        }
        values.set_response_status(response.status().as_u16());
        let limiter = state.limiter.clone();
        tokio::spawn(async move {
            limiter.run_compensations(compensations, &values).await;
        });
    }

    response
}

/// Write the quota headers for `aggregate` onto a response.
pub fn annotate(headers: &mut HeaderMap, aggregate: &AggregateOutcome) {
    headers.insert(HEADER_LIMIT, HeaderValue::from(aggregate.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(aggregate.remaining_clamped()));
    headers.insert(HEADER_RESET, HeaderValue::from(aggregate.reset_epoch_secs()));
}

/// Determine the client address for rate limiting.
///
/// With `trust_proxy_headers`, proxy headers take precedence over the
/// connection's peer address; otherwise only the peer address is used.
pub fn client_ip(
    peer: Option<SocketAddr>,
    headers: &HeaderMap,
    trust_proxy_headers: bool,
) -> Option<IpAddr> {
    if !trust_proxy_headers {
        return peer.map(|addr| addr.ip());
    }

    if let Some(ip) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok())
    {
        return Some(ip);
    }

    if let Some(ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
    {
        return Some(ip);
    }

    peer.map(|addr| addr.ip())
}

impl IntoResponse for RateLimitError {
    fn into_response(self) -> Response {
        match &self {
            RateLimitError::RateLimitExceeded { limit, .. } => {
                debug!(limit = limit, "Denying request over rate limit");
            }
            other => warn!(error = %other, "Rate limiting failed, denying request"),
        }

        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorEnvelope::from(self.to_body()))).into_response()
    }
}
