//! HTTP server for the demonstration application.
//!
//! Serves a small API whose routes are guarded by the rate limit
//! middleware: `POST /login` and `GET /api/items`. A `x-user-id` header
//! (and optional `x-user-quota`) stands in for an authentication layer and
//! is exposed to rules as the `user` request value.

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, RateLimitState};
use crate::error::{Result, TollgateError};
use crate::ratelimit::{LimitSource, RequestValues, RouteTable, RuleConfig, KeyField};

/// Password accepted by the demonstration login route.
const DEMO_PASSWORD: &str = "letmein";

/// HTTP server wrapping the rate limited demonstration routes.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware state shared by all routes
    state: RateLimitState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: RateLimitState) -> Self {
        Self { addr, state }
    }

    /// Build the application router.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/login", post(login))
            .route("/api/items", get(list_items))
            .route_layer(middleware::from_fn_with_state(self.state.clone(), rate_limit))
            .layer(middleware::from_fn(attach_user))
    }

    /// Start the HTTP server.
    ///
    /// This method will block until the server is shut down.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await?;

        info!(addr = %self.addr, "Starting HTTP server");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}

/// Rules for the demonstration routes, used when no rules file is given.
///
/// Failed logins are limited to five per minute per client address;
/// successful logins are refunded. Item listing is limited per user by the
/// user's quota, sixty per minute by default.
pub fn default_route_table() -> RouteTable {
    let mut routes = RouteTable::new();
    routes.register(
        "/login",
        vec![RuleConfig::new("login", LimitSource::Fixed(5), Duration::from_secs(60))
            .with_client_ip()
            .with_filter(|ctx| ctx.response_status() == Some(StatusCode::OK.as_u16()))],
    );
    routes.register(
        "/api/items",
        vec![RuleConfig::new(
            "items",
            LimitSource::FromValue {
                path: vec!["user".to_string(), "quota".to_string()],
                default: 60,
            },
            Duration::from_secs(60),
        )
        .with_key_field(KeyField::path(["user", "id"]))],
    );
    routes
}

/// Expose the caller's identity headers as the `user` request value.
async fn attach_user(mut request: Request<Body>, next: Next) -> Response {
    if let Some(user) = user_from_headers(request.headers()) {
        let mut values = request
            .extensions()
            .get::<RequestValues>()
            .cloned()
            .unwrap_or_default();
        values.insert("user", user);
        request.extensions_mut().insert(values);
    }
    next.run(request).await
}

fn user_from_headers(headers: &HeaderMap) -> Option<Value> {
    let id = headers.get("x-user-id")?.to_str().ok()?;
    let mut user = Map::new();
    user.insert("id".to_string(), Value::from(id));
    if let Some(quota) = headers
        .get("x-user-quota")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    {
        user.insert("quota".to_string(), Value::from(quota));
    }
    Some(Value::Object(user))
}

async fn login(headers: HeaderMap) -> Response {
    let password = headers.get("x-password").and_then(|v| v.to_str().ok());
    if password == Some(DEMO_PASSWORD) {
        (StatusCode::OK, Json(json!({"status": "logged in"}))).into_response()
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "invalid credentials"})),
        )
            .into_response()
    }
}

async fn list_items() -> Json<Value> {
    Json(json!({"items": ["alpha", "beta", "gamma"]}))
}
