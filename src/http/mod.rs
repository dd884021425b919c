//! HTTP adapter: axum middleware and the demonstration server.

mod middleware;
mod server;

pub use middleware::{
    annotate, client_ip, rate_limit, RateLimitState, HEADER_LIMIT, HEADER_REMAINING, HEADER_RESET,
};
pub use server::{default_route_table, HttpServer};
