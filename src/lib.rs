//! Tollgate - Distributed Rate Limiting Middleware
//!
//! This crate implements per-request admission control for HTTP services.
//! Every route carries an ordered set of rules; each rule keeps its counter
//! in a shared store (Redis in production), so any number of server
//! processes enforce the same quotas without local locks.

pub mod cli;
pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
