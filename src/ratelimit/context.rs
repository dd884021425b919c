//! Request-scoped values consulted by rate limit rules.

use std::collections::HashMap;
use std::net::IpAddr;

use serde_json::Value;

/// Read access to the values attached to the request being rate limited.
///
/// The HTTP adapter provides [`RequestValues`]; other transports can
/// implement this trait over their own per-request storage.
pub trait RequestContext: Send + Sync {
    /// Look up a value attached to the request under `key`.
    fn get(&self, key: &str) -> Option<&Value>;

    /// Address of the client that sent the request, if known.
    fn client_ip(&self) -> Option<IpAddr>;

    /// Status of the response, once the handler has produced one.
    fn response_status(&self) -> Option<u16> {
        None
    }
}

/// String-keyed request value store.
///
/// Upstream middleware inserts one of these into the request extensions
/// (for example an authenticated user under `"user"`), and rules read from
/// it when building keys or computing limits.
#[derive(Debug, Clone, Default)]
pub struct RequestValues {
    values: HashMap<String, Value>,
    client_ip: Option<IpAddr>,
    response_status: Option<u16>,
}

impl RequestValues {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a value to the request, replacing any previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`insert`](Self::insert).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn set_client_ip(&mut self, ip: Option<IpAddr>) {
        self.client_ip = ip;
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    pub fn set_response_status(&mut self, status: u16) {
        self.response_status = Some(status);
    }

    /// Copy every value from `other` into `self`, replacing values under the
    /// same key. Client address and response status are left untouched.
    pub fn merge(&mut self, other: RequestValues) {
        self.values.extend(other.values);
    }
}

impl RequestContext for RequestValues {
    fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    fn client_ip(&self) -> Option<IpAddr> {
        self.client_ip
    }

    fn response_status(&self) -> Option<u16> {
        self.response_status
    }
}
