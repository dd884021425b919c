//! Rate limit rules and the route registration table.
//!
//! Rules are attached to routes once, at startup. Each route carries an
//! ordered list of rules; a rule's position in that list is part of its
//! counter key, so two rules sharing a name never share a counter.
//! Rules can be built in code or loaded from YAML.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::context::RequestContext;
use super::key::{resolve_path, KeyField};
use crate::error::{RateLimitError, Result, TollgateError};

/// Computes the limit for a request.
pub type LimitFn =
    Arc<dyn Fn(&dyn RequestContext) -> std::result::Result<i64, RateLimitError> + Send + Sync>;

/// Decides, after the response was produced, whether a request should be
/// refunded.
pub type FilterFn = Arc<dyn Fn(&dyn RequestContext) -> bool + Send + Sync>;

/// Where a rule's limit comes from.
#[derive(Clone)]
pub enum LimitSource {
    /// The same limit for every request.
    Fixed(i64),
    /// An integer read from the request values, with a fallback when absent.
    FromValue { path: Vec<String>, default: i64 },
    /// Caller-supplied function.
    Custom(LimitFn),
}

impl LimitSource {
    /// Compute the limit for the current request.
    pub fn evaluate(
        &self,
        rule: &str,
        ctx: &dyn RequestContext,
    ) -> std::result::Result<i64, RateLimitError> {
        match self {
            LimitSource::Fixed(limit) => Ok(*limit),
            LimitSource::FromValue { path, default } => match resolve_path(ctx, path) {
                None | Some(Value::Null) => Ok(*default),
                Some(value) => value.as_i64().ok_or_else(|| RateLimitError::Configuration {
                    rule: rule.to_string(),
                    reason: format!("limit at `{}` is not an integer: {}", path.join("."), value),
                }),
            },
            LimitSource::Custom(f) => f(ctx),
        }
    }
}

impl fmt::Debug for LimitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitSource::Fixed(limit) => f.debug_tuple("Fixed").field(limit).finish(),
            LimitSource::FromValue { path, default } => f
                .debug_struct("FromValue")
                .field("path", path)
                .field("default", default)
                .finish(),
            LimitSource::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// A single rate limit rule attached to a route.
#[derive(Clone)]
pub struct RuleConfig {
    /// Rule name, part of the counter key
    pub name: String,
    /// Whether the client address is part of the key
    pub use_client_ip: bool,
    /// Request values that are part of the key, in order
    pub key_fields: Vec<KeyField>,
    /// Limit for the window; a limit of zero or less disables the rule
    pub limit: LimitSource,
    /// Length of the counting window
    pub window: Duration,
    /// Optional refund predicate evaluated after the response
    pub filter: Option<FilterFn>,
}

impl RuleConfig {
    pub fn new(name: impl Into<String>, limit: LimitSource, window: Duration) -> Self {
        Self {
            name: name.into(),
            use_client_ip: false,
            key_fields: Vec::new(),
            limit,
            window,
            filter: None,
        }
    }

    pub fn with_client_ip(mut self) -> Self {
        self.use_client_ip = true;
        self
    }

    pub fn with_key_field(mut self, field: KeyField) -> Self {
        self.key_fields.push(field);
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&dyn RequestContext) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for RuleConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuleConfig")
            .field("name", &self.name)
            .field("use_client_ip", &self.use_client_ip)
            .field("key_fields", &self.key_fields)
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

/// Startup-time table mapping route identifiers to their ordered rules.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, Arc<[RuleConfig]>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `rules` to `route`, replacing any previous registration.
    ///
    /// Registration order is evaluation order.
    pub fn register(&mut self, route: impl Into<String>, rules: Vec<RuleConfig>) -> &mut Self {
        self.routes.insert(route.into(), rules.into());
        self
    }

    /// Rules registered for `route`, in evaluation order.
    pub fn rules_for(&self, route: &str) -> Option<Arc<[RuleConfig]>> {
        self.routes.get(route).cloned()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Load a route table from a YAML rules file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a route table from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RuleFile = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse rate limit rules: {}", e)))?;
        file.into_route_table()
    }
}

/// Time unit for rule windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// On-disk rules document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleFile {
    /// Map of route identifier to its rules, in evaluation order
    #[serde(default)]
    pub routes: HashMap<String, Vec<RuleSpec>>,
}

/// Declarative form of a [`RuleConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    /// Include the client address in the key
    #[serde(default)]
    pub client_ip: bool,
    /// Request value paths included in the key
    #[serde(default)]
    pub keys: Vec<Vec<String>>,
    /// Fixed limit
    #[serde(default)]
    pub limit: Option<i64>,
    /// Path to an integer request value holding the limit
    #[serde(default)]
    pub limit_from: Option<Vec<String>>,
    /// Limit used when `limit_from` resolves to nothing
    #[serde(default)]
    pub default_limit: i64,
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Response statuses for which the request is refunded
    #[serde(default)]
    pub exempt_statuses: Vec<u16>,
}

impl RuleFile {
    fn into_route_table(self) -> Result<RouteTable> {
        let mut table = RouteTable::new();
        for (route, specs) in self.routes {
            let rules = specs
                .into_iter()
                .map(RuleSpec::into_rule)
                .collect::<Result<Vec<_>>>()?;
            info!(route = %route, rules = rules.len(), "Registered rate limit rules");
            table.register(route, rules);
        }
        Ok(table)
    }
}

impl RuleSpec {
    fn into_rule(self) -> Result<RuleConfig> {
        let limit = match (self.limit, self.limit_from) {
            (Some(limit), None) => LimitSource::Fixed(limit),
            (None, Some(path)) if !path.is_empty() => LimitSource::FromValue {
                path,
                default: self.default_limit,
            },
            (Some(_), Some(_)) => {
                return Err(TollgateError::Config(format!(
                    "rule `{}` sets both `limit` and `limit_from`",
                    self.name
                )))
            }
            _ => {
                return Err(TollgateError::Config(format!(
                    "rule `{}` needs `limit` or a non-empty `limit_from`",
                    self.name
                )))
            }
        };

        let window = match (self.window_secs, self.unit) {
            (Some(secs), _) => Duration::from_secs(secs),
            (None, Some(unit)) => unit.duration(),
            (None, None) => {
                return Err(TollgateError::Config(format!(
                    "rule `{}` needs `unit` or `window_secs`",
                    self.name
                )))
            }
        };
        if window.is_zero() {
            return Err(TollgateError::Config(format!(
                "rule `{}` has a zero-length window",
                self.name
            )));
        }

        let mut rule = RuleConfig::new(self.name, limit, window);
        rule.use_client_ip = self.client_ip;
        rule.key_fields = self.keys.into_iter().map(KeyField::Path).collect();

        if !self.exempt_statuses.is_empty() {
            let statuses = self.exempt_statuses;
            rule = rule.with_filter(move |ctx| {
                ctx.response_status()
                    .is_some_and(|status| statuses.contains(&status))
            });
        }

        Ok(rule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::context::RequestValues;
    use serde_json::json;

    #[test]
    fn test_register_keeps_order() {
        let mut table = RouteTable::new();
        table.register(
            "/login",
            vec![
                RuleConfig::new("a", LimitSource::Fixed(1), Duration::from_secs(1)),
                RuleConfig::new("a", LimitSource::Fixed(2), Duration::from_secs(1)),
            ],
        );

        let rules = table.rules_for("/login").unwrap();
        assert_eq!(rules.len(), 2);
        assert!(matches!(rules[0].limit, LimitSource::Fixed(1)));
        assert!(matches!(rules[1].limit, LimitSource::Fixed(2)));
        assert!(table.rules_for("/other").is_none());
    }

    #[test]
    fn test_parse_rules_file() {
        let yaml = r#"
routes:
  /login:
    - name: login
      client_ip: true
      limit: 5
      unit: minute
      exempt_statuses: [200]
  /api/items:
    - name: items
      keys: [["user", "id"]]
      limit_from: ["user", "quota"]
      default_limit: 10
      window_secs: 30
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        assert_eq!(table.len(), 2);

        let login = table.rules_for("/login").unwrap();
        assert_eq!(login[0].name, "login");
        assert!(login[0].use_client_ip);
        assert_eq!(login[0].window, Duration::from_secs(60));
        assert!(login[0].filter.is_some());

        let items = table.rules_for("/api/items").unwrap();
        assert_eq!(items[0].window, Duration::from_secs(30));
        assert_eq!(items[0].key_fields.len(), 1);
        assert!(items[0].filter.is_none());
    }

    #[test]
    fn test_example_rules_file_parses() {
        let table = RouteTable::from_yaml(include_str!("../../rules.example.yaml")).unwrap();
        let items = table.rules_for("/api/items").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].name, "items-global");
    }

    #[test]
    fn test_exempt_statuses_filter() {
        let yaml = r#"
routes:
  /login:
    - name: login
      limit: 5
      unit: minute
      exempt_statuses: [200, 204]
"#;
        let table = RouteTable::from_yaml(yaml).unwrap();
        let rules = table.rules_for("/login").unwrap();
        let filter = rules[0].filter.clone().unwrap();

        let mut ctx = RequestValues::new();
        assert!(!filter(&ctx));
        ctx.set_response_status(401);
        assert!(!filter(&ctx));
        ctx.set_response_status(204);
        assert!(filter(&ctx));
    }

    #[test]
    fn test_rule_without_limit_rejected() {
        let yaml = r#"
routes:
  /login:
    - name: login
      unit: minute
"#;
        let err = RouteTable::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, TollgateError::Config(_)));
    }

    #[test]
    fn test_rule_without_window_rejected() {
        let yaml = r#"
routes:
  /login:
    - name: login
      limit: 5
"#;
        assert!(RouteTable::from_yaml(yaml).is_err());

        let zero = r#"
routes:
  /login:
    - name: login
      limit: 5
      window_secs: 0
"#;
        assert!(RouteTable::from_yaml(zero).is_err());
    }

    #[test]
    fn test_limit_from_value() {
        let source = LimitSource::FromValue {
            path: vec!["user".to_string(), "quota".to_string()],
            default: 3,
        };

        let ctx = RequestValues::new().with("user", json!({"quota": 50}));
        assert_eq!(source.evaluate("items", &ctx).unwrap(), 50);

        let ctx = RequestValues::new();
        assert_eq!(source.evaluate("items", &ctx).unwrap(), 3);

        let ctx = RequestValues::new().with("user", json!({"quota": "lots"}));
        let err = source.evaluate("items", &ctx).unwrap_err();
        assert!(matches!(err, RateLimitError::Configuration { .. }));
    }

    #[test]
    fn test_time_unit_duration() {
        assert_eq!(TimeUnit::Second.duration(), Duration::from_secs(1));
        assert_eq!(TimeUnit::Minute.duration(), Duration::from_secs(60));
        assert_eq!(TimeUnit::Hour.duration(), Duration::from_secs(3600));
        assert_eq!(TimeUnit::Day.duration(), Duration::from_secs(86400));
    }
}
