//! Counter key generation.
//!
//! A key is composed of a fixed namespace, the rule name and index, and one
//! token per configured input, joined with `.`. Tokens are base64 so the
//! separator never appears inside them.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::context::RequestContext;
use super::rules::RuleConfig;

/// Namespace prefix shared by every counter key.
pub const KEY_PREFIX: &str = "rate";

/// Separator between key components.
pub const KEY_SEPARATOR: &str = ".";

/// Typed accessor used in place of a path lookup.
pub type ResolverFn = Arc<dyn Fn(&dyn RequestContext) -> Option<Value> + Send + Sync>;

/// One request-derived input to a rule's key.
#[derive(Clone)]
pub enum KeyField {
    /// Look up the first segment in the request values, then descend into
    /// object members for each following segment.
    Path(Vec<String>),
    /// Caller-supplied accessor.
    Resolver(ResolverFn),
}

impl KeyField {
    /// Convenience constructor for a path field.
    pub fn path<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyField::Path(segments.into_iter().map(Into::into).collect())
    }

    /// Convenience constructor for a resolver field.
    pub fn resolver<F>(f: F) -> Self
    where
        F: Fn(&dyn RequestContext) -> Option<Value> + Send + Sync + 'static,
    {
        KeyField::Resolver(Arc::new(f))
    }

    /// Resolve this field against the request.
    ///
    /// Returns `None` when nothing could be resolved.
    pub fn resolve(&self, ctx: &dyn RequestContext) -> Option<Value> {
        match self {
            KeyField::Path(segments) => resolve_path(ctx, segments).cloned(),
            KeyField::Resolver(f) => f(ctx),
        }
    }
}

impl fmt::Debug for KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyField::Path(segments) => f.debug_tuple("Path").field(segments).finish(),
            KeyField::Resolver(_) => f.write_str("Resolver(..)"),
        }
    }
}

/// Walk `segments` through the request values.
///
/// Descent stops without error at a null, at a non-object value, or at a
/// missing member; whatever was reached last is returned.
pub fn resolve_path<'a>(ctx: &'a dyn RequestContext, segments: &[String]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let mut current = ctx.get(first)?;

    for name in rest {
        match current {
            Value::Object(map) => match map.get(name) {
                Some(next) => current = next,
                None => return None,
            },
            _ => break,
        }
    }

    Some(current)
}

/// Builds deterministic counter keys for rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyBuilder;

impl KeyBuilder {
    /// Build the counter key for `rule`, evaluated at position `index` of
    /// its route's rule list, from the current request.
    pub fn build(rule: &RuleConfig, index: usize, ctx: &dyn RequestContext) -> String {
        let mut parts = vec![KEY_PREFIX.to_string(), rule.name.clone(), index.to_string()];

        if rule.use_client_ip {
            let ip = ctx.client_ip().map(|ip| ip.to_string()).unwrap_or_default();
            parts.push(STANDARD.encode(ip.as_bytes()));
        }

        for field in &rule.key_fields {
            parts.push(field_token(field.resolve(ctx).as_ref()));
        }

        parts.join(KEY_SEPARATOR)
    }
}

/// Turn a resolved value into a fixed-length token.
///
/// Absent and null values produce an empty token so later fields keep
/// their position.
fn field_token(value: Option<&Value>) -> String {
    let value = match value {
        None | Some(Value::Null) => return String::new(),
        Some(value) => value,
    };

    let mut hasher = Sha256::new();
    match value {
        Value::String(s) => hasher.update(s.as_bytes()),
        other => hasher.update(other.to_string().as_bytes()),
    }
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::context::RequestValues;
    use crate::ratelimit::rules::{LimitSource, RuleConfig};
    use serde_json::json;
    use std::time::Duration;

    fn rule(use_client_ip: bool, key_fields: Vec<KeyField>) -> RuleConfig {
        let mut rule = RuleConfig::new("login", LimitSource::Fixed(5), Duration::from_secs(60));
        rule.use_client_ip = use_client_ip;
        rule.key_fields = key_fields;
        rule
    }

    #[test]
    fn test_key_prefix_name_and_index() {
        let rule = rule(false, vec![]);
        let key = KeyBuilder::build(&rule, 2, &RequestValues::new());
        assert_eq!(key, "rate.login.2");
    }

    #[test]
    fn test_client_ip_token() {
        let rule = rule(true, vec![]);
        let ctx = RequestValues::new().with_client_ip("127.0.0.1".parse().unwrap());
        let key = KeyBuilder::build(&rule, 0, &ctx);
        assert_eq!(key, format!("rate.login.0.{}", STANDARD.encode("127.0.0.1")));
    }

    #[test]
    fn test_identical_values_give_identical_keys() {
        let rule = rule(false, vec![KeyField::path(["user", "id"])]);
        let a = RequestValues::new().with("user", json!({"id": 7, "name": "a"}));
        let b = RequestValues::new().with("user", json!({"id": 7, "name": "b"}));
        assert_eq!(KeyBuilder::build(&rule, 0, &a), KeyBuilder::build(&rule, 0, &b));
    }

    #[test]
    fn test_different_values_give_different_keys() {
        let rule = rule(false, vec![KeyField::path(["user", "id"])]);
        let a = RequestValues::new().with("user", json!({"id": 7}));
        let b = RequestValues::new().with("user", json!({"id": 8}));
        assert_ne!(KeyBuilder::build(&rule, 0, &a), KeyBuilder::build(&rule, 0, &b));
    }

    #[test]
    fn test_tokens_are_fixed_length_and_separator_free() {
        let rule = rule(false, vec![KeyField::path(["note"])]);
        let ctx = RequestValues::new().with("note", "a.very.long.dotted.value".repeat(20));
        let key = KeyBuilder::build(&rule, 0, &ctx);
        let token = key.rsplit(KEY_SEPARATOR).next().unwrap();
        assert_eq!(token.len(), 44);
        assert_eq!(key.matches(KEY_SEPARATOR).count(), 3);
    }

    #[test]
    fn test_absent_value_yields_empty_token() {
        let rule = rule(false, vec![KeyField::path(["user", "id"]), KeyField::path(["tenant"])]);
        let ctx = RequestValues::new().with("tenant", "acme");
        let key = KeyBuilder::build(&rule, 0, &ctx);
        assert!(key.starts_with("rate.login.0.."));

        let null_ctx = RequestValues::new().with("user", Value::Null).with("tenant", "acme");
        assert_eq!(KeyBuilder::build(&rule, 0, &null_ctx), key);
    }

    #[test]
    fn test_descent_stops_at_scalar() {
        let ctx = RequestValues::new().with("user", "alice");
        let segments = vec!["user".to_string(), "id".to_string(), "x".to_string()];
        assert_eq!(resolve_path(&ctx, &segments), Some(&json!("alice")));
    }

    #[test]
    fn test_descent_stops_at_null_member() {
        let ctx = RequestValues::new().with("user", json!({"profile": null}));
        let segments = vec!["user".to_string(), "profile".to_string(), "id".to_string()];
        assert_eq!(resolve_path(&ctx, &segments), Some(&Value::Null));
    }

    #[test]
    fn test_composite_values_are_hashed_structurally() {
        let rule = rule(false, vec![KeyField::path(["user"])]);
        let a = RequestValues::new().with("user", json!({"id": 1, "tags": ["x"]}));
        let b = RequestValues::new().with("user", json!({"id": 1, "tags": ["y"]}));
        assert_ne!(KeyBuilder::build(&rule, 0, &a), KeyBuilder::build(&rule, 0, &b));
    }

    #[test]
    fn test_resolver_field() {
        let rule = rule(
            false,
            vec![KeyField::resolver(|ctx| ctx.get("tenant").cloned())],
        );
        let path_rule = {
            let mut r = rule.clone();
            r.key_fields = vec![KeyField::path(["tenant"])];
            r
        };
        let ctx = RequestValues::new().with("tenant", "acme");
        assert_eq!(KeyBuilder::build(&rule, 0, &ctx), KeyBuilder::build(&path_rule, 0, &ctx));
    }
}
