//! Core rate limiter implementation.
//!
//! [`RateLimiter::evaluate`] runs a route's rules in order against the
//! counter store, folds the per-rule outcomes into one aggregate, and
//! decides whether the request is admitted. Refunds are not applied here:
//! they are handed back as [`DeferredCompensation`]s for the caller to run
//! once the response has been produced.

use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use super::context::RequestContext;
use super::key::KeyBuilder;
use super::rules::{FilterFn, RuleConfig};
use super::store::{CounterStore, StoreError};
use crate::error::RateLimitError;

/// Default upper bound on a single counter store call.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Tunables for [`RateLimiter`].
#[derive(Debug, Clone, Copy)]
pub struct LimiterOptions {
    /// Upper bound on each counter store call; exceeding it fails closed
    pub store_timeout: Duration,
    /// Compute and report quotas but never deny
    pub dry_run: bool,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            dry_run: false,
        }
    }
}

/// Result of evaluating one rule for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleOutcome {
    pub key: String,
    pub limit: i64,
    pub used_count: i64,
    /// May be negative once the rule is over its limit
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

/// All applicable rule outcomes of a request folded together.
///
/// The tightest limit and remaining quota win, and the latest reset wins so
/// a client never retries before every rule has reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregateOutcome {
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

impl AggregateOutcome {
    fn from_rule(outcome: &RuleOutcome) -> Self {
        Self {
            limit: outcome.limit,
            remaining: outcome.remaining,
            reset_at: outcome.reset_at,
        }
    }

    fn fold(&mut self, outcome: &RuleOutcome) {
        self.limit = self.limit.min(outcome.limit);
        self.remaining = self.remaining.min(outcome.remaining);
        self.reset_at = self.reset_at.max(outcome.reset_at);
    }

    /// Remaining quota as reported to clients, never below zero.
    pub fn remaining_clamped(&self) -> i64 {
        self.remaining.max(0)
    }

    /// Reset instant as Unix seconds.
    pub fn reset_epoch_secs(&self) -> i64 {
        self.reset_at.timestamp()
    }

    /// Whether some rule has been used beyond its limit.
    pub fn is_exhausted(&self) -> bool {
        self.remaining < 0
    }
}

/// A refund to consider once the response has been produced.
#[derive(Clone)]
pub struct DeferredCompensation {
    pub key: String,
    pub window: Duration,
    pub filter: FilterFn,
}

impl fmt::Debug for DeferredCompensation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredCompensation")
            .field("key", &self.key)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

/// Admission verdict for a request.
#[derive(Debug, Clone)]
pub enum Decision {
    Admit,
    Deny(RateLimitError),
}

/// Everything produced by evaluating a route's rules for one request.
#[derive(Debug)]
pub struct Evaluation {
    /// Outcomes of the rules that applied, in evaluation order
    pub outcomes: Vec<RuleOutcome>,
    /// Folded outcome; `None` when no rule applied or evaluation failed
    pub aggregate: Option<AggregateOutcome>,
    /// Refunds to run after the response, in registration order
    pub compensations: Vec<DeferredCompensation>,
    pub decision: Decision,
}

impl Evaluation {
    pub fn is_admitted(&self) -> bool {
        matches!(self.decision, Decision::Admit)
    }

    /// The denial error, if the request was denied.
    pub fn error(&self) -> Option<&RateLimitError> {
        match &self.decision {
            Decision::Admit => None,
            Decision::Deny(err) => Some(err),
        }
    }
}

/// Per-request admission control over a shared counter store.
///
/// Holds no rate limit state of its own; the store's atomic
/// increment-with-expiry is the only synchronization, so any number of
/// processes sharing one store enforce the same quotas.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    options: LimiterOptions,
}

impl RateLimiter {
    /// Create a rate limiter with default options.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self::with_options(store, LimiterOptions::default())
    }

    pub fn with_options(store: Arc<dyn CounterStore>, options: LimiterOptions) -> Self {
        Self { store, options }
    }

    pub fn options(&self) -> LimiterOptions {
        self.options
    }

    /// Evaluate `rules`, in order, for the current request.
    ///
    /// Counts are never rolled back: a denied request stays counted, and if a
    /// later rule fails against the store, earlier increments stand.
    pub async fn evaluate(&self, rules: &[RuleConfig], ctx: &dyn RequestContext) -> Evaluation {
        let now = Utc::now();
        let mut outcomes = Vec::with_capacity(rules.len());
        let mut aggregate: Option<AggregateOutcome> = None;
        let mut compensations = Vec::new();

        for (index, rule) in rules.iter().enumerate() {
            let outcome = match self.evaluate_rule(rule, index, ctx, now).await {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(err) => {
                    warn!(rule = %rule.name, error = %err, "Rate limit evaluation failed");
                    return Evaluation {
                        outcomes,
                        aggregate: None,
                        compensations,
                        decision: Decision::Deny(err),
                    };
                }
            };

            match aggregate.as_mut() {
                Some(agg) => agg.fold(&outcome),
                None => aggregate = Some(AggregateOutcome::from_rule(&outcome)),
            }

            if let Some(filter) = &rule.filter {
                compensations.push(DeferredCompensation {
                    key: outcome.key.clone(),
                    window: rule.window,
                    filter: filter.clone(),
                });
            }

            outcomes.push(outcome);
        }

        let decision = match aggregate {
            Some(agg) if agg.is_exhausted() => {
                if self.options.dry_run {
                    debug!(limit = agg.limit, "Rate limit exceeded (dry run, admitting)");
                    Decision::Admit
                } else {
                    debug!(
                        limit = agg.limit,
                        reset = agg.reset_epoch_secs(),
                        "Rate limit exceeded"
                    );
                    Decision::Deny(RateLimitError::RateLimitExceeded {
                        limit: agg.limit,
                        reset_at: agg.reset_at,
                    })
                }
            }
            _ => Decision::Admit,
        };

        Evaluation {
            outcomes,
            aggregate,
            compensations,
            decision,
        }
    }

    /// Evaluate a single rule. Returns `None` when the rule does not apply.
    async fn evaluate_rule(
        &self,
        rule: &RuleConfig,
        index: usize,
        ctx: &dyn RequestContext,
        now: DateTime<Utc>,
    ) -> Result<Option<RuleOutcome>, RateLimitError> {
        let limit = rule.limit.evaluate(&rule.name, ctx)?;
        if limit <= 0 {
            trace!(rule = %rule.name, limit = limit, "Rule disabled for request");
            return Ok(None);
        }

        let key = KeyBuilder::build(rule, index, ctx);
        trace!(rule = %rule.name, key = %key, limit = limit, "Checking rate limit");

        let used_count = self
            .bounded(self.store.increment_with_expiry(&key, rule.window))
            .await?;
        let remaining = limit - used_count.max(1);

        let ttl = self.bounded(self.store.remaining_ttl(&key)).await?;
        let reset_at = offset(now, ttl.unwrap_or(rule.window));

        Ok(Some(RuleOutcome {
            key,
            limit,
            used_count,
            remaining,
            reset_at,
        }))
    }

    /// Run deferred refunds against the request as it stands after the
    /// response. Failures are logged and never propagated.
    pub async fn run_compensations(
        &self,
        compensations: Vec<DeferredCompensation>,
        ctx: &dyn RequestContext,
    ) {
        for compensation in compensations {
            let exempt = catch_unwind(AssertUnwindSafe(|| (compensation.filter)(ctx)));
            match exempt {
                Ok(true) => {}
                Ok(false) => continue,
                Err(_) => {
                    warn!(key = %compensation.key, "Refund filter panicked, skipping refund");
                    continue;
                }
            }

            match self
                .bounded(self.store.decrement(&compensation.key, compensation.window))
                .await
            {
                Ok(count) => {
                    debug!(key = %compensation.key, count = count, "Refunded rate limit hit")
                }
                Err(err) => {
                    warn!(key = %compensation.key, error = %err, "Failed to refund rate limit hit")
                }
            }
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.options.store_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout)?
    }
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

fn offset(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
