//! Rate limiting logic: rules, key derivation, counter stores and the
//! per-request orchestrator.

mod context;
mod key;
mod limiter;
mod rules;
mod store;

pub use context::{RequestContext, RequestValues};
pub use key::{KeyBuilder, KeyField, ResolverFn, KEY_PREFIX, KEY_SEPARATOR};
pub use limiter::{
    AggregateOutcome, Decision, DeferredCompensation, Evaluation, LimiterOptions, RateLimiter,
    RuleOutcome,
};
pub use rules::{
    FilterFn, LimitFn, LimitSource, RouteTable, RuleConfig, RuleFile, RuleSpec, TimeUnit,
};
pub use store::{CounterStore, MemoryStore, RedisStore, StoreError};
