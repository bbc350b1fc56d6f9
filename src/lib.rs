//! # Policy Engine
//!
//! Rule-based policy evaluation with audit trails and rate limiting. A
//! policy is a named, ordered set of rules over a validated input; evaluating
//! it yields an allow/deny decision with the rules that ran and the rules
//! that were violated.
//!
//! ## Features
//!
//! - **Typed inputs**: raw JSON is merged over defaults and validated into
//!   your input type before any rule runs
//! - **Two strategies**: preemptive (stop at the first violation) and
//!   exhaustive (run everything, report every violation)
//! - **Fail-closed rules**: a rule that errors or panics denies, it never
//!   aborts the evaluation
//! - **Audit trail**: causally linked events per evaluation, rebuilt into an
//!   explain tree on demand
//! - **Rate limiting**: fixed window, sliding window and token bucket over any
//!   storage adapter with atomic update
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use policy_engine::{Context, Policy, PolicyEngine, Rule, RuleResult, Strategy};
//! use serde::Deserialize;
//! use validator::Validate;
//!
//! #[derive(Deserialize, Validate)]
//! struct Person {
//!     age: f64,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let context: Context<Person> = Context::builder().build();
//!     let is_adult = context.define_rule_fn("is-adult", |p| {
//!         if p.age >= 18.0 {
//!             RuleResult::allow()
//!         } else {
//!             RuleResult::deny("underage")
//!         }
//!     });
//!     let policy = Policy::new(&context, "age check", vec![is_adult], Strategy::Preemptive)?;
//!
//!     let engine = PolicyEngine::builder().build()?;
//!     let result = engine.evaluate(&policy, serde_json::json!({"age": 15})).await?;
//!     assert!(!result.is_allowed);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod api;
pub mod audit;
pub mod clock;
pub mod config;
pub mod core;
pub mod error;
pub mod ids;
pub mod policy;
pub mod ratelimit;
pub mod storage;
pub mod telemetry;

// Re-export main types for convenience
pub use api::{
    evaluate_policy, with_audit, with_rate_limit, with_storage, Context, ContextBuilder,
    EvaluateOptions, PolicyEngine, PolicyEngineBuilder, PolicyResult, Tools,
};
pub use audit::{build_explain_tree, Audit, AuditEvent, AuditEventType, ExplainNode};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use policy::{Decision, Policy, PolicyReason, Rule, RuleContext, RuleResult, Strategy};
pub use ratelimit::{rate_limit_rule, RateLimitConfig, RateLimiter};
pub use storage::{InMemoryStorage, StorageAdapter};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
