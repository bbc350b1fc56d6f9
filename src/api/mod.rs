//! Public API for the policy engine.
//!
//! This module provides the main interface for assembling and evaluating
//! policies: contexts and their capabilities, the `PolicyEngine` façade and
//! the result types it returns.

mod context;
mod decision;
mod engine;
mod tools;

pub use context::{Context, ContextBuilder, ExtensionField, ParsedInput};
pub use decision::{EvaluatedRule, PolicyResult, ViolatedRule};
pub use engine::{evaluate_policy, EvaluateOptions, PolicyEngine, PolicyEngineBuilder};
pub use tools::{
    with_audit, with_rate_limit, with_storage, Tools, AUDIT_TOOL, RATE_LIMIT_TOOL, STORAGE_TOOL,
    TRACE_FIELD,
};
