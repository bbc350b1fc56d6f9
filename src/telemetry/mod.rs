//! Telemetry and observability for the policy engine.
//!
//! Evaluation counters are plain atomics read through [`EvaluationMetrics::snapshot`];
//! logs and spans go through `tracing`, with the subscriber installed once by
//! [`init_tracing`].

use crate::config::{LoggingConfig, TelemetryConfig};
use crate::policy::Decision;
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Counters for policy evaluations.
#[derive(Debug)]
pub struct EvaluationMetrics {
    service_name: String,
    evaluations_allow: AtomicU64,
    evaluations_deny: AtomicU64,
    schema_failures: AtomicU64,
    rule_errors: AtomicU64,
    hook_failures: AtomicU64,
    /// Total evaluation time in microseconds
    total_evaluation_time_us: AtomicU64,
}

impl EvaluationMetrics {
    /// Create a new metrics instance.
    pub fn new(config: &TelemetryConfig) -> Self {
        Self {
            service_name: config.service_name.clone(),
            evaluations_allow: AtomicU64::new(0),
            evaluations_deny: AtomicU64::new(0),
            schema_failures: AtomicU64::new(0),
            rule_errors: AtomicU64::new(0),
            hook_failures: AtomicU64::new(0),
            total_evaluation_time_us: AtomicU64::new(0),
        }
    }

    /// Record a completed evaluation.
    pub fn record_evaluation(&self, decision: Decision, duration_ms: f64) {
        match decision {
            Decision::Allow => self.evaluations_allow.fetch_add(1, Ordering::Relaxed),
            Decision::Deny => self.evaluations_deny.fetch_add(1, Ordering::Relaxed),
        };
        let duration_us = (duration_ms * 1000.0) as u64;
        self.total_evaluation_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    /// Record an input rejected before any rule ran.
    pub fn record_schema_failure(&self) {
        self.schema_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a rule that failed and was downgraded to a deny.
    pub fn record_rule_error(&self) {
        self.rule_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a hook that failed.
    pub fn record_hook_failure(&self) {
        self.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Service name the counters belong to.
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Get current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let evaluations_allow = self.evaluations_allow.load(Ordering::Relaxed);
        let evaluations_deny = self.evaluations_deny.load(Ordering::Relaxed);
        let total_evaluations = evaluations_allow + evaluations_deny;

        let total_time_us = self.total_evaluation_time_us.load(Ordering::Relaxed);
        let avg_evaluation_time_ms = if total_evaluations > 0 {
            (total_time_us as f64 / total_evaluations as f64) / 1000.0
        } else {
            0.0
        };

        MetricsSnapshot {
            total_evaluations,
            evaluations_allow,
            evaluations_deny,
            schema_failures: self.schema_failures.load(Ordering::Relaxed),
            rule_errors: self.rule_errors.load(Ordering::Relaxed),
            hook_failures: self.hook_failures.load(Ordering::Relaxed),
            avg_evaluation_time_ms,
        }
    }
}

impl Default for EvaluationMetrics {
    fn default() -> Self {
        Self::new(&TelemetryConfig::default())
    }
}

/// Point-in-time copy of [`EvaluationMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Completed evaluations
    pub total_evaluations: u64,
    /// Allow decisions
    pub evaluations_allow: u64,
    /// Deny decisions
    pub evaluations_deny: u64,
    /// Inputs rejected by the schema
    pub schema_failures: u64,
    /// Rules that failed
    pub rule_errors: u64,
    /// Hooks that failed
    pub hook_failures: u64,
    /// Average evaluation time in milliseconds
    pub avg_evaluation_time_ms: f64,
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over `config.level`. Fails if a subscriber is
/// already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| Error::config_key(format!("Invalid log filter: {}", e), "logging.level"))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| Error::config(format!("Failed to set logging subscriber: {}", e)))
}
