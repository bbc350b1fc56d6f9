//! Policy engine implementation.

use super::PolicyResult;
use crate::config::EngineConfig;
use crate::core::Evaluator;
use crate::ids::SharedIdGenerator;
use crate::policy::{Policy, Strategy};
use crate::telemetry::{EvaluationMetrics, MetricsSnapshot};
use crate::Result;

use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{info_span, Instrument};
use validator::Validate;

/// Per-call evaluation options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluateOptions {
    /// Strategy for this call only
    pub strategy: Option<Strategy>,
}

impl EvaluateOptions {
    /// Options forcing `strategy`.
    pub fn with_strategy(strategy: Strategy) -> Self {
        Self {
            strategy: Some(strategy),
        }
    }
}

/// The main policy engine for evaluating policies.
///
/// The engine holds no policies of its own: callers pass the policy on each
/// call, so one engine serves any number of contexts and input types.
/// Concurrent evaluations share only what the policies' tools share.
pub struct PolicyEngine {
    /// Policy evaluator
    evaluator: Evaluator,
    /// Evaluation counters
    metrics: Option<Arc<EvaluationMetrics>>,
    /// Configuration
    config: EngineConfig,
}

impl PolicyEngine {
    /// Create a policy engine builder.
    pub fn builder() -> PolicyEngineBuilder {
        PolicyEngineBuilder::new()
    }

    /// Create a new policy engine with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        let metrics = config
            .telemetry
            .enabled
            .then(|| Arc::new(EvaluationMetrics::new(&config.telemetry)));
        let mut evaluator = Evaluator::new();
        if let Some(ref metrics) = metrics {
            evaluator = evaluator.with_metrics(metrics.clone());
        }

        Self {
            evaluator,
            metrics,
            config,
        }
    }

    /// Evaluate `policy` against raw `input` using the policy's default
    /// strategy, unless the configuration overrides it.
    ///
    /// # Returns
    /// * `Ok(PolicyResult)` - An allow or deny decision
    /// * `Err(Error::SchemaValidation)` - The input was rejected before any rule ran
    pub async fn evaluate<I>(&self, policy: &Policy<I>, input: serde_json::Value) -> Result<PolicyResult>
    where
        I: DeserializeOwned + Validate + Send + Sync + 'static,
    {
        self.evaluate_with(policy, input, EvaluateOptions::default())
            .await
    }

    /// Evaluate with per-call options. The option's strategy wins over the
    /// configured override, which wins over the policy default.
    pub async fn evaluate_with<I>(
        &self,
        policy: &Policy<I>,
        input: serde_json::Value,
        options: EvaluateOptions,
    ) -> Result<PolicyResult>
    where
        I: DeserializeOwned + Validate + Send + Sync + 'static,
    {
        let strategy = self.strategy_for(policy, options);
        let span = info_span!(
            "policy_evaluation",
            service = %self.config.telemetry.service_name,
            policy = policy.name(),
            policy_id = policy.id(),
            strategy = %strategy,
        );
        self.evaluator
            .evaluate(policy, input, strategy)
            .instrument(span)
            .await
    }

    /// Strategy an evaluation of `policy` would use with `options`.
    pub fn strategy_for<I>(&self, policy: &Policy<I>, options: EvaluateOptions) -> Strategy {
        options
            .strategy
            .or(self.config.evaluation.default_strategy_override)
            .unwrap_or_else(|| policy.default_strategy())
    }

    /// Get evaluation counters, if telemetry is enabled.
    pub fn metrics(&self) -> Option<MetricsSnapshot> {
        self.metrics.as_ref().map(|m| m.snapshot())
    }

    /// The configuration the engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Builder for creating a PolicyEngine.
#[derive(Default)]
pub struct PolicyEngineBuilder {
    config: Option<EngineConfig>,
    telemetry_enabled: Option<bool>,
    ids: Option<SharedIdGenerator>,
}

impl PolicyEngineBuilder {
    /// Create a new policy engine builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Enable or disable telemetry.
    pub fn with_telemetry_enabled(mut self, enabled: bool) -> Self {
        self.telemetry_enabled = Some(enabled);
        self
    }

    /// Mint evaluation and event ids with `ids`.
    pub fn with_id_generator(mut self, ids: SharedIdGenerator) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Build the policy engine.
    pub fn build(self) -> Result<PolicyEngine> {
        let mut config = self.config.unwrap_or_default();

        // Apply builder overrides
        if let Some(enabled) = self.telemetry_enabled {
            config.telemetry.enabled = enabled;
        }
        config.validate()?;

        let mut engine = PolicyEngine::new(config);
        if let Some(ids) = self.ids {
            engine.evaluator = engine.evaluator.with_id_generator(ids);
        }
        Ok(engine)
    }
}

/// Evaluate `policy` once with a bare evaluator and the given strategy (or
/// the policy's default).
///
/// Records no telemetry. The call bypasses [`PolicyEngine`], so there are no
/// metrics counters or `policy_evaluation` span, and no configured strategy
/// override applies. Audit events are still emitted when the policy's context
/// carries audit.
pub async fn evaluate_policy<I>(
    policy: &Policy<I>,
    input: serde_json::Value,
    strategy: Option<Strategy>,
) -> Result<PolicyResult>
where
    I: DeserializeOwned + Validate + Send + Sync + 'static,
{
    let strategy = strategy.unwrap_or_else(|| policy.default_strategy());
    Evaluator::new().evaluate(policy, input, strategy).await
}
