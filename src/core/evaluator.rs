//! Policy evaluator implementation.
//!
//! One evaluation walks `Validating → Running → Deciding → DispatchingHooks →
//! Emitting → Done`. Preemptive runs skip `DispatchingHooks` because their
//! hooks already fired inside `Running`.

use super::hooks::{self, HookTiming};
use crate::api::{EvaluatedRule, PolicyResult, ViolatedRule, TRACE_FIELD};
use crate::audit::{AuditHandler, Outcome, TraceContext};
use crate::ids::{SharedIdGenerator, UuidGenerator};
use crate::policy::{Decision, Policy, RuleContext, RuleResult, Strategy, RULE_EVALUATION_ERROR};
use crate::telemetry::EvaluationMetrics;
use crate::Result;

use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use validator::Validate;

/// Evaluation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationState {
    /// Merging defaults and validating input
    Validating,
    /// Running rules in order
    Running,
    /// Computing the final decision
    Deciding,
    /// Firing deferred hooks
    DispatchingHooks,
    /// Building the result and closing the audit trail
    Emitting,
    /// Finished
    Done,
}

/// The policy evaluator that runs a policy's rules against one input.
#[derive(Clone)]
pub struct Evaluator {
    ids: SharedIdGenerator,
    metrics: Option<Arc<EvaluationMetrics>>,
}

impl Evaluator {
    /// Create a new evaluator with random ids and no counters.
    pub fn new() -> Self {
        Self {
            ids: Arc::new(UuidGenerator),
            metrics: None,
        }
    }

    /// Use a different id generator.
    pub fn with_id_generator(mut self, ids: SharedIdGenerator) -> Self {
        self.ids = ids;
        self
    }

    /// Record into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<EvaluationMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Evaluate `policy` against `input` with the given strategy.
    ///
    /// Only schema failures and audit failures are returned as errors; a rule
    /// that fails is recorded as a deny with reason `rule_evaluation_error`.
    pub async fn evaluate<I>(
        &self,
        policy: &Policy<I>,
        input: serde_json::Value,
        strategy: Strategy,
    ) -> Result<PolicyResult>
    where
        I: DeserializeOwned + Validate + Send + Sync + 'static,
    {
        let mut run = Run::new(self, policy, strategy);
        let mut input = Some(input);
        let mut state = EvaluationState::Validating;

        loop {
            debug!(policy = policy.name(), ?state, "Evaluation state");
            state = match state {
                EvaluationState::Validating => {
                    run.validate(input.take().unwrap_or_default()).await?
                }
                EvaluationState::Running => run.run_rules().await?,
                EvaluationState::Deciding => run.decide(),
                EvaluationState::DispatchingHooks => run.dispatch_deferred().await,
                EvaluationState::Emitting => run.emit().await?,
                EvaluationState::Done => break,
            };
        }

        run.finish()
    }
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("metrics", &self.metrics.is_some())
            .finish()
    }
}

/// One completed rule.
struct Evaluated {
    index: usize,
    result: RuleResult,
    rule_event_id: Option<String>,
}

/// Mutable state of one evaluation.
struct Run<'a, I> {
    evaluator: &'a Evaluator,
    policy: &'a Policy<I>,
    strategy: Strategy,
    timing: HookTiming,
    started: Instant,
    input: Option<Arc<I>>,
    evaluation_id: String,
    audit: Option<AuditHandler>,
    evaluated: Vec<Evaluated>,
    violations: Vec<usize>,
    decision: Decision,
    result: Option<PolicyResult>,
}

impl<'a, I> Run<'a, I>
where
    I: DeserializeOwned + Validate + Send + Sync + 'static,
{
    fn new(evaluator: &'a Evaluator, policy: &'a Policy<I>, strategy: Strategy) -> Self {
        Self {
            evaluator,
            policy,
            strategy,
            timing: HookTiming::from(strategy),
            started: Instant::now(),
            input: None,
            evaluation_id: String::new(),
            audit: None,
            evaluated: Vec::with_capacity(policy.rules().len()),
            violations: Vec::new(),
            decision: Decision::Allow,
            result: None,
        }
    }

    fn metrics(&self) -> Option<&EvaluationMetrics> {
        self.evaluator.metrics.as_deref()
    }

    async fn validate(&mut self, input: serde_json::Value) -> Result<EvaluationState> {
        let parsed = match self.policy.context().parse(input) {
            Ok(parsed) => parsed,
            Err(e) => {
                if let Some(metrics) = self.metrics() {
                    metrics.record_schema_failure();
                }
                return Err(e);
            }
        };

        self.evaluation_id = self.evaluator.ids.evaluation_id();
        if let Some(audit) = self.policy.context().tools().audit() {
            let trace = parsed.extension::<TraceContext>(TRACE_FIELD);
            let handler = audit.open(
                self.policy.reference(),
                self.evaluation_id.clone(),
                trace,
                self.evaluator.ids.clone(),
            );
            handler.policy_start().await?;
            self.audit = Some(handler);
        }
        self.input = Some(Arc::new(parsed.value));
        Ok(EvaluationState::Running)
    }

    fn rule_context(&self, index: usize, rule_event_id: Option<String>) -> RuleContext {
        RuleContext::new(
            self.policy.context().tools().clone(),
            self.policy.rules()[index].reference(),
            self.audit.clone(),
            rule_event_id,
        )
    }

    async fn run_rules(&mut self) -> Result<EvaluationState> {
        let Some(input) = self.input.clone() else {
            return Ok(EvaluationState::Deciding);
        };

        let policy = self.policy;
        for (index, rule) in policy.rules().iter().enumerate() {
            let rule_ref = rule.reference();
            let rule_event_id = match &self.audit {
                Some(audit) => Some(audit.rule_start(&rule_ref).await?),
                None => None,
            };

            let started = Instant::now();
            let result = match rule
                .evaluate(input.clone(), self.rule_context(index, rule_event_id.clone()))
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        policy = policy.name(),
                        rule = rule.name(),
                        error = %e,
                        "Rule failed, denying"
                    );
                    if let Some(metrics) = self.metrics() {
                        metrics.record_rule_error();
                    }
                    RuleResult::deny(RULE_EVALUATION_ERROR)
                }
            };
            let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
            debug!(
                rule = rule.name(),
                allowed = result.allowed,
                skipped = result.skipped,
                reason = result.reason.as_deref().unwrap_or(""),
                "Rule evaluated"
            );

            if let (Some(audit), Some(start_id)) = (&self.audit, rule_event_id.as_deref()) {
                audit
                    .rule_decision(&rule_ref, start_id, result.outcome(), result.reason.clone())
                    .await?;
                audit.rule_end(&rule_ref, start_id, duration_ms).await?;
            }

            let violated = result.is_violation();
            if self.timing == HookTiming::Immediate {
                if let Some(kind) = hooks::immediate_hook(&result) {
                    let ctx = self.rule_context(index, rule_event_id.clone());
                    hooks::dispatch(rule, kind, &result, &input, ctx, self.metrics()).await;
                }
            }

            self.evaluated.push(Evaluated {
                index,
                result,
                rule_event_id,
            });
            if violated {
                self.violations.push(self.evaluated.len() - 1);
                if self.strategy == Strategy::Preemptive {
                    break;
                }
            }
        }

        Ok(EvaluationState::Deciding)
    }

    fn decide(&mut self) -> EvaluationState {
        self.decision = if self.violations.is_empty() {
            Decision::Allow
        } else {
            Decision::Deny
        };
        match self.timing {
            HookTiming::Immediate => EvaluationState::Emitting,
            HookTiming::Deferred => EvaluationState::DispatchingHooks,
        }
    }

    async fn dispatch_deferred(&mut self) -> EvaluationState {
        let Some(input) = self.input.clone() else {
            return EvaluationState::Emitting;
        };
        let policy = self.policy;
        let plan = hooks::deferred_plan(self.evaluated.iter().map(|e| &e.result), self.decision);
        for (position, kind) in plan {
            let evaluated = &self.evaluated[position];
            let rule = &policy.rules()[evaluated.index];
            let ctx = self.rule_context(evaluated.index, evaluated.rule_event_id.clone());
            hooks::dispatch(rule, kind, &evaluated.result, &input, ctx, self.metrics()).await;
        }
        EvaluationState::Emitting
    }

    async fn emit(&mut self) -> Result<EvaluationState> {
        let rules = self.policy.rules();
        let violated_rules = self
            .violations
            .iter()
            .map(|&position| {
                let evaluated = &self.evaluated[position];
                ViolatedRule {
                    name: rules[evaluated.index].name().to_string(),
                    result: evaluated.result.clone(),
                }
            })
            .collect();
        let evaluated_rules = self
            .evaluated
            .iter()
            .map(|e| EvaluatedRule {
                rule: rules[e.index].reference(),
                result: e.result.clone(),
            })
            .collect();

        let mut result = PolicyResult::new(
            violated_rules,
            evaluated_rules,
            self.strategy,
            self.evaluation_id.clone(),
        );
        result.evaluation_time_ms = self.started.elapsed().as_secs_f64() * 1000.0;

        if let Some(audit) = &self.audit {
            let outcome = match result.decision {
                Decision::Allow => Outcome::Allow,
                Decision::Deny => Outcome::Deny,
            };
            audit
                .policy_decision(outcome, Some(result.reason.as_str().to_string()))
                .await?;
            audit.policy_end(result.evaluation_time_ms).await?;
        }

        if let Some(metrics) = self.metrics() {
            metrics.record_evaluation(result.decision, result.evaluation_time_ms);
        }
        self.result = Some(result);
        Ok(EvaluationState::Done)
    }

    fn finish(self) -> Result<PolicyResult> {
        self.result.ok_or_else(|| {
            crate::Error::rule(self.policy.name(), "evaluation ended without a result")
        })
    }
}
