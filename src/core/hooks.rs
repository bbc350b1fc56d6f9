//! Hook timing and dispatch.
//!
//! Preemptive evaluations fire a rule's hook as soon as that rule completes,
//! judged by the rule's own result. Exhaustive evaluations hold every hook
//! until the policy decision is known and fire only the hooks that agree with
//! it. Both plans are pure functions so each timing mode can be checked
//! without running an evaluation.

use crate::policy::{Decision, HookKind, Rule, RuleContext, RuleResult, Strategy};
use crate::telemetry::EvaluationMetrics;

use std::sync::Arc;
use tracing::warn;

/// When hooks fire relative to the policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookTiming {
    /// Per rule, right after it completes
    Immediate,
    /// After the final decision
    Deferred,
}

impl From<Strategy> for HookTiming {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Preemptive => HookTiming::Immediate,
            Strategy::Exhaustive => HookTiming::Deferred,
        }
    }
}

/// Hook to fire right after a rule completes. Skipped results fire nothing.
pub fn immediate_hook(result: &RuleResult) -> Option<HookKind> {
    if result.skipped {
        None
    } else if result.allowed {
        Some(HookKind::OnAllow)
    } else {
        Some(HookKind::OnDeny)
    }
}

/// Hooks to fire once `decision` is final, as `(index, kind)` in evaluation
/// order. A rule's `on_allow` fires only if it allowed and the policy
/// allowed; its `on_deny` only if it denied and the policy denied.
pub fn deferred_plan<'a>(
    results: impl IntoIterator<Item = &'a RuleResult>,
    decision: Decision,
) -> Vec<(usize, HookKind)> {
    results
        .into_iter()
        .enumerate()
        .filter(|(_, result)| !result.skipped)
        .filter_map(|(index, result)| match (result.allowed, decision) {
            (true, Decision::Allow) => Some((index, HookKind::OnAllow)),
            (false, Decision::Deny) => Some((index, HookKind::OnDeny)),
            _ => None,
        })
        .collect()
}

/// Fire one hook. Failures are logged and counted; they never reach the
/// caller and never change the decision.
pub(crate) async fn dispatch<I>(
    rule: &Rule<I>,
    kind: HookKind,
    result: &RuleResult,
    input: &Arc<I>,
    ctx: RuleContext,
    metrics: Option<&EvaluationMetrics>,
) where
    I: Send + Sync + 'static,
{
    if !rule.has_hook(kind) {
        return;
    }
    if let Err(e) = rule.fire(kind, result.clone(), input.clone(), ctx).await {
        warn!(rule = rule.name(), hook = ?kind, error = %e, "Rule hook failed");
        if let Some(metrics) = metrics {
            metrics.record_hook_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results() -> Vec<RuleResult> {
        vec![
            RuleResult::allow(),
            RuleResult::deny("a"),
            RuleResult::skip(),
            RuleResult::allow(),
            RuleResult::deny("b"),
        ]
    }

    #[test]
    fn test_timing_from_strategy() {
        assert_eq!(HookTiming::from(Strategy::Preemptive), HookTiming::Immediate);
        assert_eq!(HookTiming::from(Strategy::Exhaustive), HookTiming::Deferred);
    }

    #[test]
    fn test_immediate_hook() {
        assert_eq!(immediate_hook(&RuleResult::allow()), Some(HookKind::OnAllow));
        assert_eq!(immediate_hook(&RuleResult::deny("x")), Some(HookKind::OnDeny));
        assert_eq!(immediate_hook(&RuleResult::skip()), None);
    }

    #[test]
    fn test_deferred_plan_on_deny() {
        let plan = deferred_plan(&results(), Decision::Deny);
        assert_eq!(plan, vec![(1, HookKind::OnDeny), (4, HookKind::OnDeny)]);
    }

    #[test]
    fn test_deferred_plan_on_allow() {
        let all_allowed = vec![RuleResult::allow(), RuleResult::skip(), RuleResult::allow()];
        let plan = deferred_plan(&all_allowed, Decision::Allow);
        assert_eq!(plan, vec![(0, HookKind::OnAllow), (2, HookKind::OnAllow)]);
    }

    #[test]
    fn test_skipped_denial_fires_nothing() {
        let odd = RuleResult {
            allowed: false,
            skipped: true,
            reason: None,
        };
        assert_eq!(immediate_hook(&odd), None);
        assert!(deferred_plan([&odd], Decision::Deny).is_empty());
    }
}
