//! Policy result types.

use crate::audit::EntityRef;
use crate::policy::{Decision, PolicyReason, RuleResult, Strategy};
use serde::{Deserialize, Serialize};

/// A rule that denied the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolatedRule {
    /// Rule name
    pub name: String,
    /// The denying result
    pub result: RuleResult,
}

/// A rule that ran, with its result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatedRule {
    /// Rule reference
    pub rule: EntityRef,
    /// Result
    pub result: RuleResult,
}

/// The result of a policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyResult {
    /// Final decision
    pub decision: Decision,
    /// Whether the input is allowed
    pub is_allowed: bool,
    /// Why the decision was reached
    pub reason: PolicyReason,
    /// Denying rules, in evaluation order
    #[serde(default)]
    pub violated_rules: Vec<ViolatedRule>,
    /// Every rule that ran, in evaluation order
    #[serde(default)]
    pub evaluated_rules: Vec<EvaluatedRule>,
    /// Strategy the evaluation used
    pub strategy: Strategy,
    /// Evaluation id (`eval:...`)
    pub evaluation_id: String,
    /// Time taken for evaluation in milliseconds
    pub evaluation_time_ms: f64,
}

impl PolicyResult {
    pub(crate) fn new(
        violated_rules: Vec<ViolatedRule>,
        evaluated_rules: Vec<EvaluatedRule>,
        strategy: Strategy,
        evaluation_id: String,
    ) -> Self {
        let decision = if violated_rules.is_empty() {
            Decision::Allow
        } else {
            Decision::Deny
        };
        Self {
            decision,
            is_allowed: decision.is_allowed(),
            reason: decision.reason(),
            violated_rules,
            evaluated_rules,
            strategy,
            evaluation_id,
            evaluation_time_ms: 0.0,
        }
    }

    /// Names of the violated rules.
    pub fn violated_rule_names(&self) -> Vec<&str> {
        self.violated_rules.iter().map(|v| v.name.as_str()).collect()
    }

    /// Result of a rule by name, if it ran.
    pub fn result_of(&self, rule_name: &str) -> Option<&RuleResult> {
        self.evaluated_rules
            .iter()
            .find(|e| e.rule.name == rule_name)
            .map(|e| &e.result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(name: &str) -> EntityRef {
        EntityRef {
            name: name.to_string(),
            id: format!("rule:{}", name),
            version: None,
        }
    }

    #[test]
    fn test_decision_follows_violations() {
        let allowed = PolicyResult::new(
            vec![],
            vec![EvaluatedRule {
                rule: rule("a"),
                result: RuleResult::allow(),
            }],
            Strategy::Preemptive,
            "eval:1".to_string(),
        );
        assert!(allowed.is_allowed);
        assert_eq!(allowed.reason, PolicyReason::PolicyEnforced);

        let denied = PolicyResult::new(
            vec![ViolatedRule {
                name: "a".to_string(),
                result: RuleResult::deny("nope"),
            }],
            vec![],
            Strategy::Exhaustive,
            "eval:2".to_string(),
        );
        assert_eq!(denied.decision, Decision::Deny);
        assert_eq!(denied.violated_rule_names(), vec!["a"]);
    }

    #[test]
    fn test_serialization_shape() {
        let result = PolicyResult::new(
            vec![],
            vec![EvaluatedRule {
                rule: rule("a"),
                result: RuleResult::skip(),
            }],
            Strategy::Preemptive,
            "eval:1".to_string(),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["decision"], "allow");
        assert_eq!(json["isAllowed"], true);
        assert_eq!(json["reason"], "policy_enforced");
        assert_eq!(json["strategy"], "preemptive");
        assert_eq!(json["evaluationId"], "eval:1");
        assert_eq!(json["evaluatedRules"][0]["result"]["skipped"], true);
        assert!(json["violatedRules"].as_array().unwrap().is_empty());
    }
}
