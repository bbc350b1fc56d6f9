//! Decision, reason and strategy types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Final decision of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// The request may proceed
    Allow,
    /// The request is rejected
    Deny,
}

impl Decision {
    /// Check if this decision allows the request.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    /// Reason reported alongside this decision.
    pub fn reason(&self) -> PolicyReason {
        match self {
            Decision::Allow => PolicyReason::PolicyEnforced,
            Decision::Deny => PolicyReason::PolicyViolated,
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a policy reached its decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyReason {
    /// At least one rule was violated
    PolicyViolated,
    /// No rule was violated
    PolicyEnforced,
}

impl PolicyReason {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyReason::PolicyViolated => "policy_violated",
            PolicyReason::PolicyEnforced => "policy_enforced",
        }
    }
}

impl fmt::Display for PolicyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a policy walks its rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Stop at the first violation; hooks fire per rule as it completes
    #[default]
    Preemptive,
    /// Run every rule and collect all violations; hooks fire after the
    /// final decision
    Exhaustive,
}

impl Strategy {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::Preemptive => "preemptive",
            Strategy::Exhaustive => "exhaustive",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preemptive" => Ok(Strategy::Preemptive),
            "exhaustive" => Ok(Strategy::Exhaustive),
            _ => Err(crate::Error::config_key(
                format!("Unknown strategy: {}", s),
                "strategy",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_reason() {
        assert!(Decision::Allow.is_allowed());
        assert!(!Decision::Deny.is_allowed());
        assert_eq!(Decision::Deny.reason(), PolicyReason::PolicyViolated);
        assert_eq!(Decision::Allow.reason(), PolicyReason::PolicyEnforced);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("exhaustive".parse::<Strategy>().unwrap(), Strategy::Exhaustive);
        assert_eq!("PREEMPTIVE".parse::<Strategy>().unwrap(), Strategy::Preemptive);
        assert!("eager".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_serialization() {
        assert_eq!(serde_json::to_string(&Decision::Deny).unwrap(), "\"deny\"");
        assert_eq!(
            serde_json::to_string(&PolicyReason::PolicyViolated).unwrap(),
            "\"policy_violated\""
        );
        assert_eq!(
            serde_json::from_str::<Strategy>("\"exhaustive\"").unwrap(),
            Strategy::Exhaustive
        );
    }
}
