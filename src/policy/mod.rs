//! Rules, policies and their decision types.
//!
//! A [`Policy`] is a named, ordered set of [`Rule`]s bound to one
//! [`Context`](crate::api::Context). Rule order is evaluation order and the
//! order violations are reported in.

mod decision;
mod rule;

pub use decision::{Decision, PolicyReason, Strategy};
pub use rule::{HookKind, Rule, RuleContext, RuleResult, RULE_EVALUATION_ERROR};

use crate::api::Context;
use crate::audit::EntityRef;
use crate::ids::slugify;
use crate::{Error, Result};

/// Version reported for policies that do not declare one.
pub const DEFAULT_POLICY_VERSION: &str = "1.0.0";

/// A named, ordered rule set plus a default strategy.
pub struct Policy<I> {
    name: String,
    id: String,
    version: String,
    context: Context<I>,
    rules: Vec<Rule<I>>,
    default_strategy: Strategy,
}

impl<I> Clone for Policy<I> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            id: self.id.clone(),
            version: self.version.clone(),
            context: self.context.clone(),
            rules: self.rules.clone(),
            default_strategy: self.default_strategy,
        }
    }
}

impl<I> Policy<I> {
    /// Create a policy. A rule whose name repeats an earlier one replaces
    /// it at the earlier position.
    pub fn new(
        context: &Context<I>,
        name: impl Into<String>,
        rules: impl IntoIterator<Item = Rule<I>>,
        default_strategy: Strategy,
    ) -> Result<Self> {
        Self::builder(context, name)
            .rules(rules)
            .default_strategy(default_strategy)
            .build()
    }

    /// Create a policy builder.
    pub fn builder(context: &Context<I>, name: impl Into<String>) -> PolicyBuilder<I> {
        PolicyBuilder::new(context, name)
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable id, `policy:` followed by the slugified name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The context inputs are validated against.
    pub fn context(&self) -> &Context<I> {
        &self.context
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Rule<I>] {
        &self.rules
    }

    /// Look up a rule by name.
    pub fn rule(&self, name: &str) -> Option<&Rule<I>> {
        self.rules.iter().find(|r| r.name() == name)
    }

    /// Strategy used when the caller does not override it.
    pub fn default_strategy(&self) -> Strategy {
        self.default_strategy
    }

    /// Reference used in audit events.
    pub fn reference(&self) -> EntityRef {
        EntityRef {
            name: self.name.clone(),
            id: self.id.clone(),
            version: Some(self.version.clone()),
        }
    }
}

impl<I> std::fmt::Debug for Policy<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Policy")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("rules", &self.rules)
            .field("default_strategy", &self.default_strategy)
            .finish()
    }
}

/// Builder for creating policies.
pub struct PolicyBuilder<I> {
    context: Context<I>,
    name: String,
    version: Option<String>,
    rules: Vec<Rule<I>>,
    default_strategy: Strategy,
}

impl<I> PolicyBuilder<I> {
    /// Create a new policy builder.
    pub fn new(context: &Context<I>, name: impl Into<String>) -> Self {
        Self {
            context: context.clone(),
            name: name.into(),
            version: None,
            rules: Vec::new(),
            default_strategy: Strategy::default(),
        }
    }

    /// Add a rule to the policy.
    pub fn rule(mut self, rule: Rule<I>) -> Self {
        match self.rules.iter().position(|r| r.name() == rule.name()) {
            Some(index) => self.rules[index] = rule,
            None => self.rules.push(rule),
        }
        self
    }

    /// Add multiple rules to the policy.
    pub fn rules(self, rules: impl IntoIterator<Item = Rule<I>>) -> Self {
        rules.into_iter().fold(self, PolicyBuilder::rule)
    }

    /// Set the policy version.
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the default strategy.
    pub fn default_strategy(mut self, strategy: Strategy) -> Self {
        self.default_strategy = strategy;
        self
    }

    /// Build the policy.
    pub fn build(self) -> Result<Policy<I>> {
        if self.name.trim().is_empty() {
            return Err(Error::config_key("Policy name cannot be empty", "name"));
        }
        if let Some(rule) = self.rules.iter().find(|r| r.name().trim().is_empty()) {
            return Err(Error::config_key(
                format!("Rule name cannot be empty (id '{}')", rule.id()),
                "rules",
            ));
        }

        Ok(Policy {
            id: format!("policy:{}", slugify(&self.name)),
            name: self.name,
            version: self
                .version
                .unwrap_or_else(|| DEFAULT_POLICY_VERSION.to_string()),
            context: self.context,
            rules: self.rules,
            default_strategy: self.default_strategy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Input;

    fn rule(name: &str, reason: &'static str) -> Rule<Input> {
        Rule::from_fn(name, move |_| RuleResult::deny(reason))
    }

    #[test]
    fn test_policy_creation() {
        let ctx: Context<Input> = Context::builder().build();
        let policy = Policy::new(
            &ctx,
            "Age Check",
            vec![rule("first", "a"), rule("second", "b")],
            Strategy::Exhaustive,
        )
        .unwrap();

        assert_eq!(policy.id(), "policy:age-check");
        assert_eq!(policy.version(), DEFAULT_POLICY_VERSION);
        assert_eq!(policy.default_strategy(), Strategy::Exhaustive);
        let names: Vec<_> = policy.rules().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[test]
    fn test_duplicate_rule_replaces_in_place() {
        let ctx: Context<Input> = Context::builder().build();
        let policy = Policy::builder(&ctx, "dupes")
            .rule(rule("a", "old"))
            .rule(rule("b", "b"))
            .rule(rule("a", "new").with_version("2"))
            .version("3.1.0")
            .build()
            .unwrap();

        let names: Vec<_> = policy.rules().iter().map(|r| r.name()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(policy.rule("a").unwrap().version(), Some("2"));
        assert_eq!(policy.reference().version.as_deref(), Some("3.1.0"));
    }

    #[test]
    fn test_policy_validation() {
        let ctx: Context<Input> = Context::builder().build();
        assert!(Policy::new(&ctx, " ", Vec::new(), Strategy::Preemptive).is_err());
        assert!(Policy::new(&ctx, "p", vec![rule("", "x")], Strategy::Preemptive).is_err());
    }
}
