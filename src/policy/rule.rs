//! Rule definitions.

use crate::api::Tools;
use crate::audit::{AuditHandler, EntityRef};
use crate::ids::slugify;
use crate::{Error, Result};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Reason given to a rule that failed while evaluating.
pub const RULE_EVALUATION_ERROR: &str = "rule_evaluation_error";

/// Result of running one rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    /// Whether the rule allows the input
    pub allowed: bool,
    /// The rule does not apply to this input; never counts as a violation
    pub skipped: bool,
    /// Optional explanation
    #[serde(default)]
    pub reason: Option<String>,
}

impl RuleResult {
    /// The rule allows the input.
    pub fn allow() -> Self {
        Self {
            allowed: true,
            skipped: false,
            reason: None,
        }
    }

    /// The rule denies the input.
    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            skipped: false,
            reason: Some(reason.into()),
        }
    }

    /// The rule does not apply to the input.
    pub fn skip() -> Self {
        Self {
            allowed: true,
            skipped: true,
            reason: None,
        }
    }

    /// Set the reason.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// A violation is a non-skipped denial.
    pub fn is_violation(&self) -> bool {
        !self.allowed && !self.skipped
    }

    /// Outcome label used in audit events.
    pub fn outcome(&self) -> crate::audit::Outcome {
        use crate::audit::Outcome;
        match (self.allowed, self.skipped) {
            (true, true) => Outcome::Skip,
            (true, false) => Outcome::Allow,
            (false, _) => Outcome::Deny,
        }
    }
}

/// What a rule body and its hooks can see besides the input.
#[derive(Clone, Debug)]
pub struct RuleContext {
    tools: Tools,
    rule: EntityRef,
    audit: Option<AuditHandler>,
    rule_event_id: Option<String>,
}

impl RuleContext {
    pub(crate) fn new(
        tools: Tools,
        rule: EntityRef,
        audit: Option<AuditHandler>,
        rule_event_id: Option<String>,
    ) -> Self {
        Self {
            tools,
            rule,
            audit,
            rule_event_id,
        }
    }

    /// Context without audit linkage, for calling rules directly in tests.
    pub fn detached(tools: Tools, rule: EntityRef) -> Self {
        Self::new(tools, rule, None, None)
    }

    /// The capabilities attached to the policy's context.
    pub fn tools(&self) -> &Tools {
        &self.tools
    }

    /// The rule being run.
    pub fn rule(&self) -> &EntityRef {
        &self.rule
    }

    /// Id of the evaluation, when audited.
    pub fn evaluation_id(&self) -> Option<&str> {
        self.audit.as_ref().map(AuditHandler::evaluation_id)
    }

    /// Record an `extension.event` under this rule's `rule.start`.
    ///
    /// Returns `Ok(None)` when the evaluation is not audited and
    /// [`Error::AuditClosed`] once the evaluation has ended.
    pub async fn emit_extension(
        &self,
        meta: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Option<String>> {
        match &self.audit {
            Some(audit) => audit
                .extension(self.rule_event_id.as_deref(), Some(&self.rule), meta)
                .await
                .map(Some),
            None => Ok(None),
        }
    }
}

type EvaluateFn<I> =
    Arc<dyn Fn(Arc<I>, RuleContext) -> BoxFuture<'static, Result<RuleResult>> + Send + Sync>;
type HookFn<I> =
    Arc<dyn Fn(RuleResult, Arc<I>, RuleContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Which hook to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// `on_allow`
    OnAllow,
    /// `on_deny`
    OnDeny,
}

/// A named predicate over validated input of type `I`.
///
/// The body may read or mutate shared tools (e.g. consult the rate limiter)
/// but the rule itself is immutable once placed in a policy. Hooks run after
/// the decision and cannot change it.
pub struct Rule<I> {
    name: String,
    id: String,
    version: Option<String>,
    evaluate: EvaluateFn<I>,
    on_allow: Option<HookFn<I>>,
    on_deny: Option<HookFn<I>>,
}

impl<I> Clone for Rule<I> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            id: self.id.clone(),
            version: self.version.clone(),
            evaluate: self.evaluate.clone(),
            on_allow: self.on_allow.clone(),
            on_deny: self.on_deny.clone(),
        }
    }
}

impl<I> Rule<I>
where
    I: Send + Sync + 'static,
{
    /// Create a rule from an async body.
    pub fn new<F, Fut>(name: impl Into<String>, evaluate: F) -> Self
    where
        F: Fn(Arc<I>, RuleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RuleResult>> + Send + 'static,
    {
        let name = name.into();
        Self {
            id: format!("rule:{}", slugify(&name)),
            name,
            version: None,
            evaluate: Arc::new(move |input, ctx| evaluate(input, ctx).boxed()),
            on_allow: None,
            on_deny: None,
        }
    }

    /// Create a rule from a synchronous predicate.
    pub fn from_fn<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&I) -> RuleResult + Send + Sync + 'static,
    {
        let predicate = Arc::new(predicate);
        Self::new(name, move |input: Arc<I>, _ctx| {
            let predicate = predicate.clone();
            async move { Ok::<_, Error>(predicate(&input)) }
        })
    }

    /// Attach a hook fired when this rule's result leads to an allow.
    pub fn on_allow<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RuleResult, Arc<I>, RuleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_allow = Some(Arc::new(move |result, input, ctx| {
            hook(result, input, ctx).boxed()
        }));
        self
    }

    /// Attach a hook fired when this rule's result leads to a deny.
    pub fn on_deny<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(RuleResult, Arc<I>, RuleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.on_deny = Some(Arc::new(move |result, input, ctx| {
            hook(result, input, ctx).boxed()
        }));
        self
    }

    /// Set the rule version reported in audit events.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Run the body. Errors and panics both come back as `Err`.
    pub async fn evaluate(&self, input: Arc<I>, ctx: RuleContext) -> Result<RuleResult> {
        let evaluate = self.evaluate.clone();
        match AssertUnwindSafe(async move { evaluate(input, ctx).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(Error::rule(&self.name, panic_message(panic))),
        }
    }

    /// Fire a hook if the rule has one of that kind. Errors and panics both
    /// come back as `Err`.
    pub async fn fire(
        &self,
        kind: HookKind,
        result: RuleResult,
        input: Arc<I>,
        ctx: RuleContext,
    ) -> Result<()> {
        let hook = match kind {
            HookKind::OnAllow => self.on_allow.clone(),
            HookKind::OnDeny => self.on_deny.clone(),
        };
        let Some(hook) = hook else {
            return Ok(());
        };
        match AssertUnwindSafe(async move { hook(result, input, ctx).await })
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => Err(Error::rule(&self.name, panic_message(panic))),
        }
    }
}

impl<I> Rule<I> {
    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable id, `rule:` followed by the slugified name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Declared version.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Whether the rule has a hook of the given kind.
    pub fn has_hook(&self, kind: HookKind) -> bool {
        match kind {
            HookKind::OnAllow => self.on_allow.is_some(),
            HookKind::OnDeny => self.on_deny.is_some(),
        }
    }

    /// Reference used in results and audit events.
    pub fn reference(&self) -> EntityRef {
        EntityRef {
            name: self.name.clone(),
            id: self.id.clone(),
            version: self.version.clone(),
        }
    }
}

impl<I> std::fmt::Debug for Rule<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("on_allow", &self.on_allow.is_some())
            .field("on_deny", &self.on_deny.is_some())
            .finish()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
