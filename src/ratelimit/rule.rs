//! Rate limiting packaged as a rule.

use super::{RateLimitConfig, RATE_LIMIT_EXCEEDED};
use crate::policy::{Rule, RuleResult};
use crate::{Error, Result};

use serde_json::json;
use std::sync::Arc;

/// Build a rule that previews quota in its body and consumes it from its
/// `on_allow` hook.
///
/// `configure` maps the input to the limit that applies to it, e.g. keyed by
/// user id. The policy's context must carry a rate limiter; without one the
/// rule fails and the evaluation denies.
///
/// Quota is consumed only when the allow hook fires. Under the exhaustive
/// strategy that means only when the whole policy allows. Under the
/// preemptive strategy hooks fire as each rule completes, so place this rule
/// after the rules that may deny.
pub fn rate_limit_rule<I, K>(name: impl Into<String>, configure: K) -> Rule<I>
where
    I: Send + Sync + 'static,
    K: Fn(&I) -> Result<RateLimitConfig> + Send + Sync + 'static,
{
    let configure = Arc::new(configure);
    let consume = configure.clone();

    Rule::new(name, move |input: Arc<I>, ctx| {
        let configure = configure.clone();
        async move {
            let limiter = ctx
                .tools()
                .rate_limiter()
                .ok_or_else(|| Error::unsupported("rate limit rule without a rate limiter"))?;
            let config = configure(&input)?;
            let check = limiter.check(&config).await?;

            let mut meta = serde_json::Map::new();
            meta.insert(
                "rateLimit".to_string(),
                json!({
                    "key": config.key,
                    "allowed": check.allowed,
                    "remaining": check.remaining,
                    "resetAt": check.reset_at,
                }),
            );
            ctx.emit_extension(meta).await?;

            Ok::<_, Error>(if check.allowed {
                RuleResult::allow()
            } else {
                RuleResult::deny(RATE_LIMIT_EXCEEDED)
            })
        }
    })
    .on_allow(move |_result, input: Arc<I>, ctx| {
        let consume = consume.clone();
        async move {
            let limiter = ctx
                .tools()
                .rate_limiter()
                .ok_or_else(|| Error::unsupported("rate limit rule without a rate limiter"))?;
            limiter.increment(&consume(&input)?).await?;
            Ok::<_, Error>(())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{with_rate_limit, Context, Tools};
    use crate::clock::ManualClock;
    use crate::policy::{HookKind, RuleContext};
    use crate::ratelimit::{RateLimitStoreData, RateLimiter};
    use crate::storage::InMemoryStorage;

    struct Login {
        user: String,
    }

    fn limit(input: &Login) -> Result<RateLimitConfig> {
        RateLimitConfig::fixed_window(format!("login:{}", input.user), 2, "1m")
    }

    #[tokio::test]
    async fn test_rule_checks_then_hook_consumes() {
        let clock = ManualClock::shared(1_700_000_000_000);
        let limiter = RateLimiter::with_clock(Arc::new(InMemoryStorage::<RateLimitStoreData>::new()), clock);
        let ctx: Context<Login> = with_rate_limit(&Context::builder().build(), limiter.clone());
        let rule = rate_limit_rule("login limit", limit);
        let input = Arc::new(Login {
            user: "ada".to_string(),
        });
        let rule_ctx = || RuleContext::detached(ctx.tools().clone(), rule.reference());

        for _ in 0..2 {
            let result = rule.evaluate(input.clone(), rule_ctx()).await.unwrap();
            assert!(result.allowed);
            rule.fire(HookKind::OnAllow, result, input.clone(), rule_ctx())
                .await
                .unwrap();
        }

        let result = rule.evaluate(input.clone(), rule_ctx()).await.unwrap();
        assert_eq!(result.reason.as_deref(), Some(RATE_LIMIT_EXCEEDED));

        // Another key is unaffected.
        let other = Arc::new(Login {
            user: "grace".to_string(),
        });
        assert!(rule.evaluate(other, rule_ctx()).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_missing_limiter_is_an_error() {
        let rule = rate_limit_rule("login limit", limit);
        let ctx = RuleContext::detached(Tools::new(), rule.reference());
        let input = Arc::new(Login {
            user: "ada".to_string(),
        });
        assert!(matches!(
            rule.evaluate(input, ctx).await,
            Err(Error::Unsupported { .. })
        ));
    }
}
