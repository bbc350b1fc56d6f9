//! Capability registry attached to a [`Context`].
//!
//! Capabilities are named, typed slots. The well-known names (`audit`,
//! `rateLimit`, `storage`) are type-checked when registered so a rule never
//! finds the wrong kind of value under them at call time.

use super::context::{Context, ExtensionField};
use crate::audit::{Audit, TraceContext};
use crate::ratelimit::RateLimiter;
use crate::storage::JsonStorage;
use crate::{Error, Result};

use std::any::{Any, TypeId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the audit capability.
pub const AUDIT_TOOL: &str = "audit";
/// Name of the rate limiter capability.
pub const RATE_LIMIT_TOOL: &str = "rateLimit";
/// Name of the key-value storage capability.
pub const STORAGE_TOOL: &str = "storage";
/// Input field carrying caller correlation ids once audit is attached.
pub const TRACE_FIELD: &str = "trace";

type Capability = Arc<dyn Any + Send + Sync>;

/// Named capabilities shared by every evaluation against one context.
///
/// Cloning is cheap; values are reference counted.
#[derive(Clone, Default)]
pub struct Tools {
    entries: BTreeMap<String, Capability>,
}

impl Tools {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an arbitrary capability under `name`, replacing any previous
    /// one. Fails if `name` is one of the well-known names and `T` is not
    /// that capability's type.
    pub fn with_extension<T>(mut self, name: impl Into<String>, value: T) -> Result<Self>
    where
        T: Any + Send + Sync,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::config_key("tool name cannot be empty", "tools"));
        }
        if let Some(expected) = reserved_type(&name) {
            if expected != TypeId::of::<T>() {
                return Err(Error::config_key(
                    format!("tool '{}' is reserved for a different capability type", name),
                    name,
                ));
            }
        }
        self.entries.insert(name, Arc::new(value));
        Ok(self)
    }

    /// Attach the audit capability.
    pub fn with_audit(mut self, audit: Audit) -> Self {
        self.entries.insert(AUDIT_TOOL.to_string(), Arc::new(audit));
        self
    }

    /// Attach a rate limiter.
    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.entries
            .insert(RATE_LIMIT_TOOL.to_string(), Arc::new(limiter));
        self
    }

    /// Attach a JSON key-value store.
    pub fn with_storage(mut self, storage: JsonStorage) -> Self {
        self.entries.insert(STORAGE_TOOL.to_string(), Arc::new(storage));
        self
    }

    /// Combine two registries. On a name collision `other` wins.
    pub fn merge(mut self, other: &Tools) -> Self {
        for (name, value) in &other.entries {
            self.entries.insert(name.clone(), value.clone());
        }
        self
    }

    /// Look up a capability by name and type.
    pub fn get<T>(&self, name: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.entries.get(name)?.clone().downcast::<T>().ok()
    }

    /// The audit capability, if attached.
    pub fn audit(&self) -> Option<Arc<Audit>> {
        self.get(AUDIT_TOOL)
    }

    /// The rate limiter, if attached.
    pub fn rate_limiter(&self) -> Option<Arc<RateLimiter>> {
        self.get(RATE_LIMIT_TOOL)
    }

    /// The key-value store, if attached.
    pub fn storage(&self) -> Option<JsonStorage> {
        self.get::<JsonStorage>(STORAGE_TOOL)
            .map(|storage| storage.as_ref().clone())
    }

    /// Whether a capability is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of registered capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Tools {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

fn reserved_type(name: &str) -> Option<TypeId> {
    match name {
        AUDIT_TOOL => Some(TypeId::of::<Audit>()),
        RATE_LIMIT_TOOL => Some(TypeId::of::<RateLimiter>()),
        STORAGE_TOOL => Some(TypeId::of::<JsonStorage>()),
        _ => None,
    }
}

/// Attach audit to a context. Inputs may then carry an optional
/// `trace: {traceId, requestId}` field, copied into every audit event.
pub fn with_audit<I>(context: &Context<I>, audit: Audit) -> Context<I> {
    context
        .with_tools(Tools::new().with_audit(audit))
        .with_extension_field(ExtensionField::typed::<TraceContext>(TRACE_FIELD))
}

/// Attach a rate limiter to a context.
pub fn with_rate_limit<I>(context: &Context<I>, limiter: RateLimiter) -> Context<I> {
    context.with_tools(Tools::new().with_rate_limiter(limiter))
}

/// Attach a JSON key-value store to a context.
pub fn with_storage<I>(context: &Context<I>, storage: JsonStorage) -> Context<I> {
    context.with_tools(Tools::new().with_storage(storage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::RateLimitStoreData;
    use crate::storage::InMemoryStorage;

    #[derive(Debug, PartialEq)]
    struct Greeting(&'static str);

    fn limiter() -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryStorage::<RateLimitStoreData>::new()))
    }

    #[test]
    fn test_typed_lookup() {
        let tools = Tools::new()
            .with_extension("greeting", Greeting("hello"))
            .unwrap();
        assert_eq!(*tools.get::<Greeting>("greeting").unwrap(), Greeting("hello"));
        assert!(tools.get::<String>("greeting").is_none());
        assert!(tools.get::<Greeting>("missing").is_none());
    }

    #[test]
    fn test_reserved_names_are_type_checked() {
        assert!(Tools::new().with_extension(AUDIT_TOOL, 42u32).is_err());
        assert!(Tools::new().with_extension(RATE_LIMIT_TOOL, "nope").is_err());
        assert!(Tools::new().with_extension(AUDIT_TOOL, Audit::new()).is_ok());
        assert!(Tools::new().with_extension("", 1u8).is_err());
    }

    #[test]
    fn test_merge_later_wins() {
        let a = Tools::new()
            .with_extension("x", 1u32)
            .unwrap()
            .with_extension("y", 2u32)
            .unwrap();
        let b = Tools::new().with_extension("y", 20u32).unwrap();
        let merged = a.clone().merge(&b);

        assert_eq!(*merged.get::<u32>("x").unwrap(), 1);
        assert_eq!(*merged.get::<u32>("y").unwrap(), 20);
        assert_eq!(*a.get::<u32>("y").unwrap(), 2);
    }

    #[test]
    fn test_merge_unrelated_names_commutes() {
        let audit = Tools::new().with_audit(Audit::new());
        let limits = Tools::new().with_rate_limiter(limiter());

        let ab = audit.clone().merge(&limits);
        let ba = limits.merge(&audit);
        assert_eq!(ab.names().collect::<Vec<_>>(), ba.names().collect::<Vec<_>>());
        assert!(ab.audit().is_some() && ab.rate_limiter().is_some());
    }

    #[test]
    fn test_composers_do_not_mutate_input() {
        let base: Context<serde_json::Value> = Context::builder().build();
        let audited = with_audit(&base, Audit::new());
        let limited = with_rate_limit(&audited, limiter());

        assert!(base.tools().is_empty());
        assert_eq!(audited.tools().len(), 1);
        assert!(limited.tools().audit().is_some());
        assert!(limited.tools().rate_limiter().is_some());
        assert!(limited.extension_fields().any(|f| f == TRACE_FIELD));
        assert_eq!(base.extension_fields().count(), 0);
    }

    #[test]
    fn test_storage_tool() {
        let storage: JsonStorage = Arc::new(InMemoryStorage::<serde_json::Value>::new());
        let ctx: Context<serde_json::Value> = Context::builder().build();
        let ctx = with_storage(&ctx, storage);
        assert!(ctx.tools().storage().is_some());
    }
}
