//! Identifier generation for evaluations and audit events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Prefix for evaluation ids.
pub const EVALUATION_PREFIX: &str = "eval";

/// Prefix for audit event ids.
pub const EVENT_PREFIX: &str = "event";

/// Mints unique identifiers under a fixed prefix, formatted `prefix:suffix`.
pub trait IdGenerator: Send + Sync {
    /// Generate a new identifier with the given prefix.
    fn generate(&self, prefix: &str) -> String;

    /// Generate an evaluation id.
    fn evaluation_id(&self) -> String {
        self.generate(EVALUATION_PREFIX)
    }

    /// Generate an audit event id.
    fn event_id(&self) -> String {
        self.generate(EVENT_PREFIX)
    }
}

/// Shared id generator handle.
pub type SharedIdGenerator = Arc<dyn IdGenerator>;

/// Random v4 UUID ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self, prefix: &str) -> String {
        format!("{}:{}", prefix, uuid::Uuid::new_v4())
    }
}

/// Monotonic counter ids, handy for reproducible audit logs in tests.
#[derive(Debug, Default)]
pub struct SequentialGenerator {
    next: AtomicU64,
}

impl SequentialGenerator {
    /// Create a generator starting at 1.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for SequentialGenerator {
    fn generate(&self, prefix: &str) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}:{}", prefix, n)
    }
}

/// Lower-case and hyphenate a display name, e.g. `"Is Adult"` → `"is-adult"`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for ch in name.trim().chars() {
        if ch.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(ch.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    slug
}
