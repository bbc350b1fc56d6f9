//! Evaluation context definitions.
//!
//! A [`Context`] fixes the input type rules operate on, the default values
//! merged under every input, the capabilities rules can reach, and any
//! extension fields capabilities add to the accepted record.

use super::tools::Tools;
use crate::policy::{Rule, RuleResult};
use crate::{Error, Result};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use validator::Validate;

/// An extra top-level input field accepted alongside the input type's own
/// fields. Extension fields are optional; when present they must pass the
/// field's check.
#[derive(Clone)]
pub struct ExtensionField {
    name: String,
    check: Arc<dyn Fn(&Value) -> Result<()> + Send + Sync>,
}

impl ExtensionField {
    /// Create a field with a custom check.
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    /// Create a field whose value must deserialize as `T`.
    pub fn typed<T: DeserializeOwned>(name: impl Into<String>) -> Self {
        let name = name.into();
        let field = name.clone();
        Self::new(name, move |value| {
            serde_json::from_value::<T>(value.clone())
                .map(|_| ())
                .map_err(|e| Error::schema_field(e.to_string(), field.clone()))
        })
    }

    /// Field name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for ExtensionField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ExtensionField").field(&self.name).finish()
    }
}

/// Validated input plus the merged record it was parsed from.
#[derive(Debug, Clone)]
pub struct ParsedInput<I> {
    /// Typed input
    pub value: I,
    /// Defaults merged with the raw input, extension fields included
    pub raw: Map<String, Value>,
}

impl<I> ParsedInput<I> {
    /// Read an extension field as `T`.
    pub fn extension<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        self.raw
            .get(name)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

struct ContextInner {
    default_values: Map<String, Value>,
    tools: Tools,
    extensions: Vec<ExtensionField>,
}

/// Input shape, defaults and capabilities shared by a set of rules.
///
/// Immutable once built: the `with_*` methods and composers return new
/// contexts and leave the original untouched.
pub struct Context<I> {
    inner: Arc<ContextInner>,
    _input: PhantomData<fn() -> I>,
}

impl<I> Clone for Context<I> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _input: PhantomData,
        }
    }
}

impl<I> std::fmt::Debug for Context<I> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("default_values", &self.inner.default_values)
            .field("tools", &self.inner.tools)
            .field("extensions", &self.inner.extensions)
            .finish()
    }
}

impl<I> Context<I> {
    /// Create a context builder.
    pub fn builder() -> ContextBuilder<I> {
        ContextBuilder::new()
    }

    fn from_parts(
        default_values: Map<String, Value>,
        tools: Tools,
        extensions: Vec<ExtensionField>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                default_values,
                tools,
                extensions,
            }),
            _input: PhantomData,
        }
    }

    /// Values merged under every input before validation.
    pub fn default_values(&self) -> &Map<String, Value> {
        &self.inner.default_values
    }

    /// Attached capabilities.
    pub fn tools(&self) -> &Tools {
        &self.inner.tools
    }

    /// Names of the extension fields accepted on top of `I`.
    pub fn extension_fields(&self) -> impl Iterator<Item = &str> {
        self.inner.extensions.iter().map(ExtensionField::name)
    }

    /// New context with `tools` merged over the current ones.
    pub fn with_tools(&self, tools: Tools) -> Self {
        Self::from_parts(
            self.inner.default_values.clone(),
            self.inner.tools.clone().merge(&tools),
            self.inner.extensions.clone(),
        )
    }

    /// New context accepting one more extension field. A field with the same
    /// name is replaced.
    pub fn with_extension_field(&self, field: ExtensionField) -> Self {
        let mut extensions: Vec<_> = self
            .inner
            .extensions
            .iter()
            .filter(|f| f.name != field.name)
            .cloned()
            .collect();
        extensions.push(field);
        Self::from_parts(
            self.inner.default_values.clone(),
            self.inner.tools.clone(),
            extensions,
        )
    }
}

impl<I> Context<I>
where
    I: DeserializeOwned + Validate,
{
    /// Merge `input` over the defaults and validate the result.
    ///
    /// Fails with [`Error::SchemaValidation`] when the input is not an
    /// object, an extension field fails its check, the record does not
    /// deserialize as `I`, or `I`'s validation rules reject it.
    pub fn parse(&self, input: Value) -> Result<ParsedInput<I>> {
        let Value::Object(input) = input else {
            return Err(Error::schema("input must be a JSON object"));
        };

        let mut raw = self.inner.default_values.clone();
        raw.extend(input);

        let mut record = raw.clone();
        for field in &self.inner.extensions {
            if let Some(value) = record.remove(&field.name) {
                (field.check)(&value)?;
            }
        }

        let value: I = serde_json::from_value(Value::Object(record))
            .map_err(|e| Error::schema(e.to_string()))?;
        value.validate()?;

        Ok(ParsedInput { value, raw })
    }
}

impl<I> Context<I>
where
    I: Send + Sync + 'static,
{
    /// Define an async rule over this context's input.
    pub fn define_rule<F, Fut>(&self, name: impl Into<String>, evaluate: F) -> Rule<I>
    where
        F: Fn(Arc<I>, crate::policy::RuleContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RuleResult>> + Send + 'static,
    {
        Rule::new(name, evaluate)
    }

    /// Define a rule from a synchronous predicate.
    pub fn define_rule_fn<F>(&self, name: impl Into<String>, predicate: F) -> Rule<I>
    where
        F: Fn(&I) -> RuleResult + Send + Sync + 'static,
    {
        Rule::from_fn(name, predicate)
    }
}

/// Builder for creating contexts.
pub struct ContextBuilder<I> {
    default_values: Map<String, Value>,
    tools: Tools,
    extensions: Vec<ExtensionField>,
    _input: PhantomData<fn() -> I>,
}

impl<I> Default for ContextBuilder<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I> ContextBuilder<I> {
    /// Create a new context builder.
    pub fn new() -> Self {
        Self {
            default_values: Map::new(),
            tools: Tools::new(),
            extensions: Vec::new(),
            _input: PhantomData,
        }
    }

    /// Set one default value.
    pub fn with_default(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.default_values.insert(key.into(), value.into());
        self
    }

    /// Set every default value at once.
    pub fn with_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.default_values = defaults;
        self
    }

    /// Merge capabilities into the context.
    pub fn with_tools(mut self, tools: Tools) -> Self {
        self.tools = self.tools.merge(&tools);
        self
    }

    /// Accept an extension field.
    pub fn with_extension_field(mut self, field: ExtensionField) -> Self {
        self.extensions.retain(|f| f.name != field.name);
        self.extensions.push(field);
        self
    }

    /// Build the context.
    pub fn build(self) -> Context<I> {
        Context::from_parts(self.default_values, self.tools, self.extensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::TraceContext;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, Validate)]
    #[serde(deny_unknown_fields)]
    struct Signup {
        #[validate(range(min = 0, max = 150))]
        age: u32,
        country: String,
    }

    fn context() -> Context<Signup> {
        Context::builder()
            .with_default("country", "NZ")
            .with_extension_field(ExtensionField::typed::<TraceContext>("trace"))
            .build()
    }

    #[test]
    fn test_defaults_are_merged_under_input() {
        let parsed = context().parse(json!({"age": 20})).unwrap();
        assert_eq!(parsed.value.age, 20);
        assert_eq!(parsed.value.country, "NZ");

        let parsed = context()
            .parse(json!({"age": 20, "country": "AU"}))
            .unwrap();
        assert_eq!(parsed.value.country, "AU");
    }

    #[test]
    fn test_schema_failures() {
        let ctx = context();
        assert!(matches!(
            ctx.parse(json!({"age": "twenty"})),
            Err(Error::SchemaValidation { .. })
        ));
        assert!(matches!(
            ctx.parse(json!([1, 2])),
            Err(Error::SchemaValidation { .. })
        ));

        let err = ctx.parse(json!({"age": 200})).unwrap_err();
        match err {
            Error::SchemaValidation { field, .. } => assert_eq!(field.as_deref(), Some("age")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_extension_fields() {
        let ctx = context();
        let parsed = ctx
            .parse(json!({"age": 30, "trace": {"traceId": "t-1"}}))
            .unwrap();
        let trace: TraceContext = parsed.extension("trace").unwrap();
        assert_eq!(trace.trace_id.as_deref(), Some("t-1"));

        let err = ctx
            .parse(json!({"age": 30, "trace": {"spanId": "nope"}}))
            .unwrap_err();
        assert!(matches!(err, Error::SchemaValidation { field: Some(f), .. } if f == "trace"));

        // Without the extension the strict input type rejects the field.
        let bare: Context<Signup> = Context::builder().with_default("country", "NZ").build();
        assert!(bare.parse(json!({"age": 30, "trace": {}})).is_err());
    }

    #[test]
    fn test_with_extension_field_replaces() {
        let ctx = context()
            .with_extension_field(ExtensionField::new("trace", |_| Ok(())))
            .with_extension_field(ExtensionField::new("tenant", |v| {
                v.as_str()
                    .map(|_| ())
                    .ok_or_else(|| Error::schema_field("tenant must be a string", "tenant"))
            }));
        let mut names: Vec<_> = ctx.extension_fields().collect();
        names.sort();
        assert_eq!(names, vec!["tenant", "trace"]);
        assert!(ctx.parse(json!({"age": 1, "tenant": 5})).is_err());
        assert!(ctx.parse(json!({"age": 1, "tenant": "acme", "trace": 5})).is_ok());
    }
}
