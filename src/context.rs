//! Request context: the single parameter threaded through view construction.
//!
//! A [`RequestContext`] is built once and never mutated. Factories that need
//! a variation derive a copy with [`RequestContext::to_builder`].
//!
//! The same information travels on the wire as a content-stream-path: the
//! asset path plus a query string selecting the view, e.g.
//!
//! ```text
//! /orders?view=map&keyType=String&valueType=String&bootstrap=false
//! ```

use crate::error::{Result, TreeError};
use crate::tree::ViewType;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use url::form_urlencoded;

/// Immutable description of a view request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    full_name: String,
    view_type: Option<ViewType>,
    key_type: Option<String>,
    value_type: Option<String>,
    topic_type: Option<String>,
    message_type: Option<String>,
    element_type: Option<String>,
    cluster: Option<String>,
    bootstrap: Option<bool>,
    end_subscription_after_bootstrap: bool,
    throttle_period: Option<Duration>,
    base_path: Option<String>,
    entries: Option<u64>,
    average_value_size: Option<u64>,
    put_returns_null: bool,
    remove_returns_null: bool,
}

impl RequestContext {
    /// Start building a context for `path`.
    pub fn builder(path: impl Into<String>) -> RequestContextBuilder {
        RequestContextBuilder::new(path)
    }

    /// Context for `path` with everything defaulted.
    pub fn for_path(path: impl Into<String>) -> Self {
        Self::builder(path).build()
    }

    /// Parse a content-stream-path such as `/orders?view=map&bootstrap=false`.
    ///
    /// Unknown query keys are ignored so newer peers can add selectors.
    pub fn parse(uri: &str) -> Result<Self> {
        let (path, query) = match uri.split_once('?') {
            Some((p, q)) => (p, Some(q)),
            None => (uri, None),
        };
        let mut builder = RequestContextBuilder::new(path);

        let pairs = query.map(|q| form_urlencoded::parse(q.as_bytes())).into_iter().flatten();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            if key.is_empty() {
                continue;
            }
            builder = match key {
                "view" => builder.view_type(ViewType::from_str(value)?),
                "keyType" => builder.key_type(value),
                "valueType" => builder.value_type(value),
                "topicType" => builder.topic_type(value),
                "messageType" => builder.message_type(value),
                "elementType" => builder.element_type(value),
                "cluster" => builder.cluster(value),
                "basePath" => builder.base_path(value),
                "bootstrap" => builder.bootstrap(parse_bool(key, value)?),
                "endSubscriptionAfterBootstrap" => {
                    builder.end_subscription_after_bootstrap(parse_bool(key, value)?)
                }
                "putReturnsNull" => builder.put_returns_null(parse_bool(key, value)?),
                "removeReturnsNull" => builder.remove_returns_null(parse_bool(key, value)?),
                "throttlePeriodMs" => {
                    builder.throttle_period(Duration::from_millis(parse_u64(key, value)?))
                }
                "entries" => builder.entries(parse_u64(key, value)?),
                "averageValueSize" => builder.average_value_size(parse_u64(key, value)?),
                _ => builder,
            };
        }

        Ok(builder.build())
    }

    /// Derive a builder pre-populated with this context.
    pub fn to_builder(&self) -> RequestContextBuilder {
        RequestContextBuilder { ctx: self.clone() }
    }

    /// Copy of this context requesting a different view type.
    pub fn with_view_type(&self, view_type: ViewType) -> Self {
        self.to_builder().view_type(view_type).build()
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Last path segment (empty for the root).
    pub fn name(&self) -> &str {
        self.full_name.rsplit('/').next().unwrap_or("")
    }

    pub fn view_type(&self) -> Option<ViewType> {
        self.view_type
    }

    pub fn key_type(&self) -> Option<&str> {
        self.key_type.as_deref()
    }

    pub fn value_type(&self) -> Option<&str> {
        self.value_type.as_deref()
    }

    pub fn topic_type(&self) -> Option<&str> {
        self.topic_type.as_deref()
    }

    pub fn message_type(&self) -> Option<&str> {
        self.message_type.as_deref()
    }

    pub fn element_type(&self) -> Option<&str> {
        self.element_type.as_deref()
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    /// Whether subscribers get the current state replayed first. Defaults to `true`.
    pub fn bootstrap(&self) -> bool {
        self.bootstrap.unwrap_or(true)
    }

    pub fn end_subscription_after_bootstrap(&self) -> bool {
        self.end_subscription_after_bootstrap
    }

    pub fn throttle_period(&self) -> Option<Duration> {
        self.throttle_period
    }

    pub fn base_path(&self) -> Option<&str> {
        self.base_path.as_deref()
    }

    pub fn entries(&self) -> Option<u64> {
        self.entries
    }

    pub fn average_value_size(&self) -> Option<u64> {
        self.average_value_size
    }

    pub fn put_returns_null(&self) -> bool {
        self.put_returns_null
    }

    pub fn remove_returns_null(&self) -> bool {
        self.remove_returns_null
    }
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut query = form_urlencoded::Serializer::new(String::new());
        let optional = [
            ("view", self.view_type.map(|v| v.to_string())),
            ("keyType", self.key_type.clone()),
            ("valueType", self.value_type.clone()),
            ("topicType", self.topic_type.clone()),
            ("messageType", self.message_type.clone()),
            ("elementType", self.element_type.clone()),
            ("cluster", self.cluster.clone()),
            ("basePath", self.base_path.clone()),
            ("bootstrap", self.bootstrap.map(|v| v.to_string())),
            (
                "endSubscriptionAfterBootstrap",
                self.end_subscription_after_bootstrap.then(|| "true".to_string()),
            ),
            ("throttlePeriodMs", self.throttle_period.map(|v| v.as_millis().to_string())),
            ("entries", self.entries.map(|v| v.to_string())),
            ("averageValueSize", self.average_value_size.map(|v| v.to_string())),
            ("putReturnsNull", self.put_returns_null.then(|| "true".to_string())),
            ("removeReturnsNull", self.remove_returns_null.then(|| "true".to_string())),
        ];
        let mut any = false;
        for (key, value) in optional {
            if let Some(value) = value {
                query.append_pair(key, &value);
                any = true;
            }
        }

        write!(f, "{}", self.full_name)?;
        if any {
            write!(f, "?{}", query.finish())?;
        }
        Ok(())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "" => Ok(true),
        "false" => Ok(false),
        other => Err(TreeError::Config(format!(
            "'{}' expects a boolean, got '{}'",
            key, other
        ))),
    }
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        TreeError::Config(format!("'{}' expects a number, got '{}'", key, value))
    })
}

/// Normalise a path: leading `/`, no empty segments, no trailing `/`.
/// The root is the empty string.
pub(crate) fn normalise_path(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 1);
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        out.push('/');
        out.push_str(segment);
    }
    out
}

/// Builder for [`RequestContext`].
#[derive(Debug, Clone)]
pub struct RequestContextBuilder {
    ctx: RequestContext,
}

impl RequestContextBuilder {
    fn new(path: impl Into<String>) -> Self {
        Self {
            ctx: RequestContext {
                full_name: normalise_path(&path.into()),
                view_type: None,
                key_type: None,
                value_type: None,
                topic_type: None,
                message_type: None,
                element_type: None,
                cluster: None,
                bootstrap: None,
                end_subscription_after_bootstrap: false,
                throttle_period: None,
                base_path: None,
                entries: None,
                average_value_size: None,
                put_returns_null: false,
                remove_returns_null: false,
            },
        }
    }

    pub fn full_name(mut self, path: impl Into<String>) -> Self {
        self.ctx.full_name = normalise_path(&path.into());
        self
    }

    pub fn view_type(mut self, view_type: ViewType) -> Self {
        self.ctx.view_type = Some(view_type);
        self
    }

    pub fn key_type(mut self, t: impl Into<String>) -> Self {
        self.ctx.key_type = Some(t.into());
        self
    }

    pub fn value_type(mut self, t: impl Into<String>) -> Self {
        self.ctx.value_type = Some(t.into());
        self
    }

    /// Shorthand for `key_type` + `value_type`.
    pub fn types(self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_type(key).value_type(value)
    }

    pub fn topic_type(mut self, t: impl Into<String>) -> Self {
        self.ctx.topic_type = Some(t.into());
        self
    }

    pub fn message_type(mut self, t: impl Into<String>) -> Self {
        self.ctx.message_type = Some(t.into());
        self
    }

    pub fn element_type(mut self, t: impl Into<String>) -> Self {
        self.ctx.element_type = Some(t.into());
        self
    }

    pub fn cluster(mut self, cluster: impl Into<String>) -> Self {
        self.ctx.cluster = Some(cluster.into());
        self
    }

    pub fn bootstrap(mut self, bootstrap: bool) -> Self {
        self.ctx.bootstrap = Some(bootstrap);
        self
    }

    pub fn end_subscription_after_bootstrap(mut self, end: bool) -> Self {
        self.ctx.end_subscription_after_bootstrap = end;
        self
    }

    pub fn throttle_period(mut self, period: Duration) -> Self {
        self.ctx.throttle_period = Some(period);
        self
    }

    pub fn base_path(mut self, path: impl Into<String>) -> Self {
        self.ctx.base_path = Some(path.into());
        self
    }

    pub fn entries(mut self, entries: u64) -> Self {
        self.ctx.entries = Some(entries);
        self
    }

    pub fn average_value_size(mut self, size: u64) -> Self {
        self.ctx.average_value_size = Some(size);
        self
    }

    pub fn put_returns_null(mut self, flag: bool) -> Self {
        self.ctx.put_returns_null = flag;
        self
    }

    pub fn remove_returns_null(mut self, flag: bool) -> Self {
        self.ctx.remove_returns_null = flag;
        self
    }

    pub fn build(self) -> RequestContext {
        self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalise_path() {
        assert_eq!(normalise_path(""), "");
        assert_eq!(normalise_path("/"), "");
        assert_eq!(normalise_path("orders"), "/orders");
        assert_eq!(normalise_path("//orders///eu/"), "/orders/eu");
    }

    #[test]
    fn test_parse_full_uri() {
        let ctx = RequestContext::parse(
            "/orders?view=map&keyType=String&valueType=Long&bootstrap=false&cluster=c1&throttlePeriodMs=25",
        )
        .unwrap();

        assert_eq!(ctx.full_name(), "/orders");
        assert_eq!(ctx.name(), "orders");
        assert_eq!(ctx.view_type(), Some(ViewType::Map));
        assert_eq!(ctx.key_type(), Some("String"));
        assert_eq!(ctx.value_type(), Some("Long"));
        assert!(!ctx.bootstrap());
        assert_eq!(ctx.cluster(), Some("c1"));
        assert_eq!(ctx.throttle_period(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn test_parse_defaults() {
        let ctx = RequestContext::parse("/a/b").unwrap();
        assert_eq!(ctx.full_name(), "/a/b");
        assert_eq!(ctx.name(), "b");
        assert!(ctx.bootstrap());
        assert!(!ctx.end_subscription_after_bootstrap());
        assert!(!ctx.put_returns_null());
        assert!(ctx.view_type().is_none());
    }

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let ctx = RequestContext::parse("/a?futureSelector=1&&view=kvstore").unwrap();
        assert_eq!(ctx.view_type(), Some(ViewType::KeyValueStore));
    }

    #[test]
    fn test_parse_rejects_bad_bool() {
        let err = RequestContext::parse("/a?bootstrap=maybe").unwrap_err();
        assert!(matches!(err, TreeError::Config(_)));
    }

    #[test]
    fn test_parse_rejects_bad_number() {
        assert!(RequestContext::parse("/a?entries=lots").is_err());
    }

    #[test]
    fn test_display_roundtrip() {
        let ctx = RequestContext::builder("/orders")
            .view_type(ViewType::Map)
            .types("String", "String")
            .bootstrap(false)
            .end_subscription_after_bootstrap(true)
            .put_returns_null(true)
            .entries(1000)
            .build();

        let uri = ctx.to_string();
        assert!(uri.starts_with("/orders?view=map"));
        assert_eq!(RequestContext::parse(&uri).unwrap(), ctx);
    }

    #[test]
    fn test_reserved_characters_survive_roundtrip() {
        let ctx = RequestContext::builder("/orders")
            .cluster("a&b=c")
            .key_type("100%")
            .value_type("Map<String, Long>")
            .base_path("/base?x=1")
            .build();

        let uri = ctx.to_string();
        assert!(!uri.contains("cluster=a&b"));
        let parsed = RequestContext::parse(&uri).unwrap();
        assert_eq!(parsed.cluster(), Some("a&b=c"));
        assert_eq!(parsed.key_type(), Some("100%"));
        assert_eq!(parsed.value_type(), Some("Map<String, Long>"));
        assert_eq!(parsed.base_path(), Some("/base?x=1"));
        assert_eq!(parsed, ctx);
    }

    #[test]
    fn test_parse_decodes_percent_escapes() {
        let ctx = RequestContext::parse("/a?cluster=east%26west&keyType=Long+Key").unwrap();
        assert_eq!(ctx.cluster(), Some("east&west"));
        assert_eq!(ctx.key_type(), Some("Long Key"));
    }

    #[test]
    fn test_display_without_selectors_is_bare_path() {
        assert_eq!(RequestContext::for_path("/a/b").to_string(), "/a/b");
    }

    #[test]
    fn test_to_builder_leaves_original_untouched() {
        let ctx = RequestContext::builder("/a").key_type("String").build();
        let derived = ctx.with_view_type(ViewType::Reference);

        assert!(ctx.view_type().is_none());
        assert_eq!(derived.view_type(), Some(ViewType::Reference));
        assert_eq!(derived.key_type(), Some("String"));
    }
}
