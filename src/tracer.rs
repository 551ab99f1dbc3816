//! Spans for handler code.
//!
//! Spans carrying `internal.visibility=user` are the ones meant to be shown
//! to the users of a service, next to the server span of the middleware.
//! [`UserTracer`] adds the attribute to every span it starts, unless the
//! span is started with [`UserTracer::start_internal`].
//!
//! ```ignore
//! let tracer = UserTracer::new("orders");
//! let cx = tracer.start(&Context::current(), "load order");
//! // ...
//! cx.span().end();
//! ```

use std::borrow::Cow;

use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{TraceContextExt, Tracer},
    Context, KeyValue,
};

pub const VISIBILITY_KEY: &str = "internal.visibility";

/// `internal.visibility=user`.
pub fn user_visibility() -> KeyValue {
    KeyValue::new(VISIBILITY_KEY, "user")
}

#[derive(Debug)]
pub struct UserTracer<T = BoxedTracer> {
    tracer: T,
}

impl UserTracer<BoxedTracer> {
    /// Named tracer of the global tracer provider.
    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self::from_tracer(global::tracer(name))
    }
}

impl<T> UserTracer<T>
where
    T: Tracer,
    T::Span: Send + Sync + 'static,
{
    pub fn from_tracer(tracer: T) -> Self {
        Self { tracer }
    }

    pub fn inner(&self) -> &T {
        &self.tracer
    }

    /// Starts a user visible child of `cx` and returns `cx` with the new span
    /// active.
    pub fn start(&self, cx: &Context, name: impl Into<Cow<'static, str>>) -> Context {
        self.start_with_attributes(cx, name, Vec::new())
    }

    pub fn start_with_attributes(
        &self,
        cx: &Context,
        name: impl Into<Cow<'static, str>>,
        mut attributes: Vec<KeyValue>,
    ) -> Context {
        attributes.push(user_visibility());
        let span = self
            .tracer
            .span_builder(name)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, cx);
        cx.with_span(span)
    }

    /// Starts a child of `cx` without the visibility attribute.
    pub fn start_internal(&self, cx: &Context, name: impl Into<Cow<'static, str>>) -> Context {
        let span = self.tracer.start_with_context(name, cx);
        cx.with_span(span)
    }
}
