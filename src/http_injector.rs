use http::{HeaderMap, HeaderName, HeaderValue, Request};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    trace::TraceContextExt,
    Context,
};

/// Header carrying an explicit request identifier.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Injects `context` into the [`Request`] headers to allow propagation
/// downstream.
pub fn inject_context_into_request<'a, T>(
    context: &Context,
    request: &'a mut Request<T>,
) -> &'a mut Request<T> {
    inject_context_into_headers(context, request.headers_mut());
    request
}

/// Injects `context` into a header map using the global propagator.
pub fn inject_context_into_headers(context: &Context, headers: &mut HeaderMap) {
    global::get_text_map_propagator(|injector| {
        injector.inject_context(context, &mut HeaderInjector(headers))
    });
}

/// Constructs an [`opentelemetry::Context`] from [`Request`] headers using the
/// global propagator. The returned context is a child of the current one.
pub fn extract_context_from_request<T>(request: &Request<T>) -> Context {
    extract_context_from_headers(request.headers())
}

pub fn extract_context_from_headers(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|extractor| extractor.extract(&HeaderExtractor(headers)))
}

/// Identifies a request, by precedence:
/// 1. a non-empty `x-request-id` header,
/// 2. the trace id of the span in `context`, if valid,
/// 3. a random UUID.
pub fn request_id(headers: &HeaderMap, context: &Context) -> String {
    if let Some(id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
    {
        return id.to_owned();
    }

    let span = context.span();
    let span_context = span.span_context();
    if span_context.is_valid() {
        return span_context.trace_id().to_string();
    }

    uuid::Uuid::new_v4().to_string()
}

// "traceparent" => https://www.w3.org/TR/trace-context/#trace-context-http-headers-format

/// Injector used via opentelemetry propagator to tell the extractor how to
/// insert the "traceparent" header value. Will basically insert a
/// "{version}-{trace_id}-{span_id}-{trace_flags}" string of the span context
/// into the headers. Listeners can then re-hydrate the context to add
/// additional spans to the same trace.
pub struct HeaderInjector<'a>(pub &'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let Ok(key) = key.parse::<HeaderName>() else {
            tracing::debug!(%key, "failed to parse header name");
            return;
        };
        let Ok(value) = HeaderValue::from_str(&value) else {
            tracing::debug!(%value, "failed to parse header value");
            return;
        };
        self.0.insert(key, value);
    }
}

pub struct HeaderExtractor<'a>(pub &'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|h| h.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|s| s.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use opentelemetry::{
        propagation::TextMapPropagator,
        trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState},
    };
    use opentelemetry_sdk::propagation::TraceContextPropagator;

    use super::*;

    const TRACE_ID: &str = "0af7651916cd43dd8448eb211c80319c";

    fn remote_context() -> Context {
        Context::new().with_remote_span_context(SpanContext::new(
            TraceId::from_hex(TRACE_ID).unwrap(),
            SpanId::from_hex("b7ad6b7169203331").unwrap(),
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        ))
    }

    #[test]
    fn request_id_prefers_header() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-1"));

        assert_eq!(request_id(&headers, &remote_context()), "req-1");
    }

    #[test]
    fn request_id_falls_back_to_trace_id() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static(""));

        assert_eq!(request_id(&headers, &remote_context()), TRACE_ID);
    }

    #[test]
    fn request_id_generates_uuid() {
        let id = request_id(&HeaderMap::new(), &Context::new());

        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_ne!(id, request_id(&HeaderMap::new(), &Context::new()));
    }

    #[test]
    fn injector_and_extractor_round_trip() {
        let propagator = TraceContextPropagator::new();
        let mut headers = HeaderMap::new();

        propagator.inject_context(&remote_context(), &mut HeaderInjector(&mut headers));
        assert!(headers
            .get("traceparent")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains(TRACE_ID)));

        let extracted = propagator.extract(&HeaderExtractor(&headers));
        assert_eq!(
            extracted.span().span_context().trace_id(),
            TraceId::from_hex(TRACE_ID).unwrap()
        );
    }

    #[test]
    fn injector_skips_invalid_values() {
        let mut headers = HeaderMap::new();
        HeaderInjector(&mut headers).set("bad header", "x".into());
        HeaderInjector(&mut headers).set("good", "line\nbreak".into());

        assert!(headers.is_empty());
    }
}
