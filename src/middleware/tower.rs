use std::{
    fmt,
    net::SocketAddr,
    panic::AssertUnwindSafe,
    sync::Arc,
    task::{Context as TaskContext, Poll},
    time::Instant,
};

use bytes::Bytes;
use futures_util::{future::BoxFuture, FutureExt as _};
use http::{
    header::{CONTENT_TYPE, HOST, USER_AGENT},
    request::Parts,
    HeaderMap, Request, Response, StatusCode, Version,
};
use http_body::Body;
use http_body_util::BodyExt;
use opentelemetry::{
    trace::{SpanKind, TraceContextExt, Tracer},
    KeyValue,
};
use opentelemetry_semantic_conventions::trace as semconv;
use serde_json::json;
use tower::Service;
use tower_layer::Layer;
use tracing::{Instrument, Level};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use super::{
    body::{problem_response, RequestBody, ResponseBody, ResponseTelemetry},
    finalize::{panic_cause, panic_description, Completion, Finalizer},
    TraceOptions,
};
use crate::{
    headers::{set_span_header_attributes, TelemetryHeaders},
    host_port::split_host_port,
    http_injector,
    logger::{attach_logger, RequestLogger, RequestRecord},
    tracer::user_visibility,
    metrics::RequestMetrics,
    writer::{BasicWriter, BodySink, TeeBuffer, WrapResponseWriter},
};

/// Request bodies with these content types are captured when debug logging
/// is enabled.
const DEBUGGABLE_CONTENT_TYPES: [&str; 4] = [
    "application/json",
    "text/",
    "application/xml",
    "multipart/form-data",
];

/// Traces, measures and logs every request, and turns handler panics into
/// `500` problem responses.
///
/// Generally, the middleware should be used on every http route, this usually
/// means that it can be registered globally and in the last position, to be the
/// first to run, even before general logging layers.
///
/// The wrapped service receives a [`RequestBody`] and the request extensions
/// carry the [`RequestLogger`] and the OpenTelemetry
/// [`Context`](opentelemetry::Context) of the
/// server span. A [`SocketAddr`] extension, if present, is used as the peer
/// address.
///
/// ```ignore
/// let telemetry = http_telemetry::setup::setup(&SetupConfig::from_env())?;
/// let app = Router::new()
///     .route("/foo", get(|| async {}))
///     .route("/bar", get(|| async {}))
///     .layer(TraceLayer::new(
///         telemetry.tracer(),
///         HttpServerMetrics::new(&telemetry.meter()),
///         TraceOptions::new().with_debug_paths(["/ready"]),
///     ));
/// ```
pub struct TraceLayer<T> {
    tracer: Arc<T>,
    metrics: Arc<dyn RequestMetrics>,
    options: Arc<TraceOptions>,
}

impl<T> TraceLayer<T>
where
    T: Tracer,
{
    pub fn new(tracer: T, metrics: impl RequestMetrics + 'static, options: TraceOptions) -> Self {
        Self::from_shared(Arc::new(tracer), Arc::new(metrics), Arc::new(options))
    }

    pub fn from_shared(
        tracer: Arc<T>,
        metrics: Arc<dyn RequestMetrics>,
        options: Arc<TraceOptions>,
    ) -> Self {
        Self {
            tracer,
            metrics,
            options,
        }
    }
}

impl<T> Clone for TraceLayer<T> {
    fn clone(&self) -> Self {
        Self {
            tracer: self.tracer.clone(),
            metrics: self.metrics.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S, T> Layer<S> for TraceLayer<T> {
    type Service = TraceService<S, T>;

    fn layer(&self, service: S) -> Self::Service {
        TraceService {
            inner: service,
            tracer: self.tracer.clone(),
            metrics: self.metrics.clone(),
            options: self.options.clone(),
        }
    }
}

/// This service implements the Trace behavior
pub struct TraceService<S, T> {
    inner: S,
    tracer: Arc<T>,
    metrics: Arc<dyn RequestMetrics>,
    options: Arc<TraceOptions>,
}

impl<S: Clone, T> Clone for TraceService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            tracer: self.tracer.clone(),
            metrics: self.metrics.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S, T, ReqBody, ResBody> Service<Request<ReqBody>> for TraceService<S, T>
where
    S: Service<Request<RequestBody<ReqBody>>, Response = Response<ResBody>>
        + Clone
        + Send
        + 'static,
    S::Future: Send,
    S::Error: fmt::Display + Send,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: fmt::Display + Send,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: fmt::Display,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = Response<ResponseBody<ResBody>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; call the instance that was polled.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(trace_request(
            inner,
            request,
            self.tracer.clone(),
            self.metrics.clone(),
            self.options.clone(),
        ))
    }
}

async fn trace_request<S, T, ReqBody, ResBody>(
    mut inner: S,
    request: Request<ReqBody>,
    tracer: Arc<T>,
    metrics: Arc<dyn RequestMetrics>,
    options: Arc<TraceOptions>,
) -> Result<Response<ResponseBody<ResBody>>, S::Error>
where
    S: Service<Request<RequestBody<ReqBody>>, Response = Response<ResBody>> + Send + 'static,
    S::Future: Send,
    S::Error: fmt::Display + Send,
    ReqBody: Body<Data = Bytes> + Send + 'static,
    ReqBody::Error: fmt::Display + Send,
    ResBody: Body<Data = Bytes> + Send + 'static,
    ResBody::Error: fmt::Display,
    T: Tracer + Send + Sync + 'static,
    T::Span: Send + Sync + 'static,
{
    let start = Instant::now();
    let (mut parts, body) = request.into_parts();

    let scheme = parts.uri.scheme_str().unwrap_or("http").to_owned();
    let host = request_host(&parts).to_owned();
    let (server_address, server_port) = match split_host_port(&host, &scheme) {
        Ok(split) => split,
        Err(err) => {
            tracing::debug!(%err, %host, "failed to parse request host");
            (host.clone(), None)
        }
    };
    let path = parts.uri.path().to_owned();

    let mut metric_attributes = vec![
        KeyValue::new(semconv::HTTP_REQUEST_METHOD, parts.method.as_str().to_owned()),
        KeyValue::new(semconv::URL_SCHEME, scheme.clone()),
        KeyValue::new(semconv::SERVER_ADDRESS, server_address.clone()),
    ];
    if let Some(port) = server_port {
        metric_attributes.push(KeyValue::new(semconv::SERVER_PORT, i64::from(port)));
    }

    let debug_path = options.is_debug_path(&path);
    let parent_cx = http_injector::extract_context_from_headers(&parts.headers);
    let cx = if debug_path {
        parent_cx
    } else {
        let span = tracer
            .span_builder(options.span_name(&parts.method, &path))
            .with_kind(SpanKind::Server)
            .with_attributes(vec![user_visibility()])
            .start_with_context(tracer.as_ref(), &parent_cx);
        parent_cx.with_span(span)
    };
    let has_span = !debug_path;

    let logger = RequestLogger::new(http_injector::request_id(&parts.headers, &cx));
    logger.span().set_parent(cx.clone());
    let debug_enabled = logger.enabled(Level::DEBUG);

    let protocol_version = protocol_version(parts.version);
    let peer = parts.extensions.get::<SocketAddr>().copied();
    let url_full = full_url(&parts, &scheme, &host);

    if has_span {
        let span = cx.span();
        for attribute in metric_attributes.iter().cloned() {
            span.set_attribute(attribute);
        }
        span.set_attribute(KeyValue::new(semconv::NETWORK_PROTOCOL_VERSION, protocol_version));
        span.set_attribute(KeyValue::new(semconv::URL_PATH, path.clone()));
        span.set_attribute(KeyValue::new(semconv::URL_FULL, url_full.clone()));
        if let Some(client) = client_address(&parts.headers, peer) {
            span.set_attribute(KeyValue::new(semconv::CLIENT_ADDRESS, client));
        }
        if let Some(user_agent) = parts.headers.get(USER_AGENT).and_then(|v| v.to_str().ok()) {
            span.set_attribute(KeyValue::new(
                semconv::USER_AGENT_ORIGINAL,
                user_agent.to_owned(),
            ));
        }
        if let Some(peer) = peer {
            span.set_attribute(KeyValue::new("network.peer.address", peer.ip().to_string()));
            span.set_attribute(KeyValue::new("network.peer.port", i64::from(peer.port())));
        }
    }

    if let Some(custom_attributes) = &options.custom_attributes {
        metric_attributes.extend(custom_attributes(&parts));
    }
    if options.high_cardinality_metrics {
        metric_attributes.push(KeyValue::new("http.request.path", path.clone()));
    }
    let active_attributes = metric_attributes.clone();
    metric_attributes.push(KeyValue::new(
        semconv::NETWORK_PROTOCOL_VERSION,
        protocol_version,
    ));

    let request_headers = TelemetryHeaders::new(&parts.headers, &options.allowed_request_headers);
    if has_span {
        set_span_header_attributes(
            &cx.span(),
            "http.request.header",
            &request_headers,
            &options.allowed_request_headers,
        );
    }

    let record = RequestRecord {
        method: parts.method.to_string(),
        url: url_full,
        remote_address: peer.map(|peer| peer.to_string()).unwrap_or_default(),
        protocol: format!("{:?}", parts.version),
        request_size: body.size_hint().exact().unwrap_or(0),
        request_headers: request_headers.to_json(),
        ..RequestRecord::default()
    };

    let mut finalizer = Finalizer::start(
        metrics,
        active_attributes,
        metric_attributes,
        start,
        cx.clone(),
        has_span,
        debug_path,
        logger.clone(),
        record,
    );

    let sink = BodySink::new();
    let mut writer: Box<dyn WrapResponseWriter> = match &options.response_writer {
        Some(make_writer) => make_writer(sink, parts.version),
        None => Box::new(BasicWriter::new(sink)),
    };
    let tee = debug_enabled.then(TeeBuffer::new);
    if let Some(tee) = &tee {
        writer.tee(Box::new(tee.clone()));
    }

    let body = if debug_enabled && !body.is_end_stream() && is_debuggable(&parts.headers) {
        match body.collect().await {
            Ok(collected) => {
                let bytes = collected.to_bytes();
                let captured = String::from_utf8_lossy(&bytes).into_owned();
                if has_span {
                    cx.span()
                        .set_attribute(KeyValue::new("http.request.body", captured.clone()));
                }
                finalizer.set_request_size(bytes.len() as u64);
                finalizer.set_request_body(captured);
                RequestBody::buffered(bytes)
            }
            Err(err) => {
                let detail = err.to_string();
                if has_span {
                    cx.span().add_event(
                        "exception",
                        vec![KeyValue::new("exception.message", detail.clone())],
                    );
                }
                finalizer.finish(Completion::failed(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    detail.clone(),
                ));
                return Ok(problem_response(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    &json!({
                        "title": "Failed to read request body",
                        "detail": detail,
                    }),
                ));
            }
        }
    } else {
        RequestBody::streaming(body)
    };

    let handler_cx = attach_logger(&cx, logger.clone());
    parts.extensions.insert(handler_cx.clone());
    parts.extensions.insert(logger.clone());
    let request = Request::from_parts(parts, body);

    let handler = AssertUnwindSafe(async move { inner.call(request).await }).catch_unwind();
    let result = opentelemetry::trace::FutureExt::with_context(handler, handler_cx)
        .instrument(logger.span().clone())
        .await;

    match result {
        Err(payload) => {
            let cause = panic_cause(payload.as_ref());
            let description = panic_description(&cause);
            if has_span {
                cx.span()
                    .set_attribute(KeyValue::new("error", cause.to_string()));
            }
            finalizer.finish(Completion::failed(
                StatusCode::INTERNAL_SERVER_ERROR,
                description,
            ));

            Ok(problem_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                &json!({
                    "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    "title": StatusCode::INTERNAL_SERVER_ERROR
                        .canonical_reason()
                        .unwrap_or("Internal Server Error"),
                    "instance": path,
                    "extensions": { "cause": cause },
                }),
            ))
        }
        Ok(Err(err)) => {
            finalizer.finish(Completion::failed(
                StatusCode::INTERNAL_SERVER_ERROR,
                err.to_string(),
            ));
            Err(err)
        }
        Ok(Ok(response)) => {
            let (parts, body) = response.into_parts();
            writer.write_header(parts.status);

            let response_headers =
                TelemetryHeaders::new(&parts.headers, &options.allowed_response_headers);
            if has_span {
                set_span_header_attributes(
                    &cx.span(),
                    "http.response.header",
                    &response_headers,
                    &options.allowed_response_headers,
                );
            }
            finalizer.set_response_headers(response_headers.to_json());

            let telemetry = ResponseTelemetry::new(writer, tee, finalizer);
            Ok(Response::from_parts(
                parts,
                ResponseBody::observed(body, telemetry),
            ))
        }
    }
}

/// Authority of an absolute request URI, otherwise the `Host` header.
fn request_host(parts: &Parts) -> &str {
    if let Some(authority) = parts.uri.authority() {
        let authority = authority.as_str();
        return authority
            .rsplit_once('@')
            .map_or(authority, |(_, host)| host);
    }

    parts
        .headers
        .get(HOST)
        .and_then(|host| host.to_str().ok())
        .unwrap_or_default()
}

fn full_url(parts: &Parts, scheme: &str, host: &str) -> String {
    if host.is_empty() || parts.uri.authority().is_some() {
        return parts.uri.to_string();
    }

    let path_and_query = parts
        .uri
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    format!("{scheme}://{host}{path_and_query}")
}

fn protocol_version(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "0.9",
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        Version::HTTP_2 => "2",
        Version::HTTP_3 => "3",
        _ => "",
    }
}

/// First `X-Forwarded-For` entry, falling back to the peer IP.
fn client_address(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|client| !client.is_empty())
        .map(str::to_owned)
        .or_else(|| peer.map(|peer| peer.ip().to_string()))
}

fn is_debuggable(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|content_type| {
            let content_type = content_type.to_ascii_lowercase();
            DEBUGGABLE_CONTENT_TYPES
                .iter()
                .any(|prefix| content_type.starts_with(prefix))
        })
        .unwrap_or(false)
}
