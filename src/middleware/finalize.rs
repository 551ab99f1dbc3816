use std::{any::Any, sync::Arc, time::Instant};

use http::StatusCode;
use opentelemetry::{
    trace::{Status, TraceContextExt},
    Context, KeyValue,
};
use opentelemetry_semantic_conventions::trace as semconv;
use tracing::Level;

use crate::{
    logger::{RequestLogger, RequestRecord},
    metrics::RequestMetrics,
};

/// Status recorded for requests whose future was dropped before the
/// wrapped service produced a response.
pub(crate) const CLIENT_CLOSED_REQUEST: u16 = 499;

/// How a request ended.
#[derive(Debug, Default)]
pub(crate) struct Completion {
    pub status: u16,
    pub error: Option<String>,
    pub response_size: u64,
    pub response_body: Option<String>,
}

impl Completion {
    pub(crate) fn failed(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status: status.as_u16(),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Closes the active-request gauge, the metrics, the span and the log line
/// of a single request.
///
/// Consumed by [`Finalizer::finish`]; if it is dropped unfinished, the
/// request is finished as cancelled.
pub(crate) struct Finalizer {
    state: Option<RequestState>,
}

struct RequestState {
    metrics: Arc<dyn RequestMetrics>,
    active_attributes: Vec<KeyValue>,
    metric_attributes: Vec<KeyValue>,
    start: Instant,
    cx: Context,
    has_span: bool,
    debug_path: bool,
    logger: RequestLogger,
    record: RequestRecord,
}

impl Finalizer {
    /// Increments the active-request gauge with `active_attributes`; the
    /// same set decrements it on finish.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        metrics: Arc<dyn RequestMetrics>,
        active_attributes: Vec<KeyValue>,
        metric_attributes: Vec<KeyValue>,
        start: Instant,
        cx: Context,
        has_span: bool,
        debug_path: bool,
        logger: RequestLogger,
        record: RequestRecord,
    ) -> Self {
        metrics.add_active_requests(1, &active_attributes);

        Self {
            state: Some(RequestState {
                metrics,
                active_attributes,
                metric_attributes,
                start,
                cx,
                has_span,
                debug_path,
                logger,
                record,
            }),
        }
    }

    pub(crate) fn set_request_body(&mut self, body: String) {
        if let Some(state) = self.state.as_mut() {
            state.record.request_body = Some(body);
        }
    }

    pub(crate) fn set_request_size(&mut self, size: u64) {
        if let Some(state) = self.state.as_mut() {
            state.record.request_size = size;
        }
    }

    pub(crate) fn set_response_headers(&mut self, headers: String) {
        if let Some(state) = self.state.as_mut() {
            state.record.response_headers = headers;
        }
    }

    pub(crate) fn finish(mut self, completion: Completion) {
        if let Some(state) = self.state.take() {
            state.finish(completion);
        }
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            state.finish(Completion {
                status: CLIENT_CLOSED_REQUEST,
                error: Some("request cancelled".to_owned()),
                ..Completion::default()
            });
        }
    }
}

/// JSON rendering of a panic payload. `serde_json::Value` payloads are kept,
/// string payloads become JSON strings.
pub(crate) fn panic_cause(payload: &(dyn Any + Send)) -> serde_json::Value {
    if let Some(value) = payload.downcast_ref::<serde_json::Value>() {
        value.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        serde_json::Value::from(*message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        serde_json::Value::from(message.as_str())
    } else {
        serde_json::Value::from("unknown panic")
    }
}

pub(crate) fn panic_description(cause: &serde_json::Value) -> String {
    match cause {
        serde_json::Value::String(cause) => cause.clone(),
        cause => cause.to_string(),
    }
}

impl RequestState {
    fn finish(self, completion: Completion) {
        let Self {
            metrics,
            active_attributes,
            mut metric_attributes,
            start,
            cx,
            has_span,
            debug_path,
            logger,
            mut record,
        } = self;

        metrics.add_active_requests(-1, &active_attributes);

        let latency = start.elapsed();
        let status = completion.status;
        metric_attributes.push(KeyValue::new(
            semconv::HTTP_RESPONSE_STATUS_CODE,
            i64::from(status),
        ));
        if record.request_size > 0 {
            metrics.record_request_body_size(record.request_size, &metric_attributes);
        }
        if completion.response_size > 0 {
            metrics.record_response_body_size(completion.response_size, &metric_attributes);
        }
        metrics.record_request_duration(latency.as_secs_f64(), &metric_attributes);

        let message = match &completion.error {
            Some(error) => error.clone(),
            None if status < 400 => "success".to_owned(),
            None => StatusCode::from_u16(status)
                .ok()
                .and_then(|status| status.canonical_reason())
                .map_or_else(|| status.to_string(), str::to_owned),
        };

        if has_span {
            let span = cx.span();
            span.set_attribute(KeyValue::new(
                semconv::HTTP_RESPONSE_STATUS_CODE,
                i64::from(status),
            ));
            span.set_attribute(KeyValue::new(
                "http.response.body.size",
                completion.response_size as i64,
            ));
            if let Some(body) = &completion.response_body {
                span.set_attribute(KeyValue::new("http.response.body", body.clone()));
            }
            if status >= 400 {
                span.set_status(Status::error(message.clone()));
            } else {
                span.set_status(Status::Ok);
            }
            span.end();
        }

        let level = if status >= 400 {
            Level::ERROR
        } else if debug_path {
            Level::DEBUG
        } else {
            Level::INFO
        };

        record.latency = latency;
        record.status = status;
        record.response_size = completion.response_size;
        record.response_body = completion.response_body;
        record.error = completion.error;
        record.message = message;
        logger.log_request(level, &record);
    }
}
