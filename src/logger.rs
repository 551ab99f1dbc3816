//! Per-request structured logger.
//!
//! A [`RequestLogger`] is a `tracing` span carrying the request id. The
//! middleware attaches it to the OpenTelemetry [`Context`] handed to the
//! downstream service and stores it in the request extensions, so handlers
//! can log with the request id in scope:
//!
//! ```ignore
//! async fn handler(request: Request<Body>) -> Response<Body> {
//!     let logger = http_telemetry::logger::logger_from_request(&request);
//!     let _guard = logger.span().enter();
//!     tracing::info!("handling");
//!     // ...
//! }
//! ```

use std::time::Duration;

use http::Request;
use opentelemetry::Context;
use tracing::{Level, Span};

use crate::http_injector;

/// Target of every event emitted by this crate's middleware.
pub const TARGET: &str = "http_telemetry";

#[derive(Debug, Clone)]
pub struct RequestLogger {
    span: Span,
    request_id: Option<String>,
}

impl RequestLogger {
    pub fn new(request_id: impl Into<String>) -> Self {
        let request_id = request_id.into();
        let span = tracing::info_span!(target: TARGET, "http_request", request_id = %request_id);

        Self {
            span,
            request_id: Some(request_id),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Whether events at `level` would be recorded by the current subscriber.
    pub fn enabled(&self, level: Level) -> bool {
        if level == Level::ERROR {
            tracing::enabled!(target: TARGET, Level::ERROR)
        } else if level == Level::WARN {
            tracing::enabled!(target: TARGET, Level::WARN)
        } else if level == Level::INFO {
            tracing::enabled!(target: TARGET, Level::INFO)
        } else if level == Level::DEBUG {
            tracing::enabled!(target: TARGET, Level::DEBUG)
        } else {
            tracing::enabled!(target: TARGET, Level::TRACE)
        }
    }
}

/// Falls back to the subscriber's root: events logged through it carry no
/// request id.
impl Default for RequestLogger {
    fn default() -> Self {
        Self {
            span: Span::none(),
            request_id: None,
        }
    }
}

// Private newtype so nothing outside this module can read or overwrite the
// attached logger.
struct LoggerKey(RequestLogger);

/// Returns a child of `cx` carrying `logger`. `cx` itself is left untouched.
pub fn attach_logger(cx: &Context, logger: RequestLogger) -> Context {
    cx.with_value(LoggerKey(logger))
}

/// Looks up the logger attached with [`attach_logger`].
///
/// Returns the default logger and `false` if none is attached.
pub fn logger_from_context(cx: &Context) -> (RequestLogger, bool) {
    match cx.get::<LoggerKey>() {
        Some(LoggerKey(logger)) => (logger.clone(), true),
        None => (RequestLogger::default(), false),
    }
}

/// The logger the middleware stored on `request`, or a new one identified
/// by [`http_injector::request_id`].
pub fn logger_from_request<B>(request: &Request<B>) -> RequestLogger {
    if let Some(logger) = request.extensions().get::<RequestLogger>() {
        return logger.clone();
    }

    if let Some(cx) = request.extensions().get::<Context>() {
        if let (logger, true) = logger_from_context(cx) {
            return logger;
        }
    }

    let cx = http_injector::extract_context_from_request(request);
    RequestLogger::new(http_injector::request_id(request.headers(), &cx))
}

/// Everything the per-request summary line carries.
#[derive(Debug, Default)]
pub(crate) struct RequestRecord {
    pub latency: Duration,
    pub method: String,
    pub url: String,
    pub remote_address: String,
    pub protocol: String,
    pub request_size: u64,
    pub request_headers: String,
    pub request_body: Option<String>,
    pub status: u16,
    pub response_size: u64,
    pub response_headers: String,
    pub response_body: Option<String>,
    pub error: Option<String>,
    pub message: String,
}

// `tracing::event!` needs its level at compile time.
macro_rules! dispatch {
    ($level:expr, $($rest:tt)+) => {
        if $level == Level::ERROR {
            tracing::event!(target: TARGET, Level::ERROR, $($rest)+)
        } else if $level == Level::WARN {
            tracing::event!(target: TARGET, Level::WARN, $($rest)+)
        } else if $level == Level::INFO {
            tracing::event!(target: TARGET, Level::INFO, $($rest)+)
        } else if $level == Level::DEBUG {
            tracing::event!(target: TARGET, Level::DEBUG, $($rest)+)
        } else {
            tracing::event!(target: TARGET, Level::TRACE, $($rest)+)
        }
    };
}

impl RequestLogger {
    /// Emits the summary line. The request id is recorded on the event too:
    /// the span is info level and disappears under a stricter filter.
    pub(crate) fn log_request(&self, level: Level, record: &RequestRecord) {
        self.span.in_scope(|| {
            dispatch!(
                level,
                request_id = self.request_id.as_deref(),
                latency = ?record.latency,
                request.method = %record.method,
                request.url = %record.url,
                request.remote_address = %record.remote_address,
                request.protocol = %record.protocol,
                request.size = record.request_size,
                request.headers = %record.request_headers,
                request.body = record.request_body.as_deref(),
                response.status = record.status,
                response.size = record.response_size,
                response.headers = %record.response_headers,
                response.body = record.response_body.as_deref(),
                error = record.error.as_deref(),
                "{}",
                record.message
            )
        });
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn attach_does_not_mutate_parent() {
        let parent = Context::new();
        let child = attach_logger(&parent, RequestLogger::new("req-1"));

        let (logger, found) = logger_from_context(&child);
        assert!(found);
        assert_eq!(logger.request_id(), Some("req-1"));

        let (logger, found) = logger_from_context(&parent);
        assert!(!found);
        assert_eq!(logger.request_id(), None);
    }

    #[test]
    fn later_attach_shadows_earlier() {
        let first = attach_logger(&Context::new(), RequestLogger::new("a"));
        let second = attach_logger(&first, RequestLogger::new("b"));

        assert_eq!(logger_from_context(&first).0.request_id(), Some("a"));
        assert_eq!(logger_from_context(&second).0.request_id(), Some("b"));
    }

    #[test]
    fn request_extension_wins() {
        let mut request = Request::new(());
        request
            .headers_mut()
            .insert("x-request-id", HeaderValue::from_static("from-header"));
        request.extensions_mut().insert(RequestLogger::new("stored"));

        assert_eq!(logger_from_request(&request).request_id(), Some("stored"));
    }

    #[test]
    fn request_context_extension_is_used() {
        let mut request = Request::new(());
        request
            .extensions_mut()
            .insert(attach_logger(&Context::new(), RequestLogger::new("in-context")));

        assert_eq!(
            logger_from_request(&request).request_id(),
            Some("in-context")
        );
    }

    #[test]
    fn request_without_logger_derives_one() {
        let mut request = Request::new(());
        request
            .headers_mut()
            .insert("x-request-id", HeaderValue::from_static("from-header"));

        assert_eq!(
            logger_from_request(&request).request_id(),
            Some("from-header")
        );
    }
}
