use opentelemetry::{
    metrics::{Histogram, Meter, Unit, UpDownCounter},
    KeyValue,
};

pub const REQUEST_DURATION: &str = "http.server.request.duration";
pub const ACTIVE_REQUESTS: &str = "http.server.active_requests";
pub const REQUEST_BODY_SIZE: &str = "http.server.request.body.size";
pub const RESPONSE_BODY_SIZE: &str = "http.server.response.body.size";

/// Instruments the middleware records into. Implementations are shared by
/// every in-flight request and must tolerate concurrent use.
pub trait RequestMetrics: Send + Sync {
    fn add_active_requests(&self, delta: i64, attributes: &[KeyValue]);

    fn record_request_body_size(&self, bytes: u64, attributes: &[KeyValue]);

    fn record_response_body_size(&self, bytes: u64, attributes: &[KeyValue]);

    /// Duration in seconds.
    fn record_request_duration(&self, seconds: f64, attributes: &[KeyValue]);
}

/// HTTP server instruments following the OpenTelemetry semantic conventions.
pub struct HttpServerMetrics {
    request_duration: Histogram<f64>,
    active_requests: UpDownCounter<i64>,
    request_body_size: Histogram<u64>,
    response_body_size: Histogram<u64>,
}

impl HttpServerMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            request_duration: meter
                .f64_histogram(REQUEST_DURATION)
                .with_description("Duration of HTTP server requests")
                .with_unit(Unit::new("s"))
                .init(),
            active_requests: meter
                .i64_up_down_counter(ACTIVE_REQUESTS)
                .with_description("Number of active HTTP server requests")
                .with_unit(Unit::new("{request}"))
                .init(),
            request_body_size: meter
                .u64_histogram(REQUEST_BODY_SIZE)
                .with_description("Size of HTTP server request bodies")
                .with_unit(Unit::new("By"))
                .init(),
            response_body_size: meter
                .u64_histogram(RESPONSE_BODY_SIZE)
                .with_description("Size of HTTP server response bodies")
                .with_unit(Unit::new("By"))
                .init(),
        }
    }
}

impl RequestMetrics for HttpServerMetrics {
    fn add_active_requests(&self, delta: i64, attributes: &[KeyValue]) {
        self.active_requests.add(delta, attributes);
    }

    fn record_request_body_size(&self, bytes: u64, attributes: &[KeyValue]) {
        self.request_body_size.record(bytes, attributes);
    }

    fn record_response_body_size(&self, bytes: u64, attributes: &[KeyValue]) {
        self.response_body_size.record(bytes, attributes);
    }

    fn record_request_duration(&self, seconds: f64, attributes: &[KeyValue]) {
        self.request_duration.record(seconds, attributes);
    }
}
