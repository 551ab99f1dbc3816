//! # HTTP Telemetry
//! This crate instruments HTTP servers with traces, metrics and one
//! structured log line per request.
//!
//! ## Setup
//! Tracing, metrics and logs can be set up using [`setup::setup`]. This should
//! be the first call of any server binary.
//!
//! ## Http Trace Propagation
//! [`http_injector`] provides functions for injecting and extracting tracing
//! data into/from [`http::Request`]s, and for deriving a request id.
//!
//! ## Middleware
//! When using [`tower`](https://docs.rs/tower) based http frameworks like
//! [`axum`](https://docs.rs/axum/latest/axum), the middleware
//! `middleware::tower::TraceLayer` (feature `tower`, on by default) creates
//! a server span per request, records the OpenTelemetry HTTP server metrics,
//! logs the request and response with sensitive headers masked, and turns
//! handler panics into `500` responses.
//!
//! Generally, the middleware should be used on every http route, this usually
//! means that it can be registered globally and in the last position, to be the
//! first to run.
//!
//! Handlers find their [`logger::RequestLogger`] with
//! [`logger::logger_from_request`], and start their own user visible spans
//! with [`tracer::UserTracer`].

pub mod headers;
pub mod host_port;
pub mod http_injector;
pub mod logger;
pub mod metrics;
pub mod middleware;
pub mod setup;
pub mod tracer;
pub mod writer;
