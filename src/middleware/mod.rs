//! Request tracing middleware.
//!
//! Each request gets a server span (skipped for [debug paths]), a paired
//! active-request gauge, duration and body size histograms, and a single
//! summary log line once the response body has been fully sent. Panics in
//! the wrapped service become `500` problem responses.
//!
//! [debug paths]: TraceOptions::debug_paths

mod body;
mod finalize;
mod options;
#[cfg(feature = "tower")]
pub mod tower;

pub use body::{RequestBody, ResponseBody, MAX_LOGGED_RESPONSE_BODY};
pub use options::{CustomAttributes, TraceOptions};
#[cfg(feature = "tower")]
pub use self::tower::{TraceLayer, TraceService};
