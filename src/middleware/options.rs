use std::{fmt, sync::Arc};

use http::{request::Parts, Method};
use opentelemetry::KeyValue;
use serde::{Deserialize, Deserializer};

use crate::writer::{BodySink, MakeResponseWriter, WrapResponseWriter};

/// Produces extra metric attributes from the incoming request.
pub type CustomAttributes = Arc<dyn Fn(&Parts) -> Vec<KeyValue> + Send + Sync>;

const DEFAULT_DEBUG_PATHS: [&str; 3] = ["/metrics", "/health", "/healthz"];

/// Configuration of [`TraceLayer`](super::TraceLayer).
///
/// The data fields deserialize from any serde format, missing fields taking
/// their defaults. As with the builders, listed debug paths are added to the
/// default ones and every list is lower-cased:
///
/// ```
/// use http_telemetry::middleware::TraceOptions;
///
/// let options: TraceOptions =
///     serde_json::from_str(r#"{ "high_cardinality_spans": false }"#).unwrap();
/// assert!(!options.high_cardinality_spans);
/// assert!(options.is_debug_path("/healthz"));
/// ```
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TraceOptions {
    /// Paths that get no span and are logged at debug level.
    #[serde(deserialize_with = "default_debug_paths_and")]
    pub debug_paths: Vec<String>,
    /// Request headers put on spans and logs. Empty means all of them.
    #[serde(deserialize_with = "lowercased")]
    pub allowed_request_headers: Vec<String>,
    /// Response headers put on spans and logs. Empty means all of them.
    #[serde(deserialize_with = "lowercased")]
    pub allowed_response_headers: Vec<String>,
    /// Name spans `{METHOD} {PATH}` instead of `{METHOD}`.
    pub high_cardinality_spans: bool,
    /// Tag metrics with `http.request.path`.
    pub high_cardinality_metrics: bool,
    #[serde(skip)]
    pub custom_attributes: Option<CustomAttributes>,
    #[serde(skip)]
    pub response_writer: Option<MakeResponseWriter>,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            debug_paths: default_debug_paths(),
            allowed_request_headers: Vec::new(),
            allowed_response_headers: Vec::new(),
            high_cardinality_spans: true,
            high_cardinality_metrics: true,
            custom_attributes: None,
            response_writer: None,
        }
    }
}

impl TraceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds to the debug paths; the defaults stay.
    pub fn with_debug_paths<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.debug_paths
            .extend(paths.into_iter().map(|p| p.into().to_ascii_lowercase()));
        self
    }

    pub fn with_allowed_request_headers<I, H>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Into<String>,
    {
        self.allowed_request_headers = lowercase_all(headers);
        self
    }

    pub fn with_allowed_response_headers<I, H>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = H>,
        H: Into<String>,
    {
        self.allowed_response_headers = lowercase_all(headers);
        self
    }

    pub fn with_high_cardinality_spans(mut self, enabled: bool) -> Self {
        self.high_cardinality_spans = enabled;
        self
    }

    pub fn with_high_cardinality_metrics(mut self, enabled: bool) -> Self {
        self.high_cardinality_metrics = enabled;
        self
    }

    pub fn with_custom_attributes<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parts) -> Vec<KeyValue> + Send + Sync + 'static,
    {
        self.custom_attributes = Some(Arc::new(f));
        self
    }

    /// Replaces [`BasicWriter`](crate::writer::BasicWriter) as the writer
    /// observing responses.
    pub fn with_response_writer<F>(mut self, f: F) -> Self
    where
        F: Fn(BodySink, http::Version) -> Box<dyn WrapResponseWriter> + Send + Sync + 'static,
    {
        self.response_writer = Some(Arc::new(f));
        self
    }

    pub fn is_debug_path(&self, path: &str) -> bool {
        self.debug_paths
            .iter()
            .any(|debug_path| debug_path.eq_ignore_ascii_case(path))
    }

    pub fn span_name(&self, method: &Method, path: &str) -> String {
        if !self.high_cardinality_spans || path.is_empty() {
            return method.as_str().to_owned();
        }

        if path.starts_with('/') {
            format!("{method} {path}")
        } else {
            format!("{method} /{path}")
        }
    }
}

fn default_debug_paths() -> Vec<String> {
    DEFAULT_DEBUG_PATHS.iter().map(|p| p.to_string()).collect()
}

fn default_debug_paths_and<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut paths = default_debug_paths();
    paths.extend(lowercased(deserializer)?);
    Ok(paths)
}

fn lowercased<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Vec::<String>::deserialize(deserializer).map(lowercase_all)
}

fn lowercase_all<I, H>(values: I) -> Vec<String>
where
    I: IntoIterator<Item = H>,
    H: Into<String>,
{
    values
        .into_iter()
        .map(|v| v.into().to_ascii_lowercase())
        .collect()
}

impl fmt::Debug for TraceOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceOptions")
            .field("debug_paths", &self.debug_paths)
            .field("allowed_request_headers", &self.allowed_request_headers)
            .field("allowed_response_headers", &self.allowed_response_headers)
            .field("high_cardinality_spans", &self.high_cardinality_spans)
            .field("high_cardinality_metrics", &self.high_cardinality_metrics)
            .field("custom_attributes", &self.custom_attributes.is_some())
            .field("response_writer", &self.response_writer.is_some())
            .finish()
    }
}
