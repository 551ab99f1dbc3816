use std::{collections::BTreeMap, sync::OnceLock};

use http::HeaderMap;
use opentelemetry::{
    trace::SpanRef,
    Array, KeyValue, StringValue, Value,
};
use regex::Regex;
use serde::Serialize;

static SENSITIVE_HEADER_REGEX: OnceLock<Regex> = OnceLock::new();

fn sensitive_header_regex() -> &'static Regex {
    SENSITIVE_HEADER_REGEX
        .get_or_init(|| Regex::new(r"auth|key|secret|token|password").expect("Invalid regex"))
}

/// Trace propagation headers that are never copied onto spans unless they are
/// explicitly allowed.
const EXCLUDED_SPAN_HEADERS: [&str; 10] = [
    "baggage",
    "traceparent",
    "traceresponse",
    "tracestate",
    "x-b3-sampled",
    "x-b3-spanid",
    "x-b3-traceid",
    "x-b3-parentspanid",
    "x-b3-flags",
    "b3",
];

const MASK_PREFIX_LEN: usize = 2;
const MASK_WIDTH: usize = 8;

/// Checks whether a header name looks like it carries a credential.
///
/// Matching is a case-insensitive substring search, so `passwordless` and
/// `x-api-key` both count.
pub fn is_sensitive_header(name: &str) -> bool {
    if name.len() < 3 {
        return false;
    }

    sensitive_header_regex().is_match(&name.to_ascii_lowercase())
}

/// Masks a value so that only its length and, for long values, a short
/// prefix remain visible.
///
/// ```
/// use http_telemetry::headers::mask_string;
///
/// assert_eq!(mask_string("secret"), "******");
/// assert_eq!(mask_string("password1"), "p********");
/// assert_eq!(mask_string("Bearer abcdefghijkl"), "Be********(19)");
/// ```
pub fn mask_string(input: &str) -> String {
    let length = input.chars().count();

    match length {
        0..=6 => "*".repeat(length),
        7..=11 => {
            let first: String = input.chars().take(1).collect();
            format!("{first}{}", "*".repeat(length - 1))
        }
        _ => {
            let prefix: String = input.chars().take(MASK_PREFIX_LEN).collect();
            format!("{prefix}{}({length})", "*".repeat(MASK_WIDTH))
        }
    }
}

/// Redacted, lower-cased projection of a header collection, safe to put in
/// logs and span attributes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct TelemetryHeaders(BTreeMap<String, Vec<String>>);

impl TelemetryHeaders {
    /// Builds the projection.
    ///
    /// With an empty `allowed` list every header with at least one value is
    /// kept. Otherwise only the listed names are looked up and the first
    /// value of each is kept, the header being skipped when that value is
    /// empty. Sensitive values are masked either way.
    pub fn new(headers: &HeaderMap, allowed: &[String]) -> Self {
        let mut result = BTreeMap::new();

        if !allowed.is_empty() {
            for name in allowed {
                let key = name.to_ascii_lowercase();
                let Some(value) = headers.get(key.as_str()) else {
                    continue;
                };
                let value = String::from_utf8_lossy(value.as_bytes());
                if value.is_empty() {
                    continue;
                }

                let value = if is_sensitive_header(&key) {
                    mask_string(&value)
                } else {
                    value.into_owned()
                };
                result.insert(key, vec![value]);
            }

            return Self(result);
        }

        for name in headers.keys() {
            let sensitive = is_sensitive_header(name.as_str());
            let values: Vec<String> = headers
                .get_all(name)
                .iter()
                .map(|value| {
                    let value = String::from_utf8_lossy(value.as_bytes());
                    if sensitive {
                        mask_string(&value)
                    } else {
                        value.into_owned()
                    }
                })
                .collect();

            if values.is_empty() {
                continue;
            }

            result.insert(name.as_str().to_ascii_lowercase(), values);
        }

        Self(result)
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        self.0.get(&name.to_ascii_lowercase()).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// JSON object rendering used for log fields.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

/// Computes the span attributes for a header projection.
///
/// Each selected header becomes `{prefix}.{name}` with a string array value.
/// An empty `allowed` list selects everything except the trace propagation
/// headers.
pub fn header_attributes(
    prefix: &str,
    headers: &TelemetryHeaders,
    allowed: &[String],
) -> Vec<KeyValue> {
    headers
        .iter()
        .filter(|(name, _)| {
            if allowed.is_empty() {
                !EXCLUDED_SPAN_HEADERS.contains(name)
            } else {
                allowed.iter().any(|a| a.eq_ignore_ascii_case(name))
            }
        })
        .map(|(name, values)| {
            let values: Vec<StringValue> =
                values.iter().cloned().map(StringValue::from).collect();
            KeyValue::new(
                format!("{prefix}.{name}"),
                Value::Array(Array::String(values)),
            )
        })
        .collect()
}

/// Sets header attributes on the span. See [`header_attributes`].
pub fn set_span_header_attributes(
    span: &SpanRef<'_>,
    prefix: &str,
    headers: &TelemetryHeaders,
    allowed: &[String],
) {
    for attribute in header_attributes(prefix, headers, allowed) {
        span.set_attribute(attribute);
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    fn header_map(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(*name, HeaderValue::from_static(value));
        }
        headers
    }

    #[test]
    fn detects_sensitive_names() {
        for name in [
            "Authorization",
            "X-API-KEY",
            "client_secret",
            "X-Auth-Token",
            "passwordless",
            "PASSWORD",
        ] {
            assert!(is_sensitive_header(name), "{name} should be sensitive");
        }

        for name in ["Content-Type", "Accept", "User-Agent", "x-request-id"] {
            assert!(!is_sensitive_header(name), "{name} should not be sensitive");
        }
    }

    #[test]
    fn short_names_are_never_sensitive() {
        assert!(!is_sensitive_header(""));
        assert!(!is_sensitive_header("ke"));
        assert!(is_sensitive_header("key"));
    }

    #[test]
    fn masks_by_length() {
        assert_eq!(mask_string(""), "");
        assert_eq!(mask_string("abc"), "***");
        assert_eq!(mask_string("abcdef"), "******");
        assert_eq!(mask_string("abcdefg"), "a******");
        assert_eq!(mask_string("abcdefghijk"), "a**********");
        assert_eq!(mask_string("abcdefghijkl"), "ab********(12)");
    }

    #[test]
    fn mask_is_deterministic_and_hides_content() {
        let secret = "Bearer abcdefghijklmnopqrstuvwxyz0123456789abcdefghijklmnopqrstuv";
        assert_eq!(secret.len(), 65);

        let masked = mask_string(secret);
        assert_eq!(masked, mask_string(secret));
        assert_eq!(masked, "Be********(65)");
        assert!(!masked.contains("abcdef"));
    }

    #[test]
    fn mask_handles_multibyte_input() {
        assert_eq!(mask_string("ééééééé"), "é******");
        assert_eq!(mask_string("ßßßßßßßßßßßßß"), "ßß********(13)");
    }

    #[test]
    fn projects_all_headers_masking_sensitive_ones() {
        let headers = header_map(&[
            ("content-type", "application/json"),
            ("authorization", "Bearer abcdefghijklmnop"),
            ("set-cookie", "a=1"),
            ("set-cookie", "b=2"),
        ]);

        let projected = TelemetryHeaders::new(&headers, &[]);

        assert_eq!(projected.len(), 3);
        assert_eq!(
            projected.get("content-type"),
            Some(&["application/json".to_string()][..])
        );
        assert_eq!(
            projected.get("authorization"),
            Some(&["Be********(23)".to_string()][..])
        );
        assert_eq!(
            projected.get("Set-Cookie"),
            Some(&["a=1".to_string(), "b=2".to_string()][..])
        );
    }

    #[test]
    fn projects_only_allowed_headers() {
        let headers = header_map(&[
            ("content-type", "text/plain"),
            ("x-api-key", "0123456789abcdef"),
            ("accept", ""),
        ]);
        let allowed = vec![
            "Content-Type".to_string(),
            "X-Api-Key".to_string(),
            "Accept".to_string(),
            "X-Missing".to_string(),
        ];

        let projected = TelemetryHeaders::new(&headers, &allowed);

        assert_eq!(projected.len(), 2);
        assert_eq!(
            projected.get("content-type"),
            Some(&["text/plain".to_string()][..])
        );
        assert_eq!(
            projected.get("x-api-key"),
            Some(&["01********(16)".to_string()][..])
        );
        assert!(projected.get("accept").is_none());
    }

    #[test]
    fn allowed_headers_keep_the_first_value_only() {
        let mut headers = HeaderMap::new();
        headers.append("x-forwarded-for", HeaderValue::from_static("203.0.113.7"));
        headers.append("x-forwarded-for", HeaderValue::from_static("10.0.0.2"));
        headers.append("x-tag", HeaderValue::from_static(""));
        headers.append("x-tag", HeaderValue::from_static("second"));
        let allowed = vec!["x-forwarded-for".to_string(), "x-tag".to_string()];

        let projected = TelemetryHeaders::new(&headers, &allowed);

        assert_eq!(
            projected.get("x-forwarded-for"),
            Some(&["203.0.113.7".to_string()][..])
        );
        assert!(projected.get("x-tag").is_none());

        let everything = TelemetryHeaders::new(&headers, &[]);
        assert_eq!(everything.get("x-forwarded-for").map(<[String]>::len), Some(2));
    }

    #[test]
    fn span_attributes_skip_propagation_headers() {
        let headers = header_map(&[
            ("traceparent", "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"),
            ("tracestate", "vendor=1"),
            ("baggage", "user=1"),
            ("b3", "80f198ee56343ba864fe8b2a57d3eff7-e457b5a2e4d86bd1-1"),
            ("x-b3-traceid", "80f198ee56343ba864fe8b2a57d3eff7"),
            ("accept", "*/*"),
        ]);
        let projected = TelemetryHeaders::new(&headers, &[]);

        let attributes = header_attributes("http.request.header", &projected, &[]);

        assert_eq!(attributes.len(), 1);
        assert_eq!(attributes[0].key.as_str(), "http.request.header.accept");
        assert_eq!(
            attributes[0].value,
            Value::Array(Array::String(vec![StringValue::from("*/*")]))
        );
    }

    #[test]
    fn span_attributes_respect_allow_list() {
        let headers = header_map(&[("traceparent", "x"), ("accept", "*/*"), ("host", "a")]);
        let projected = TelemetryHeaders::new(&headers, &[]);
        let allowed = vec!["traceparent".to_string()];

        let attributes = header_attributes("http.request.header", &projected, &allowed);

        let keys: Vec<&str> = attributes.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["http.request.header.traceparent"]);
    }

    #[test]
    fn renders_json() {
        let headers = header_map(&[("accept", "*/*")]);
        let projected = TelemetryHeaders::new(&headers, &[]);

        assert_eq!(projected.to_json(), r#"{"accept":["*/*"]}"#);
    }
}
