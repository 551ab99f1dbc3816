use std::{env, fmt, str::FromStr};

use opentelemetry::{
    global,
    logs::LogError,
    metrics::{Meter, MetricsError},
    propagation::{TextMapCompositePropagator, TextMapPropagator},
    trace::TraceError,
    KeyValue,
};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    logs,
    metrics::SdkMeterProvider,
    propagation::{BaggagePropagator, TraceContextPropagator},
    runtime, Resource,
};
use tracing_core::LevelFilter;
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, util::TryInitError, EnvFilter, Layer as _,
    Registry,
};

const DEFAULT_ENDPOINT: &str = "http://localhost:4317";

/// Targets kept out of the exported logs: the exporters log through them.
const EXPORTER_TARGETS: [&str; 5] = ["hyper", "opentelemetry", "tonic", "h2", "reqwest"];

#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to install trace pipeline: {0}")]
    Trace(#[from] TraceError),
    #[error("failed to install metrics pipeline: {0}")]
    Metrics(#[from] MetricsError),
    #[error("failed to install logs pipeline: {0}")]
    Logs(#[from] LogError),
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(#[from] TryInitError),
    #[error("invalid log level {0:?}")]
    InvalidLogLevel(String),
    #[error("invalid exporter {0:?}, expected \"none\" or \"otlp\"")]
    InvalidExporter(String),
}

/// Value of `OTEL_METRICS_EXPORTER` and `OTEL_LOGS_EXPORTER`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exporter {
    None,
    Otlp,
}

impl FromStr for Exporter {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "otlp" | "" => Ok(Self::Otlp),
            _ => Err(SetupError::InvalidExporter(s.to_owned())),
        }
    }
}

/// Exporter and subscriber configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConfig {
    pub service_name: String,
    pub endpoint: String,
    pub traces_endpoint: Option<String>,
    pub metrics_endpoint: Option<String>,
    pub logs_endpoint: Option<String>,
    pub metrics_exporter: String,
    pub logs_exporter: String,
    /// No exporter is built; tracer and meter are no-ops.
    pub sdk_disabled: bool,
    pub log_level: String,
}

impl SetupConfig {
    /// Reads the configuration from the process environment.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `OTEL_SERVICE_NAME`, then `SERVICE_NAME` | crate name |
    /// | `OTEL_EXPORTER_OTLP_ENDPOINT` | `http://localhost:4317` |
    /// | `OTEL_EXPORTER_OTLP_TRACES_ENDPOINT` | the endpoint above |
    /// | `OTEL_EXPORTER_OTLP_METRICS_ENDPOINT` | the endpoint above |
    /// | `OTEL_EXPORTER_OTLP_LOGS_ENDPOINT` | the endpoint above |
    /// | `OTEL_METRICS_EXPORTER` | `otlp` |
    /// | `OTEL_LOGS_EXPORTER` | `otlp` |
    /// | `OTEL_SDK_DISABLED` | `false` |
    /// | `LOG_LEVEL` | `info` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        Self {
            service_name: lookup("OTEL_SERVICE_NAME")
                .or_else(|| lookup("SERVICE_NAME"))
                .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned()),
            endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_owned()),
            traces_endpoint: lookup("OTEL_EXPORTER_OTLP_TRACES_ENDPOINT"),
            metrics_endpoint: lookup("OTEL_EXPORTER_OTLP_METRICS_ENDPOINT"),
            logs_endpoint: lookup("OTEL_EXPORTER_OTLP_LOGS_ENDPOINT"),
            metrics_exporter: lookup("OTEL_METRICS_EXPORTER").unwrap_or_else(|| "otlp".to_owned()),
            logs_exporter: lookup("OTEL_LOGS_EXPORTER").unwrap_or_else(|| "otlp".to_owned()),
            sdk_disabled: lookup("OTEL_SDK_DISABLED")
                .is_some_and(|value| value.trim().eq_ignore_ascii_case("true")),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
        }
    }

    fn traces_endpoint(&self) -> &str {
        self.traces_endpoint.as_deref().unwrap_or(&self.endpoint)
    }

    fn metrics_endpoint(&self) -> &str {
        self.metrics_endpoint.as_deref().unwrap_or(&self.endpoint)
    }

    fn logs_endpoint(&self) -> &str {
        self.logs_endpoint.as_deref().unwrap_or(&self.endpoint)
    }

    fn resource(&self) -> Resource {
        Resource::new(vec![KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            self.service_name.clone(),
        )])
    }
}

/// Handles to the installed telemetry.
pub struct Telemetry {
    service_name: String,
    meter_provider: Option<SdkMeterProvider>,
    logs_exported: bool,
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("service_name", &self.service_name)
            .field("metrics_exported", &self.meter_provider.is_some())
            .field("logs_exported", &self.logs_exported)
            .finish()
    }
}

impl Telemetry {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn tracer(&self) -> global::BoxedTracer {
        global::tracer(self.service_name.clone())
    }

    pub fn meter(&self) -> Meter {
        global::meter(self.service_name.clone())
    }

    /// Flushes and stops the exporters.
    pub fn shutdown(self) {
        if let Some(meter_provider) = self.meter_provider {
            if let Err(err) = meter_provider.shutdown() {
                tracing::warn!(%err, "failed to shut down meter provider");
            }
        }
        if self.logs_exported {
            global::shutdown_logger_provider();
        }
        global::shutdown_tracer_provider();
    }
}

/// Sets up tracing, metrics and logging via otlp exporter.
///
/// Installs the global propagator (W3C trace context, baggage and Jaeger),
/// the exporters unless `sdk_disabled` is set, and a `tracing` subscriber
/// writing JSON lines to stderr. `RUST_LOG` overrides the configured level.
/// Exported logs are the `tracing` events at the configured level, except
/// those of the exporters' own transport crates.
///
/// This should generally be the first statement of any server binary's main
/// function.
pub fn setup(config: &SetupConfig) -> Result<Telemetry, SetupError> {
    let level = LevelFilter::from_str(&config.log_level)
        .map_err(|_| SetupError::InvalidLogLevel(config.log_level.clone()))?;
    let metrics_exporter = config.metrics_exporter.parse::<Exporter>()?;
    let logs_exporter = config.logs_exporter.parse::<Exporter>()?;
    let exported_logs_filter = exported_logs_filter(level)?;

    let propagators: Vec<Box<dyn TextMapPropagator + Send + Sync>> = vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
        Box::new(opentelemetry_jaeger_propagator::Propagator::new()),
    ];
    global::set_text_map_propagator(TextMapCompositePropagator::new(propagators));

    let (tracer, meter_provider, logs_exported) = if config.sdk_disabled {
        (None, None, false)
    } else {
        let meter_provider = match metrics_exporter {
            Exporter::Otlp => Some(init_metrics(config)?),
            Exporter::None => None,
        };
        // the log bridge reads the global logger provider, install it first
        let logs_exported = match logs_exporter {
            Exporter::Otlp => {
                init_logs(config)?;
                true
            }
            Exporter::None => false,
        };
        (Some(init_tracer(config)?), meter_provider, logs_exported)
    };

    let telemetry = tracer.map(|tracer| tracing_opentelemetry::layer().with_tracer(tracer));
    let log_bridge = logs_exported.then(|| {
        OpenTelemetryTracingBridge::new(&global::logger_provider())
            .with_filter(exported_logs_filter)
    });
    Registry::default()
        .with(
            EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr),
        )
        .with(telemetry)
        .with(log_bridge)
        .try_init()?;

    tracing::info!(
        service = %config.service_name,
        sdk_disabled = config.sdk_disabled,
        logs_exported,
        "telemetry initialized"
    );

    Ok(Telemetry {
        service_name: config.service_name.clone(),
        meter_provider,
        logs_exported,
    })
}

fn exported_logs_filter(level: LevelFilter) -> Result<EnvFilter, SetupError> {
    let directives = EXPORTER_TARGETS
        .iter()
        .fold(level.to_string(), |directives, target| {
            format!("{directives},{target}=off")
        });
    EnvFilter::try_new(directives).map_err(|_| SetupError::InvalidLogLevel(level.to_string()))
}

fn init_tracer(config: &SetupConfig) -> Result<opentelemetry_sdk::trace::Tracer, TraceError> {
    opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(config.traces_endpoint()),
        )
        .with_trace_config(opentelemetry_sdk::trace::config().with_resource(config.resource()))
        .install_batch(runtime::Tokio)
}

fn init_metrics(config: &SetupConfig) -> Result<SdkMeterProvider, MetricsError> {
    let meter_provider = opentelemetry_otlp::new_pipeline()
        .metrics(runtime::Tokio)
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(config.metrics_endpoint()),
        )
        .with_resource(config.resource())
        .build()?;
    global::set_meter_provider(meter_provider.clone());

    Ok(meter_provider)
}

/// Installs the global logger provider.
fn init_logs(config: &SetupConfig) -> Result<(), LogError> {
    opentelemetry_otlp::new_pipeline()
        .logging()
        .with_log_config(logs::Config::default().with_resource(config.resource()))
        .with_exporter(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(config.logs_endpoint()),
        )
        .install_batch(runtime::Tokio)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> SetupConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SetupConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]);

        assert_eq!(config.service_name, env!("CARGO_PKG_NAME"));
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.traces_endpoint(), DEFAULT_ENDPOINT);
        assert_eq!(config.metrics_endpoint(), DEFAULT_ENDPOINT);
        assert_eq!(config.logs_endpoint(), DEFAULT_ENDPOINT);
        assert_eq!(config.metrics_exporter, "otlp");
        assert_eq!(config.logs_exporter, "otlp");
        assert!(!config.sdk_disabled);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn reads_variables() {
        let config = config(&[
            ("SERVICE_NAME", "fallback"),
            ("OTEL_SERVICE_NAME", "orders"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://collector:4317"),
            ("OTEL_EXPORTER_OTLP_METRICS_ENDPOINT", "http://metrics:4317"),
            ("OTEL_EXPORTER_OTLP_LOGS_ENDPOINT", "http://logs:4317"),
            ("OTEL_METRICS_EXPORTER", "none"),
            ("OTEL_LOGS_EXPORTER", "None"),
            ("OTEL_SDK_DISABLED", "TRUE"),
            ("LOG_LEVEL", "debug"),
        ]);

        assert_eq!(config.service_name, "orders");
        assert_eq!(config.traces_endpoint(), "http://collector:4317");
        assert_eq!(config.metrics_endpoint(), "http://metrics:4317");
        assert_eq!(config.logs_endpoint(), "http://logs:4317");
        assert_eq!(
            config.metrics_exporter.parse::<Exporter>().unwrap(),
            Exporter::None
        );
        assert_eq!(config.logs_exporter.parse::<Exporter>().unwrap(), Exporter::None);
        assert!(config.sdk_disabled);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn service_name_falls_back() {
        assert_eq!(config(&[("SERVICE_NAME", "legacy")]).service_name, "legacy");
        assert_eq!(
            config(&[("OTEL_SERVICE_NAME", " "), ("SERVICE_NAME", "legacy")]).service_name,
            "legacy"
        );
    }

    #[test]
    fn rejects_invalid_settings_before_installing_anything() {
        let err = setup(&config(&[("OTEL_METRICS_EXPORTER", "prometheus")])).unwrap_err();
        assert!(matches!(err, SetupError::InvalidExporter(ref kind) if kind == "prometheus"));

        let err = setup(&config(&[("OTEL_LOGS_EXPORTER", "stdout")])).unwrap_err();
        assert!(matches!(err, SetupError::InvalidExporter(ref kind) if kind == "stdout"));

        let err = setup(&config(&[("LOG_LEVEL", "loud")])).unwrap_err();
        assert!(matches!(err, SetupError::InvalidLogLevel(ref level) if level == "loud"));
    }

    #[test]
    fn exported_logs_skip_exporter_transports() {
        let filter = exported_logs_filter(LevelFilter::WARN).unwrap().to_string();

        assert!(filter.contains("warn"), "{filter}");
        for target in EXPORTER_TARGETS {
            assert!(filter.contains(&format!("{target}=off")), "{filter}");
        }
    }
}
