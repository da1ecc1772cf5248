/*
 * Copyright (c) 2025 Dylan Storey
 * Licensed under the Elastic License 2.0.
 * See LICENSE file in the project root for full license text.
 */

//! # Gas Town Telemetry Module
//!
//! Structured logging and optional OpenTelemetry trace export for the operator.
//!
//! ## Features
//! - `tracing` subscriber with text or JSON output
//! - `RUST_LOG` overrides the configured level
//! - OTLP export to any OpenTelemetry-compatible collector
//! - Spans tagged with the operator pod and namespace
//! - Configurable sampling rate
//!
//! ## Usage
//!
//! ```rust,ignore
//! use gastown_utils::telemetry;
//!
//! let settings = gastown_utils::Settings::new(None)?;
//! telemetry::init(
//!     &settings.telemetry.for_operator(),
//!     &settings.log.level,
//!     &settings.log.format,
//! )?;
//!
//! tracing::info!("Operator started");
//! ```

use crate::config::ResolvedTelemetry;
use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::Sampler;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Every operator replica reports under this service namespace
pub const SERVICE_NAMESPACE: &str = "gastown";

const SERVICE_NAMESPACE_KEY: &str = "service.namespace";
const SERVICE_INSTANCE_ID: &str = "service.instance.id";
const K8S_POD_NAME: &str = "k8s.pod.name";
const K8S_NAMESPACE_NAME: &str = "k8s.namespace.name";

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("OTLP exporter error: {0}")]
    ExporterError(String),
    #[error("Subscriber error: {0}")]
    SubscriberError(String),
}

/// Maps a sampling rate onto an OpenTelemetry sampler.
pub fn sampler_for(rate: f64) -> Sampler {
    if rate >= 1.0 {
        Sampler::AlwaysOn
    } else if rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(rate)
    }
}

/// Resource attributes attached to every exported span.
///
/// The pod identity comes from the downward-API variables `POD_NAME` and
/// `POD_NAMESPACE` of the operator Deployment; `HOSTNAME` stands in for the
/// pod name outside a cluster.
pub fn resource_attributes<F>(config: &ResolvedTelemetry, env: F) -> Vec<KeyValue>
where
    F: Fn(&str) -> Option<String>,
{
    let mut attributes = vec![
        KeyValue::new(resource::SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(resource::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        KeyValue::new(SERVICE_NAMESPACE_KEY, SERVICE_NAMESPACE),
    ];
    if let Some(pod) = env("POD_NAME").or_else(|| env("HOSTNAME")) {
        attributes.push(KeyValue::new(SERVICE_INSTANCE_ID, pod.clone()));
        attributes.push(KeyValue::new(K8S_POD_NAME, pod));
    }
    if let Some(namespace) = env("POD_NAMESPACE") {
        attributes.push(KeyValue::new(K8S_NAMESPACE_NAME, namespace));
    }
    attributes
}

fn tracer_provider(
    config: &ResolvedTelemetry,
) -> Result<opentelemetry_sdk::trace::TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| TelemetryError::ExporterError(e.to_string()))?;

    Ok(opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_sampler(sampler_for(config.sampling_rate))
        .with_resource(Resource::new(resource_attributes(config, |key| {
            std::env::var(key).ok()
        })))
        .build())
}

/// Installs the global subscriber for the operator process.
///
/// `RUST_LOG` overrides `log_level`. With export disabled only the
/// console layer is installed; otherwise spans also go to the OTLP
/// collector named in `config`.
pub fn init(
    config: &ResolvedTelemetry,
    log_level: &str,
    log_format: &str,
) -> Result<(), TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let json = log_format.eq_ignore_ascii_case("json");

    let otel_layer = if config.enabled {
        let provider = tracer_provider(config)?;
        let tracer = provider.tracer(config.service_name.clone());
        opentelemetry::global::set_tracer_provider(provider);
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()
        .map_err(|e| TelemetryError::SubscriberError(e.to_string()))
}

/// Shutdown OpenTelemetry, flushing any pending traces.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}

/// Re-export tracing macros for convenience
pub mod prelude {
    pub use tracing::Instrument;
    pub use tracing::{debug, error, info, trace, warn};
    pub use tracing::{instrument, span, Level};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sampler_bounds() {
        assert!(matches!(sampler_for(1.5), Sampler::AlwaysOn));
        assert!(matches!(sampler_for(1.0), Sampler::AlwaysOn));
        assert!(matches!(sampler_for(-0.5), Sampler::AlwaysOff));
        assert!(matches!(sampler_for(0.0), Sampler::AlwaysOff));
        assert!(matches!(sampler_for(0.25), Sampler::TraceIdRatioBased(_)));
    }

    fn config() -> ResolvedTelemetry {
        ResolvedTelemetry {
            enabled: true,
            otlp_endpoint: "http://localhost:4317".to_string(),
            service_name: "gastown-operator".to_string(),
            sampling_rate: 0.1,
        }
    }

    fn value_of(attributes: &[KeyValue], key: &str) -> Option<String> {
        attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.as_str().into_owned())
    }

    #[test]
    fn test_resource_names_the_operator_pod() {
        let attributes = resource_attributes(&config(), |key| match key {
            "POD_NAME" => Some("gastown-operator-7d9f-abcde".to_string()),
            "POD_NAMESPACE" => Some("gastown-system".to_string()),
            _ => None,
        });
        assert_eq!(value_of(&attributes, "service.name").as_deref(), Some("gastown-operator"));
        assert_eq!(value_of(&attributes, "service.namespace").as_deref(), Some("gastown"));
        assert_eq!(
            value_of(&attributes, "service.version").as_deref(),
            Some(env!("CARGO_PKG_VERSION"))
        );
        assert_eq!(
            value_of(&attributes, "k8s.pod.name").as_deref(),
            Some("gastown-operator-7d9f-abcde")
        );
        assert_eq!(
            value_of(&attributes, "service.instance.id").as_deref(),
            Some("gastown-operator-7d9f-abcde")
        );
        assert_eq!(value_of(&attributes, "k8s.namespace.name").as_deref(), Some("gastown-system"));
    }

    #[test]
    fn test_resource_outside_a_cluster() {
        let attributes = resource_attributes(&config(), |key| {
            (key == "HOSTNAME").then(|| "laptop".to_string())
        });
        assert_eq!(value_of(&attributes, "k8s.pod.name").as_deref(), Some("laptop"));
        assert_eq!(value_of(&attributes, "k8s.namespace.name"), None);

        let bare = resource_attributes(&config(), |_| None);
        assert_eq!(bare.len(), 3);
    }

    #[test]
    fn test_init_without_export() {
        let config = ResolvedTelemetry {
            enabled: false,
            otlp_endpoint: "http://localhost:4317".to_string(),
            service_name: "test-service".to_string(),
            sampling_rate: 0.1,
        };

        // A second init in the same process fails on the global subscriber,
        // which is reported rather than panicking.
        let first = init(&config, "debug", "text");
        let second = init(&config, "debug", "json");
        assert!(first.is_ok() || matches!(first, Err(TelemetryError::SubscriberError(_))));
        assert!(matches!(second, Err(TelemetryError::SubscriberError(_))));
    }
}
