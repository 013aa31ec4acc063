use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::runtime::Tokio;
use prometheus::Registry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::metrics;

pub struct Observability {
    pub registry: Registry,
    tracer_provider: Option<opentelemetry_sdk::trace::TracerProvider>,
}

impl Observability {
    /// Logging, metrics and (when an OTLP endpoint is configured) tracing.
    pub fn init() -> Result<Self> {
        let registry = Registry::new_custom(Some("kinjo".into()), None)?;
        metrics::register_all(&registry)?;

        let tracer_provider = match std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            Ok(endpoint) if !endpoint.is_empty() => {
                let exporter = opentelemetry_otlp::SpanExporter::builder()
                    .with_tonic()
                    .with_endpoint(&endpoint)
                    .build()?;

                Some(
                    opentelemetry_sdk::trace::TracerProvider::builder()
                        .with_batch_exporter(exporter, Tokio)
                        .with_resource(opentelemetry_sdk::Resource::new(vec![KeyValue::new(
                            "service.name",
                            "kinjo-api",
                        )]))
                        .build(),
                )
            }
            _ => None,
        };

        let otel_layer = tracer_provider
            .as_ref()
            .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("kinjo-api")));

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "kinjo_api=debug,tower_http=info".into());

        let json = std::env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(json.then(|| tracing_subscriber::fmt::layer().json()))
            .with((!json).then(tracing_subscriber::fmt::layer))
            .with(otel_layer)
            .init();

        tracing::info!(
            otlp = tracer_provider.is_some(),
            json_logs = json,
            "Observability stack initialized"
        );
        Ok(Self {
            registry,
            tracer_provider,
        })
    }

    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider {
            if let Err(err) = provider.shutdown() {
                tracing::warn!(error = ?err, "tracer provider shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_names_prefixed() {
        let registry = Registry::new_custom(Some("kinjo".into()), None).unwrap();
        metrics::register_all(&registry).unwrap();
        metrics::INVOICES_FAILED.inc();
        let families = registry.gather();
        assert!(!families.is_empty());
        for fam in &families {
            assert!(
                fam.get_name().starts_with("kinjo_"),
                "metric {} missing prefix",
                fam.get_name()
            );
        }
    }
}
