//! Process telemetry for the metricstore binary
//!
//! Log records go to stdout as JSON through `tracing`; `RUST_LOG` refines the
//! level given on the command line. Store and retention instruments record
//! into the global OpenTelemetry meter, which is only backed by an SDK
//! provider when telemetry is enabled.

use crate::{Error, Result};

use opentelemetry::global;
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use opentelemetry_sdk::Resource;
use std::collections::BTreeMap;
use tracing::{info, Level};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

const SERVICE_NAMESPACE: &str = "metricstore";

/// Telemetry settings read from the environment
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub enabled: bool,
    pub service_name: String,
    /// Tags every exported measurement of one deployment run
    pub run_id: Option<String>,
    pub resource_attributes: BTreeMap<String, String>,
    sampler: Sampler,
}

impl TelemetryConfig {
    pub fn from_env(component: &str) -> Result<Self> {
        Self::from_lookup(component, |name| std::env::var(name).ok())
    }

    /// Build from any variable source.
    ///
    /// `METRICSTORE_TELEMETRY_ENABLED` defaults to off. `OTEL_SERVICE_NAME`
    /// overrides the component name and `OTEL_RESOURCE_ATTRIBUTES` adds
    /// `key=value` pairs to the resource.
    pub fn from_lookup(component: &str, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let enabled = match var("METRICSTORE_TELEMETRY_ENABLED") {
            Some(raw) => parse_bool("METRICSTORE_TELEMETRY_ENABLED", &raw)?,
            None => false,
        };
        let service_name = var("OTEL_SERVICE_NAME").unwrap_or_else(|| component.to_string());
        let run_id = var("METRICSTORE_TELEMETRY_RUN_ID");

        let sampler = match var("METRICSTORE_TRACE_RATIO") {
            Some(raw) => {
                let ratio = parse_ratio(&raw)?;
                Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(ratio)))
            }
            None => Sampler::ParentBased(Box::new(Sampler::AlwaysOn)),
        };

        let mut resource_attributes = match var("OTEL_RESOURCE_ATTRIBUTES") {
            Some(raw) => parse_resource_attributes(&raw)?,
            None => BTreeMap::new(),
        };
        resource_attributes.insert("service.name".to_string(), service_name.clone());
        resource_attributes
            .entry("service.namespace".to_string())
            .or_insert_with(|| SERVICE_NAMESPACE.to_string());
        if let Some(run_id) = &run_id {
            resource_attributes.insert("metricstore.run_id".to_string(), run_id.clone());
        }

        Ok(Self {
            enabled,
            service_name,
            run_id,
            resource_attributes,
            sampler,
        })
    }

    fn resource(&self) -> Resource {
        let attributes: Vec<KeyValue> = self
            .resource_attributes
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone()))
            .collect();
        Resource::default().merge(&Resource::new(attributes))
    }
}

/// Keeps the SDK providers alive; dropping it flushes and shuts them down.
pub struct Telemetry {
    config: TelemetryConfig,
    providers: Option<(TracerProvider, SdkMeterProvider)>,
}

impl Telemetry {
    /// Install the log subscriber and, when enabled, the OpenTelemetry providers
    pub fn init_for_component(component: &str, log_level: &str) -> Result<Self> {
        let config = TelemetryConfig::from_env(component)?;
        let level = parse_log_level(log_level)?;

        let filter = EnvFilter::builder()
            .with_default_directive(LevelFilter::from_level(level).into())
            .from_env_lossy();
        FmtSubscriber::builder()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .json()
            .try_init()
            .map_err(|e| Error::Config(format!("failed to install log subscriber: {e}")))?;

        let providers = if config.enabled {
            let resource = config.resource();
            let tracer_provider = TracerProvider::builder()
                .with_config(
                    trace::Config::default()
                        .with_sampler(config.sampler.clone())
                        .with_resource(resource.clone()),
                )
                .build();
            let _ = global::set_tracer_provider(tracer_provider.clone());

            let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
            global::set_meter_provider(meter_provider.clone());
            global::set_text_map_propagator(TraceContextPropagator::new());
            Some((tracer_provider, meter_provider))
        } else {
            None
        };

        info!(
            service_name = %config.service_name,
            enabled = config.enabled,
            run_id = %config.run_id.as_deref().unwrap_or("none"),
            "Telemetry initialized"
        );

        Ok(Self { config, providers })
    }

    pub fn enabled(&self) -> bool {
        self.providers.is_some()
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if let Some((tracer_provider, meter_provider)) = self.providers.take() {
            let _ = meter_provider.shutdown();
            let _ = tracer_provider.shutdown();
        }
    }
}

fn parse_log_level(raw: &str) -> Result<Level> {
    raw.trim()
        .parse::<Level>()
        .map_err(|_| Error::Config(format!("invalid log level '{raw}'")))
}

fn parse_bool(name: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::Config(format!("{name} must be a boolean, got '{raw}'"))),
    }
}

fn parse_ratio(raw: &str) -> Result<f64> {
    let ratio = raw
        .parse::<f64>()
        .map_err(|e| Error::Config(format!("METRICSTORE_TRACE_RATIO is not a number: {e}")))?;
    if !(0.0..=1.0).contains(&ratio) {
        return Err(Error::Config(format!("METRICSTORE_TRACE_RATIO must be in [0,1], got {ratio}")));
    }
    Ok(ratio)
}

fn parse_resource_attributes(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut attributes = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pair.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                attributes.insert(key.trim().to_string(), value.trim().to_string());
            }
            _ => {
                return Err(Error::Config(format!(
                    "OTEL_RESOURCE_ATTRIBUTES entry '{pair}' must be key=value"
                )))
            }
        }
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<TelemetryConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TelemetryConfig::from_lookup("metricstore", move |name: &str| vars.get(name).cloned())
    }

    #[test]
    fn test_disabled_by_default() {
        let config = config(&[]).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.service_name, "metricstore");
        assert_eq!(config.resource_attributes["service.namespace"], "metricstore");
        assert!(config.run_id.is_none());
    }

    #[test]
    fn test_run_id_and_attributes() {
        let config = config(&[
            ("METRICSTORE_TELEMETRY_ENABLED", "yes"),
            ("METRICSTORE_TELEMETRY_RUN_ID", " run-7 "),
            ("OTEL_SERVICE_NAME", "metrics-edge"),
            ("OTEL_RESOURCE_ATTRIBUTES", "deployment.environment=prod, ,service.namespace=ops"),
        ])
        .unwrap();
        assert!(config.enabled);
        assert_eq!(config.run_id.as_deref(), Some("run-7"));
        assert_eq!(config.resource_attributes["metricstore.run_id"], "run-7");
        assert_eq!(config.resource_attributes["service.name"], "metrics-edge");
        assert_eq!(config.resource_attributes["service.namespace"], "ops");
        assert_eq!(config.resource_attributes["deployment.environment"], "prod");
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(config(&[("METRICSTORE_TELEMETRY_ENABLED", "maybe")]).is_err());
        assert!(config(&[("METRICSTORE_TRACE_RATIO", "1.5")]).is_err());
        assert!(config(&[("OTEL_RESOURCE_ATTRIBUTES", "=value")]).is_err());
        assert!(config(&[("METRICSTORE_TRACE_RATIO", "0.25")]).is_ok());
    }

    #[test]
    fn test_log_level_parsing() {
        assert_eq!(parse_log_level(" warn ").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert!(parse_log_level("verbose").is_err());
    }
}
