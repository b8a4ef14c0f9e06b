// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! OpenTelemetry providers for the host.
//!
//! The bridge libraries only talk to the global meter; installing a provider
//! here is what makes their instruments export anything.

use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::{Protocol, WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{SdkTracerProvider, Tracer};
use opentelemetry_sdk::Resource;
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::config::TelemetryConfig;

const SERVICE_NAME: &str = "rtcbridge";
const EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

fn resource() -> Resource {
    Resource::builder_empty()
        .with_attributes([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])
        .build()
}

/// Points an OTLP/HTTP exporter builder at `endpoint`.
fn over_http<B>(builder: B, endpoint: &str, headers: &HashMap<String, String>) -> B
where
    B: WithExportConfig + WithHttpConfig,
{
    let builder = builder
        .with_protocol(Protocol::HttpBinary)
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT);
    if headers.is_empty() {
        builder
    } else {
        builder.with_headers(headers.clone())
    }
}

/// Installs the global meter provider and returns it; dropping the returned
/// provider stops the periodic export.
///
/// # Errors
///
/// Returns an error if the OTLP metrics exporter cannot be built.
pub fn init_metrics(config: &TelemetryConfig) -> Result<SdkMeterProvider, Box<dyn Error>> {
    let mut builder = SdkMeterProvider::builder().with_resource(resource());

    match &config.otlp_endpoint {
        Some(endpoint) => {
            let exporter = over_http(
                opentelemetry_otlp::MetricExporter::builder().with_http(),
                endpoint,
                &config.otlp_headers,
            )
            .build()?;
            let interval = Duration::from_secs(config.metrics_interval_secs);
            let reader = PeriodicReader::builder(exporter).with_interval(interval).build();
            builder = builder.with_reader(reader);
            tracing::info!(%endpoint, ?interval, "exporting metrics over OTLP");
        },
        None => tracing::info!("no otlp_endpoint set, metrics stay in process"),
    }

    let provider = builder.build();
    global::set_meter_provider(provider.clone());
    Ok(provider)
}

/// Builds a span layer that exports through a batch OTLP exporter and
/// installs its provider globally.
///
/// # Errors
///
/// Returns an error if `otlp_traces_endpoint` is unset or the exporter cannot
/// be built.
pub fn init_tracing_with_otlp<S>(
    config: &TelemetryConfig,
) -> Result<OpenTelemetryLayer<S, Tracer>, Box<dyn Error>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let endpoint =
        config.otlp_traces_endpoint.as_deref().ok_or("otlp_traces_endpoint is not set")?;
    let exporter = over_http(
        opentelemetry_otlp::SpanExporter::builder().with_http(),
        endpoint,
        &config.otlp_headers,
    )
    .build()?;

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_resource(resource())
        .build();
    let tracer = provider.tracer(SERVICE_NAME);
    global::set_tracer_provider(provider);

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}
