//! Logging and OpenTelemetry setup.
//!
//! `serve` exports traces, logs and metrics over OTLP when an endpoint is
//! configured. Every other command logs to stderr only. Worker processes
//! continue the parent's trace through a `TRACEPARENT` value.

use std::time::Duration;

use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Timeout for OTLP exports - prevents blocking on unavailable endpoints
const EXPORT_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_FILTER: &str = "info,lclstream=debug";

fn env_filter(log_level: Option<&str>) -> EnvFilter {
    // A configured directive other than the plain default replaces the
    // built-in filter
    EnvFilter::try_from_default_env().unwrap_or_else(|_| match log_level {
        Some(level) if !level.is_empty() && level != "info" => EnvFilter::new(level),
        _ => EnvFilter::new(DEFAULT_FILTER),
    })
}

/// Plain stderr logging for CLI commands.
pub fn init_fmt(log_level: Option<&str>) {
    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Initialize OpenTelemetry with OTLP exporters for traces, logs, and metrics.
pub fn init(otlp_endpoint: &str, log_level: Option<&str>) -> Result<()> {
    let resource = Resource::builder_empty()
        .with_service_name("lclstream")
        .with_attributes(vec![KeyValue::new(
            "service.version",
            env!("CARGO_PKG_VERSION"),
        )])
        .build();

    let endpoint = if otlp_endpoint.contains("://") {
        otlp_endpoint.to_string()
    } else {
        format!("http://{}", otlp_endpoint)
    };

    let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP span exporter")?;

    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_span_processor(
            opentelemetry_sdk::trace::BatchSpanProcessor::builder(trace_exporter).build(),
        )
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_resource(resource.clone())
        .build();

    let tracer = tracer_provider.tracer("lclstream");
    global::set_tracer_provider(tracer_provider);

    let log_exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint.clone())
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP log exporter")?;

    let logger_provider = opentelemetry_sdk::logs::SdkLoggerProvider::builder()
        .with_log_processor(
            opentelemetry_sdk::logs::BatchLogProcessor::builder(log_exporter).build(),
        )
        .with_resource(resource.clone())
        .build();

    // Counters recorded by the pipeline go through this provider
    let metric_exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(EXPORT_TIMEOUT)
        .build()
        .context("Failed to create OTLP metric exporter")?;

    let meter_provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
        .with_reader(opentelemetry_sdk::metrics::PeriodicReader::builder(metric_exporter).build())
        .with_resource(resource)
        .build();
    global::set_meter_provider(meter_provider);

    let log_appender =
        opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&logger_provider);

    tracing_subscriber::registry()
        .with(env_filter(log_level))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .with(log_appender)
        .init();

    tracing::info!("OpenTelemetry exporting to {}", otlp_endpoint);
    Ok(())
}

/// The current span as a W3C `traceparent`, if it belongs to a valid trace.
pub fn current_traceparent() -> Option<String> {
    use opentelemetry::trace::TraceContextExt;
    use tracing_opentelemetry::OpenTelemetrySpanExt;

    let context = tracing::Span::current().context();
    let span = context.span();
    let span_context = span.span_context();

    if span_context.is_valid() {
        Some(format!(
            "00-{}-{}-{:02x}",
            span_context.trace_id(),
            span_context.span_id(),
            span_context.trace_flags().to_u8()
        ))
    } else {
        None
    }
}

/// Parse a W3C traceparent header and return an OpenTelemetry Context.
///
/// Format: `{version}-{trace_id}-{span_id}-{trace_flags}`
pub fn parse_traceparent(traceparent: Option<&str>) -> Option<opentelemetry::Context> {
    use opentelemetry::trace::{
        SpanContext, SpanId, TraceContextExt, TraceFlags, TraceId, TraceState,
    };

    let tp = traceparent?;
    let parts: Vec<&str> = tp.split('-').collect();

    if parts.len() != 4 {
        tracing::warn!("Invalid traceparent format: {}", tp);
        return None;
    }
    if parts[0] != "00" {
        tracing::warn!("Unsupported traceparent version: {}", parts[0]);
        return None;
    }

    let trace_id = TraceId::from_bytes(hex_to_bytes::<16>(parts[1])?);
    let span_id = SpanId::from_bytes(hex_to_bytes::<8>(parts[2])?);
    let flags = u8::from_str_radix(parts[3], 16).unwrap_or(0);

    let span_context = SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::new(flags),
        true,
        TraceState::default(),
    );

    Some(opentelemetry::Context::current().with_remote_span_context(span_context))
}

fn hex_to_bytes<const N: usize>(hex: &str) -> Option<[u8; N]> {
    if hex.len() != N * 2 {
        return None;
    }

    let mut bytes = [0u8; N];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_to_bytes() {
        let result: Option<[u8; 4]> = hex_to_bytes("deadbeef");
        assert_eq!(result, Some([0xde, 0xad, 0xbe, 0xef]));

        let result: Option<[u8; 4]> = hex_to_bytes("short");
        assert_eq!(result, None);

        let result: Option<[u8; 4]> = hex_to_bytes("not_hex!");
        assert_eq!(result, None);
    }

    #[test]
    fn test_parse_traceparent() {
        let tp = "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01";
        assert!(parse_traceparent(Some(tp)).is_some());
        assert!(parse_traceparent(None).is_none());
        assert!(parse_traceparent(Some("not-a-valid-traceparent")).is_none());
        assert!(parse_traceparent(Some(
            "01-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
        ))
        .is_none());
    }

    #[test]
    fn test_no_traceparent_outside_a_trace() {
        assert_eq!(current_traceparent(), None);
    }
}
