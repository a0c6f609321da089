use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use opentelemetry::trace::{Span, TraceContextExt, Tracer, TracerProvider as _};
use opentelemetry::{Context as OtelContext, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, SdkTracer, SdkTracerProvider, SpanExporter,
};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::ScanError;
use crate::report::OutputFormat;
use crate::scan::Artifact;

const SERVICE_NAME: &str = "policyextractor";
const DEFAULT_LOG_FILTER: &str = "policyextractor=info,warn";
const SIGNAL_PATHS: [&str; 3] = ["/v1/traces", "/v1/logs", "/v1/metrics"];

/// A unit of extraction work traced as one span.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Phase<'a> {
    Run { modules: usize, include_test: bool },
    Archive(&'a Artifact),
    Class { module: &'a str, entry: &'a str },
    Report(OutputFormat),
}

impl Phase<'_> {
    fn name(&self) -> &'static str {
        match self {
            Phase::Run { .. } => "scan",
            Phase::Archive(_) => "archive.scan",
            Phase::Class { .. } => "class.scan",
            Phase::Report(_) => "report",
        }
    }

    fn attributes(&self) -> Vec<KeyValue> {
        match *self {
            Phase::Run {
                modules,
                include_test,
            } => vec![
                KeyValue::new("policyextractor.module_count", modules as i64),
                KeyValue::new("policyextractor.include_test", include_test),
            ],
            Phase::Archive(artifact) => vec![
                KeyValue::new("policyextractor.module", artifact.module_name.clone()),
                KeyValue::new("policyextractor.scope", artifact.scope.to_string()),
            ],
            Phase::Class { module, entry } => vec![
                KeyValue::new("policyextractor.module", module.to_string()),
                KeyValue::new("policyextractor.entry", entry.to_string()),
            ],
            Phase::Report(format) => vec![KeyValue::new(
                "policyextractor.format",
                format!("{format:?}").to_lowercase(),
            )],
        }
    }
}

/// OTLP trace export for one run.
pub(crate) struct Telemetry {
    tracer: SdkTracer,
    provider: SdkTracerProvider,
}

impl Telemetry {
    pub(crate) fn connect(collector: &str) -> Result<Self> {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(traces_endpoint(collector)?)
            .build()
            .context("build OTLP span exporter")?;
        Ok(Self::with_exporter(exporter))
    }

    fn with_exporter<E: SpanExporter + 'static>(exporter: E) -> Self {
        // Ending a span only enqueues it, so rayon workers can end spans.
        let processor = BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_max_queue_size(65_536)
                    .with_max_export_batch_size(4096)
                    .with_scheduled_delay(Duration::from_millis(200))
                    .build(),
            )
            .build();
        let provider = SdkTracerProvider::builder()
            .with_resource(Resource::builder().with_service_name(SERVICE_NAME).build())
            .with_span_processor(processor)
            .build();
        opentelemetry::global::set_tracer_provider(provider.clone());
        Self {
            tracer: provider.tracer(SERVICE_NAME),
            provider,
        }
    }

    fn start(&self, phase: &Phase<'_>, parent: &OtelContext) -> OtelContext {
        let mut span = self.tracer.start_with_context(phase.name(), parent);
        span.set_attributes(phase.attributes());
        parent.with_span(span)
    }

    /// Flush queued spans.
    pub(crate) fn shutdown(&self) -> Result<()> {
        self.provider
            .shutdown()
            .map_err(|err| anyhow!("failed to flush trace spans: {err}"))
    }
}

/// Run `f` inside a span for `phase` under the current context.
pub(crate) fn traced<T>(telemetry: Option<&Telemetry>, phase: Phase<'_>, f: impl FnOnce() -> T) -> T {
    traced_under(telemetry, &OtelContext::current(), phase, f)
}

/// Run `f` inside a span for `phase` under `parent`, which may come from another thread.
pub(crate) fn traced_under<T>(
    telemetry: Option<&Telemetry>,
    parent: &OtelContext,
    phase: Phase<'_>,
    f: impl FnOnce() -> T,
) -> T {
    let Some(telemetry) = telemetry else {
        return f();
    };
    let _guard = telemetry.start(&phase, parent).attach();
    f()
}

/// Attach a diagnostic to the active span as an event.
pub(crate) fn record_diagnostic(diagnostic: &ScanError) {
    let cx = OtelContext::current();
    let span = cx.span();
    if span.span_context().is_valid() {
        span.add_event(
            "scan.diagnostic",
            vec![
                KeyValue::new("policyextractor.module", diagnostic.module().to_string()),
                KeyValue::new("policyextractor.diagnostic", diagnostic.to_string()),
            ],
        );
    }
}

pub(crate) fn current_trace_id() -> Option<String> {
    let cx = OtelContext::current();
    let span_context = cx.span().span_context().clone();
    span_context
        .is_valid()
        .then(|| span_context.trace_id().to_string())
}

/// Resolve a collector base URL (or any signal URL under it) to its traces URL.
fn traces_endpoint(collector: &str) -> Result<String> {
    let mut url = reqwest::Url::parse(collector)
        .with_context(|| format!("invalid OTLP collector URL {collector:?}"))?;
    let path = url.path().trim_end_matches('/').to_string();
    let base = SIGNAL_PATHS
        .iter()
        .find_map(|signal| path.strip_suffix(signal))
        .unwrap_or(&path);
    url.set_path(&format!("{base}/v1/traces"));
    Ok(url.to_string())
}

/// Install the stderr log subscriber; `RUST_LOG` overrides the default filter.
pub(crate) fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
