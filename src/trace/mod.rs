//! Span creation and export.
//!
//! A [`SpanManager`] owns one tracer provider for the service. Spans started
//! through it pick up their parent from the [`RequestContext`] scope they run
//! in, so nested operations of one request form a single trace.
//!
//! [`RequestContext`]: crate::context::RequestContext

use std::borrow::Cow;

use opentelemetry::{
    trace::{
        SpanContext, SpanKind, TraceContextExt, TraceFlags, TraceState, Tracer as _,
        TracerProvider as _,
    },
    Context, KeyValue,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    export::trace::SpanExporter,
    trace::{self as sdktrace, Tracer, TracerProvider},
    Resource,
};

use crate::{
    config::{ExportConfig, ServiceIdentity, TelemetryConfig},
    context::{self, SpanIds},
    error::Result,
};

mod export;
mod span;

pub use export::InMemorySpanExporter;
use export::{ExportHandle, QueueingSpanProcessor};
pub use span::{Entered, Span, SpanStatus};

/// Starts spans for one service and ships them to a collector.
///
/// Cloning is cheap; clones share the provider and the export queue.
#[derive(Clone)]
pub struct SpanManager {
    tracer: Tracer,
    // the tracer only holds a weak reference to its provider
    _provider: TracerProvider,
    export: ExportHandle,
}

impl SpanManager {
    /// Builds a manager exporting through `exporter`.
    ///
    /// Must be called from within a tokio runtime; the export worker is
    /// spawned onto it.
    pub fn new<E>(identity: &ServiceIdentity, exporter: E, config: &ExportConfig) -> Result<Self>
    where
        E: SpanExporter + 'static,
    {
        let (processor, export) = QueueingSpanProcessor::spawn(exporter, config)?;
        let provider = TracerProvider::builder()
            .with_span_processor(processor)
            .with_config(sdktrace::config().with_resource(Resource::new(vec![KeyValue::new(
                opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                identity.service_name().to_owned(),
            )])))
            .build();
        let tracer = provider.tracer(env!("CARGO_PKG_NAME"));

        Ok(Self {
            tracer,
            _provider: provider,
            export,
        })
    }

    /// Builds a manager exporting over OTLP/gRPC to the configured collector.
    pub fn otlp(identity: &ServiceIdentity, config: &TelemetryConfig) -> Result<Self> {
        let exporter = opentelemetry_otlp::SpanExporterBuilder::from(
            opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(config.collector_endpoint())
                .with_timeout(config.export.export_timeout),
        )
        .build_span_exporter()?;

        Self::new(identity, exporter, &config.export)
    }

    /// Starts a span under the active span of the current request, or a new
    /// trace when there is none.
    pub fn start_span(&self, name: impl Into<Cow<'static, str>>, kind: SpanKind) -> Span {
        let parent = match context::active_span() {
            Some(ids) => parent_context(ids),
            None => Context::new(),
        };
        self.start_span_with_parent(name, kind, &parent)
    }

    /// Starts a span under an explicit parent, typically one extracted from
    /// inbound request headers.
    pub fn start_span_with_parent(
        &self,
        name: impl Into<Cow<'static, str>>,
        kind: SpanKind,
        parent: &Context,
    ) -> Span {
        let builder = self.tracer.span_builder(name).with_kind(kind);
        Span::new(self.tracer.build_with_context(builder, parent))
    }

    /// Exports every span ended so far.
    pub async fn flush(&self) {
        self.export.flush().await;
    }

    /// Flushes and stops the export worker. Spans ended afterwards are lost.
    pub async fn shutdown(&self) {
        self.export.shutdown().await;
        tracing::debug!("span manager shut down");
    }
}

pub(crate) fn parent_context(ids: SpanIds) -> Context {
    Context::new().with_remote_span_context(SpanContext::new(
        ids.trace_id,
        ids.span_id,
        TraceFlags::SAMPLED,
        false,
        TraceState::default(),
    ))
}
