use opentelemetry::{global, propagation::TextMapCompositePropagator};
use opentelemetry_sdk::{export::trace::SpanExporter, propagation::TraceContextPropagator};

use crate::{
    config::{ServiceIdentity, TelemetryConfig},
    error::Result,
    logging,
    metrics::Metrics,
    trace::SpanManager,
};

/// Handles to the instrumentation of a running service.
#[derive(Clone)]
pub struct Telemetry {
    pub spans: SpanManager,
    pub metrics: Metrics,
    pub config: TelemetryConfig,
}

impl Telemetry {
    /// Exports every pending span and stops the export worker.
    pub async fn shutdown(self) {
        self.spans.shutdown().await;
        tracing::info!(service = %self.config.service_name, "telemetry shut down");
    }
}

/// Sets up logging, tracing and metrics, exporting spans over OTLP to the
/// collector named in `config`.
///
/// This should generally be the first statement of any server binary's main
/// function, after the tokio runtime has started. Invalid configuration is
/// reported before anything global is installed.
pub fn setup(config: &TelemetryConfig) -> Result<Telemetry> {
    config.validate()?;
    let identity = install_globals(config)?;
    let spans = SpanManager::otlp(identity, config)?;
    finish(config, spans)
}

/// Like [`setup`], but exports spans through `exporter`.
pub fn setup_with_exporter<E>(config: &TelemetryConfig, exporter: E) -> Result<Telemetry>
where
    E: SpanExporter + 'static,
{
    config.validate()?;
    let identity = install_globals(config)?;
    let spans = SpanManager::new(identity, exporter, &config.export)?;
    finish(config, spans)
}

/// Installs W3C trace context and Jaeger as the global propagator.
pub fn install_propagator() {
    global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(opentelemetry_jaeger_propagator::Propagator::new()),
    ]));
}

fn install_globals(config: &TelemetryConfig) -> Result<&'static ServiceIdentity> {
    let identity = config.identity().install()?;
    // needs to run before anything logs
    logging::setup_logging(config)?;
    install_propagator();
    Ok(identity)
}

fn finish(config: &TelemetryConfig, spans: SpanManager) -> Result<Telemetry> {
    let metrics = Metrics::new()?;
    tracing::info!(
        service = %config.service_name,
        collector = %config.collector_endpoint(),
        "tracing initialized for service"
    );

    Ok(Telemetry {
        spans,
        metrics,
        config: config.clone(),
    })
}
