//! Structured logging.
//!
//! Every `tracing` event becomes one JSON object on its own line, enriched with
//! the active span's trace/span ids and the request's correlation id taken
//! from the [`RequestContext`](crate::context::RequestContext).

use std::{error::Error as StdError, fmt, io};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Number, Value};
use tracing::{
    field::{Field, Visit},
    Event, Level, Subscriber,
};
use tracing_subscriber::{
    fmt::{
        format::{DefaultFields, Writer},
        FmtContext, FormatEvent, FormatFields, MakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::{
    config::TelemetryConfig,
    context::{self, SpanIds},
    error::Result,
};

/// Keys owned by the record itself. Caller fields with one of these names are
/// written under `fields.<name>` instead; a key already taken by another
/// caller field gets a `_<n>` suffix.
pub const RESERVED_KEYS: [&str; 11] = [
    "timestamp",
    "level",
    "logger",
    "message",
    "module",
    "function",
    "line",
    "trace_id",
    "span_id",
    "correlation_id",
    "exception",
];

const FIELD_NAMESPACE: &str = "fields.";

/// Target of the `request` span opened by the tracing middleware. It wraps
/// the whole request rather than a function, so it never fills `function`.
pub(crate) const REQUEST_SPAN_TARGET: &str = concat!(env!("CARGO_CRATE_NAME"), "::request");

/// One structured log line.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: Level,
    pub logger: String,
    pub message: String,
    pub module: Option<String>,
    pub function: Option<String>,
    pub line: Option<u32>,
    pub span: Option<SpanIds>,
    pub correlation_id: Option<String>,
    pub exception: Option<String>,
    pub fields: Vec<(String, Value)>,
}

impl LogRecord {
    pub fn new(level: Level, logger: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            logger: logger.into(),
            message: message.into(),
            module: None,
            function: None,
            line: None,
            span: None,
            correlation_id: None,
            exception: None,
            fields: Vec::new(),
        }
    }

    /// Fills trace ids and correlation id from the current request scope.
    pub fn with_request_context(mut self) -> Self {
        self.span = context::active_span();
        self.correlation_id = context::correlation_id();
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.push((key.into(), value.into()));
        self
    }

    pub fn to_json(&self) -> Value {
        let mut map = Map::new();
        map.insert(
            "timestamp".into(),
            self.timestamp
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .into(),
        );
        map.insert("level".into(), level_name(&self.level).into());
        map.insert("logger".into(), self.logger.clone().into());
        map.insert("message".into(), self.message.clone().into());
        map.insert(
            "module".into(),
            self.module.clone().unwrap_or_else(|| self.logger.clone()).into(),
        );
        if let Some(function) = &self.function {
            map.insert("function".into(), function.clone().into());
        }
        if let Some(line) = self.line {
            map.insert("line".into(), line.into());
        }
        if let Some(ids) = &self.span {
            map.insert("trace_id".into(), ids.trace_id_hex().into());
            map.insert("span_id".into(), ids.span_id_hex().into());
        }
        if let Some(correlation_id) = &self.correlation_id {
            map.insert("correlation_id".into(), correlation_id.clone().into());
        }
        if let Some(exception) = &self.exception {
            map.insert("exception".into(), exception.clone().into());
        }
        for (key, value) in &self.fields {
            let base = if RESERVED_KEYS.contains(&key.as_str()) {
                format!("{FIELD_NAMESPACE}{key}")
            } else {
                key.clone()
            };
            // a taken key gets the first free numeric suffix
            let mut key = base.clone();
            let mut suffix = 1;
            while map.contains_key(&key) {
                key = format!("{base}_{suffix}");
                suffix += 1;
            }
            map.insert(key, value.clone());
        }
        Value::Object(map)
    }

    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.to_json())
    }
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "TRACE",
        Level::DEBUG => "DEBUG",
        Level::INFO => "INFO",
        Level::WARN => "WARNING",
        Level::ERROR => "ERROR",
    }
}

fn render_error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str("\nCaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    exception: Option<String>,
    fields: Vec<(String, Value)>,
}

impl FieldVisitor {
    fn push(&mut self, field: &Field, value: Value) {
        // bridged `log` records carry their metadata as `log.*` fields
        if field.name().starts_with("log.") {
            return;
        }
        self.fields.push((field.name().to_string(), value));
    }
}

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = Number::from_f64(value).map_or(Value::Null, Value::Number);
        self.push(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.push(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.push(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.push(field, value.into());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.push(field, value.into());
        }
    }

    fn record_error(&mut self, _field: &Field, value: &(dyn StdError + 'static)) {
        let rendered = render_error_chain(value);
        self.exception = Some(match self.exception.take() {
            Some(previous) => format!("{previous}\n{rendered}"),
            None => rendered,
        });
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.push(field, format!("{value:?}").into());
        }
    }
}

/// Formats events as [`LogRecord`] JSON lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredFormatter;

impl<S, N> FormatEvent<S, N> for StructuredFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let record = LogRecord {
            timestamp: Utc::now(),
            level: *metadata.level(),
            logger: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            module: metadata.module_path().map(str::to_owned),
            function: ctx
                .lookup_current()
                .filter(|span| span.metadata().target() != REQUEST_SPAN_TARGET)
                .map(|span| span.name().to_string()),
            line: metadata.line(),
            span: None,
            correlation_id: None,
            exception: visitor.exception,
            fields: visitor.fields,
        }
        .with_request_context();

        let line = record.to_json_line().map_err(|_| fmt::Error)?;
        writeln!(writer, "{line}")
    }
}

/// The JSON layer writing to `make_writer`. The fmt layer writes each
/// formatted record with a single `write_all`, so lines never interleave.
pub fn json_layer<S, W>(
    make_writer: W,
) -> tracing_subscriber::fmt::Layer<S, DefaultFields, StructuredFormatter, W>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + 'static,
{
    tracing_subscriber::fmt::layer()
        .event_format(StructuredFormatter)
        .with_writer(make_writer)
}

/// Installs the global subscriber writing to stdout.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn setup_logging(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(config.log_level.as_filter().into())
            .from_env_lossy()
    });
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_format {
        registry.with(json_layer(io::stdout)).try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init()?;
    }

    tracing::info!(service = %config.service_name, "logging initialized for service");
    Ok(())
}
