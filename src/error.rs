use opentelemetry::trace::TraceError;

/// Errors raised while configuring or wiring up instrumentation.
///
/// Request-time telemetry failures (exporter unreachable, a dropped batch) are
/// never returned through this type; they are logged and swallowed so the
/// instrumented request is unaffected.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid log level `{0}`, expected one of DEBUG, INFO, WARNING, ERROR, CRITICAL")]
    InvalidLogLevel(String),

    #[error("invalid value for `{key}`: {reason}")]
    InvalidConfig { key: &'static str, reason: String },

    #[error("service identity already installed as `{0}`")]
    IdentityAlreadySet(String),

    #[error("metric `{name}` is declared with label keys {expected:?}, got {actual:?}")]
    LabelKeyMismatch {
        name: String,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("metric `{name}` is already registered as a {kind}")]
    MetricKindConflict { name: String, kind: &'static str },

    #[error("failed to register metric `{name}`")]
    MetricRegistration {
        name: String,
        #[source]
        source: prometheus::Error,
    },

    #[error("failed to encode metrics")]
    MetricsEncoding(#[source] prometheus::Error),

    #[error(transparent)]
    Trace(#[from] TraceError),

    #[error("span export worker needs a running tokio runtime")]
    NoRuntime,

    #[error("failed to install log subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
