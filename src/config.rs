//! Startup configuration for the instrumentation layer.
//!
//! Values are read once, validated, and then treated as immutable for the
//! life of the process.

use std::{env, fmt, str::FromStr, sync::Arc, sync::OnceLock, time::Duration};

use http::HeaderName;
use tracing_core::LevelFilter;

use crate::error::{Error, Result};

/// Header used to carry the correlation id when none is configured.
pub const DEFAULT_CORRELATION_HEADER: &str = "x-correlation-id";
/// OTLP/gRPC port of the trace collector.
pub const DEFAULT_COLLECTOR_PORT: u16 = 4317;

static IDENTITY: OnceLock<ServiceIdentity> = OnceLock::new();

/// Log verbosity accepted on the configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    /// The `tracing` threshold for this level. `tracing` has no critical
    /// level, so CRITICAL keeps only errors.
    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

impl FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARNING" | "WARN" => Ok(LogLevel::Warning),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            _ => Err(Error::InvalidLogLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        })
    }
}

/// Tuning for the span export queue.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Spans held before the oldest are dropped.
    pub max_queue_size: usize,
    pub max_export_batch_size: usize,
    /// Interval between exports when the queue holds less than a full batch.
    pub scheduled_delay: Duration,
    pub export_timeout: Duration,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            max_export_batch_size: 512,
            scheduled_delay: Duration::from_secs(5),
            export_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything the instrumentation layer consumes at startup.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub log_level: LogLevel,
    pub json_format: bool,
    pub collector_host: String,
    pub collector_port: u16,
    /// Full collector URL, takes precedence over host and port.
    pub collector_endpoint: Option<String>,
    pub correlation_header: HeaderName,
    pub export: ExportConfig,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            log_level: LogLevel::default(),
            json_format: true,
            collector_host: "localhost".to_string(),
            collector_port: DEFAULT_COLLECTOR_PORT,
            collector_endpoint: None,
            correlation_header: HeaderName::from_static(DEFAULT_CORRELATION_HEADER),
            export: ExportConfig::default(),
        }
    }

    /// Reads the configuration from environment variables.
    ///
    /// The service name comes from `SERVICE_NAME`, otherwise the cargo package
    /// name is used. `OTEL_EXPORTER_OTLP_ENDPOINT` overrides
    /// `COLLECTOR_HOST`/`COLLECTOR_PORT`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let service =
            lookup("SERVICE_NAME").unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        let mut config = Self::new(service);

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level.parse()?;
        }
        if let Some(json) = lookup("LOG_JSON") {
            config.json_format = parse_bool("LOG_JSON", &json)?;
        }
        if let Some(host) = lookup("COLLECTOR_HOST").or_else(|| lookup("JAEGER_HOST")) {
            config.collector_host = host;
        }
        if let Some(port) = lookup("COLLECTOR_PORT") {
            config.collector_port = port.trim().parse().map_err(|_| Error::InvalidConfig {
                key: "COLLECTOR_PORT",
                reason: format!("`{port}` is not a port number"),
            })?;
        }
        config.collector_endpoint = lookup("OTEL_EXPORTER_OTLP_ENDPOINT");
        if let Some(header) = lookup("CORRELATION_HEADER") {
            config.correlation_header =
                HeaderName::from_bytes(header.trim().as_bytes()).map_err(|_| {
                    Error::InvalidConfig {
                        key: "CORRELATION_HEADER",
                        reason: format!("`{header}` is not a valid header name"),
                    }
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Rejects values that would only fail once traffic is being served.
    pub fn validate(&self) -> Result<()> {
        if self.service_name.trim().is_empty() {
            return Err(Error::InvalidConfig {
                key: "service_name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.collector_endpoint.is_none() && self.collector_port == 0 {
            return Err(Error::InvalidConfig {
                key: "collector_port",
                reason: "must not be 0".to_string(),
            });
        }
        if self.export.max_queue_size == 0 || self.export.max_export_batch_size == 0 {
            return Err(Error::InvalidConfig {
                key: "export",
                reason: "queue size and batch size must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Address of the trace collector.
    pub fn collector_endpoint(&self) -> String {
        match &self.collector_endpoint {
            Some(endpoint) => endpoint.clone(),
            None => format!("http://{}:{}", self.collector_host, self.collector_port),
        }
    }

    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(self.service_name.as_str())
    }
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::InvalidConfig {
            key,
            reason: format!("`{value}` is not a boolean"),
        }),
    }
}

/// Process-wide identity of the running service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    service_name: Arc<str>,
}

impl ServiceIdentity {
    pub fn new(service_name: impl Into<Arc<str>>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Installs this identity for the lifetime of the process.
    ///
    /// Installing the same identity twice is a no-op; installing a different
    /// one fails.
    pub fn install(self) -> Result<&'static ServiceIdentity> {
        let installed = IDENTITY.get_or_init(|| self.clone());
        if *installed == self {
            Ok(installed)
        } else {
            Err(Error::IdentityAlreadySet(installed.service_name.to_string()))
        }
    }

    pub fn global() -> Option<&'static ServiceIdentity> {
        IDENTITY.get()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = TelemetryConfig::from_lookup(lookup(&[("SERVICE_NAME", "user-service")]))
            .unwrap();
        assert_eq!(config.service_name, "user-service");
        assert_eq!(config.log_level, LogLevel::Info);
        assert!(config.json_format);
        assert_eq!(config.collector_endpoint(), "http://localhost:4317");
        assert_eq!(config.correlation_header.as_str(), "x-correlation-id");
    }

    #[test]
    fn reads_collector_and_logging_overrides() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("SERVICE_NAME", "orders"),
            ("LOG_LEVEL", "warning"),
            ("LOG_JSON", "false"),
            ("JAEGER_HOST", "jaeger"),
            ("COLLECTOR_PORT", "14317"),
            ("CORRELATION_HEADER", "X-Request-Correlation"),
        ]))
        .unwrap();
        assert_eq!(config.log_level, LogLevel::Warning);
        assert!(!config.json_format);
        assert_eq!(config.collector_endpoint(), "http://jaeger:14317");
        assert_eq!(config.correlation_header.as_str(), "x-request-correlation");
    }

    #[test]
    fn endpoint_override_wins() {
        let config = TelemetryConfig::from_lookup(lookup(&[
            ("COLLECTOR_HOST", "ignored"),
            ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://otel:4317"),
        ]))
        .unwrap();
        assert_eq!(config.collector_endpoint(), "http://otel:4317");
    }

    #[test]
    fn invalid_values_fail_fast() {
        let err = TelemetryConfig::from_lookup(lookup(&[("LOG_LEVEL", "loud")])).unwrap_err();
        assert!(matches!(err, Error::InvalidLogLevel(level) if level == "loud"));

        let err =
            TelemetryConfig::from_lookup(lookup(&[("COLLECTOR_PORT", "http")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { key: "COLLECTOR_PORT", .. }));

        let err = TelemetryConfig::from_lookup(lookup(&[("SERVICE_NAME", "  ")])).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { key: "service_name", .. }));
    }

    #[test]
    fn log_level_mapping() {
        assert_eq!("WARN".parse::<LogLevel>().unwrap(), LogLevel::Warning);
        assert_eq!(LogLevel::Critical.as_filter(), LevelFilter::ERROR);
        assert_eq!(LogLevel::Debug.as_filter(), LevelFilter::DEBUG);
        assert_eq!(LogLevel::Warning.to_string(), "WARNING");
    }

    #[test]
    fn identity_installs_once() {
        let identity = ServiceIdentity::new("config-test-service");
        let installed = identity.clone().install().unwrap();
        assert_eq!(installed.service_name(), "config-test-service");
        assert!(identity.install().is_ok());

        let err = ServiceIdentity::new("someone-else").install().unwrap_err();
        assert!(matches!(err, Error::IdentityAlreadySet(_)));
        assert_eq!(
            ServiceIdentity::global().map(ServiceIdentity::service_name),
            Some("config-test-service")
        );
    }
}
