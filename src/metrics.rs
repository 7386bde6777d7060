//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_requests_total` (counter): method, endpoint, status
//! - `http_request_duration_seconds` (histogram): method, endpoint
//! - `http_requests_in_progress` (gauge): method, endpoint
//! - `business_operations_total` (counter): operation, status
//! - `business_operation_duration_seconds` (histogram): operation
//!
//! Every metric name owns a fixed set of label keys. Using a name with
//! different keys is a configuration error, never a second series family.
//! Series values are atomics; the per-family child lookup is the only lock
//! on the hot path.

use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
    time::Instant,
};

use parking_lot::RwLock;
use prometheus::{
    proto::{LabelPair, MetricType},
    Encoder, HistogramOpts, HistogramTimer, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// Media type of the text exposition format.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Latency buckets in seconds, 5ms to 10s.
pub const DURATION_BUCKETS: [f64; 14] = [
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

const STANDARD_FAMILIES: [(&str, &str); 5] = [
    ("http_requests_total", "counter"),
    ("http_request_duration_seconds", "histogram"),
    ("http_requests_in_progress", "gauge"),
    ("business_operations_total", "counter"),
    ("business_operation_duration_seconds", "histogram"),
];

/// Registry shared by the middleware and request handlers.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Registry,
    http_requests_total: IntCounterVec,
    http_request_duration_seconds: HistogramVec,
    http_requests_in_progress: IntGaugeVec,
    business_operations_total: IntCounterVec,
    business_operation_duration_seconds: HistogramVec,
    custom_counters: RwLock<HashMap<String, CustomCounter>>,
}

enum CustomCounter {
    Plain(IntCounter),
    Labeled {
        keys: Vec<String>,
        counter: IntCounterVec,
    },
}

impl CustomCounter {
    fn keys(&self) -> &[String] {
        match self {
            CustomCounter::Plain(_) => &[],
            CustomCounter::Labeled { keys, .. } => keys,
        }
    }

    fn increment(&self, name: &str, keys: &[String], labels: &[(&str, &str)]) -> Result<()> {
        if self.keys() != keys {
            return Err(Error::LabelKeyMismatch {
                name: name.to_string(),
                expected: self.keys().to_vec(),
                actual: keys.to_vec(),
            });
        }
        match self {
            CustomCounter::Plain(counter) => counter.inc(),
            CustomCounter::Labeled { counter, .. } => {
                let labels: HashMap<&str, &str> = labels.iter().copied().collect();
                counter
                    .get_metric_with(&labels)
                    .map_err(|source| Error::MetricRegistration {
                        name: name.to_string(),
                        source,
                    })?
                    .inc();
            }
        }
        Ok(())
    }
}

impl Metrics {
    /// Creates a registry with the standard request and business families.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Total HTTP requests"),
            &["method", "endpoint", "status"],
        )
        .map_err(registration("http_requests_total"))?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["method", "endpoint"],
        )
        .map_err(registration("http_request_duration_seconds"))?;
        let http_requests_in_progress = IntGaugeVec::new(
            Opts::new(
                "http_requests_in_progress",
                "Number of HTTP requests in progress",
            ),
            &["method", "endpoint"],
        )
        .map_err(registration("http_requests_in_progress"))?;
        let business_operations_total = IntCounterVec::new(
            Opts::new("business_operations_total", "Total business operations"),
            &["operation", "status"],
        )
        .map_err(registration("business_operations_total"))?;
        let business_operation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "business_operation_duration_seconds",
                "Business operation duration in seconds",
            )
            .buckets(DURATION_BUCKETS.to_vec()),
            &["operation"],
        )
        .map_err(registration("business_operation_duration_seconds"))?;

        registry
            .register(Box::new(http_requests_total.clone()))
            .map_err(registration("http_requests_total"))?;
        registry
            .register(Box::new(http_request_duration_seconds.clone()))
            .map_err(registration("http_request_duration_seconds"))?;
        registry
            .register(Box::new(http_requests_in_progress.clone()))
            .map_err(registration("http_requests_in_progress"))?;
        registry
            .register(Box::new(business_operations_total.clone()))
            .map_err(registration("business_operations_total"))?;
        registry
            .register(Box::new(business_operation_duration_seconds.clone()))
            .map_err(registration("business_operation_duration_seconds"))?;

        Ok(Self {
            inner: Arc::new(MetricsInner {
                registry,
                http_requests_total,
                http_request_duration_seconds,
                http_requests_in_progress,
                business_operations_total,
                business_operation_duration_seconds,
                custom_counters: RwLock::new(HashMap::new()),
            }),
        })
    }

    /// Counts one business operation outcome.
    pub fn record_operation(&self, operation: &str, status: &str) {
        self.inner
            .business_operations_total
            .with_label_values(&[operation, status])
            .inc();
    }

    /// Starts timing a business operation. The elapsed time is observed when
    /// the timer is dropped, whichever way the enclosing scope is left.
    pub fn time_operation(&self, operation: &str) -> HistogramTimer {
        self.inner
            .business_operation_duration_seconds
            .with_label_values(&[operation])
            .start_timer()
    }

    /// Increments an ad hoc counter, registering it on first use.
    ///
    /// The label keys seen on first use are fixed for the name; later calls
    /// with other keys fail, as do names owned by the standard families.
    pub fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) -> Result<()> {
        let mut keys: Vec<String> = labels.iter().map(|(key, _)| key.to_string()).collect();
        keys.sort();

        if let Some(counter) = self.inner.custom_counters.read().get(name) {
            return counter.increment(name, &keys, labels);
        }

        let mut counters = self.inner.custom_counters.write();
        let counter = match counters.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(self.register_counter(name, &keys)?),
        };
        counter.increment(name, &keys, labels)
    }

    fn register_counter(&self, name: &str, keys: &[String]) -> Result<CustomCounter> {
        if let Some((_, kind)) = STANDARD_FAMILIES.iter().find(|(family, _)| *family == name) {
            return Err(Error::MetricKindConflict {
                name: name.to_string(),
                kind: *kind,
            });
        }

        let opts = Opts::new(name, format!("Custom counter: {name}"));
        let counter = if keys.is_empty() {
            let counter = IntCounter::with_opts(opts).map_err(registration(name))?;
            self.inner
                .registry
                .register(Box::new(counter.clone()))
                .map_err(registration(name))?;
            CustomCounter::Plain(counter)
        } else {
            let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
            let counter = IntCounterVec::new(opts, &key_refs).map_err(registration(name))?;
            self.inner
                .registry
                .register(Box::new(counter.clone()))
                .map_err(registration(name))?;
            CustomCounter::Labeled {
                keys: keys.to_vec(),
                counter,
            }
        };

        tracing::debug!(metric = name, labels = ?keys, "registered custom counter");
        Ok(counter)
    }

    /// Marks an HTTP request as in flight until the returned guard drops.
    pub fn track_http_request(&self, method: &str, endpoint: &str) -> HttpRequestGuard {
        let in_progress = self
            .inner
            .http_requests_in_progress
            .with_label_values(&[method, endpoint]);
        in_progress.inc();

        HttpRequestGuard {
            metrics: self.clone(),
            method: method.to_string(),
            endpoint: endpoint.to_string(),
            status: None,
            in_progress,
            started: Instant::now(),
        }
    }

    /// Renders every series in the text exposition format.
    pub fn render(&self) -> Result<String> {
        let families = self.inner.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(Error::MetricsEncoding)?;
        String::from_utf8(buffer)
            .map_err(|err| Error::MetricsEncoding(prometheus::Error::Msg(err.to_string())))
    }

    /// Current value of the series with exactly these labels. Histograms
    /// report their observation count.
    pub fn sample(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let family = self
            .inner
            .registry
            .gather()
            .into_iter()
            .find(|family| family.get_name() == name)?;
        let metric = family
            .get_metric()
            .iter()
            .find(|metric| labels_match(metric.get_label(), labels))?;

        match family.get_field_type() {
            MetricType::COUNTER => Some(metric.get_counter().get_value()),
            MetricType::GAUGE => Some(metric.get_gauge().get_value()),
            MetricType::HISTOGRAM => Some(metric.get_histogram().get_sample_count() as f64),
            _ => None,
        }
    }

    /// Scrape response for axum routers.
    #[cfg(feature = "axum")]
    pub fn exposition(&self) -> axum::response::Response {
        use axum::{http::header, http::StatusCode, response::IntoResponse};

        match self.render() {
            Ok(body) => ([(header::CONTENT_TYPE, CONTENT_TYPE)], body).into_response(),
            Err(err) => {
                tracing::error!(error = &err as &dyn std::error::Error, "failed to render metrics");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

fn registration(name: &str) -> impl FnOnce(prometheus::Error) -> Error + '_ {
    move |source| Error::MetricRegistration {
        name: name.to_string(),
        source,
    }
}

fn labels_match(actual: &[LabelPair], expected: &[(&str, &str)]) -> bool {
    actual.len() == expected.len()
        && expected.iter().all(|(key, value)| {
            actual
                .iter()
                .any(|pair| pair.get_name() == *key && pair.get_value() == *value)
        })
}

/// In-flight bookkeeping for one HTTP request.
///
/// Dropping the guard counts the request under the recorded status (500 when
/// none was recorded), observes its duration and releases the in-progress
/// gauge.
pub struct HttpRequestGuard {
    metrics: Metrics,
    method: String,
    endpoint: String,
    status: Option<u16>,
    in_progress: IntGauge,
    started: Instant,
}

impl HttpRequestGuard {
    pub fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }
}

impl Drop for HttpRequestGuard {
    fn drop(&mut self) {
        let status = self.status.unwrap_or(500).to_string();
        let inner = &self.metrics.inner;
        inner
            .http_requests_total
            .with_label_values(&[self.method.as_str(), self.endpoint.as_str(), status.as_str()])
            .inc();
        inner
            .http_request_duration_seconds
            .with_label_values(&[self.method.as_str(), self.endpoint.as_str()])
            .observe(self.started.elapsed().as_secs_f64());
        self.in_progress.dec();
    }
}
