//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::{io, sync::Arc};

use axum::{body::Body, http::Request, Router};
use http::{HeaderMap, StatusCode};
use observability_sdk::{
    config::TelemetryConfig,
    logging,
    metrics::Metrics,
    setup::Telemetry,
    trace::{InMemorySpanExporter, SpanManager},
    user_service,
};
use opentelemetry::Value as OtelValue;
use opentelemetry_sdk::export::trace::SpanData;
use parking_lot::Mutex;
use serde_json::Value;
use tower::ServiceExt;
use tracing_subscriber::{fmt::MakeWriter, layer::SubscriberExt};

/// A user service wired to an in-memory span exporter.
pub struct TestApp {
    pub app: Router,
    pub telemetry: Telemetry,
    pub exporter: InMemorySpanExporter,
}

impl TestApp {
    pub fn new() -> Self {
        let exporter = InMemorySpanExporter::new();
        let config = TelemetryConfig::new("user-service");
        let spans = SpanManager::new(&config.identity(), exporter.clone(), &config.export).unwrap();
        let telemetry = Telemetry {
            spans,
            metrics: Metrics::new().unwrap(),
            config,
        };
        let app = user_service::router(&telemetry);
        Self {
            app,
            telemetry,
            exporter,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.telemetry.metrics
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        (status, headers, body)
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, HeaderMap, Value) {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    pub async fn finished_spans(&self) -> Vec<SpanData> {
        self.telemetry.spans.flush().await;
        self.exporter.finished_spans()
    }
}

pub fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn attribute(span: &SpanData, key: &str) -> Option<OtelValue> {
    span.attributes
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.clone())
}

/// In-memory sink for the JSON log layer.
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

impl CapturedLogs {
    /// Installs the JSON layer writing into this sink for the current thread.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(logging::json_layer(self.clone()));
        tracing::subscriber::set_default(subscriber)
    }

    pub fn records(&self) -> Vec<Value> {
        let bytes = self.0.lock().clone();
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    pub fn with_message(&self, message: &str) -> Vec<Value> {
        self.records()
            .into_iter()
            .filter(|record| record["message"] == message)
            .collect()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLogs {
    type Writer = CapturedLogs;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
