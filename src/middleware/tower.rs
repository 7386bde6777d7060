use std::{
    fmt,
    sync::Arc,
    task::{Context, Poll},
};

use futures_util::future::BoxFuture;
use http::{HeaderName, HeaderValue, Request, Response};
use opentelemetry::trace::SpanKind;
use tower::Service;
use tower_layer::Layer;
use tracing::Instrument;

use crate::{
    context::{self, RequestContext},
    http_injector, logging,
    metrics::Metrics,
    trace::{SpanManager, SpanStatus},
};

/// Opens the request scope and the server span around route handlers.
///
/// Generally, the middleware should be used on every http route, this usually
/// means that it can be registered globally and in the last position, to be the
/// first to run. Stack it outside of [`MetricsLayer`] so request metrics are
/// recorded inside the request scope.
///
/// For every request the layer
/// - reads the correlation id header into a fresh [`RequestContext`],
/// - starts a `SERVER` span named `"{method} {path}"`, continuing a trace
///   propagated through the request headers,
/// - runs the rest of the stack inside a `request` tracing span,
/// - echoes the correlation id on the response.
///
/// The span ends with an error status for 5xx responses and for errors of
/// the inner service; errors are passed on unchanged.
///
/// ```ignore
/// let app = Router::new()
///     .route("/users", get(list_users))
///     .layer(
///         ServiceBuilder::new()
///             .layer(TracingLayer::new(spans, correlation_header))
///             .layer(MetricsLayer::new(metrics)),
///     );
/// ```
#[derive(Clone)]
pub struct TracingLayer {
    spans: SpanManager,
    correlation_header: HeaderName,
}

impl TracingLayer {
    pub fn new(spans: SpanManager, correlation_header: HeaderName) -> Self {
        Self {
            spans,
            correlation_header,
        }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, service: S) -> Self::Service {
        TracingService {
            service,
            spans: self.spans.clone(),
            correlation_header: self.correlation_header.clone(),
        }
    }
}

/// Service created by [`TracingLayer`].
#[derive(Clone)]
pub struct TracingService<S> {
    service: S,
    spans: SpanManager,
    correlation_header: HeaderName,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TracingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: fmt::Display + Send + 'static,
    ResBody: Send + 'static,
{
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = Response<ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let method = request.method().clone();
        let path = request.uri().path().to_owned();

        let parent = http_injector::extract_remote_context(request.headers());
        let mut span = self.spans.start_span_with_parent(
            format!("{method} {path}"),
            SpanKind::Server,
            &parent,
        );
        span.set_attribute("http.method", method.to_string());
        span.set_attribute("http.url", request.uri().to_string());
        span.set_attribute("http.route", route(&request));
        if let Some(client_ip) = client_ip(&request) {
            span.set_attribute("http.client_ip", client_ip);
        }

        let mut scope = RequestContext::new().with_active_span(span.ids());
        if let Some(correlation_id) = request
            .headers()
            .get(&self.correlation_header)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.is_empty())
        {
            scope = scope.with_correlation_id(Arc::<str>::from(correlation_id));
        }

        let request_span =
            tracing::info_span!(target: logging::REQUEST_SPAN_TARGET, "request", %method, %path);
        let future = request_span.in_scope(|| {
            scope
                .clone()
                .sync_scope(|| self.service.call(request))
        });
        let correlation_header = self.correlation_header.clone();

        Box::pin(async move {
            let (mut result, correlation_id) = scope
                .scope(async move {
                    let result = future.await;
                    (result, context::correlation_id())
                })
                .instrument(request_span)
                .await;

            match &mut result {
                Ok(response) => {
                    let status = response.status();
                    span.set_attribute("http.status_code", i64::from(status.as_u16()));
                    if let Some(value) =
                        correlation_id.and_then(|id| HeaderValue::try_from(id).ok())
                    {
                        response.headers_mut().insert(correlation_header, value);
                    }
                    if status.is_server_error() {
                        span.end(SpanStatus::error(status.to_string()));
                    } else {
                        span.end(SpanStatus::Ok);
                    }
                }
                Err(err) => {
                    span.set_attribute("http.status_code", 500_i64);
                    span.end(SpanStatus::error(err.to_string()));
                }
            }

            result
        })
    }
}

/// Records the RED metrics of every request passing through.
///
/// The in-progress gauge is released on every exit path: a response, an
/// error of the inner service, or the request future being dropped. Errors
/// and dropped requests are counted with status 500; errors are passed on
/// unchanged.
#[derive(Clone)]
pub struct MetricsLayer {
    metrics: Metrics,
}

impl MetricsLayer {
    pub fn new(metrics: Metrics) -> Self {
        Self { metrics }
    }
}

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, service: S) -> Self::Service {
        MetricsService {
            service,
            metrics: self.metrics.clone(),
        }
    }
}

/// Service created by [`MetricsLayer`].
#[derive(Clone)]
pub struct MetricsService<S> {
    service: S,
    metrics: Metrics,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for MetricsService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;
    type Response = Response<ResBody>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        let mut guard = self
            .metrics
            .track_http_request(request.method().as_str(), &route(&request));
        let future = self.service.call(request);

        Box::pin(async move {
            let result = future.await;
            if let Ok(response) = &result {
                guard.set_status(response.status().as_u16());
            }
            result
        })
    }
}

/// Route template the request matched, falling back to the raw path.
#[cfg(feature = "axum")]
fn route<B>(request: &Request<B>) -> String {
    request
        .extensions()
        .get::<axum::extract::MatchedPath>()
        .map_or_else(|| request.uri().path(), |matched| matched.as_str())
        .to_owned()
}

#[cfg(not(feature = "axum"))]
fn route<B>(request: &Request<B>) -> String {
    request.uri().path().to_owned()
}

fn client_ip<B>(request: &Request<B>) -> Option<String> {
    peer_ip(request).or_else(|| {
        request
            .headers()
            .get("x-forwarded-for")?
            .to_str()
            .ok()?
            .split(',')
            .map(str::trim)
            .find(|ip| !ip.is_empty())
            .map(str::to_owned)
    })
}

#[cfg(feature = "axum")]
fn peer_ip<B>(request: &Request<B>) -> Option<String> {
    request
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|axum::extract::ConnectInfo(addr)| addr.ip().to_string())
}

#[cfg(not(feature = "axum"))]
fn peer_ip<B>(_request: &Request<B>) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, time::Duration};

    use http::StatusCode;
    use opentelemetry::{trace::Status, Value};
    use opentelemetry_sdk::export::trace::SpanData;
    use tower::{service_fn, ServiceBuilder, ServiceExt};

    use super::*;
    use crate::{
        config::{ExportConfig, ServiceIdentity},
        trace::InMemorySpanExporter,
    };

    const CORRELATION: HeaderName = HeaderName::from_static("x-correlation-id");

    fn span_manager() -> (SpanManager, InMemorySpanExporter) {
        let exporter = InMemorySpanExporter::new();
        let spans = SpanManager::new(
            &ServiceIdentity::new("middleware-test"),
            exporter.clone(),
            &ExportConfig::default(),
        )
        .unwrap();
        (spans, exporter)
    }

    fn attribute(span: &SpanData, key: &str) -> Option<Value> {
        span.attributes
            .iter()
            .find(|kv| kv.key.as_str() == key)
            .map(|kv| kv.value.clone())
    }

    #[tokio::test]
    async fn publishes_request_context_to_handler() {
        let (spans, exporter) = span_manager();
        let service = TracingLayer::new(spans.clone(), CORRELATION).layer(service_fn(
            |_req: Request<()>| async {
                let active = context::active_span();
                let body = context::correlation_id().unwrap_or_default();
                assert!(active.is_some());
                Ok::<_, Infallible>(Response::new(body))
            },
        ));

        let request = Request::get("/users?limit=1")
            .header("x-correlation-id", "abc")
            .header("x-forwarded-for", "10.1.2.3, 10.0.0.1")
            .body(())
            .unwrap();
        let response = service.oneshot(request).await.unwrap();
        assert_eq!(response.body(), "abc");
        assert_eq!(response.headers()["x-correlation-id"], "abc");

        spans.flush().await;
        let finished = exporter.finished_spans();
        assert_eq!(finished.len(), 1);
        let span = &finished[0];
        assert_eq!(span.name, "GET /users");
        assert_eq!(span.span_kind, SpanKind::Server);
        assert_eq!(span.status, Status::Ok);
        assert_eq!(attribute(span, "http.method"), Some(Value::from("GET")));
        assert_eq!(attribute(span, "http.url"), Some(Value::from("/users?limit=1")));
        assert_eq!(attribute(span, "http.status_code"), Some(Value::I64(200)));
        assert_eq!(attribute(span, "http.client_ip"), Some(Value::from("10.1.2.3")));
    }

    #[tokio::test]
    async fn without_header_no_correlation_id_is_made_up() {
        let (spans, _exporter) = span_manager();
        let service = TracingLayer::new(spans, CORRELATION).layer(service_fn(
            |_req: Request<()>| async {
                Ok::<_, Infallible>(Response::new(context::correlation_id()))
            },
        ));

        let response = service.oneshot(Request::new(())).await.unwrap();
        assert_eq!(response.body(), &None);
        assert!(response.headers().get("x-correlation-id").is_none());
    }

    #[tokio::test]
    async fn echoes_correlation_id_set_in_child_span() {
        let (spans, _exporter) = span_manager();
        let handler_spans = spans.clone();
        let service = TracingLayer::new(spans, CORRELATION).layer(service_fn(
            move |_req: Request<()>| {
                let spans = handler_spans.clone();
                async move {
                    let child = spans.start_span("assign_id", SpanKind::Internal);
                    child
                        .attach(async {
                            context::set_correlation_id("from-handler");
                        })
                        .await;
                    child.end(SpanStatus::Ok);
                    Ok::<_, Infallible>(Response::new(()))
                }
            },
        ));

        let response = service.oneshot(Request::new(())).await.unwrap();
        assert_eq!(response.headers()["x-correlation-id"], "from-handler");
    }

    #[tokio::test]
    async fn echoes_correlation_id_set_before_first_poll() {
        let (spans, _exporter) = span_manager();
        let service = TracingLayer::new(spans, CORRELATION).layer(service_fn(
            |_req: Request<()>| {
                context::set_correlation_id("assigned-in-call");
                async { Ok::<_, Infallible>(Response::new(context::correlation_id())) }
            },
        ));

        let response = service.oneshot(Request::new(())).await.unwrap();
        assert_eq!(response.body().as_deref(), Some("assigned-in-call"));
        assert_eq!(response.headers()["x-correlation-id"], "assigned-in-call");
    }

    #[tokio::test]
    async fn server_errors_mark_the_span() {
        let (spans, exporter) = span_manager();
        let service = TracingLayer::new(spans.clone(), CORRELATION).layer(service_fn(
            |_req: Request<()>| async {
                let mut response = Response::new(());
                *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                Ok::<_, Infallible>(response)
            },
        ));

        service.oneshot(Request::new(())).await.unwrap();
        spans.flush().await;

        let finished = exporter.finished_spans();
        assert_eq!(finished[0].status, Status::error("503 Service Unavailable"));
        assert_eq!(attribute(&finished[0], "http.status_code"), Some(Value::I64(503)));
    }

    #[tokio::test]
    async fn inner_errors_propagate_unchanged() {
        let (spans, exporter) = span_manager();
        let metrics = Metrics::new().unwrap();
        let service = ServiceBuilder::new()
            .layer(TracingLayer::new(spans.clone(), CORRELATION))
            .layer(MetricsLayer::new(metrics.clone()))
            .service(service_fn(|_req: Request<()>| async {
                Err::<Response<()>, _>("database on fire")
            }));

        let err = service
            .oneshot(Request::post("/users").body(()).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err, "database on fire");

        spans.flush().await;
        let finished = exporter.finished_spans();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, Status::error("database on fire"));

        let labels = [("method", "POST"), ("endpoint", "/users"), ("status", "500")];
        assert_eq!(metrics.sample("http_requests_total", &labels), Some(1.0));
        assert_eq!(
            metrics.sample(
                "http_requests_in_progress",
                &[("method", "POST"), ("endpoint", "/users")]
            ),
            Some(0.0)
        );
    }

    #[tokio::test]
    async fn cancelled_request_releases_gauge_and_ends_span() {
        let (spans, exporter) = span_manager();
        let metrics = Metrics::new().unwrap();
        let service = ServiceBuilder::new()
            .layer(TracingLayer::new(spans.clone(), CORRELATION))
            .layer(MetricsLayer::new(metrics.clone()))
            .service(service_fn(|_req: Request<()>| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, Infallible>(Response::new(()))
            }));

        let request = Request::get("/slow").body(()).unwrap();
        let outcome =
            tokio::time::timeout(Duration::from_millis(20), service.oneshot(request)).await;
        assert!(outcome.is_err());

        let in_progress = [("method", "GET"), ("endpoint", "/slow")];
        assert_eq!(metrics.sample("http_requests_in_progress", &in_progress), Some(0.0));
        assert_eq!(
            metrics.sample(
                "http_requests_total",
                &[("method", "GET"), ("endpoint", "/slow"), ("status", "500")]
            ),
            Some(1.0)
        );

        spans.flush().await;
        let finished = exporter.finished_spans();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].status, Status::error("cancelled"));
    }

    #[tokio::test]
    async fn continues_inbound_trace() {
        let (spans, exporter) = span_manager();
        opentelemetry::global::set_text_map_propagator(
            opentelemetry_sdk::propagation::TraceContextPropagator::new(),
        );
        let service = TracingLayer::new(spans.clone(), CORRELATION).layer(service_fn(
            |_req: Request<()>| async { Ok::<_, Infallible>(Response::new(())) },
        ));

        let request = Request::get("/")
            .header(
                "traceparent",
                "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01",
            )
            .body(())
            .unwrap();
        service.oneshot(request).await.unwrap();
        spans.flush().await;

        let finished = exporter.finished_spans();
        assert_eq!(
            finished[0].span_context.trace_id(),
            opentelemetry::trace::TraceId::from(0x4bf92f3577b34da6a3ce929d0e0e4736)
        );
    }
}
