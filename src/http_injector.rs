use http::{HeaderMap, HeaderName, HeaderValue, Request};
use opentelemetry::{
    global,
    propagation::{Extractor, Injector},
    Context,
};

use crate::{context, trace};

/// Builds the parent [`Context`] carried by inbound request headers.
///
/// Understands whatever the global propagator was configured with; after
/// [`setup`](crate::setup::setup) that is W3C `traceparent` and Jaeger
/// `uber-trace-id`. Without usable headers the returned context is empty.
pub fn extract_remote_context(headers: &HeaderMap) -> Context {
    global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
}

/// Injects the active span and the correlation id of the current request
/// into an outbound request, so the downstream service continues the same
/// trace and logs under the same correlation id.
pub fn inject_context_into_request<'a, T>(
    request: &'a mut Request<T>,
    correlation_header: &HeaderName,
) -> &'a mut Request<T> {
    if let Some(ids) = context::active_span() {
        let cx = trace::parent_context(ids);
        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut HeaderInjector(request.headers_mut()))
        });
    }

    if let Some(correlation_id) = context::correlation_id() {
        match HeaderValue::try_from(correlation_id) {
            Ok(value) => {
                request
                    .headers_mut()
                    .insert(correlation_header.clone(), value);
            }
            Err(err) => tracing::debug!(%err, "correlation id is not a valid header value"),
        }
    }

    request
}

// "traceparent" => https://www.w3.org/TR/trace-context/#trace-context-http-headers-format

/// Lets the propagator write its headers, for example a `traceparent` value
/// of the form "{version}-{trace_id}-{span_id}-{trace_flags}".
struct HeaderInjector<'a>(&'a mut HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        let Ok(key) = key.parse::<HeaderName>() else {
            tracing::debug!(%key, "failed to parse header name");
            return;
        };
        let Ok(value) = value.parse() else {
            tracing::debug!(%value, "failed to parse header value");
            return;
        };
        self.0.insert(key, value);
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|h| h.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|s| s.as_str()).collect()
    }
}
