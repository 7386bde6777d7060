use std::{borrow::Cow, cell::RefCell, fmt, future::Future, marker::PhantomData};

use opentelemetry::{
    trace::{Span as _, Status},
    Key, KeyValue, Value,
};
use opentelemetry_sdk::trace::Span as SdkSpan;
use tokio::task::futures::TaskLocalFuture;

use crate::context::{self, RequestContext, SpanIds};

/// Final status of a span.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error(Cow<'static, str>),
}

impl SpanStatus {
    pub fn error(description: impl Into<Cow<'static, str>>) -> Self {
        Self::Error(description.into())
    }

    fn into_otel(self) -> Status {
        match self {
            Self::Ok => Status::Ok,
            Self::Error(description) => Status::error(description),
        }
    }
}

/// A started span.
///
/// [`Span::end`] consumes the span, so nothing can be recorded on it
/// afterwards. A span dropped without being ended is ended with an error
/// status of `cancelled`.
pub struct Span {
    inner: SdkSpan,
    ids: SpanIds,
    ended: bool,
}

impl Span {
    pub(crate) fn new(inner: SdkSpan) -> Self {
        let cx = inner.span_context();
        let ids = SpanIds::new(cx.trace_id(), cx.span_id());
        Self {
            inner,
            ids,
            ended: false,
        }
    }

    pub fn ids(&self) -> SpanIds {
        self.ids
    }

    pub fn set_attribute(&mut self, key: impl Into<Key>, value: impl Into<Value>) {
        self.inner.set_attribute(KeyValue::new(key, value));
    }

    pub fn end(mut self, status: SpanStatus) {
        self.finish(status);
    }

    /// Runs `future` with this span as the active span.
    ///
    /// The future shares the correlation id of the enclosing request, so an
    /// id set inside it stays visible after it completes. Spans started
    /// inside the future become children of this one.
    pub fn attach<F: Future>(&self, future: F) -> TaskLocalFuture<RefCell<RequestContext>, F> {
        RequestContext::current_or_default()
            .with_active_span(self.ids)
            .scope(future)
    }

    /// Makes this span the active span until the guard is dropped.
    ///
    /// Only has an effect inside a request scope; use [`Span::attach`] for
    /// async code.
    pub fn enter(&self) -> Entered<'_> {
        let previous = context::set_active_span(Some(self.ids));
        Entered {
            previous,
            _span: PhantomData,
        }
    }

    fn finish(&mut self, status: SpanStatus) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.inner.set_status(status.into_otel());
        self.inner.end();
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("ids", &self.ids)
            .field("ended", &self.ended)
            .finish()
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish(SpanStatus::error("cancelled"));
    }
}

/// Guard returned by [`Span::enter`].
#[must_use = "the span stops being active when the guard is dropped"]
pub struct Entered<'a> {
    previous: Option<SpanIds>,
    // restoring on another thread would clobber an unrelated scope
    _span: PhantomData<(&'a Span, *const ())>,
}

impl Drop for Entered<'_> {
    fn drop(&mut self) {
        context::set_active_span(self.previous);
    }
}
