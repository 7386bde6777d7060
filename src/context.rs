//! Request-scoped context.
//!
//! Each inbound request runs inside its own [`RequestContext`] scope, a tokio
//! task-local slot that follows the request's future across every `.await`
//! instead of the worker thread that happens to poll it. Two requests
//! interleaved on one worker never observe each other's values.
//!
//! The correlation id belongs to the request: nested scopes opened for child
//! spans share it with the request scope, so an id set anywhere underneath is
//! seen by everything that runs later in the same request. The active span is
//! per scope and restored when a nested scope exits.
//!
//! Reading outside of any scope is not an error: every accessor returns
//! `None` and callers omit the field.
//!
//! Work moved onto another task with `tokio::spawn` leaves the scope. Carry
//! the context over explicitly:
//!
//! ```ignore
//! let context = RequestContext::current_or_default();
//! tokio::spawn(context.scope(async move { /* ... */ }));
//! ```

use std::{cell::RefCell, fmt, future::Future, sync::Arc};

use opentelemetry::trace::{SpanId, TraceId};
use parking_lot::Mutex;
use tokio::task::futures::TaskLocalFuture;

tokio::task_local! {
    static CURRENT: RefCell<RequestContext>;
}

/// Trace and span identifier of the active span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanIds {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl SpanIds {
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self { trace_id, span_id }
    }

    /// 32 lowercase hex digits.
    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", u128::from_be_bytes(self.trace_id.to_bytes()))
    }

    /// 16 lowercase hex digits.
    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", u64::from_be_bytes(self.span_id.to_bytes()))
    }
}

impl fmt::Display for SpanIds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.trace_id_hex(), self.span_id_hex())
    }
}

/// Values visible to everything running underneath one request.
///
/// Clones share the correlation id cell; [`RequestContext::new`] starts a new
/// one.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    correlation_id: Arc<Mutex<Option<Arc<str>>>>,
    active_span: Option<SpanIds>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(self, correlation_id: impl Into<Arc<str>>) -> Self {
        *self.correlation_id.lock() = Some(correlation_id.into());
        self
    }

    pub fn with_active_span(mut self, ids: SpanIds) -> Self {
        self.active_span = Some(ids);
        self
    }

    pub fn correlation_id(&self) -> Option<Arc<str>> {
        self.correlation_id.lock().clone()
    }

    pub fn active_span(&self) -> Option<SpanIds> {
        self.active_span
    }

    /// Handle on the enclosing scope, if there is one.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|current| current.borrow().clone()).ok()
    }

    pub fn current_or_default() -> Self {
        Self::current().unwrap_or_default()
    }

    /// Runs `future` with this context as the current one. The enclosing
    /// context, if any, is visible again once the future yields or
    /// completes.
    pub fn scope<F: Future>(self, future: F) -> TaskLocalFuture<RefCell<RequestContext>, F> {
        CURRENT.scope(RefCell::new(self), future)
    }

    /// Synchronous counterpart of [`RequestContext::scope`].
    pub fn sync_scope<R>(self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(RefCell::new(self), f)
    }
}

/// Sets the correlation id of the current request.
///
/// Returns `false` when called outside of a request scope.
pub fn set_correlation_id(correlation_id: impl Into<Arc<str>>) -> bool {
    CURRENT
        .try_with(|current| {
            *current.borrow().correlation_id.lock() = Some(correlation_id.into());
        })
        .is_ok()
}

pub fn correlation_id() -> Option<String> {
    CURRENT
        .try_with(|current| current.borrow().correlation_id())
        .ok()
        .flatten()
        .map(|id| id.to_string())
}

/// Replaces the active span of the current scope and returns the previous
/// one. Outside of a scope this does nothing.
pub(crate) fn set_active_span(ids: Option<SpanIds>) -> Option<SpanIds> {
    CURRENT
        .try_with(|current| std::mem::replace(&mut current.borrow_mut().active_span, ids))
        .ok()
        .flatten()
}

pub fn active_span() -> Option<SpanIds> {
    CURRENT
        .try_with(|current| current.borrow().active_span)
        .ok()
        .flatten()
}
