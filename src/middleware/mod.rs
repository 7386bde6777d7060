//! HTTP middleware.
//!
//! [`TracingLayer`] must wrap [`MetricsLayer`]: tracing starts first and ends
//! last, so everything the metrics layer observes already runs inside the
//! request scope.

pub mod tower;

pub use self::tower::{MetricsLayer, MetricsService, TracingLayer, TracingService};
