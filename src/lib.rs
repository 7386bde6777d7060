//! # Observability SDK
//! This crate provides helpers to instrument HTTP services with structured
//! logs, Prometheus metrics and distributed traces that all agree on which
//! request they belong to.
//!
//! ## Setup
//! Logging, tracing and metrics can be set up using [`setup::setup`]. This
//! should be the first call of any server binary, from within the tokio
//! runtime. The returned [`setup::Telemetry`] must be shut down before the
//! process exits so pending spans are exported.
//!
//! ## Request context
//! [`context::RequestContext`] is the per-request slot holding the
//! correlation id and the active span. Log records and child spans read it
//! from there.
//!
//! ## Http Trace Propagation
//! [`http_injector`] provides functions for injecting and extracting tracing
//! data into/from [`http::Request`]s.
//!
//! When using [`tower`](https://docs.rs/tower) based http frameworks like
//! [`axum`](https://docs.rs/axum/latest/axum), the layers in [`middleware`]
//! open the request context, the server span and the request metrics.
//!
//! Generally, the middleware should be used on every http route, this usually
//! means that it can be registered globally and in the last position, to be the
//! first to run.

pub mod config;
pub mod context;
pub mod error;
pub mod http_injector;
pub mod logging;
pub mod metrics;
#[cfg(feature = "tower")]
pub mod middleware;
pub mod setup;
pub mod trace;
#[cfg(feature = "axum")]
pub mod user_service;

pub use error::{Error, Result};
