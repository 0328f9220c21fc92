//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! Fusion exposes the following metrics:
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `fusion_skirmish_contended` | Counter | Skirmish acquisitions that had to wait |
//! | `fusion_skirmish_broken` | Counter | Skirmishes taken over from departed holders |
//! | `fusion_calls_executed` | Counter | Call handler invocations |
//! | `fusion_calls_denied` | Counter | Calls rejected by permissions |
//! | `fusion_call_latency_ns` | Histogram | Blocking call round trip |
//! | `fusion_reactor_deliveries` | Counter | Notifications delivered to reactions |
//! | `fusion_objects_live` | Gauge | Live objects per object pool |
//! | `fusion_pool_bytes_used` | Gauge | Bytes allocated per shared pool |
//! | `fusion_pool_exhausted` | Counter | Failed allocations |
//! | `fusion_mailbox_depth` | Gauge | Messages pending per member |
//!
//! ## Tracing
//!
//! Every dispatcher thread runs inside a [`span_world`] span; each handled
//! message gets a [`span_message`] span.
//!
//! ## Example
//!
//! [`World::enter`](crate::World::enter) describes the metrics on first
//! use; install any `metrics` recorder to collect them.
//!
//! ```rust
//! use fusion::observability::init_metrics;
//!
//! init_metrics();
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{
    CallMetrics, TimerGuard, init_metrics, record_call_denied, record_mailbox_depth,
    record_objects_live, record_pool_bytes_used, record_pool_exhausted,
    record_reactor_deliveries, record_skirmish_broken, record_skirmish_contended,
};
pub use tracing_support::{span_message, span_world, trace_lock_broken, trace_zombie};
