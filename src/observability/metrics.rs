//! Metrics collection using metrics-rs.

use metrics::{Counter, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const SKIRMISH_CONTENDED: &str = "fusion_skirmish_contended";
const SKIRMISH_BROKEN: &str = "fusion_skirmish_broken";
const CALLS_EXECUTED: &str = "fusion_calls_executed";
const CALLS_DENIED: &str = "fusion_calls_denied";
const CALL_LATENCY_NS: &str = "fusion_call_latency_ns";
const REACTOR_DELIVERIES: &str = "fusion_reactor_deliveries";
const OBJECTS_LIVE: &str = "fusion_objects_live";
const POOL_BYTES_USED: &str = "fusion_pool_bytes_used";
const POOL_EXHAUSTED: &str = "fusion_pool_exhausted";
const MAILBOX_DEPTH: &str = "fusion_mailbox_depth";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        SKIRMISH_CONTENDED,
        Unit::Count,
        "Skirmish acquisitions that had to wait for another holder"
    );
    metrics::describe_counter!(
        SKIRMISH_BROKEN,
        Unit::Count,
        "Skirmishes taken over from a holder that left the World"
    );
    metrics::describe_counter!(
        CALLS_EXECUTED,
        Unit::Count,
        "FusionCall handler invocations in the owner process"
    );
    metrics::describe_counter!(
        CALLS_DENIED,
        Unit::Count,
        "FusionCall executions rejected for missing permissions"
    );
    metrics::describe_histogram!(
        CALL_LATENCY_NS,
        Unit::Nanoseconds,
        "Round trip time of blocking FusionCall executions"
    );
    metrics::describe_counter!(
        REACTOR_DELIVERIES,
        Unit::Count,
        "Notifications delivered to reactions"
    );
    metrics::describe_gauge!(OBJECTS_LIVE, Unit::Count, "Objects alive per object pool");
    metrics::describe_gauge!(POOL_BYTES_USED, Unit::Bytes, "Bytes allocated per shared pool");
    metrics::describe_counter!(
        POOL_EXHAUSTED,
        Unit::Count,
        "Allocations that failed because the pool was full"
    );
    metrics::describe_gauge!(
        MAILBOX_DEPTH,
        Unit::Count,
        "Messages pending in a member's mailbox"
    );
}

/// Record a Skirmish acquisition that had to wait.
#[inline]
pub fn record_skirmish_contended(name: &str) {
    counter!(SKIRMISH_CONTENDED, "skirmish" => name.to_string()).increment(1);
}

/// Record a Skirmish broken because its holder left.
#[inline]
pub fn record_skirmish_broken(name: &str) {
    counter!(SKIRMISH_BROKEN, "skirmish" => name.to_string()).increment(1);
}

/// Record a call rejected by the permission check.
#[inline]
pub fn record_call_denied(call_id: u32) {
    counter!(CALLS_DENIED, "call" => call_id.to_string()).increment(1);
}

/// Record a notification delivered to `count` reactions.
#[inline]
pub fn record_reactor_deliveries(reactor_id: u32, count: usize) {
    if count > 0 {
        counter!(REACTOR_DELIVERIES, "reactor" => reactor_id.to_string()).increment(count as u64);
    }
}

/// Record the number of live objects in an object pool.
#[inline]
pub fn record_objects_live(pool_name: &str, live: usize) {
    gauge!(OBJECTS_LIVE, "pool" => pool_name.to_string()).set(live as f64);
}

/// Record bytes in use in a shared pool.
#[inline]
pub fn record_pool_bytes_used(pool_id: u16, bytes: u64) {
    gauge!(POOL_BYTES_USED, "pool" => pool_id.to_string()).set(bytes as f64);
}

/// Record an allocation failure.
#[inline]
pub fn record_pool_exhausted(pool_id: u16) {
    counter!(POOL_EXHAUSTED, "pool" => pool_id.to_string()).increment(1);
}

/// Record mailbox depth (pending messages).
#[inline]
pub fn record_mailbox_depth(fusion_id: u32, depth: usize) {
    gauge!(MAILBOX_DEPTH, "fusion_id" => fusion_id.to_string()).set(depth as f64);
}

/// Metrics collector for one FusionCall.
///
/// Provides a convenient way to record metrics with pre-configured labels.
#[derive(Clone)]
pub struct CallMetrics {
    call_id: u32,
    executed: Counter,
    latency: Histogram,
}

impl CallMetrics {
    /// Create a new call metrics collector.
    pub fn new(call_id: u32) -> Self {
        Self {
            call_id,
            executed: counter!(CALLS_EXECUTED, "call" => call_id.to_string()),
            latency: histogram!(CALL_LATENCY_NS, "call" => call_id.to_string()),
        }
    }

    /// Record one handler invocation.
    #[inline]
    pub fn record_executed(&self) {
        self.executed.increment(1);
    }

    /// Record a round trip time.
    #[inline]
    pub fn record_latency(&self, duration: Duration) {
        self.latency.record(duration.as_nanos() as f64);
    }

    /// Start a timer and return a guard that records on drop.
    pub fn start_timer(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// The call id.
    pub fn call_id(&self) -> u32 {
        self.call_id
    }
}

/// Guard that records call latency when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    metrics: &'a CallMetrics,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_latency(self.start.elapsed());
    }
}
