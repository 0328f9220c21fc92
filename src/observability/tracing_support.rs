//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Create a span for one World member.
///
/// The dispatcher thread runs inside this span, so everything it logs
/// carries the World index and the member's FusionID.
///
/// # Example
///
/// ```rust
/// use fusion::observability::span_world;
///
/// let span = span_world(0, 1);
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_world(world_index: u32, fusion_id: u32) -> Span {
    span!(Level::INFO, "world", index = world_index, fusion_id = fusion_id)
}

/// Create a span for one message handled by a dispatcher.
#[inline]
pub fn span_message(kind: &str, sender: u32, serial: u64) -> Span {
    span!(
        Level::DEBUG,
        "message",
        kind = %kind,
        sender = sender,
        serial = serial
    )
}

/// Log a lock taken over from a member that left.
#[inline]
pub fn trace_lock_broken(name: &str, dead_holder: u32, new_holder: u32) {
    tracing::warn!(
        skirmish = %name,
        dead_holder,
        new_holder,
        "breaking skirmish held by departed member"
    );
}

/// Log an object destroyed while its pool was being torn down.
#[inline]
pub fn trace_zombie(pool: &str, id: u32, refs: u32) {
    tracing::warn!(pool = %pool, id, refs, "destroying zombie object");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        let _span = span_world(0, 1);
        let _span = span_message("call", 2, 7);
    }

    #[test]
    fn test_instrumentation() {
        let _guard = span_world(3, 1).entered();
        trace_lock_broken("lock", 2, 1);
        trace_zombie("surfaces", 4, 1);
    }
}
