//! Performance timing for runtime operations
//!
//! [`PerformanceSpan`] is an RAII timer: created at the start of an operation, it logs
//! the elapsed time at `debug` when dropped. Spans shorter than their threshold are
//! dropped silently. When a span carries no threshold of its own, the process-wide
//! threshold installed by [`configure`] applies.
//!
//! ```rust
//! use cal_tracing::performance::{record_transfer, PerformanceSpan};
//!
//! {
//!     let _span = PerformanceSpan::new("copy_in", Some(100));
//!     // ... issue and wait for the copy ...
//! }
//! record_transfer(4096, "H2D", 250);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

/// Sentinel for "no global threshold"
const NO_THRESHOLD: u64 = u64::MAX;

static ENABLED: AtomicBool = AtomicBool::new(true);
static GLOBAL_THRESHOLD_US: AtomicU64 = AtomicU64::new(NO_THRESHOLD);

/// Apply process-wide performance settings (called by [`crate::init_global_tracing`])
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    GLOBAL_THRESHOLD_US.store(threshold_us.unwrap_or(NO_THRESHOLD), Ordering::Relaxed);
}

/// True when performance spans are being emitted
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match GLOBAL_THRESHOLD_US.load(Ordering::Relaxed) {
        NO_THRESHOLD => None,
        threshold => Some(threshold),
    }
}

/// RAII timer that logs its duration on drop
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start timing `span_name`; `threshold_us` overrides the global threshold
    pub fn new(span_name: &str, threshold_us: Option<u64>) -> Self {
        let span = if is_enabled() {
            tracing::debug_span!("perf", name = %span_name)
        } else {
            tracing::Span::none()
        };

        Self::with_span(span, threshold_us)
    }

    /// Time an already-built span, used by [`crate::perf_span!`] to attach fields
    pub fn with_span(span: tracing::Span, threshold_us: Option<u64>) -> Self {
        let span = if is_enabled() { span } else { tracing::Span::none() };
        Self {
            threshold_us: threshold_us.or_else(global_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter this span's context
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if self.span.is_none() {
            return;
        }
        let elapsed_us = self.elapsed_us();
        if self.threshold_us.is_none_or(|t| elapsed_us >= t) {
            let _entered = self.span.enter();
            tracing::debug!(
                duration_us = elapsed_us,
                duration_ms = elapsed_us as f64 / 1000.0,
                "performance_span_complete"
            );
        }
    }
}

/// Record a host/device transfer with its bandwidth
///
/// `direction` is `"H2D"` (remote to local) or `"D2H"` (local to remote).
pub fn record_transfer(bytes: usize, direction: &str, duration_us: u64) {
    let bandwidth_mbps = if duration_us > 0 {
        (bytes as f64 / duration_us as f64) * 1_000_000.0 / (1024.0 * 1024.0)
    } else {
        0.0
    };

    tracing::debug!(
        event = "transfer",
        bytes,
        direction,
        duration_us,
        bandwidth_mbps,
        "data_transfer"
    );
}

/// Record a completed wait on a completion token
pub fn record_wait(operation: &str, polls: u64, duration_us: u64) {
    tracing::debug!(event = "wait", operation, polls, duration_us, "completion_observed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn global_threshold_applies_when_span_has_none() {
        configure(true, Some(500));
        let span = PerformanceSpan::new("threshold", None);
        assert_eq!(span.threshold_us, Some(500));

        let explicit = PerformanceSpan::new("explicit", Some(10));
        assert_eq!(explicit.threshold_us, Some(10));
        configure(true, None);
    }

    #[test]
    #[serial]
    fn disabled_spans_are_inert() {
        configure(false, None);
        let span = PerformanceSpan::new("disabled", None);
        assert!(span.span.is_none());
        configure(true, None);
    }

    #[test]
    fn records_do_not_panic_on_zero_duration() {
        record_transfer(1024, "H2D", 0);
        record_wait("calCtxRunProgram", 3, 0);
    }
}
