//! Instrumentation macros

/// Start a [`crate::performance::PerformanceSpan`], optionally with span fields.
///
/// ```rust
/// use cal_tracing::perf_span;
///
/// {
///     let _span = perf_span!("launch", device = 0, work_items = 4096);
///     // ...
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::performance::PerformanceSpan::with_span(
            tracing::debug_span!("perf", name = $name, $($field = $value),+),
            None,
        )
    }};
}

/// Emit a `debug` event tagged with `event = $name`.
///
/// ```rust
/// use cal_tracing::perf_event;
///
/// perf_event!("copy_in", register = "i0", bytes = 4096);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}
