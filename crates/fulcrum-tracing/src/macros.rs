//! Instrumentation shorthands.

/// Start a [`crate::performance::PerformanceSpan`], optionally attaching
/// fields to an entered `perf` span.
///
/// ```rust
/// use fulcrum_tracing::perf_span;
///
/// {
///     let _span = perf_span!("graph_compute", nodes = 12);
///     // work
/// }
/// ```
#[macro_export]
macro_rules! perf_span {
    ($name:expr) => {{
        $crate::performance::PerformanceSpan::new($name, None)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        let _span = $crate::__tracing::debug_span!(
            "perf",
            name = $name,
            $($field = $value),+
        ).entered();
        $crate::performance::PerformanceSpan::new($name, None)
    }};
}

/// Emit a `debug` event tagged with `event = $name`.
///
/// ```rust
/// use fulcrum_tracing::perf_event;
///
/// perf_event!("cache_hit", entries = 3);
/// ```
#[macro_export]
macro_rules! perf_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::__tracing::debug!(
            event = $name,
            $($field = $value),+
        );
    };
}

/// Time a block, returning `(result, duration_us)`.
///
/// ```rust
/// use fulcrum_tracing::timed_block;
///
/// let (sum, _us) = timed_block!("sum", { (1..=10).sum::<i32>() });
/// assert_eq!(sum, 55);
/// ```
#[macro_export]
macro_rules! timed_block {
    ($name:expr, $block:block) => {{
        let start = ::std::time::Instant::now();
        let result = $block;
        let duration_us = start.elapsed().as_micros() as u64;
        $crate::__tracing::debug!(operation = $name, duration_us, "timed_block_complete");
        (result, duration_us)
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn timed_block_returns_value() {
        let (value, _) = timed_block!("square", { 7 * 7 });
        assert_eq!(value, 49);
    }

    #[test]
    fn perf_event_with_fields() {
        crate::init_for_tests();
        perf_event!("graph_fused", nodes = 3, groups = 1);
    }

    #[test]
    fn perf_span_with_fields() {
        let span = perf_span!("encode", nodes = 3, device = "GPU0");
        assert!(span.elapsed_us() < 60_000_000);
    }
}
