//! Timing guards and standard performance events.
//!
//! A [`PerformanceSpan`] measures the time between its creation and its drop
//! and emits one `debug` event on drop, unless performance tracing is turned
//! off or the duration falls under the configured threshold.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

static ENABLED: AtomicBool = AtomicBool::new(cfg!(debug_assertions));
// u64::MAX means "no threshold"
static THRESHOLD_US: AtomicU64 = AtomicU64::new(u64::MAX);

/// Apply the process-wide performance settings.
pub fn configure(enabled: bool, threshold_us: Option<u64>) {
    ENABLED.store(enabled, Ordering::Relaxed);
    THRESHOLD_US.store(threshold_us.unwrap_or(u64::MAX), Ordering::Relaxed);
}

/// Whether performance spans currently log anything.
pub fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

fn global_threshold() -> Option<u64> {
    match THRESHOLD_US.load(Ordering::Relaxed) {
        u64::MAX => None,
        us => Some(us),
    }
}

/// RAII timer. Logs `performance_span_complete` when dropped.
pub struct PerformanceSpan {
    threshold_us: Option<u64>,
    start_time: Instant,
    span: tracing::Span,
}

impl PerformanceSpan {
    /// Start timing `name`. `threshold_us` overrides the global threshold.
    pub fn new(name: impl AsRef<str>, threshold_us: Option<u64>) -> Self {
        let span = tracing::debug_span!("perf", name = %name.as_ref());
        Self {
            threshold_us: threshold_us.or_else(global_threshold),
            start_time: Instant::now(),
            span,
        }
    }

    pub fn elapsed_us(&self) -> u64 {
        self.start_time.elapsed().as_micros() as u64
    }

    /// Enter the span so nested events are attributed to it.
    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for PerformanceSpan {
    fn drop(&mut self) {
        if !is_enabled() {
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

/// Standard event for a device allocation.
pub fn record_allocation(device: &str, buffer_type: &str, size_bytes: usize, duration_us: u64) {
    tracing::debug!(
        event = "allocation",
        device,
        buffer_type,
        size_bytes,
        size_kb = size_bytes as f64 / 1024.0,
        duration_us,
        "device_allocation"
    );
}

/// Standard event for a kernel compilation.
pub fn record_compile(kernel: &str, n_constants: usize, duration_us: u64) {
    tracing::debug!(event = "compile", kernel, n_constants, duration_us, "pipeline_compiled");
}

/// Standard event for a finished graph submission.
pub fn record_graph(backend: &str, n_nodes: usize, n_dispatches: usize, duration_us: u64) {
    let nodes_per_ms = if duration_us > 0 {
        n_nodes as f64 * 1000.0 / duration_us as f64
    } else {
        0.0
    };
    tracing::debug!(
        event = "graph",
        backend,
        n_nodes,
        n_dispatches,
        duration_us,
        nodes_per_ms,
        "graph_submitted"
    );
}
