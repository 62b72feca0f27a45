//! Per-block performance tracing.
//!
//! The block context carries one `PerfStats`; the VM records a span per
//! opcode and processors may add their own. Span storage is preallocated
//! and reset each block, so steady-state recording does not allocate.
//! Names are static strings for the same reason.

use std::time::Duration;

/// Spans kept per block before recording starts dropping.
const SPAN_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct PerfSpan {
    pub name: &'static str,
    pub duration: Duration,
}

pub struct PerfStats {
    spans: Vec<PerfSpan>,
    dropped: usize,
}

impl PerfStats {
    pub fn new() -> Self {
        Self {
            spans: Vec::with_capacity(SPAN_CAPACITY),
            dropped: 0,
        }
    }

    /// Forget the previous block's spans.
    pub fn reset(&mut self) {
        self.spans.clear();
        self.dropped = 0;
    }

    pub fn record(&mut self, name: &'static str, duration: Duration) {
        if self.spans.len() < SPAN_CAPACITY {
            self.spans.push(PerfSpan { name, duration });
        } else {
            self.dropped += 1;
        }
    }

    pub fn spans(&self) -> &[PerfSpan] {
        &self.spans
    }

    /// Spans that did not fit this block.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Total time across all recorded spans.
    pub fn total(&self) -> Duration {
        self.spans.iter().map(|s| s.duration).sum()
    }
}

impl Default for PerfStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reset() {
        let mut perf = PerfStats::new();
        perf.record("opcode", Duration::from_micros(5));
        perf.record("plugin", Duration::from_micros(10));
        assert_eq!(perf.spans().len(), 2);
        assert_eq!(perf.total(), Duration::from_micros(15));

        perf.reset();
        assert!(perf.spans().is_empty());
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut perf = PerfStats::new();
        for _ in 0..SPAN_CAPACITY + 10 {
            perf.record("x", Duration::from_nanos(1));
        }
        assert_eq!(perf.spans().len(), SPAN_CAPACITY);
        assert_eq!(perf.dropped(), 10);
    }
}
