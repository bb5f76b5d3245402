use std::time::{SystemTime, UNIX_EPOCH};

/// Source of record timestamps for the writer.
pub trait Clock: Send + Sync + 'static {
    /// Nanoseconds since the UNIX epoch.
    fn now(&self) -> u64;
}

/// Wall-clock time from `SystemTime`. Subject to NTP steps.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        // A clock before the epoch or past year 2554 stamps 0 / u64::MAX rather
        // than failing the append.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// Default timestamp source of [`LogWriter`](crate::LogWriter).
///
/// Reads the TSC through `quanta` and offsets it by the wall time sampled
/// when the clock was built, so stamps are epoch nanoseconds that never go
/// backward within one writer even if the system clock is stepped.
#[derive(Debug, Clone)]
pub struct QuantaClock {
    source: quanta::Clock,
    epoch_ns_at_anchor: u64,
    anchor: quanta::Instant,
}

impl QuantaClock {
    pub fn new() -> Self {
        Self::anchored_at(SystemClock.now())
    }

    /// Anchor the monotonic source at `epoch_ns` instead of the current wall time.
    pub fn anchored_at(epoch_ns: u64) -> Self {
        let source = quanta::Clock::new();
        let anchor = source.now();
        Self {
            source,
            epoch_ns_at_anchor: epoch_ns,
            anchor,
        }
    }
}

impl Default for QuantaClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for QuantaClock {
    fn now(&self) -> u64 {
        let elapsed = self.source.now().duration_since(self.anchor);
        let elapsed_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.epoch_ns_at_anchor.saturating_add(elapsed_ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_start_at_anchor_and_never_go_backward() {
        let clock = QuantaClock::anchored_at(1_000);
        let mut prev = clock.now();
        assert!(prev >= 1_000);
        for _ in 0..1_000 {
            let next = clock.now();
            assert!(next >= prev);
            prev = next;
        }
        assert!(QuantaClock::new().now() > 0);
    }
}
