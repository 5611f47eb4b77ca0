use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Duration shared between tasks, kept with millisecond precision
#[derive(Debug)]
pub struct AtomicDuration(AtomicU64);

impl AtomicDuration {
    pub fn new(dur: Duration) -> Self {
        AtomicDuration(AtomicU64::new(dur_to_ms(dur)))
    }

    #[inline]
    pub fn get(&self) -> Duration {
        Duration::from_millis(self.0.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn store(&self, dur: Duration) {
        self.0.store(dur_to_ms(dur), Ordering::Relaxed);
    }
}

/// Convert Duration to milliseconds with rounding up
fn dur_to_ms(dur: Duration) -> u64 {
    const MS_PER_SEC: u64 = 1_000;
    const NANOS_PER_MILLI: u64 = 1_000_000;
    let ns = u64::from(dur.subsec_nanos());
    let ms = (ns + NANOS_PER_MILLI - 1) / NANOS_PER_MILLI;
    dur.as_secs().saturating_mul(MS_PER_SEC).saturating_add(ms)
}
