//! Delta computation over monotonically increasing hardware counters.
//!
//! Engine-time, energy and busy-cycle counters only make sense as rates.
//! Each counter keeps exactly one previous `(value, timestamp)` pair; the
//! rate over the last interval is `(value - previous) / elapsed`. A counter
//! that resets or wraps (new value below the previous one) yields a rate of
//! zero for that interval while the stored baseline still advances, so the
//! following interval is not computed against a stale sample.

use std::time::Instant;

/// One raw counter sample: last observed value and when it was observed.
#[derive(Debug, Clone, Copy)]
pub struct DeltaCounter {
    previous: Option<(u64, Instant)>,
}

impl DeltaCounter {
    pub fn new() -> Self {
        Self { previous: None }
    }

    /// Advances the counter to `value` observed at `now` and returns the
    /// per-second rate over the elapsed interval.
    ///
    /// The first observation, a backward jump (wrap/reset) and a zero-length
    /// interval all yield 0.0.
    pub fn rate(&mut self, value: u64, now: Instant) -> f64 {
        let rate = match self.previous {
            Some((prev_value, prev_time)) => {
                let elapsed = now.duration_since(prev_time).as_secs_f64();
                if value < prev_value || elapsed <= 0.0 {
                    0.0
                } else {
                    (value - prev_value) as f64 / elapsed
                }
            }
            None => 0.0,
        };

        self.previous = Some((value, now));
        rate
    }

    /// Like [`rate`](Self::rate), but only returns the raw value delta.
    /// Used where the caller divides by its own captured cycle interval.
    pub fn delta(&mut self, value: u64, now: Instant) -> u64 {
        let delta = match self.previous {
            Some((prev_value, _)) if value >= prev_value => value - prev_value,
            _ => 0,
        };

        self.previous = Some((value, now));
        delta
    }

    pub fn is_primed(&self) -> bool {
        self.previous.is_some()
    }
}

impl Default for DeltaCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Advances `counter` to the current engine-time reading and converts the
/// busy-time delta over `wall_delta` into a load percentage in `[0, 100]`.
pub fn engine_load_percent(
    counter: &mut DeltaCounter,
    engine_time_ns: u64,
    wall_delta: std::time::Duration,
) -> i32 {
    let busy_ns = counter.delta(engine_time_ns, Instant::now());
    let wall_ns = wall_delta.as_nanos();
    if wall_ns == 0 {
        return 0;
    }

    let percent = busy_ns as f64 / wall_ns as f64 * 100.0;
    percent.clamp(0.0, 100.0).round() as i32
}
