// Message schedule module
//
// Pure computation of when, relative to a session's own start, each
// scheduled action of a test type happens. Strategies sleep until these
// offsets, so expected counts follow directly from the schedule lengths.

use std::time::Duration;

/// Offsets of every message a device publishes on its main topic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MessageSchedule {
    /// `count` messages, one every `1 / rate` seconds starting at zero.
    Uniform { count: u64, rate: f64 },
    /// One message per second, except inside the window where each second
    /// carries `multiplier` evenly spaced messages.
    Burst {
        runtime_secs: u64,
        window_start: u64,
        window_secs: u64,
        multiplier: u64,
    },
}

impl MessageSchedule {
    /// `round(runtime × rate)` messages at a fixed rate.
    pub fn uniform(runtime_secs: u32, rate: f64) -> Self {
        let count = (runtime_secs as f64 * rate).round() as u64;
        MessageSchedule::Uniform { count, rate }
    }

    /// One message per second for `secs` seconds.
    pub fn per_second(secs: u64) -> Self {
        MessageSchedule::Uniform {
            count: secs,
            rate: 1.0,
        }
    }

    /// Burst window centred in the runtime.
    pub fn burst(runtime_secs: u32, window_secs: u32, multiplier: u32) -> Self {
        let (window_start, window_secs) = burst_window(runtime_secs, window_secs);
        MessageSchedule::Burst {
            runtime_secs: runtime_secs as u64,
            window_start,
            window_secs,
            multiplier: multiplier.max(1) as u64,
        }
    }

    pub fn len(&self) -> u64 {
        match *self {
            MessageSchedule::Uniform { count, .. } => count,
            MessageSchedule::Burst {
                runtime_secs,
                window_secs,
                multiplier,
                ..
            } => (runtime_secs - window_secs) + window_secs * multiplier,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Offset of message `k` (0-based) from the session start.
    pub fn offset(&self, k: u64) -> Duration {
        match *self {
            MessageSchedule::Uniform { rate, .. } => Duration::from_secs_f64(k as f64 / rate),
            MessageSchedule::Burst {
                window_start,
                window_secs,
                multiplier,
                ..
            } => {
                let in_window = window_secs * multiplier;
                if k < window_start {
                    Duration::from_secs(k)
                } else if k < window_start + in_window {
                    let j = k - window_start;
                    Duration::from_secs(window_start + j / multiplier)
                        + Duration::from_secs_f64((j % multiplier) as f64 / multiplier as f64)
                } else {
                    Duration::from_secs(k - in_window + window_secs)
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.len()).map(move |k| self.offset(k))
    }
}

/// `(start, length)` in whole seconds of a burst window centred in the runtime.
pub fn burst_window(runtime_secs: u32, window_secs: u32) -> (u64, u64) {
    let window = window_secs.min(runtime_secs) as u64;
    let start = (runtime_secs as u64 - window) / 2;
    (start, window)
}

/// Offsets at which a churning device drops and re-establishes its connection.
pub fn churn_offsets(runtime_secs: u32, interval_secs: u32) -> impl Iterator<Item = Duration> {
    let interval = interval_secs.max(1) as u64;
    let count = runtime_secs as u64 / interval;
    (1..=count).map(move |k| Duration::from_secs(k * interval))
}

/// `(start, end)` second offsets of the offline window, starting mid-run.
pub fn offline_window(runtime_secs: u32, offline_secs: u32) -> (u64, u64) {
    let start = runtime_secs as u64 / 2;
    (start, start + offline_secs as u64)
}

/// When an LWT device drops its connection without saying goodbye.
pub fn lwt_abort_offset(runtime_secs: u32) -> Duration {
    Duration::from_secs(runtime_secs as u64 / 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Uniform schedules
    // =========================================================================

    #[test]
    fn test_uniform_count_and_spacing() {
        let schedule = MessageSchedule::uniform(60, 2.0);
        assert_eq!(schedule.len(), 120);
        assert_eq!(schedule.offset(0), Duration::ZERO);
        assert_eq!(schedule.offset(1), Duration::from_millis(500));
        assert_eq!(schedule.offset(119), Duration::from_millis(59_500));
    }

    #[test]
    fn test_uniform_fractional_rate_rounds() {
        // 25 s at 0.1 msg/s = 2.5 -> 3 messages at 0, 10, 20 s
        let schedule = MessageSchedule::uniform(25, 0.1);
        assert_eq!(schedule.len(), 3);
        assert_eq!(schedule.offset(2), Duration::from_secs(20));
    }

    // =========================================================================
    // Burst schedules
    // =========================================================================

    #[test]
    fn test_burst_count_matches_formula() {
        let schedule = MessageSchedule::burst(120, 30, 10);
        assert_eq!(schedule.len(), 390);
    }

    #[test]
    fn test_burst_window_is_centred() {
        assert_eq!(burst_window(120, 30), (45, 30));
        assert_eq!(burst_window(30, 30), (0, 30));
        assert_eq!(burst_window(20, 30), (0, 20));
    }

    #[test]
    fn test_burst_offsets_by_phase() {
        let schedule = MessageSchedule::burst(120, 30, 10);
        // before the window: one per second
        assert_eq!(schedule.offset(44), Duration::from_secs(44));
        // first window message at 45 s, then every 100 ms
        assert_eq!(schedule.offset(45), Duration::from_secs(45));
        assert_eq!(schedule.offset(46), Duration::from_millis(45_100));
        // last window message at 74.9 s
        assert_eq!(schedule.offset(45 + 299), Duration::from_millis(74_900));
        // after the window: one per second from 75 s
        assert_eq!(schedule.offset(345), Duration::from_secs(75));
        assert_eq!(schedule.offset(389), Duration::from_secs(119));
    }

    // =========================================================================
    // Churn / offline / lwt
    // =========================================================================

    #[test]
    fn test_churn_offsets() {
        let offsets: Vec<_> = churn_offsets(120, 10).collect();
        assert_eq!(offsets.len(), 12);
        assert_eq!(offsets[0], Duration::from_secs(10));
        assert_eq!(offsets[11], Duration::from_secs(120));
    }

    #[test]
    fn test_churn_interval_not_dividing_runtime() {
        assert_eq!(churn_offsets(25, 10).count(), 2);
    }

    #[test]
    fn test_offline_window_mid_run() {
        assert_eq!(offline_window(60, 5), (30, 35));
        assert_eq!(offline_window(10, 5), (5, 10));
    }

    #[test]
    fn test_lwt_abort_offset() {
        assert_eq!(lwt_abort_offset(60), Duration::from_secs(30));
        assert_eq!(lwt_abort_offset(11), Duration::from_secs(5));
    }

    // =========================================================================
    // Property-Based Tests
    // =========================================================================

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_burst_schedule_is_ordered_and_within_runtime(
            runtime in 10u32..600,
            window in 1u32..300,
            multiplier in 1u32..20,
        ) {
            let schedule = MessageSchedule::burst(runtime, window, multiplier);
            let w = window.min(runtime) as u64;
            prop_assert_eq!(schedule.len(), (runtime as u64 - w) + w * multiplier as u64);
            let mut previous = Duration::ZERO;
            for (k, offset) in schedule.iter().enumerate() {
                if k > 0 {
                    prop_assert!(offset > previous, "offset {} not increasing", k);
                }
                prop_assert!(offset < Duration::from_secs(runtime as u64));
                previous = offset;
            }
        }

        #[test]
        fn prop_uniform_schedule_fits_runtime(runtime in 10u32..3_600, tenths in 1u32..=1_000) {
            let rate = tenths as f64 / 10.0;
            let schedule = MessageSchedule::uniform(runtime, rate);
            prop_assert_eq!(schedule.len(), (runtime as f64 * rate).round() as u64);
            if !schedule.is_empty() {
                let last = schedule.offset(schedule.len() - 1);
                prop_assert!(last < Duration::from_secs(runtime as u64));
            }
        }
    }
}
