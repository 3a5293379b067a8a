//! Rolling one-second frame-rate windows.

use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Counts events and emits a rate each time a full second has elapsed.
#[derive(Debug, Clone)]
pub struct FpsMeter {
    window_start: Instant,
    count: u32,
}

impl FpsMeter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Start the first window at `start` instead of now.
    pub fn starting_at(start: Instant) -> Self {
        Self {
            window_start: start,
            count: 0,
        }
    }

    /// Record one event now.
    pub fn tick(&mut self) -> Option<f64> {
        self.tick_at(Instant::now())
    }

    /// Record one event at `now`, returning the rate when the window closes.
    pub fn tick_at(&mut self, now: Instant) -> Option<f64> {
        self.count += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < WINDOW {
            return None;
        }

        let fps = f64::from(self.count) / elapsed.as_secs_f64();
        self.window_start = now;
        self.count = 0;
        Some(fps)
    }

    /// Events counted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }
}

impl Default for FpsMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thirty_ticks_over_one_second() {
        let start = Instant::now();
        let mut meter = FpsMeter::starting_at(start);

        for i in 1..30u64 {
            assert_eq!(meter.tick_at(start + Duration::from_millis(i * 33)), None);
        }
        let fps = meter.tick_at(start + Duration::from_millis(1000));

        assert_eq!(fps, Some(30.0));
        assert_eq!(meter.count(), 0);
    }

    #[test]
    fn test_emits_once_per_window() {
        let start = Instant::now();
        let mut meter = FpsMeter::starting_at(start);

        let mut samples = Vec::new();
        for i in 1..=50u64 {
            if let Some(fps) = meter.tick_at(start + Duration::from_millis(i * 50)) {
                samples.push(fps);
            }
        }

        // 2.5 s of 20 Hz ticks closes exactly two windows.
        assert_eq!(samples, vec![20.0, 20.0]);
        assert_eq!(meter.count(), 10);
    }

    #[test]
    fn test_long_gap_reports_low_rate() {
        let start = Instant::now();
        let mut meter = FpsMeter::starting_at(start);
        meter.tick_at(start + Duration::from_millis(100));
        let fps = meter.tick_at(start + Duration::from_secs(4)).unwrap();
        assert!((fps - 0.5).abs() < 1e-9);
    }
}
