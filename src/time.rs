//! Frame timing for scheduler passes.
//!
//! This module provides:
//! - [`FrameClock`] - per-pass delta time and pass duration tracking
//! - [`FixedRate`] - the tick period of a fixed-rate schedule
//!
//! # Examples
//!
//! ```
//! use inferno::time::{FixedRate, FrameClock};
//!
//! let mut clock = FrameClock::new();
//! clock.begin_pass();
//! clock.end_pass();
//! assert_eq!(clock.frame_count(), 1);
//!
//! let rate = FixedRate::new(10).unwrap();
//! assert_eq!(rate.period().as_millis(), 100);
//! ```

use std::time::{Duration, Instant};

/// Timing of consecutive pipeline passes
#[derive(Clone, Debug)]
pub struct FrameClock {
    /// Time between the starts of the last two passes
    delta: Duration,
    /// Wall time of the last completed pass
    last_pass: Duration,
    frame_count: u64,
    startup_time: Instant,
    last_start: Option<Instant>,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            delta: Duration::ZERO,
            last_pass: Duration::ZERO,
            frame_count: 0,
            startup_time: Instant::now(),
            last_start: None,
        }
    }

    /// Mark the start of a pass and return its delta in seconds
    pub fn begin_pass(&mut self) -> f64 {
        let now = Instant::now();
        self.delta = self
            .last_start
            .map_or(Duration::ZERO, |last| now.duration_since(last));
        self.last_start = Some(now);
        self.delta.as_secs_f64()
    }

    /// Mark the end of the pass started by [`begin_pass`](Self::begin_pass)
    pub fn end_pass(&mut self) {
        if let Some(start) = self.last_start {
            self.last_pass = start.elapsed();
        }
        self.frame_count += 1;
    }

    /// Get delta time (time between the starts of the last two passes)
    pub fn delta(&self) -> Duration {
        self.delta
    }

    pub fn delta_seconds(&self) -> f64 {
        self.delta.as_secs_f64()
    }

    pub fn last_pass_duration(&self) -> Duration {
        self.last_pass
    }

    /// Completed passes
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Get total elapsed time
    pub fn elapsed(&self) -> Duration {
        self.startup_time.elapsed()
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Period of a fixed-rate schedule
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedRate {
    ups: u32,
    period: Duration,
}

impl FixedRate {
    /// `ups` updates per second. `None` for 0, which means "stopped".
    pub fn new(ups: u32) -> Option<Self> {
        if ups == 0 {
            return None;
        }
        Some(Self {
            ups,
            period: Duration::from_micros(1_000_000 / u64::from(ups)).max(Duration::from_micros(1)),
        })
    }

    pub fn ups(&self) -> u32 {
        self.ups
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}
