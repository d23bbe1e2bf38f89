//! Keeps the capture loop at its target frame rate.
//!
//! The pacer tracks the deadline of the next frame rather than sleeping a
//! fixed period after each one, so time spent reading and writing frames is
//! absorbed instead of adding up over a long session. A frame that runs late
//! gets no sleep, and the following ones catch up.

use std::time::{Duration, Instant};

/// Deadline accumulator for a fixed frame period.
#[derive(Debug, Clone)]
pub struct FramePacer {
    period: Duration,
    next_deadline: Instant,
}

impl FramePacer {
    /// A pacer for `fps` frames per second whose first frame is due at
    /// `start`.
    pub fn new(fps: f64, start: Instant) -> Self {
        let fps = if fps.is_finite() && fps > 0.0 { fps } else { 25.0 };
        Self {
            period: Duration::from_secs_f64(1.0 / fps),
            next_deadline: start,
        }
    }

    /// The frame period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Mark a frame as done at `now`, and return how long to wait before
    /// the next one. Never negative.
    pub fn slack_after_frame(&mut self, now: Instant) -> Duration {
        self.next_deadline += self.period;
        self.next_deadline.saturating_duration_since(now)
    }

    /// [FramePacer::slack_after_frame] against the wall clock, then sleep
    /// the slack.
    pub fn wait(&mut self) {
        let slack = self.slack_after_frame(Instant::now());
        if !slack.is_zero() {
            spin_sleep::sleep(slack);
        }
    }
}
