//! # Timer Engine
//!
//! Computes the next wake-up instant across SPM ambient/heartbeat
//! cadences, the three RXW expiry queues (per peer), SPMR arming, and
//! peer expiry, then dispatches the due state transitions. The actual
//! thread this runs on lives in `transport::bind`; this module holds the
//! pure scheduling logic so it can be unit-tested without spawning
//! anything.

use std::time::Duration;

use quanta::Instant;

/// Ambient + heartbeat SPM cadence state, held under `transport.mutex`.
#[derive(Debug, Clone)]
pub struct SpmSchedule {
    pub ambient_interval: Duration,
    /// Zero-leaded, zero-terminated ascending ramp of heartbeat intervals.
    pub heartbeat_intervals: Vec<Duration>,
    pub next_ambient_spm: Instant,
    /// `None` when disarmed (falls back to ambient-only).
    pub heartbeat_index: Option<usize>,
    pub next_heartbeat_spm: Option<Instant>,
}

impl SpmSchedule {
    pub fn new(now: Instant, ambient_interval: Duration, heartbeat_intervals: Vec<Duration>) -> Self {
        SpmSchedule {
            ambient_interval,
            heartbeat_intervals,
            next_ambient_spm: now + ambient_interval,
            heartbeat_index: None,
            next_heartbeat_spm: None,
        }
    }

    /// Any successful ODATA/RDATA emission resets the heartbeat ramp to
    /// its first scheduled interval.
    pub fn arm_heartbeat(&mut self, now: Instant) {
        if self.heartbeat_intervals.is_empty() {
            return;
        }
        self.heartbeat_index = Some(0);
        self.next_heartbeat_spm = Some(now + self.heartbeat_intervals[0]);
    }

    /// Compute the earliest of the two SPM cadences.
    pub fn next_spm(&self) -> Instant {
        match self.next_heartbeat_spm {
            Some(t) => t.min(self.next_ambient_spm),
            None => self.next_ambient_spm,
        }
    }

    /// Returns true if an ambient SPM is due; resets the ambient timer and
    /// the heartbeat ramp to index 0 as a side effect.
    pub fn poll_ambient(&mut self, now: Instant) -> bool {
        if now < self.next_ambient_spm {
            return false;
        }
        self.next_ambient_spm = now + self.ambient_interval;
        self.arm_heartbeat(now);
        true
    }

    /// Returns true if a heartbeat SPM is due; advances the ramp or
    /// disarms it once exhausted.
    pub fn poll_heartbeat(&mut self, now: Instant) -> bool {
        let Some(idx) = self.heartbeat_index else {
            return false;
        };
        let Some(next) = self.next_heartbeat_spm else {
            return false;
        };
        if now < next {
            return false;
        }
        let new_idx = idx + 1;
        if new_idx >= self.heartbeat_intervals.len() || self.heartbeat_intervals[new_idx] == Duration::ZERO {
            self.heartbeat_index = None;
            self.next_heartbeat_spm = None;
        } else {
            self.heartbeat_index = Some(new_idx);
            self.next_heartbeat_spm = Some(now + self.heartbeat_intervals[new_idx]);
        }
        true
    }
}
