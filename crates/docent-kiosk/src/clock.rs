//! One-shot clock offset between the server timeline and local monotonic time.

use std::time::Instant;

/// Learned from the first time-bearing control message and immutable for the
/// rest of the session: `offset_ms = server_ts - local_monotonic_at_receive`.
#[derive(Debug)]
pub struct ClockSync {
    epoch: Instant,
    offset_ms: Option<i64>,
}

impl ClockSync {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            offset_ms: None,
        }
    }

    /// Milliseconds on the local monotonic scale all conversions target.
    pub fn local_now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    pub fn is_initialised(&self) -> bool {
        self.offset_ms.is_some()
    }

    /// Learn the offset from the first server timestamp seen. Subsequent
    /// calls are no-ops; returns whether this call did the learning.
    pub fn initialise(&mut self, server_ts: i64) -> bool {
        if self.offset_ms.is_some() {
            return false;
        }
        self.offset_ms = Some(server_ts - self.local_now_ms());
        true
    }

    /// Convert a server-timeline instant to local monotonic milliseconds.
    /// `None` until the offset has been learned.
    pub fn convert(&self, server_ts: i64) -> Option<i64> {
        self.offset_ms.map(|offset| server_ts - offset)
    }
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new()
    }
}
