//! Completion-marker polling and the reset window consulted when a poll times out.

use crate::hal::{Clock, DmaMemory};
use parking_lot::Mutex;

/// Timing of a completion poll, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub initial_delay_us: u64,
    pub interval_us: u64,
    pub timeout_us: u64,
}

/// Spins until the 32-bit word at `pa` reads `expected` or the timeout expires.
///
/// The first check happens after `initial_delay_us`; later checks are `interval_us` apart.
/// Returns `true` if the marker was observed.
pub fn poll_marker(
    memory: &dyn DmaMemory,
    clock: &dyn Clock,
    pa: u64,
    expected: u32,
    config: &PollConfig,
) -> bool {
    let start = clock.now_ns();
    let timeout_ns = config.timeout_us.saturating_mul(1_000);

    clock.delay_us(config.initial_delay_us);
    loop {
        if memory.load_u32_acquire(pa) == expected {
            return true;
        }
        if clock.now_ns().saturating_sub(start) >= timeout_ns {
            // One last look: the marker may have landed during the final interval.
            return memory.load_u32_acquire(pa) == expected;
        }
        clock.delay_us(config.interval_us.max(1));
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct WindowState {
    started_at: Option<u64>,
    ended_at: Option<u64>,
}

/// The most recent device reset interval, on the device's monotonic nanosecond clock.
///
/// An open window (started, not yet ended) means a reset is in progress.
#[derive(Debug, Default)]
pub struct ResetWindow {
    state: Mutex<WindowState>,
}

impl ResetWindow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, now_ns: u64) {
        let mut state = self.state.lock();
        state.started_at = Some(now_ns);
        state.ended_at = None;
    }

    pub fn end(&self, now_ns: u64) {
        let mut state = self.state.lock();
        if state.started_at.is_some() {
            state.ended_at = Some(now_ns);
        }
    }

    #[must_use]
    pub fn in_progress(&self) -> bool {
        let state = self.state.lock();
        state.started_at.is_some() && state.ended_at.is_none()
    }

    /// Whether a transfer issued at `transfer_start_ns` may have been disrupted by a reset.
    #[must_use]
    pub fn covers(&self, transfer_start_ns: u64) -> bool {
        let state = *self.state.lock();
        match (state.started_at, state.ended_at) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(start), Some(end)) => (start..=end).contains(&transfer_start_ns),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ArchV2;
    use crate::hal::sim::{HOST_PHYS_BASE, ManualClock, SimConfig, SimDevice};
    use std::sync::Arc;

    #[test]
    fn window_bounds_are_inclusive() {
        let window = ResetWindow::new();
        assert!(!window.covers(5));

        window.begin(100);
        assert!(window.in_progress());
        assert!(window.covers(5));

        window.end(200);
        assert!(!window.in_progress());
        assert!(window.covers(100));
        assert!(window.covers(200));
        assert!(!window.covers(99));
        assert!(!window.covers(201));
    }

    #[test]
    fn poll_times_out_on_the_injected_clock() {
        let sim = SimDevice::new(Arc::new(ArchV2), SimConfig::default());
        let clock = ManualClock::new();
        let config = PollConfig {
            initial_delay_us: 4,
            interval_us: 2,
            timeout_us: 100,
        };

        assert!(!poll_marker(sim.as_ref(), &clock, HOST_PHYS_BASE, 7, &config));
        assert!(clock.now_ns() >= 100_000);

        sim.store_u32_release(HOST_PHYS_BASE, 7);
        assert!(poll_marker(sim.as_ref(), &clock, HOST_PHYS_BASE, 7, &config));
    }
}
