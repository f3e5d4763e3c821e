#![allow(dead_code)]

use npu_rs::device::{Device, DeviceResources};
use npu_rs::hal::sim::{ManualClock, SimConfig, SimDevice};
use npu_rs::hal::{self, ChipArch, Clock, MonotonicClock};
use npu_rs::{DeviceState, DriverConfig};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Integration tests bind every simulated device as the same generation: the HAL selection
/// is process-wide.
pub const ARCH: ChipArch = ChipArch::V3;

pub struct Bench {
    pub sim: Arc<SimDevice>,
    pub clock: Arc<ManualClock>,
    pub device: Device,
}

/// A device on a clock that only moves while the driver waits on it.
pub fn bench(config: &DriverConfig) -> Bench {
    let sim = SimDevice::new(hal::for_arch(ARCH), SimConfig::default());
    let clock = Arc::new(ManualClock::new());
    let resources = DeviceResources::simulated(&sim, clock.clone());
    let device = Device::probe(0, ARCH, config, resources).unwrap();
    Bench { sim, clock, device }
}

/// A device on the wall clock, for tests that race the reset worker.
pub fn realtime_bench(config: &DriverConfig) -> (Arc<SimDevice>, Device) {
    let sim = SimDevice::new(hal::for_arch(ARCH), SimConfig::default());
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let resources = DeviceResources::simulated(&sim, clock);
    let device = Device::probe(0, ARCH, config, resources).unwrap();
    (sim, device)
}

/// Polls `cond` for up to five seconds.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

pub fn wait_ready(device: &Device) -> DeviceState {
    eventually(|| device.device_state() != DeviceState::Reset);
    device.device_state()
}

/// Deterministic test pattern.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
