use npu_rs::device::{Device, DeviceResources};
use npu_rs::hal::sim::{SimConfig, SimDevice};
use npu_rs::hal::{self, ChipArch, MonotonicClock};
use npu_rs::mem::ProcessId;
use npu_rs::{CoreMask, DeviceState, DriverConfig, DriverResult};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};
use tracing::level_filters::LevelFilter;

const REQUESTERS: u32 = 16;

fn main() -> DriverResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("NPU_LOG")
                .from_env_lossy(),
        )
        .init();

    println!("============================================================");
    println!("              Simulated Device - Reset Storm                ");
    println!("============================================================");

    let arch = ChipArch::V3;
    let sim = SimDevice::new(hal::for_arch(arch), SimConfig::default());
    sim.set_reset_behavior(0, 3);
    let mut config = DriverConfig::default();
    config.reset_poll_interval_ms = 1;
    let resources = DeviceResources::simulated(&sim, Arc::new(MonotonicClock::new()));
    let device = Device::probe(0, arch, &config, resources)?;
    let cores = device.hal().core_count();

    // 1. Many processes ask for core resets at once
    let start = Instant::now();
    let results = std::thread::scope(|s| {
        let workers: Vec<_> = (0..REQUESTERS)
            .map(|i| {
                let device = &device;
                s.spawn(move || {
                    let never = AtomicBool::new(false);
                    let id = device.reset_request(ProcessId(100 + i), CoreMask::single(i % cores))?;
                    device.reset_wait(id, &never)
                })
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().unwrap_or(Err(npu_rs::DriverError::Cancelled)))
            .collect::<Vec<_>>()
    });

    let completed = results.iter().filter(|r| r.is_ok()).count();
    println!(
        "[+] {completed}/{REQUESTERS} requests finished in {:?}",
        start.elapsed()
    );
    let history = sim.reset_history();
    println!("[+] {} hardware resets issued:", history.len());
    for mask in &history {
        println!("    cores {:#06b}", mask.0);
    }

    // 2. Full-device reset
    device.reset_all();
    let deadline = Instant::now() + Duration::from_secs(5);
    while device.device_state() == DeviceState::Reset && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    println!("[+] Device state after full reset: {:?}", device.device_state());
    println!("[+] Metrics posted: {}", sim.metrics().len());

    device.shutdown();
    Ok(())
}
