use npu_rs::device::{Device, DeviceResources};
use npu_rs::hal::sim::{SimConfig, SimDevice};
use npu_rs::hal::{self, ChipArch, MonotonicClock};
use npu_rs::mem::{AllocRequest, Lifespan, MemCategory, ProcessId};
use npu_rs::{DriverConfig, DriverResult};
use std::sync::Arc;
use tracing::level_filters::LevelFilter;

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
    println!("                 Simulated Device - Pool Usage              ");
    println!("============================================================");

    // 1. Bring up a simulated device
    let arch = ChipArch::V3;
    let sim = SimDevice::new(hal::for_arch(arch), SimConfig::default());
    let resources = DeviceResources::simulated(&sim, Arc::new(MonotonicClock::new()));
    let device = Device::probe(0, arch, &DriverConfig::default(), resources)?;

    let info = device.device_info()?;
    println!("[+] Device {} ({:?})", info.index, info.arch);
    println!("    Revision:      {:#x}", info.revision);
    println!("    Serial:        {:#x}", info.serial);
    println!("    Cores:         {}", info.core_count);
    for (i, (base, size)) in info.dram_channels.iter().enumerate() {
        println!("    DRAM {i}:        {base:#x} ({} MB)", size / 1024 / 1024);
    }
    println!("    Peers:         {:?}", info.connected_devices);

    // 2. Allocate on behalf of a process
    let pid = ProcessId(1000);
    device.process_attach(pid)?;

    let requests = [
        ("code", AllocRequest::device(0, 0, 256 * 1024).with_category(MemCategory::Code)),
        (
            "tensors",
            AllocRequest::device(1, 1, 8 * 1024 * 1024).with_category(MemCategory::Tensors),
        ),
        (
            "scratchpad",
            AllocRequest::device(0, 1, 1024 * 1024).with_category(MemCategory::Scratchpad),
        ),
        ("staging", AllocRequest::host(100).with_lifespan(Lifespan::Local)),
    ];

    println!("\n[+] Allocations:");
    for (name, req) in requests {
        let handle = device.mem_alloc(pid, req)?;
        let chunk = device.mem_info(handle)?;
        println!(
            "    {name:<12} handle {:>3}  pa {:#014x}  size {:>9}  {:?}",
            handle.value(),
            chunk.pa,
            chunk.size,
            chunk.location
        );
    }

    // 3. Dump accounting
    println!("\n[+] Pool usage:");
    println!("{}", to_json(&device.pool_usage()));
    println!("\n[+] Datastore of pid {}:", pid.0);
    println!("{}", to_json(&device.datastore_counters(pid)));

    let pools = device.pools();
    for channel in 0..device.hal().dram_channel_count() {
        for region in 0..device.hal().dram_region_count() {
            let usage = pools.device_pool_usage(channel, region)?;
            println!("    pool ({channel}, {region}): {}", to_json(&usage));
        }
    }

    // 4. Tear down
    println!("\n[+] Local chunks released: {}", device.release_local(pid));
    println!("[+] Chunks reclaimed on detach: {}", device.process_detach(pid));
    println!("[+] Chunks freed at shutdown: {}", device.shutdown());
    Ok(())
}

fn to_json<T: serde::Serialize>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("<{e}>"))
}
