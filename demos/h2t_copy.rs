use npu_rs::device::{Device, DeviceResources};
use npu_rs::dma::Direction;
use npu_rs::hal::sim::{SimConfig, SimDevice, SimUserLayout};
use npu_rs::hal::{self, ChipArch, MonotonicClock};
use npu_rs::mem::{AllocRequest, ProcessId};
use npu_rs::{DriverConfig, DriverResult};
use std::sync::Arc;
use std::time::Instant;
use tracing::level_filters::LevelFilter;

const SIZE: u64 = 4 * 1024 * 1024;

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
    println!("              Simulated Device - Host/Device Copies         ");
    println!("============================================================");

    let arch = ChipArch::V3;
    let sim = SimDevice::new(hal::for_arch(arch), SimConfig::default());
    let resources = DeviceResources::simulated(&sim, Arc::new(MonotonicClock::new()));
    let device = Device::probe(0, arch, &DriverConfig::default(), resources)?;
    let hal = device.hal().clone();
    let pid = ProcessId(2000);

    // 1. Buffers
    let host = device.mem_alloc(pid, AllocRequest::host(SIZE))?;
    let dev_a = device.mem_alloc(pid, AllocRequest::device(0, 1, SIZE).with_core(0))?;
    let dev_b = device.mem_alloc(pid, AllocRequest::device(1, 1, SIZE).with_core(1))?;
    let data: Vec<u8> = (0..SIZE as usize).map(|i| (i % 251) as u8).collect();
    device.mem_write(host, 0, &data)?;

    // 2. Synchronous copy, then inspect the descriptors the engine executed
    let (engine, queue) = (hal.h2t_engine(0), hal.h2t_queue());
    sim.clear_transfer_log(engine, queue);
    let start = Instant::now();
    device.mem_copy(host, 0, dev_a, 0, 150_000)?;
    println!("[+] 150000-byte copy took {:?}", start.elapsed());
    for (i, t) in sim.transfer_log(engine, queue).iter().enumerate() {
        println!(
            "    desc {i}: {:#014x} -> {:#014x}  {:>6} bytes  flags {:#010x}",
            t.src, t.dst, t.len, t.flags
        );
    }

    let start = Instant::now();
    device.mem_copy(host, 0, dev_a, 0, SIZE)?;
    println!("[+] {} MB host -> device in {:?}", SIZE >> 20, start.elapsed());

    // 3. Pipelined copies alternating between the two async contexts
    let start = Instant::now();
    let first = device.mem_copy_async(dev_a, dev_b, SIZE / 2, None)?;
    let second = device.mem_copy_async(dev_a, dev_b, SIZE, Some(first))?;
    device.mem_copy_wait(first)?;
    device.mem_copy_wait(second)?;
    println!(
        "[+] pipelined device -> device ({:?}, {:?}) in {:?}",
        first.context(),
        second.context(),
        start.elapsed()
    );

    let mut check = vec![0u8; 64 * 1024];
    device.mem_read(dev_b, SIZE - check.len() as u64, &mut check)?;
    let ok = check == data[data.len() - check.len()..];
    println!("    verify tail: {}", if ok { "ok" } else { "MISMATCH" });

    // 4. Fill
    device.memset(dev_b, 0, 0xA5, SIZE)?;
    device.mem_read(dev_b, 0, &mut check)?;
    println!(
        "[+] memset: {}",
        if check.iter().all(|b| *b == 0xA5) { "ok" } else { "MISMATCH" }
    );

    // 5. Zero copy from a scattered user buffer
    let uaddr = 0x7f00_0000_0000;
    let user_len = 1024 * 1024 + 100;
    sim.map_user_buffer(pid.0, uaddr, user_len, SimUserLayout::Scattered)?;
    sim.user_write(pid.0, uaddr, &data[..user_len as usize])?;
    let start = Instant::now();
    device.memcpy_zero_copy(pid, 0, uaddr, dev_b, 0, user_len, Direction::ToDevice)?;
    let (fast, slow) = sim.pin_calls();
    println!(
        "[+] zero-copy of {user_len} bytes in {:?} ({fast} fast pins, {slow} slow pins)",
        start.elapsed()
    );

    println!("[+] Chunks freed at shutdown: {}", device.shutdown());
    Ok(())
}
