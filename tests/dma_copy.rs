mod common;

use common::{bench, pattern};
use npu_rs::DriverError;
use npu_rs::config::DriverConfig;
use npu_rs::dma::Direction;
use npu_rs::dma::udma::{DESC_COMPLETION, MAX_DESC_SIZE};
use npu_rs::hal::Clock;
use npu_rs::hal::sim::SimUserLayout;
use npu_rs::mem::{AllocRequest, ProcessId};

const PID: ProcessId = ProcessId(12);

fn config() -> DriverConfig {
    DriverConfig::default()
        .with_small_pool(0, 0)
        .with_h2t_desc_count(256)
        .with_dma_timeout_us(1_000)
}

#[test]
fn large_copy_is_split_at_the_descriptor_limit() {
    let b = bench(&config());
    let dev = &b.device;
    let hal = dev.hal().clone();
    let (engine, queue) = (hal.h2t_engine(2), hal.h2t_queue());

    let src = dev.mem_alloc(PID, AllocRequest::host(150_000)).unwrap();
    let dst = dev
        .mem_alloc(PID, AllocRequest::device(0, 1, 150_000).with_core(2))
        .unwrap();
    let data = pattern(150_000, 9);
    dev.mem_write(src, 0, &data).unwrap();
    b.sim.clear_transfer_log(engine, queue);

    dev.mem_copy(src, 0, dst, 0, 150_000).unwrap();

    let log = b.sim.transfer_log(engine, queue);
    let lens: Vec<u32> = log.iter().map(|t| t.len).collect();
    assert_eq!(lens, [65_536, 65_536, 18_928, 4]);
    assert!(log[..3].iter().all(|t| t.flags & DESC_COMPLETION == 0));
    assert_ne!(log[3].flags & DESC_COMPLETION, 0);
    assert_eq!(
        log[..3].iter().map(|t| u64::from(t.len)).sum::<u64>(),
        150_000
    );

    let mut back = vec![0u8; 150_000];
    dev.mem_read(dst, 0, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn descriptor_count_matches_transfer_size() {
    let b = bench(&config());
    let dev = &b.device;
    let hal = dev.hal().clone();
    let (engine, queue) = (hal.h2t_engine(0), hal.h2t_queue());
    let src = dev.mem_alloc(PID, AllocRequest::host(1 << 20)).unwrap();
    let dst = dev
        .mem_alloc(PID, AllocRequest::device(0, 1, 1 << 20))
        .unwrap();

    for size in [1u64, 4096, MAX_DESC_SIZE, MAX_DESC_SIZE + 1, 700_000] {
        b.sim.clear_transfer_log(engine, queue);
        dev.mem_copy(src, 0, dst, 0, size).unwrap();
        let log = b.sim.transfer_log(engine, queue);
        let data: Vec<_> = log
            .iter()
            .filter(|t| t.flags & DESC_COMPLETION == 0)
            .collect();
        assert_eq!(data.len() as u64, size.div_ceil(MAX_DESC_SIZE), "size {size}");
        assert_eq!(data.iter().map(|t| u64::from(t.len)).sum::<u64>(), size);
        assert_eq!(log.len() - data.len(), 1, "size {size}");
    }
}

#[test]
fn copy_spanning_several_ring_fills_completes() {
    // A 128-entry ring: a sync launch carries at most 60 pairs.
    let b = bench(&config().with_h2t_desc_count(64));
    let dev = &b.device;
    let size = 200 * MAX_DESC_SIZE;
    let src = dev.mem_alloc(PID, AllocRequest::host(size)).unwrap();
    let dst = dev.mem_alloc(PID, AllocRequest::device(0, 1, size)).unwrap();
    let data = pattern(size as usize, 1);
    dev.mem_write(src, 0, &data).unwrap();

    dev.mem_copy(src, 0, dst, 0, size).unwrap();

    let mut tail = vec![0u8; 4096];
    dev.mem_read(dst, size - 4096, &mut tail).unwrap();
    assert_eq!(tail, data[data.len() - 4096..]);
}

#[test]
fn timeout_inside_a_reset_window_is_retried() {
    let b = bench(&config());
    let dev = &b.device;
    let hal = dev.hal().clone();
    let src = dev.mem_alloc(PID, AllocRequest::host(8192)).unwrap();
    let dst = dev
        .mem_alloc(PID, AllocRequest::device(1, 1, 8192).with_core(1))
        .unwrap();
    let data = pattern(8192, 4);
    dev.mem_write(src, 0, &data).unwrap();

    dev.reset_window().begin(b.clock.now_ns());
    b.sim.stall_queue(hal.h2t_engine(1), hal.h2t_queue(), 1);
    dev.mem_copy(src, 0, dst, 0, 8192).unwrap();
    dev.reset_window().end(b.clock.now_ns());

    let mut back = vec![0u8; 8192];
    dev.mem_read(dst, 0, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn timeout_outside_a_reset_window_fails() {
    let b = bench(&config());
    let dev = &b.device;
    let hal = dev.hal().clone();
    let src = dev.mem_alloc(PID, AllocRequest::host(4096)).unwrap();
    let dst = dev
        .mem_alloc(PID, AllocRequest::device(1, 1, 4096).with_core(3))
        .unwrap();

    b.sim.stall_queue(hal.h2t_engine(3), hal.h2t_queue(), 1);
    assert!(matches!(
        dev.mem_copy(src, 0, dst, 0, 4096),
        Err(DriverError::DmaTimeout)
    ));
}

#[test]
fn async_context_cannot_be_reused_before_wait() {
    let b = bench(&config());
    let dev = &b.device;
    let src = dev.mem_alloc(PID, AllocRequest::host(65536)).unwrap();
    let dst = dev
        .mem_alloc(PID, AllocRequest::device(0, 1, 65536))
        .unwrap();

    let first = dev.mem_copy_async(src, dst, 65536, None).unwrap();
    assert!(matches!(
        dev.mem_copy_async(src, dst, 65536, None),
        Err(DriverError::InUse(_))
    ));

    // The chained context is free and the first transfer is still waitable.
    let second = dev.mem_copy_async(src, dst, 65536, Some(first)).unwrap();
    assert_ne!(first.context(), second.context());
    dev.mem_copy_wait(first).unwrap();
    dev.mem_copy_wait(second).unwrap();
    assert!(matches!(
        dev.mem_copy_wait(first),
        Err(DriverError::NotFound)
    ));
}

#[test]
fn zero_copy_moves_user_buffers_both_ways() {
    let b = bench(&config());
    let dev = &b.device;
    let pid = 40;
    let uaddr = 0x7000_0000;
    let size = 300 * 4096 + 123;
    b.sim
        .map_user_buffer(pid, uaddr, size, SimUserLayout::Scattered)
        .unwrap();
    b.sim.set_fast_pin_limit(Some(10));
    let data = pattern(size as usize, 77);
    b.sim.user_write(pid, uaddr, &data).unwrap();

    let h = dev
        .mem_alloc(ProcessId(pid), AllocRequest::device(0, 1, size))
        .unwrap();
    dev.memcpy_zero_copy(ProcessId(pid), 0, uaddr, h, 0, size, Direction::ToDevice)
        .unwrap();
    let mut back = vec![0u8; size as usize];
    dev.mem_read(h, 0, &mut back).unwrap();
    assert_eq!(back, data);
    assert_eq!(b.sim.pinned_pages(), 0);
    let (fast, slow) = b.sim.pin_calls();
    assert!(fast >= 5 && slow >= 1);

    b.sim.user_write(pid, uaddr, &vec![0u8; size as usize]).unwrap();
    dev.memcpy_zero_copy(ProcessId(pid), 0, uaddr, h, 0, size, Direction::FromDevice)
        .unwrap();
    let mut user = vec![0u8; size as usize];
    b.sim.user_read(pid, uaddr, &mut user).unwrap();
    assert_eq!(user, data);
    assert_eq!(b.sim.pinned_pages(), 0);
    assert!(b.sim.dirty_pages() > 0);
}

#[test]
fn zero_copy_failure_unpins_everything() {
    let b = bench(&config());
    let dev = &b.device;
    let pid = 41;
    let uaddr = 0x7100_0000;
    // Only the first 100 pages are mapped.
    b.sim
        .map_user_buffer(pid, uaddr, 100 * 4096, SimUserLayout::Contiguous)
        .unwrap();
    let h = dev
        .mem_alloc(ProcessId(pid), AllocRequest::device(0, 1, 200 * 4096))
        .unwrap();

    assert!(
        dev.memcpy_zero_copy(
            ProcessId(pid),
            0,
            uaddr,
            h,
            0,
            200 * 4096,
            Direction::ToDevice
        )
        .is_err()
    );
    assert_eq!(b.sim.pinned_pages(), 0);
    assert!(
        dev.memcpy_zero_copy(
            ProcessId(pid),
            0,
            uaddr,
            h,
            0,
            100 * 4096,
            Direction::ToDevice
        )
        .is_ok()
    );
}

#[test]
fn zero_copy_rejects_host_chunks() {
    let b = bench(&config());
    let dev = &b.device;
    let h = dev.mem_alloc(PID, AllocRequest::host(4096)).unwrap();
    assert!(matches!(
        dev.memcpy_zero_copy(PID, 0, 0x1000, h, 0, 4096, Direction::ToDevice),
        Err(DriverError::InvalidArgument(_))
    ));
}
