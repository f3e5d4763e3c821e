mod common;

use common::{bench, eventually, pattern, realtime_bench, wait_ready};
use npu_rs::config::DriverConfig;
use npu_rs::mem::{AllocRequest, ProcessId};
use npu_rs::{CoreMask, DeviceState, DriverError, ResetState};
use std::sync::atomic::{AtomicBool, Ordering};

fn config() -> DriverConfig {
    let mut config = DriverConfig::default()
        .with_small_pool(0, 0)
        .with_h2t_desc_count(256);
    config.reset_poll_interval_ms = 1;
    config
}

#[test]
fn concurrent_requests_share_one_hardware_reset() {
    let (sim, dev) = realtime_bench(&config());
    let never = AtomicBool::new(false);

    // Keep the worker busy on an unrelated reset while the two requests queue up.
    sim.set_never_ready(true);
    let blocker = dev.reset_request(ProcessId(1), CoreMask::single(3)).unwrap();
    assert!(eventually(|| sim.reset_history().len() == 1));

    let a = dev.reset_request(ProcessId(2), CoreMask::single(0)).unwrap();
    let b = dev.reset_request(ProcessId(3), CoreMask::single(1)).unwrap();
    sim.set_never_ready(false);

    assert_eq!(dev.reset_wait(a, &never).unwrap(), ResetState::Completed);
    assert_eq!(dev.reset_wait(b, &never).unwrap(), ResetState::Completed);
    assert_eq!(dev.reset_wait(blocker, &never).unwrap(), ResetState::Completed);
    assert_eq!(
        sim.reset_history(),
        vec![CoreMask::single(3), CoreMask(0b11)]
    );

    let last = sim.metrics().pop().unwrap();
    assert_eq!(last[0], 1);
    assert_eq!(u64::from_le_bytes(last[1..9].try_into().unwrap()), 0b11);
}

#[test]
fn many_requests_coalesce_into_their_union() {
    let (sim, dev) = realtime_bench(&config());
    let never = AtomicBool::new(false);

    sim.set_never_ready(true);
    let blocker = dev.reset_request(ProcessId(1), CoreMask::single(0)).unwrap();
    assert!(eventually(|| sim.reset_history().len() == 1));

    let ids: Vec<_> = [0b0001, 0b0110, 0b0100, 0b1000]
        .into_iter()
        .zip(10..)
        .map(|(mask, pid)| dev.reset_request(ProcessId(pid), CoreMask(mask)).unwrap())
        .collect();
    sim.set_never_ready(false);

    for id in ids {
        assert_eq!(dev.reset_wait(id, &never).unwrap(), ResetState::Completed);
    }
    dev.reset_wait(blocker, &never).unwrap();
    assert_eq!(sim.reset_history()[1], CoreMask(0b1111));
    assert_eq!(sim.reset_history().len(), 2);
}

#[test]
fn copies_work_after_a_core_reset() {
    let (_sim, dev) = realtime_bench(&config());
    let never = AtomicBool::new(false);
    let pid = ProcessId(5);
    let src = dev.mem_alloc(pid, AllocRequest::host(100_000)).unwrap();
    let dst = dev
        .mem_alloc(pid, AllocRequest::device(0, 1, 100_000).with_core(0))
        .unwrap();
    let data = pattern(100_000, 2);
    dev.mem_write(src, 0, &data).unwrap();
    dev.mem_copy(src, 0, dst, 0, 100_000).unwrap();

    let id = dev.reset_request(pid, CoreMask::single(0)).unwrap();
    assert_eq!(dev.reset_wait(id, &never).unwrap(), ResetState::Completed);

    dev.mem_copy(src, 0, dst, 0, 100_000).unwrap();
    let mut back = vec![0u8; 100_000];
    dev.mem_read(dst, 0, &mut back).unwrap();
    assert_eq!(back, data);
}

#[test]
fn rejected_reset_fails_the_request() {
    let b = bench(&config());
    let never = AtomicBool::new(false);
    b.sim.set_reset_behavior(1, 0);

    let id = b
        .device
        .reset_request(ProcessId(8), CoreMask::single(2))
        .unwrap();
    assert_eq!(b.device.reset_wait(id, &never).unwrap(), ResetState::Failed);
    assert_eq!(b.sim.metrics().last().map(|m| m[0]), Some(0));
    assert!(matches!(
        b.device.reset_status(id),
        Err(DriverError::NotFound)
    ));
}

#[test]
fn requests_are_validated() {
    let b = bench(&config());
    assert!(matches!(
        b.device.reset_request(ProcessId(8), CoreMask(0)),
        Err(DriverError::InvalidArgument(_))
    ));
    assert!(matches!(
        b.device.reset_request(ProcessId(8), CoreMask::ALL),
        Err(DriverError::InvalidArgument(_))
    ));
}

#[test]
fn cancelled_wait_can_be_resumed() {
    let (sim, dev) = realtime_bench(&config());
    sim.set_never_ready(true);
    let id = dev.reset_request(ProcessId(9), CoreMask::single(1)).unwrap();

    let cancel = AtomicBool::new(true);
    assert!(matches!(
        dev.reset_wait(id, &cancel),
        Err(DriverError::Cancelled)
    ));
    assert_eq!(dev.reset_status(id).unwrap(), ResetState::Started);

    sim.set_never_ready(false);
    cancel.store(false, Ordering::Release);
    assert_eq!(dev.reset_wait(id, &cancel).unwrap(), ResetState::Completed);
}

#[test]
fn full_reset_returns_to_ready() {
    let (sim, dev) = realtime_bench(&config());
    let info = dev.device_info().unwrap();

    dev.reset_all();
    assert_eq!(wait_ready(&dev), DeviceState::Ready);
    assert!(dev.is_ready());
    assert_eq!(sim.reset_history(), vec![CoreMask::ALL]);
    assert_eq!(dev.device_info().unwrap(), info);
}

#[test]
fn device_that_never_returns_is_invalid() {
    let (sim, dev) = realtime_bench(&config().with_reset_timeout_ms(20));
    sim.set_never_ready(true);

    dev.reset_all();
    assert_eq!(wait_ready(&dev), DeviceState::Invalid);
    assert!(matches!(dev.device_info(), Err(DriverError::Busy(_))));
}

#[test]
fn no_reset_mode_still_rebuilds_dma() {
    let (sim, dev) = realtime_bench(&config().no_reset());
    let never = AtomicBool::new(false);
    let id = dev.reset_request(ProcessId(4), CoreMask::single(2)).unwrap();
    assert_eq!(dev.reset_wait(id, &never).unwrap(), ResetState::Completed);
    assert!(sim.reset_history().is_empty());
}
