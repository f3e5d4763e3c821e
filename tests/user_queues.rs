mod common;

use common::{bench, pattern};
use npu_rs::config::DriverConfig;
use npu_rs::device::QueueSpec;
use npu_rs::dma::engine::ring_bytes;
use npu_rs::dma::udma::{MAX_RING_DESCS, UdmaDesc, ring_id_for, ring_size_for};
use npu_rs::dma::{AxiPort, EngineState, RingKind};
use npu_rs::mem::{AllocRequest, Handle, ProcessId};
use npu_rs::{Device, DriverError};

const OWNER: ProcessId = ProcessId(30);
const ENGINE: u32 = 1;
const QUEUE: u32 = 2;
const COUNT: u32 = 64;

fn config() -> DriverConfig {
    DriverConfig::default()
        .with_small_pool(0, 0)
        .with_h2t_desc_count(256)
}

fn user_queue(dev: &Device) -> QueueSpec {
    dev.dma_owner_attach(OWNER).unwrap();
    dev.dma_engine_init(OWNER, ENGINE).unwrap();
    let ring = || {
        dev.mem_alloc(OWNER, AllocRequest::device(0, 1, ring_bytes(COUNT).unwrap()))
            .unwrap()
    };
    let rings = QueueSpec {
        tx_count: COUNT,
        rx_count: COUNT,
        tx: ring(),
        rx: ring(),
        completion: None,
        axi_port: AxiPort::Default,
    };
    dev.dma_queue_init(OWNER, ENGINE, QUEUE, &rings).unwrap();
    rings
}

fn desc(dev: &Device, h: Handle, index: u64, len: u32) -> UdmaDesc {
    UdmaDesc::new(dev.mem_get_pa(h).unwrap(), len, 0)
        .with_ring_id(ring_id_for(index, ring_size_for(COUNT).unwrap()))
}

#[test]
fn user_descriptors_run_after_doorbell() {
    let b = bench(&config());
    let dev = &b.device;
    user_queue(dev);
    assert_eq!(dev.dma_engine_state(ENGINE).unwrap(), EngineState::Normal);

    let src = dev.mem_alloc(OWNER, AllocRequest::host(8192)).unwrap();
    let dst = dev
        .mem_alloc(OWNER, AllocRequest::device(1, 1, 8192))
        .unwrap();
    let data = pattern(8192, 5);
    dev.mem_write(src, 0, &data).unwrap();

    dev.queue_copy_descriptors(OWNER, ENGINE, QUEUE, RingKind::Tx, 0, &[desc(dev, src, 0, 8192)])
        .unwrap();
    dev.queue_copy_descriptors(OWNER, ENGINE, QUEUE, RingKind::Rx, 0, &[desc(dev, dst, 0, 8192)])
        .unwrap();
    dev.dma_queue_doorbell(OWNER, ENGINE, QUEUE, 1).unwrap();

    let mut back = vec![0u8; 8192];
    dev.mem_read(dst, 0, &mut back).unwrap();
    assert_eq!(back, data);
    assert_eq!(b.sim.transfer_log(ENGINE, QUEUE).len(), 1);

    dev.dma_ack_completed(OWNER, ENGINE, QUEUE, 1).unwrap();
    assert!(dev.dma_ack_completed(OWNER, ENGINE, QUEUE, 1).is_err());
}

#[test]
fn acks_advance_the_completion_ring() {
    let b = bench(&config());
    let dev = &b.device;
    dev.dma_owner_attach(OWNER).unwrap();
    dev.dma_engine_init(OWNER, ENGINE).unwrap();
    let ring = || {
        dev.mem_alloc(OWNER, AllocRequest::device(0, 1, ring_bytes(COUNT).unwrap()))
            .unwrap()
    };
    let rings = QueueSpec {
        tx_count: COUNT,
        rx_count: COUNT,
        tx: ring(),
        rx: ring(),
        completion: Some(ring()),
        axi_port: AxiPort::Default,
    };
    dev.dma_queue_init(OWNER, ENGINE, QUEUE, &rings).unwrap();

    let src = dev.mem_alloc(OWNER, AllocRequest::host(4096)).unwrap();
    let dst = dev
        .mem_alloc(OWNER, AllocRequest::device(1, 1, 4096))
        .unwrap();
    for i in 0..2u32 {
        let (tx, rx) = (desc(dev, src, i.into(), 4096), desc(dev, dst, i.into(), 4096));
        dev.queue_copy_descriptors(OWNER, ENGINE, QUEUE, RingKind::Tx, i, &[tx])
            .unwrap();
        dev.queue_copy_descriptors(OWNER, ENGINE, QUEUE, RingKind::Rx, i, &[rx])
            .unwrap();
    }
    dev.dma_queue_doorbell(OWNER, ENGINE, QUEUE, 2).unwrap();

    assert_eq!(b.sim.completion_head(ENGINE, QUEUE), 0);
    dev.dma_ack_completed(OWNER, ENGINE, QUEUE, 2).unwrap();
    assert_eq!(b.sim.completion_head(ENGINE, QUEUE), 2);
}

#[test]
fn descriptors_must_point_into_live_chunks() {
    let b = bench(&config());
    let dev = &b.device;
    user_queue(dev);
    let buf = dev.mem_alloc(OWNER, AllocRequest::host(4096)).unwrap();

    let stray = UdmaDesc::new(0xdead_0000, 64, 0);
    assert!(matches!(
        dev.queue_copy_descriptors(OWNER, ENGINE, QUEUE, RingKind::Tx, 0, &[stray]),
        Err(DriverError::InvalidArgument(_))
    ));
    let overrun = desc(dev, buf, 0, 8192);
    assert!(
        dev.queue_copy_descriptors(OWNER, ENGINE, QUEUE, RingKind::Tx, 0, &[overrun])
            .is_err()
    );

    // The AXI port bit is not part of the address.
    let hal = dev.hal().clone();
    let mut routed = desc(dev, buf, 0, 4096);
    routed.buf_ptr |= hal.axi_port_bit();
    dev.queue_copy_descriptors(OWNER, ENGINE, QUEUE, RingKind::Tx, 0, &[routed])
        .unwrap();

    // Once the chunk is gone its range is rejected.
    dev.mem_free(buf).unwrap();
    assert!(
        dev.queue_copy_descriptors(OWNER, ENGINE, QUEUE, RingKind::Tx, 0, &[routed])
            .is_err()
    );
}

#[test]
fn only_the_owner_drives_queues() {
    let b = bench(&config());
    let dev = &b.device;
    user_queue(dev);
    let intruder = ProcessId(31);

    assert!(matches!(
        dev.dma_queue_doorbell(intruder, ENGINE, QUEUE, 1),
        Err(DriverError::Busy(_))
    ));
    assert!(matches!(
        dev.dma_set_engine_state(intruder, ENGINE, EngineState::Disable),
        Err(DriverError::Busy(_))
    ));

    dev.process_attach(OWNER).unwrap();
    dev.process_detach(OWNER);
    dev.dma_owner_attach(intruder).unwrap();
}

#[test]
fn engine_state_follows_requests() {
    let b = bench(&config());
    let dev = &b.device;
    user_queue(dev);
    dev.dma_set_engine_state(OWNER, ENGINE, EngineState::Abort)
        .unwrap();
    assert_eq!(dev.dma_engine_state(ENGINE).unwrap(), EngineState::Abort);
    let (m2s, s2m) = b.sim.engine_state(ENGINE);
    assert_eq!(EngineState::from_code(m2s), Some(EngineState::Abort));
    assert_eq!(m2s, s2m);
    dev.dma_set_engine_state(OWNER, ENGINE, EngineState::Normal)
        .unwrap();
    assert_eq!(dev.dma_engine_state(ENGINE).unwrap(), EngineState::Normal);
}

#[test]
fn released_queue_refuses_doorbells() {
    let b = bench(&config());
    let dev = &b.device;
    user_queue(dev);
    dev.dma_queue_release(OWNER, ENGINE, QUEUE).unwrap();
    assert!(matches!(
        dev.dma_queue_doorbell(OWNER, ENGINE, QUEUE, 1),
        Err(DriverError::InvalidArgument(_))
    ));
    assert!(dev.dma_queue_release(OWNER, ENGINE, QUEUE).is_err());
}

#[test]
fn undersized_ring_chunk_is_rejected() {
    let b = bench(&config());
    let dev = &b.device;
    dev.dma_owner_attach(OWNER).unwrap();
    let small = dev
        .mem_alloc(OWNER, AllocRequest::device(0, 1, 4096))
        .unwrap();
    let rings = QueueSpec {
        tx_count: 1024,
        rx_count: 1024,
        tx: small,
        rx: small,
        completion: None,
        axi_port: AxiPort::Alternate,
    };
    assert!(matches!(
        dev.dma_queue_init(OWNER, ENGINE, QUEUE, &rings),
        Err(DriverError::InvalidArgument(_))
    ));
}

#[test]
fn oversized_descriptor_count_is_rejected() {
    let b = bench(&config());
    let dev = &b.device;
    dev.dma_owner_attach(OWNER).unwrap();
    dev.dma_engine_init(OWNER, ENGINE).unwrap();
    let ring = dev
        .mem_alloc(OWNER, AllocRequest::device(0, 1, ring_bytes(COUNT).unwrap()))
        .unwrap();

    for (tx_count, rx_count) in [(u32::MAX, COUNT), (COUNT, u32::MAX), (MAX_RING_DESCS + 1, COUNT)] {
        let rings = QueueSpec {
            tx_count,
            rx_count,
            tx: ring,
            rx: ring,
            completion: None,
            axi_port: AxiPort::Default,
        };
        assert!(matches!(
            dev.dma_queue_init(OWNER, ENGINE, QUEUE, &rings),
            Err(DriverError::InvalidArgument(_))
        ));
    }
}
