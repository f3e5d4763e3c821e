//! Device reset coordination.
//!
//! Requests queue up on a pending list. A dedicated worker drains the list, merging every
//! contiguous run of core-level requests into one hardware reset, and files each request on a
//! completed list until its submitter collects the result with [`ResetCoordinator::wait`].

#![allow(clippy::cast_possible_truncation)]

use crate::config::DriverConfig;
use crate::dma::ResetWindow;
use crate::error::{DriverError, DriverResult};
use crate::hal::{Clock, FirmwareIo};
use crate::mem::ProcessId;
use crate::utils::CoreMask;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

// ===============================================================================================
// Public Types
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Started,
    Completed,
    Failed,
}

/// Externally visible device state, driven by full-device resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Ready,
    Reset,
    Invalid,
}

/// Ticket for a submitted reset request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResetId {
    slot: u32,
    generation: u32,
}

impl ResetId {
    #[must_use]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self {
            slot: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

/// Work the coordinator delegates to the rest of the device after the hardware comes back.
pub trait ResetHooks: Send + Sync {
    /// Rebuilds DMA ring state for the reset cores.
    ///
    /// # Errors
    /// A failure marks every request of the batch as failed.
    fn reinit_dma(&self, cores: CoreMask) -> DriverResult<()>;

    /// Runs after every batch, successful or not.
    fn post_reset(&self, cores: CoreMask, ok: bool);
}

#[derive(Debug, Clone, Copy)]
struct ResetTiming {
    timeout_ms: u64,
    poll_interval_ms: u64,
    no_reset: bool,
}

// ===============================================================================================
// Request Lists
// ===============================================================================================

#[derive(Debug)]
struct Node {
    requester: ProcessId,
    cores: CoreMask,
    state: ResetState,
    prev: Option<u32>,
    next: Option<u32>,
}

impl Node {
    const fn is_universal(&self) -> bool {
        self.cores.is_all()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

#[derive(Debug, Default, Clone, Copy)]
struct List {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

/// Everything the worker mutates, behind one lock.
#[derive(Debug)]
struct ResetQueue {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pending: List,
    completed: List,
    /// Requests the worker is executing right now.
    in_flight: Vec<u32>,
    device_state: DeviceState,
    stop: bool,
}

/// A run of requests executed as one hardware operation.
struct Batch {
    slots: Vec<u32>,
    cores: CoreMask,
    universal: bool,
}

impl ResetQueue {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            pending: List::default(),
            completed: List::default(),
            in_flight: Vec::new(),
            device_state: DeviceState::Ready,
            stop: false,
        }
    }

    fn node(&self, slot: u32) -> &Node {
        match self.slots[slot as usize].node.as_ref() {
            Some(n) => n,
            None => panic!("reset list links vacant slot {slot}"),
        }
    }

    fn node_mut(&mut self, slot: u32) -> &mut Node {
        match self.slots[slot as usize].node.as_mut() {
            Some(n) => n,
            None => panic!("reset list links vacant slot {slot}"),
        }
    }

    fn lookup(&self, id: ResetId) -> Option<&Node> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn insert(&mut self, node: Node) -> ResetId {
        let slot = match self.free.pop() {
            Some(s) => s,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let entry = &mut self.slots[slot as usize];
        entry.generation = entry.generation.wrapping_add(1).max(1);
        entry.node = Some(node);
        ResetId {
            slot,
            generation: entry.generation,
        }
    }

    fn remove(&mut self, slot: u32) {
        let entry = &mut self.slots[slot as usize];
        entry.node = None;
        self.free.push(slot);
    }

    fn push_back(&mut self, pending: bool, slot: u32) {
        let list = if pending { self.pending } else { self.completed };
        {
            let n = self.node_mut(slot);
            n.prev = list.tail;
            n.next = None;
        }
        if let Some(tail) = list.tail {
            self.node_mut(tail).next = Some(slot);
        }
        let list = if pending {
            &mut self.pending
        } else {
            &mut self.completed
        };
        list.head = list.head.or(Some(slot));
        list.tail = Some(slot);
        list.len += 1;
    }

    fn unlink(&mut self, pending: bool, slot: u32) {
        let (prev, next) = {
            let n = self.node_mut(slot);
            let links = (n.prev, n.next);
            n.prev = None;
            n.next = None;
            links
        };
        if let Some(p) = prev {
            self.node_mut(p).next = next;
        }
        if let Some(n) = next {
            self.node_mut(n).prev = prev;
        }
        let list = if pending {
            &mut self.pending
        } else {
            &mut self.completed
        };
        if list.head == Some(slot) {
            list.head = next;
        }
        if list.tail == Some(slot) {
            list.tail = prev;
        }
        list.len -= 1;
    }

    fn has_outstanding(&self, requester: ProcessId) -> bool {
        self.slots.iter().filter_map(|s| s.node.as_ref()).any(|n| {
            n.requester == requester && n.state == ResetState::Started && !n.is_universal()
        })
    }

    /// Detaches the next batch from the head of the pending list.
    ///
    /// A universal request always runs alone; otherwise the contiguous run of core-level
    /// requests is merged.
    fn take_batch(&mut self) -> Option<Batch> {
        let head = self.pending.head?;
        if self.node(head).is_universal() {
            self.unlink(true, head);
            self.in_flight.push(head);
            return Some(Batch {
                slots: vec![head],
                cores: CoreMask::ALL,
                universal: true,
            });
        }

        let mut slots = Vec::new();
        let mut cores = CoreMask::default();
        let mut cursor = Some(head);
        while let Some(slot) = cursor {
            let node = self.node(slot);
            if node.is_universal() {
                break;
            }
            cores = cores.union(node.cores);
            cursor = node.next;
            slots.push(slot);
        }
        for &slot in &slots {
            self.unlink(true, slot);
        }
        self.in_flight.extend_from_slice(&slots);
        Some(Batch {
            slots,
            cores,
            universal: false,
        })
    }

    fn finish(&mut self, batch: &Batch, ok: bool) {
        self.in_flight.retain(|s| !batch.slots.contains(s));
        if batch.universal {
            self.device_state = if ok {
                DeviceState::Ready
            } else {
                DeviceState::Invalid
            };
            for &slot in &batch.slots {
                self.remove(slot);
            }
            return;
        }

        let state = if ok {
            ResetState::Completed
        } else {
            ResetState::Failed
        };
        for &slot in &batch.slots {
            self.node_mut(slot).state = state;
            self.push_back(false, slot);
        }
    }

    /// Drops every node. Used once the worker is gone.
    fn reclaim(&mut self) -> usize {
        let live = self.slots.iter().filter(|s| s.node.is_some()).count();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.node.take().is_some() {
                self.free.push(i as u32);
            }
        }
        self.pending = List::default();
        self.completed = List::default();
        self.in_flight.clear();
        live
    }
}

// ===============================================================================================
// Coordinator
// ===============================================================================================

struct Shared {
    queue: Mutex<ResetQueue>,
    wake: Condvar,
    firmware: Arc<dyn FirmwareIo>,
    clock: Arc<dyn Clock>,
    window: Arc<ResetWindow>,
    hooks: Arc<dyn ResetHooks>,
    timing: ResetTiming,
}

pub struct ResetCoordinator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ResetCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResetCoordinator")
            .field("timing", &self.shared.timing)
            .field("running", &self.worker.lock().is_some())
            .finish_non_exhaustive()
    }
}

impl ResetCoordinator {
    /// Creates a coordinator whose worker is not running yet. Requests submitted before
    /// [`Self::start`] wait on the pending list.
    #[must_use]
    pub fn new(
        firmware: Arc<dyn FirmwareIo>,
        clock: Arc<dyn Clock>,
        window: Arc<ResetWindow>,
        hooks: Arc<dyn ResetHooks>,
        config: &DriverConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(ResetQueue::new()),
                wake: Condvar::new(),
                firmware,
                clock,
                window,
                hooks,
                timing: ResetTiming {
                    timeout_ms: config.reset_timeout_ms,
                    poll_interval_ms: config.reset_poll_interval_ms,
                    no_reset: config.no_reset,
                },
            }),
            worker: Mutex::new(None),
        }
    }

    /// Spawns the worker thread. Does nothing if it is already running.
    ///
    /// # Errors
    /// `Io` if the thread cannot be created.
    pub fn start(&self) -> DriverResult<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        self.shared.queue.lock().stop = false;
        let handle = std::thread::Builder::new()
            .name("npu-reset".to_string())
            .spawn({
                let shared = self.shared.clone();
                move || run(&shared)
            })?;
        *worker = Some(handle);
        Ok(())
    }

    /// Queues a reset of `cores` on behalf of `requester`.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty mask, `InUse` if the requester already has a request
    /// outstanding.
    pub fn request(&self, requester: ProcessId, cores: CoreMask) -> DriverResult<ResetId> {
        if cores.0 == 0 {
            return Err(DriverError::invalid("reset request without cores"));
        }
        if cores.is_all() {
            return Err(DriverError::invalid(
                "full-device resets go through request_all",
            ));
        }

        let id = {
            let mut queue = self.shared.queue.lock();
            if queue.has_outstanding(requester) {
                return Err(DriverError::InUse(format!(
                    "pid {} already has a reset pending",
                    requester.0
                )));
            }
            let id = queue.insert(Node {
                requester,
                cores,
                state: ResetState::Started,
                prev: None,
                next: None,
            });
            queue.push_back(true, id.slot);
            id
        };
        self.shared.wake.notify_one();
        tracing::debug!(pid = requester.0, cores = cores.0, "reset requested");
        Ok(id)
    }

    /// Queues a fire-and-forget reset of the whole device. Progress shows up in
    /// [`Self::device_state`].
    pub fn request_all(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.device_state = DeviceState::Reset;
            let id = queue.insert(Node {
                requester: ProcessId::KERNEL,
                cores: CoreMask::ALL,
                state: ResetState::Started,
                prev: None,
                next: None,
            });
            queue.push_back(true, id.slot);
        }
        self.shared.wake.notify_one();
        tracing::info!("full device reset requested");
    }

    /// Current state of a request without consuming it.
    ///
    /// # Errors
    /// `NotFound` for an unknown or already collected id.
    pub fn status(&self, id: ResetId) -> DriverResult<ResetState> {
        self.shared
            .queue
            .lock()
            .lookup(id)
            .map(|n| n.state)
            .ok_or(DriverError::NotFound)
    }

    /// Spins, yielding between polls, until the request leaves `Started`, then removes it.
    ///
    /// # Errors
    /// `NotFound` for an unknown id, `Cancelled` once `cancel` is raised. A cancelled request
    /// stays queued and is reclaimed at teardown.
    pub fn wait(&self, id: ResetId, cancel: &AtomicBool) -> DriverResult<ResetState> {
        loop {
            {
                let mut queue = self.shared.queue.lock();
                let state = queue.lookup(id).map(|n| n.state).ok_or(DriverError::NotFound)?;
                if state != ResetState::Started {
                    queue.unlink(false, id.slot);
                    queue.remove(id.slot);
                    return Ok(state);
                }
            }
            if cancel.load(Ordering::Acquire) {
                return Err(DriverError::Cancelled);
            }
            self.shared.clock.yield_now();
        }
    }

    #[must_use]
    pub fn device_state(&self) -> DeviceState {
        self.shared.queue.lock().device_state
    }

    /// Requests still waiting for the worker.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.queue.lock().pending.len
    }

    /// Finished requests nobody collected yet.
    #[must_use]
    pub fn completed_len(&self) -> usize {
        self.shared.queue.lock().completed.len
    }

    /// Stops the worker and drops every request still queued.
    pub fn stop(&self) {
        self.shared.queue.lock().stop = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            tracing::error!("reset worker panicked");
        }
        let dropped = self.shared.queue.lock().reclaim();
        if dropped > 0 {
            tracing::debug!(dropped, "reclaimed reset requests at teardown");
        }
    }
}

impl Drop for ResetCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

// ===============================================================================================
// Worker
// ===============================================================================================

fn run(shared: &Shared) {
    loop {
        let batch = {
            let mut queue = shared.queue.lock();
            while queue.pending.len == 0 && !queue.stop {
                shared.wake.wait(&mut queue);
            }
            if queue.stop {
                return;
            }
            match queue.take_batch() {
                Some(b) => b,
                None => continue,
            }
        };

        tracing::info!(
            cores = batch.cores.0,
            requests = batch.slots.len(),
            "executing reset"
        );
        let ok = match shared.execute(batch.cores) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(cores = batch.cores.0, error = %e, "reset failed");
                false
            }
        };
        shared.hooks.post_reset(batch.cores, ok);
        shared.queue.lock().finish(&batch, ok);
    }
}

impl Shared {
    fn execute(&self, cores: CoreMask) -> DriverResult<()> {
        self.window.begin(self.clock.now_ns());
        let result = self.execute_steps(cores);
        self.window.end(self.clock.now_ns());
        result
    }

    fn execute_steps(&self, cores: CoreMask) -> DriverResult<()> {
        if !self.timing.no_reset {
            // 1. Trigger the reset.
            self.firmware.initiate_reset(cores)?;
            // 2. Wait for the firmware to bring the cores back.
            self.wait_ready()?;
        }
        // 3. DMA rings.
        self.hooks.reinit_dma(cores)
    }

    fn wait_ready(&self) -> DriverResult<()> {
        let start = self.clock.now_ns();
        let timeout_ns = self.timing.timeout_ms.saturating_mul(1_000_000);
        loop {
            if self.firmware.is_device_ready()? {
                return Ok(());
            }
            if self.clock.now_ns().saturating_sub(start) >= timeout_ns {
                return Err(DriverError::HardwareFault(
                    "device not ready after reset".into(),
                ));
            }
            self.clock
                .delay_us(self.timing.poll_interval_ms.max(1) * 1_000);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::ArchV3;
    use crate::hal::sim::{ManualClock, SimConfig, SimDevice};

    #[derive(Default)]
    struct RecordingHooks {
        reinit: Mutex<Vec<CoreMask>>,
        post: Mutex<Vec<(CoreMask, bool)>>,
        fail_reinit: AtomicBool,
    }

    impl ResetHooks for RecordingHooks {
        fn reinit_dma(&self, cores: CoreMask) -> DriverResult<()> {
            self.reinit.lock().push(cores);
            if self.fail_reinit.load(Ordering::SeqCst) {
                return Err(DriverError::HardwareFault("ring rebuild".into()));
            }
            Ok(())
        }

        fn post_reset(&self, cores: CoreMask, ok: bool) {
            self.post.lock().push((cores, ok));
        }
    }

    fn setup(config: &DriverConfig) -> (Arc<SimDevice>, Arc<RecordingHooks>, ResetCoordinator) {
        let sim = SimDevice::new(Arc::new(ArchV3), SimConfig::default());
        let hooks = Arc::new(RecordingHooks::default());
        let coordinator = ResetCoordinator::new(
            sim.clone(),
            Arc::new(ManualClock::new()),
            Arc::new(ResetWindow::new()),
            hooks.clone(),
            config,
        );
        (sim, hooks, coordinator)
    }

    fn never() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn queued_requests_coalesce() {
        let (sim, hooks, coordinator) = setup(&DriverConfig::default());
        let ids: Vec<ResetId> = (0..4)
            .map(|i| {
                coordinator
                    .request(ProcessId(100 + i), CoreMask::single(i))
                    .unwrap()
            })
            .collect();
        assert_eq!(coordinator.pending_len(), 4);

        coordinator.start().unwrap();
        for id in ids {
            assert_eq!(coordinator.wait(id, &never()).unwrap(), ResetState::Completed);
        }
        assert_eq!(sim.reset_history(), vec![CoreMask(0b1111)]);
        assert_eq!(*hooks.post.lock(), vec![(CoreMask(0b1111), true)]);
        assert_eq!(coordinator.completed_len(), 0);
    }

    #[test]
    fn one_outstanding_request_per_requester() {
        let (_sim, _hooks, coordinator) = setup(&DriverConfig::default());
        coordinator.request(ProcessId(7), CoreMask::single(0)).unwrap();
        assert!(matches!(
            coordinator.request(ProcessId(7), CoreMask::single(1)),
            Err(DriverError::InUse(_))
        ));
        assert!(coordinator.request(ProcessId(8), CoreMask::single(1)).is_ok());
    }

    #[test]
    fn failure_marks_batch_and_still_runs_hook() {
        let (sim, hooks, coordinator) = setup(&DriverConfig::default());
        sim.set_reset_behavior(1, 0);
        let a = coordinator.request(ProcessId(1), CoreMask::single(0)).unwrap();
        let b = coordinator.request(ProcessId(2), CoreMask::single(2)).unwrap();
        coordinator.start().unwrap();

        assert_eq!(coordinator.wait(a, &never()).unwrap(), ResetState::Failed);
        assert_eq!(coordinator.wait(b, &never()).unwrap(), ResetState::Failed);
        // Step 1 failed: no ring rebuild, hook told about the failure.
        assert!(hooks.reinit.lock().is_empty());
        assert_eq!(*hooks.post.lock(), vec![(CoreMask(0b101), false)]);
    }

    #[test]
    fn no_reset_mode_skips_hardware() {
        let config = DriverConfig::default().no_reset();
        let (sim, hooks, coordinator) = setup(&config);
        coordinator.start().unwrap();
        let id = coordinator.request(ProcessId(3), CoreMask::single(1)).unwrap();
        assert_eq!(coordinator.wait(id, &never()).unwrap(), ResetState::Completed);
        assert!(sim.reset_history().is_empty());
        assert_eq!(*hooks.reinit.lock(), vec![CoreMask::single(1)]);
    }

    #[test]
    fn universal_request_drives_device_state() {
        let (sim, _hooks, coordinator) = setup(&DriverConfig::default());
        coordinator.request_all();
        assert_eq!(coordinator.device_state(), DeviceState::Reset);
        coordinator.start().unwrap();
        while coordinator.device_state() == DeviceState::Reset {
            std::thread::yield_now();
        }
        assert_eq!(coordinator.device_state(), DeviceState::Ready);
        assert_eq!(sim.reset_history(), vec![CoreMask::ALL]);
        assert_eq!(coordinator.completed_len(), 0);
    }

    #[test]
    fn device_that_never_comes_back_is_invalid() {
        let config = DriverConfig::default().with_reset_timeout_ms(50);
        let (sim, hooks, coordinator) = setup(&config);
        sim.set_never_ready(true);
        coordinator.request_all();
        coordinator.start().unwrap();
        while coordinator.device_state() == DeviceState::Reset {
            std::thread::yield_now();
        }
        assert_eq!(coordinator.device_state(), DeviceState::Invalid);
        assert_eq!(*hooks.post.lock(), vec![(CoreMask::ALL, false)]);
    }

    #[test]
    fn universal_request_breaks_the_run() {
        let (sim, _hooks, coordinator) = setup(&DriverConfig::default());
        let a = coordinator.request(ProcessId(1), CoreMask::single(0)).unwrap();
        coordinator.request_all();
        let b = coordinator.request(ProcessId(2), CoreMask::single(1)).unwrap();
        coordinator.start().unwrap();
        coordinator.wait(a, &never()).unwrap();
        coordinator.wait(b, &never()).unwrap();
        assert_eq!(
            sim.reset_history(),
            vec![CoreMask::single(0), CoreMask::ALL, CoreMask::single(1)]
        );
    }

    #[test]
    fn cancelled_wait_leaves_request_for_teardown() {
        let (_sim, _hooks, coordinator) = setup(&DriverConfig::default());
        let id = coordinator.request(ProcessId(5), CoreMask::single(0)).unwrap();
        let cancel = AtomicBool::new(true);
        assert!(matches!(coordinator.wait(id, &cancel), Err(DriverError::Cancelled)));
        assert_eq!(coordinator.status(id).unwrap(), ResetState::Started);

        coordinator.stop();
        assert!(matches!(coordinator.status(id), Err(DriverError::NotFound)));
    }

    #[test]
    fn ids_are_not_reused_across_generations() {
        let (_sim, _hooks, coordinator) = setup(&DriverConfig::default());
        coordinator.start().unwrap();
        let first = coordinator.request(ProcessId(9), CoreMask::single(0)).unwrap();
        coordinator.wait(first, &never()).unwrap();
        let second = coordinator.request(ProcessId(9), CoreMask::single(0)).unwrap();
        assert_ne!(first, second);
        assert!(matches!(coordinator.status(first), Err(DriverError::NotFound)));
        assert_eq!(ResetId::from_bits(second.to_bits()), second);
    }
}
