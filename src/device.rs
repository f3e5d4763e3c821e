//! One bound accelerator: every core component wired together behind the entry points the
//! user-facing layer calls.
//!
//! Every entry point that acts on behalf of a process takes the caller's [`ProcessId`]
//! explicitly.

#![allow(clippy::cast_possible_truncation)]

use crate::config::DriverConfig;
use crate::datastore::{Datastore, DatastoreCounters};
use crate::dma::udma::UdmaDesc;
use crate::dma::zerocopy::{self, Direction};
use crate::dma::{
    AsyncHandle, AxiPort, DmaCopy, DmaEngines, EngineState, QueueInit, ResetWindow, RingKind,
};
use crate::error::{DriverError, DriverResult};
use crate::hal::firmware::{discover_memory_layout, read_identity};
use crate::hal::regs::{SEM_DEC_OFFSET, SEM_INC_OFFSET, SEM_SET_OFFSET};
use crate::hal::sim::SimDevice;
use crate::hal::{
    self, ArchHal, ChipArch, Clock, DmaMemory, FirmwareIo, RegisterAccess, UserPages,
};
use crate::mem::{
    AllocRequest, ChunkId, Handle, Lifespan, MemCategory, MemChunkInfo, MemLocation, MempoolSet,
    PoolUsage, ProcessId,
};
use crate::reset::{DeviceState, ResetCoordinator, ResetHooks, ResetId, ResetState};
use crate::utils::CoreMask;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Largest piece of a device chunk staged through host memory at once.
const BOUNCE_SIZE: u64 = 256 * 1024;

/// Platform services a device is bound with.
#[derive(Clone)]
pub struct DeviceResources {
    pub regs: Arc<dyn RegisterAccess>,
    pub firmware: Arc<dyn FirmwareIo>,
    pub memory: Arc<dyn DmaMemory>,
    pub user_pages: Arc<dyn UserPages>,
    pub clock: Arc<dyn Clock>,
}

impl DeviceResources {
    /// Every service backed by one simulated device.
    #[must_use]
    pub fn simulated(sim: &Arc<SimDevice>, clock: Arc<dyn Clock>) -> Self {
        Self {
            regs: sim.clone(),
            firmware: sim.clone(),
            memory: sim.clone(),
            user_pages: sim.clone(),
            clock,
        }
    }
}

/// Identity and topology, read from the firmware once per device boot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub index: u32,
    pub arch: ChipArch,
    pub revision: u32,
    pub serial: u32,
    pub core_count: u32,
    /// `(base, size)` of every DRAM channel.
    pub dram_channels: Vec<(u64, u64)>,
    /// Devices reachable over the chip-to-chip links.
    pub connected_devices: Vec<u32>,
}

/// Geometry and backing handles of a user DMA queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSpec {
    pub tx_count: u32,
    pub rx_count: u32,
    pub tx: Handle,
    pub rx: Handle,
    pub completion: Option<Handle>,
    pub axi_port: AxiPort,
}

// ===============================================================================================
// Shared Core
// ===============================================================================================

struct DeviceCore {
    index: u32,
    hal: Arc<dyn ArchHal>,
    regs: Arc<dyn RegisterAccess>,
    firmware: Arc<dyn FirmwareIo>,
    user_pages: Arc<dyn UserPages>,
    pools: Arc<MempoolSet>,
    engines: Arc<DmaEngines>,
    copy: DmaCopy,
    datastore: Arc<Datastore>,

    info: Mutex<Option<DeviceInfo>>,
    dma_owner: Mutex<Option<ProcessId>>,
    /// Attach count per process.
    processes: Mutex<BTreeMap<ProcessId, u32>>,
}

impl ResetHooks for DeviceCore {
    fn reinit_dma(&self, cores: CoreMask) -> DriverResult<()> {
        for core in cores.cores(self.hal.core_count()) {
            self.engines.reinit_core(core);
        }
        Ok(())
    }

    fn post_reset(&self, cores: CoreMask, ok: bool) {
        if cores.is_all() {
            *self.info.lock() = None;
        }
        let mut blob = Vec::with_capacity(9);
        blob.push(u8::from(ok));
        blob.extend_from_slice(&cores.0.to_le_bytes());
        if let Err(e) = self.firmware.post_metric(&blob) {
            tracing::warn!(device = self.index, error = %e, "failed to post reset metric");
        }
    }
}

// ===============================================================================================
// Device
// ===============================================================================================

pub struct Device {
    reset: ResetCoordinator,
    window: Arc<ResetWindow>,
    core: Arc<DeviceCore>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("index", &self.core.index)
            .field("arch", &self.core.hal.arch())
            .field("pools", &self.core.pools)
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Brings a device up: selects the HAL, discovers memory, builds the pools, the H2T
    /// queues and the datastore, and starts the reset worker.
    ///
    /// # Errors
    /// `InvalidArgument` if a device of another generation was bound earlier, `HardwareFault`
    /// if the firmware cannot be queried, and any allocation failure of the H2T queues.
    pub fn probe(
        index: u32,
        arch: ChipArch,
        config: &DriverConfig,
        resources: DeviceResources,
    ) -> DriverResult<Self> {
        let DeviceResources {
            regs,
            firmware,
            memory,
            user_pages,
            clock,
        } = resources;

        // 1. Hardware identity and memory layout.
        let hal = hal::select(arch)?;
        let (revision, serial) = read_identity(firmware.as_ref())?;
        let layout = discover_memory_layout(firmware.as_ref(), hal.as_ref())?;
        tracing::info!(
            device = index,
            ?arch,
            revision,
            serial,
            channels = layout.channels.len(),
            "probing device"
        );

        // 2. Memory.
        let pools = Arc::new(MempoolSet::new(
            hal.clone(),
            memory.clone(),
            layout,
            config,
        ));
        let datastore = Datastore::new(pools.clone(), config.datastore_size);

        // 3. DMA.
        let engines = Arc::new(DmaEngines::new(hal.clone(), regs.clone(), memory.clone()));
        let window = Arc::new(ResetWindow::new());
        let copy = DmaCopy::new(
            hal.as_ref(),
            &pools,
            engines.clone(),
            memory,
            clock.clone(),
            window.clone(),
            config,
        )?;

        // 4. Reset worker.
        let core = Arc::new(DeviceCore {
            index,
            hal,
            regs,
            firmware: firmware.clone(),
            user_pages,
            pools,
            engines,
            copy,
            datastore,
            info: Mutex::new(None),
            dma_owner: Mutex::new(None),
            processes: Mutex::new(BTreeMap::new()),
        });
        let reset = ResetCoordinator::new(firmware, clock, window.clone(), core.clone(), config);
        reset.start()?;

        Ok(Self {
            reset,
            window,
            core,
        })
    }

    #[must_use]
    pub fn index(&self) -> u32 {
        self.core.index
    }

    #[must_use]
    pub fn hal(&self) -> &Arc<dyn ArchHal> {
        &self.core.hal
    }

    #[must_use]
    pub fn pools(&self) -> &Arc<MempoolSet> {
        &self.core.pools
    }

    #[must_use]
    pub fn copy(&self) -> &DmaCopy {
        &self.core.copy
    }

    #[must_use]
    pub fn engines(&self) -> &Arc<DmaEngines> {
        &self.core.engines
    }

    /// Interval of the latest reset, as consulted by timed-out copies.
    #[must_use]
    pub fn reset_window(&self) -> &Arc<ResetWindow> {
        &self.window
    }

    // -------------------------------------------------------------------------------------------
    // Processes
    // -------------------------------------------------------------------------------------------

    /// Registers an open of the device by `pid` and makes sure it has a datastore.
    ///
    /// # Errors
    /// Propagates datastore allocation failures.
    pub fn process_attach(&self, pid: ProcessId) -> DriverResult<()> {
        *self.core.processes.lock().entry(pid).or_insert(0) += 1;
        if let Err(e) = self.core.datastore.acquire(pid) {
            self.process_detach(pid);
            return Err(e);
        }
        tracing::debug!(device = self.core.index, pid = pid.0, "process attached");
        Ok(())
    }

    /// Drops one attach of `pid`. The last detach reclaims the memory it left behind, and the
    /// last process overall takes the cross-process chunks with it. Returns the chunks freed.
    pub fn process_detach(&self, pid: ProcessId) -> usize {
        let (last_of_pid, none_left) = {
            let mut processes = self.core.processes.lock();
            let last = match processes.get_mut(&pid) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    processes.remove(&pid);
                    true
                }
                None => return 0,
            };
            (last, processes.is_empty())
        };
        if !last_of_pid {
            return 0;
        }

        {
            let mut owner = self.core.dma_owner.lock();
            if *owner == Some(pid) {
                *owner = None;
            }
        }
        let mut freed = self.core.pools.release_process(pid);
        self.core.datastore.release(pid);
        if none_left {
            freed += self.core.pools.release_all_processes();
        }
        tracing::debug!(device = self.core.index, pid = pid.0, freed, "process detached");
        freed
    }

    /// Ends a call context of `pid`, freeing its `Local` chunks.
    pub fn release_local(&self, pid: ProcessId) -> usize {
        self.core.pools.release_local(pid)
    }

    /// Claims the device's user DMA queues for `pid`.
    ///
    /// # Errors
    /// `Busy` if another process holds them.
    pub fn dma_owner_attach(&self, pid: ProcessId) -> DriverResult<()> {
        let mut owner = self.core.dma_owner.lock();
        match *owner {
            Some(current) if current != pid => Err(DriverError::Busy(format!(
                "device {} DMA is owned by pid {}",
                self.core.index, current.0
            ))),
            _ => {
                *owner = Some(pid);
                Ok(())
            }
        }
    }

    /// # Errors
    /// `InvalidArgument` if `pid` is not the owner.
    pub fn dma_owner_release(&self, pid: ProcessId) -> DriverResult<()> {
        let mut owner = self.core.dma_owner.lock();
        if *owner != Some(pid) {
            return Err(DriverError::invalid(format!(
                "pid {} does not own device {} DMA",
                pid.0, self.core.index
            )));
        }
        *owner = None;
        Ok(())
    }

    fn check_owner(&self, pid: ProcessId) -> DriverResult<()> {
        match *self.core.dma_owner.lock() {
            Some(owner) if owner == pid => Ok(()),
            Some(owner) => Err(DriverError::Busy(format!(
                "device {} DMA is owned by pid {}",
                self.core.index, owner.0
            ))),
            None => Err(DriverError::invalid(format!(
                "pid {} has not attached to device {} DMA",
                pid.0, self.core.index
            ))),
        }
    }

    // -------------------------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------------------------

    /// Allocates a chunk for `pid` and publishes a handle for it.
    ///
    /// # Errors
    /// See [`MempoolSet::alloc`]; `OutOfMemory` also when the handle table is exhausted.
    pub fn mem_alloc(&self, pid: ProcessId, req: AllocRequest) -> DriverResult<Handle> {
        let pools = &self.core.pools;
        let id = pools.alloc(pid, req)?;
        match pools.publish(id) {
            Ok(handle) => Ok(handle),
            Err(e) => {
                pools.free(id);
                Err(e)
            }
        }
    }

    /// Drops one reference on the chunk behind `handle`.
    ///
    /// # Errors
    /// `NotFound` for an unknown or already released handle.
    pub fn mem_free(&self, handle: Handle) -> DriverResult<()> {
        self.core.pools.free_handle(handle).map(drop)
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn mem_inc_ref(&self, handle: Handle) -> DriverResult<()> {
        let id = self.core.pools.resolve(handle)?;
        self.core.pools.inc_ref(id)
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn mem_get_pa(&self, handle: Handle) -> DriverResult<u64> {
        Ok(self.mem_info(handle)?.pa)
    }

    /// # Errors
    /// `NotFound` for an unknown handle.
    pub fn mem_info(&self, handle: Handle) -> DriverResult<MemChunkInfo> {
        let id = self.core.pools.resolve(handle)?;
        self.core.pools.chunk_info(id)
    }

    fn span(info: &MemChunkInfo, offset: u64, len: u64) -> DriverResult<u64> {
        match offset.checked_add(len) {
            Some(end) if len > 0 && end <= info.size => Ok(info.pa + offset),
            _ => Err(DriverError::invalid(format!(
                "range {offset:#x}+{len:#x} outside chunk of {:#x} bytes",
                info.size
            ))),
        }
    }

    /// H2T queue that serves copies touching `info`.
    fn copy_core(&self, info: &MemChunkInfo) -> u32 {
        info.core.unwrap_or(0) % self.core.hal.core_count()
    }

    /// DMA copy between two chunks.
    ///
    /// # Errors
    /// `NotFound` for an unknown handle, `InvalidArgument` for a range outside either chunk,
    /// `DmaTimeout` if the copy never completes.
    pub fn mem_copy(
        &self,
        src: Handle,
        src_offset: u64,
        dst: Handle,
        dst_offset: u64,
        size: u64,
    ) -> DriverResult<()> {
        let src_info = self.mem_info(src)?;
        let dst_info = self.mem_info(dst)?;
        let src_pa = Self::span(&src_info, src_offset, size)?;
        let dst_pa = Self::span(&dst_info, dst_offset, size)?;
        let core = match dst_info.location {
            MemLocation::Device => self.copy_core(&dst_info),
            MemLocation::Host => self.copy_core(&src_info),
        };
        self.core.copy.memcpy(core, src_pa, dst_pa, size)
    }

    /// Starts a chunk-to-chunk copy without waiting. See [`DmaCopy::memcpy_async`].
    ///
    /// # Errors
    /// As [`Self::mem_copy`], plus `InUse` when the next async context is still outstanding.
    pub fn mem_copy_async(
        &self,
        src: Handle,
        dst: Handle,
        size: u64,
        prev: Option<AsyncHandle>,
    ) -> DriverResult<AsyncHandle> {
        let src_info = self.mem_info(src)?;
        let dst_info = self.mem_info(dst)?;
        let src_pa = Self::span(&src_info, 0, size)?;
        let dst_pa = Self::span(&dst_info, 0, size)?;
        let core = prev
            .as_ref()
            .map_or_else(|| self.copy_core(&dst_info), AsyncHandle::core);
        self.core.copy.memcpy_async(core, src_pa, dst_pa, size, prev)
    }

    /// # Errors
    /// See [`DmaCopy::memcpy_wait`].
    pub fn mem_copy_wait(&self, handle: AsyncHandle) -> DriverResult<()> {
        self.core.copy.memcpy_wait(handle)
    }

    /// Reads from a chunk. Device chunks are staged through a host bounce buffer.
    ///
    /// # Errors
    /// `NotFound` for an unknown handle, `InvalidArgument` for an out-of-bounds range.
    pub fn mem_read(&self, handle: Handle, offset: u64, buf: &mut [u8]) -> DriverResult<()> {
        let info = self.mem_info(handle)?;
        let pa = Self::span(&info, offset, buf.len() as u64)?;
        if info.location == MemLocation::Host {
            return self.core.pools.read(info.id, offset, buf);
        }

        let core = self.copy_core(&info);
        self.with_bounce(buf.len() as u64, |bounce, bounce_pa| {
            let mut done = 0u64;
            for piece in buf.chunks_mut(BOUNCE_SIZE as usize) {
                self.core
                    .copy
                    .memcpy(core, pa + done, bounce_pa, piece.len() as u64)?;
                self.core.pools.read(bounce, 0, piece)?;
                done += piece.len() as u64;
            }
            Ok(())
        })
    }

    /// Writes into a chunk. Device chunks are staged through a host bounce buffer.
    ///
    /// # Errors
    /// As [`Self::mem_read`].
    pub fn mem_write(&self, handle: Handle, offset: u64, data: &[u8]) -> DriverResult<()> {
        let info = self.mem_info(handle)?;
        let pa = Self::span(&info, offset, data.len() as u64)?;
        if info.location == MemLocation::Host {
            return self.core.pools.write(info.id, offset, data);
        }

        let core = self.copy_core(&info);
        self.with_bounce(data.len() as u64, |bounce, bounce_pa| {
            let mut done = 0u64;
            for piece in data.chunks(BOUNCE_SIZE as usize) {
                self.core.pools.write(bounce, 0, piece)?;
                self.core
                    .copy
                    .memcpy(core, bounce_pa, pa + done, piece.len() as u64)?;
                done += piece.len() as u64;
            }
            Ok(())
        })
    }

    fn with_bounce(
        &self,
        len: u64,
        f: impl FnOnce(ChunkId, u64) -> DriverResult<()>,
    ) -> DriverResult<()> {
        let pools = &self.core.pools;
        let req = AllocRequest::host(len.min(BOUNCE_SIZE))
            .with_lifespan(Lifespan::Local)
            .with_category(MemCategory::Driver);
        let bounce = pools.alloc(ProcessId::KERNEL, req)?;
        let result = pools.chunk_info(bounce).and_then(|info| f(bounce, info.pa));
        pools.free(bounce);
        result
    }

    /// Fills `size` bytes of a chunk with `value`.
    ///
    /// # Errors
    /// As [`Self::mem_copy`].
    pub fn memset(&self, handle: Handle, offset: u64, value: u8, size: u64) -> DriverResult<()> {
        let info = self.mem_info(handle)?;
        let pa = Self::span(&info, offset, size)?;
        match info.location {
            MemLocation::Host => self
                .core
                .pools
                .write(info.id, offset, &vec![value; size as usize]),
            MemLocation::Device => self.core.copy.memset(self.copy_core(&info), pa, value, size),
        }
    }

    /// Moves data between pinned pages of `pid` and a device chunk.
    ///
    /// # Errors
    /// `InvalidArgument` for a host chunk or a range outside the chunk, plus everything
    /// [`zerocopy::memcpy_zero_copy`] reports.
    #[allow(clippy::too_many_arguments)]
    pub fn memcpy_zero_copy(
        &self,
        pid: ProcessId,
        core: u32,
        uaddr: u64,
        handle: Handle,
        offset: u64,
        size: u64,
        dir: Direction,
    ) -> DriverResult<()> {
        let info = self.mem_info(handle)?;
        if info.location != MemLocation::Device {
            return Err(DriverError::invalid("zero-copy target must be device memory"));
        }
        let pa = Self::span(&info, offset, size)?;
        zerocopy::memcpy_zero_copy(
            &self.core.copy,
            self.core.user_pages.as_ref(),
            pid,
            core,
            uaddr,
            pa,
            size,
            dir,
        )
    }

    #[must_use]
    pub fn pool_usage(&self) -> PoolUsage {
        self.core.pools.usage()
    }

    #[must_use]
    pub fn datastore_counters(&self, pid: ProcessId) -> DatastoreCounters {
        self.core.datastore.counters(pid)
    }

    /// Datastore chunk of `pid`, for mapping into the process.
    ///
    /// # Errors
    /// `NotFound` if `pid` is not attached.
    pub fn datastore_pa(&self, pid: ProcessId) -> DriverResult<u64> {
        let id = self
            .core
            .datastore
            .chunk(pid)
            .ok_or(DriverError::NotFound)?;
        Ok(self.core.pools.chunk_info(id)?.pa)
    }

    // -------------------------------------------------------------------------------------------
    // User DMA Queues
    // -------------------------------------------------------------------------------------------

    fn check_user_queue(&self, engine: u32, queue: u32) -> DriverResult<()> {
        let hal = &self.core.hal;
        if engine >= hal.dma_engine_count() || queue >= hal.dma_queue_count() {
            return Err(DriverError::invalid(format!(
                "invalid DMA engine {engine} queue {queue}"
            )));
        }
        let reserved =
            queue == hal.h2t_queue() && (0..hal.core_count()).any(|c| hal.h2t_engine(c) == engine);
        if reserved {
            return Err(DriverError::invalid(format!(
                "engine {engine} queue {queue} is reserved for driver copies"
            )));
        }
        Ok(())
    }

    /// # Errors
    /// `Busy`/`InvalidArgument` unless `pid` owns the device DMA.
    pub fn dma_engine_init(&self, pid: ProcessId, engine: u32) -> DriverResult<()> {
        self.check_owner(pid)?;
        self.core.engines.engine_init(engine)
    }

    /// Binds a user queue to the rings held by the given handles.
    ///
    /// # Errors
    /// Ownership errors, `InvalidArgument` for a reserved or unknown queue or undersized
    /// rings, `NotFound` for unknown handles.
    pub fn dma_queue_init(
        &self,
        pid: ProcessId,
        engine: u32,
        queue: u32,
        rings: &QueueSpec,
    ) -> DriverResult<()> {
        self.check_owner(pid)?;
        self.check_user_queue(engine, queue)?;
        let init = QueueInit {
            tx_count: rings.tx_count,
            rx_count: rings.rx_count,
            tx: self.mem_info(rings.tx)?,
            rx: self.mem_info(rings.rx)?,
            completion: rings.completion.map(|h| self.mem_info(h)).transpose()?,
            axi_port: rings.axi_port,
        };
        self.core
            .engines
            .acquire_engine(engine)?
            .queue_init(queue, &init)
    }

    /// # Errors
    /// Ownership errors, `InvalidArgument` for a reserved or uninitialized queue.
    pub fn dma_queue_release(&self, pid: ProcessId, engine: u32, queue: u32) -> DriverResult<()> {
        self.check_owner(pid)?;
        self.check_user_queue(engine, queue)?;
        self.core
            .engines
            .acquire_engine(engine)?
            .queue_release(queue)
    }

    /// # Errors
    /// Ownership errors, `InvalidArgument` for over-acknowledgement.
    pub fn dma_ack_completed(
        &self,
        pid: ProcessId,
        engine: u32,
        queue: u32,
        count: u32,
    ) -> DriverResult<()> {
        self.check_owner(pid)?;
        self.check_user_queue(engine, queue)?;
        self.core
            .engines
            .acquire_engine(engine)?
            .ack_completed(queue, count)
    }

    /// Copies user-built descriptors into a queue ring. Every descriptor must point into a
    /// live chunk.
    ///
    /// # Errors
    /// Ownership errors, `InvalidArgument` for a descriptor outside known memory or a range
    /// beyond the ring.
    pub fn queue_copy_descriptors(
        &self,
        pid: ProcessId,
        engine: u32,
        queue: u32,
        ring: RingKind,
        index: u32,
        descs: &[UdmaDesc],
    ) -> DriverResult<()> {
        self.check_owner(pid)?;
        self.check_user_queue(engine, queue)?;
        let axi = self.core.hal.axi_port_bit();
        for desc in descs.iter().filter(|d| !d.is_empty()) {
            self.core
                .pools
                .validate_dma_range(desc.buf_ptr & !axi, u64::from(desc.len()))?;
        }
        self.core
            .engines
            .acquire_engine(engine)?
            .write_descriptors(queue, ring, index, descs)
    }

    /// Tells the engine `count` descriptors were added to both rings of a user queue.
    ///
    /// # Errors
    /// Ownership errors, `InvalidArgument` for a reserved or uninitialized queue, `Busy` when
    /// the rings are full.
    pub fn dma_queue_doorbell(
        &self,
        pid: ProcessId,
        engine: u32,
        queue: u32,
        count: u32,
    ) -> DriverResult<()> {
        self.check_owner(pid)?;
        self.check_user_queue(engine, queue)?;
        self.core
            .engines
            .acquire_engine(engine)?
            .submit_written(queue, count)
    }

    /// # Errors
    /// `InvalidArgument` for an unknown engine.
    pub fn dma_engine_state(&self, engine: u32) -> DriverResult<EngineState> {
        Ok(self.core.engines.acquire_engine(engine)?.get_state())
    }

    /// # Errors
    /// Ownership errors, `InvalidArgument` for an unknown engine.
    pub fn dma_set_engine_state(
        &self,
        pid: ProcessId,
        engine: u32,
        state: EngineState,
    ) -> DriverResult<()> {
        self.check_owner(pid)?;
        self.core.engines.acquire_engine(engine)?.set_state(state);
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Semaphores and Events
    // -------------------------------------------------------------------------------------------

    fn semaphore_reg(&self, core: u32, idx: u32) -> DriverResult<u64> {
        let hal = &self.core.hal;
        if core >= hal.core_count() || idx >= hal.semaphore_count() {
            return Err(DriverError::invalid(format!(
                "invalid semaphore {idx} on core {core}"
            )));
        }
        Ok(hal.semaphore_reg(core, idx))
    }

    fn event_reg(&self, core: u32, idx: u32) -> DriverResult<u64> {
        let hal = &self.core.hal;
        if core >= hal.core_count() || idx >= hal.event_count() {
            return Err(DriverError::invalid(format!(
                "invalid event {idx} on core {core}"
            )));
        }
        Ok(hal.event_reg(core, idx))
    }

    /// # Errors
    /// `InvalidArgument` for a core or index outside the chip.
    pub fn semaphore_read(&self, core: u32, idx: u32) -> DriverResult<u32> {
        Ok(self.core.regs.read32(self.semaphore_reg(core, idx)?))
    }

    /// # Errors
    /// `InvalidArgument` for a core or index outside the chip.
    pub fn semaphore_write(&self, core: u32, idx: u32, value: u32) -> DriverResult<()> {
        let reg = self.semaphore_reg(core, idx)?;
        self.core.regs.write32(reg + SEM_SET_OFFSET, value);
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` for a core or index outside the chip.
    pub fn semaphore_increment(&self, core: u32, idx: u32, value: u32) -> DriverResult<()> {
        let reg = self.semaphore_reg(core, idx)?;
        self.core.regs.write32(reg + SEM_INC_OFFSET, value);
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` for a core or index outside the chip.
    pub fn semaphore_decrement(&self, core: u32, idx: u32, value: u32) -> DriverResult<()> {
        let reg = self.semaphore_reg(core, idx)?;
        self.core.regs.write32(reg + SEM_DEC_OFFSET, value);
        Ok(())
    }

    /// # Errors
    /// `InvalidArgument` for a core or index outside the chip.
    pub fn event_read(&self, core: u32, idx: u32) -> DriverResult<u32> {
        Ok(self.core.regs.read32(self.event_reg(core, idx)?))
    }

    /// # Errors
    /// `InvalidArgument` for a core or index outside the chip.
    pub fn event_write(&self, core: u32, idx: u32, value: u32) -> DriverResult<()> {
        self.core.regs.write32(self.event_reg(core, idx)?, value);
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Reset and Info
    // -------------------------------------------------------------------------------------------

    /// # Errors
    /// See [`ResetCoordinator::request`].
    pub fn reset_request(&self, pid: ProcessId, cores: CoreMask) -> DriverResult<ResetId> {
        self.reset.request(pid, cores)
    }

    /// # Errors
    /// See [`ResetCoordinator::wait`].
    pub fn reset_wait(&self, id: ResetId, cancel: &AtomicBool) -> DriverResult<ResetState> {
        self.reset.wait(id, cancel)
    }

    /// # Errors
    /// `NotFound` for an unknown or collected request.
    pub fn reset_status(&self, id: ResetId) -> DriverResult<ResetState> {
        self.reset.status(id)
    }

    /// Starts a full-device reset; poll [`Self::device_state`] for the outcome.
    pub fn reset_all(&self) {
        self.reset.request_all();
    }

    #[must_use]
    pub fn device_state(&self) -> DeviceState {
        self.reset.device_state()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.device_state() == DeviceState::Ready
    }

    /// Identity and topology, read from the firmware on first use after every full reset.
    ///
    /// # Errors
    /// `Busy` while a full reset is running, `HardwareFault` if the firmware cannot answer.
    pub fn device_info(&self) -> DriverResult<DeviceInfo> {
        if !self.is_ready() {
            return Err(DriverError::Busy(format!(
                "device {} is not ready",
                self.core.index
            )));
        }
        let mut cached = self.core.info.lock();
        if let Some(info) = cached.as_ref() {
            return Ok(info.clone());
        }

        let firmware = self.core.firmware.as_ref();
        let (revision, serial) = read_identity(firmware)?;
        let info = DeviceInfo {
            index: self.core.index,
            arch: self.core.hal.arch(),
            revision,
            serial,
            core_count: self.core.hal.core_count(),
            dram_channels: self
                .core
                .pools
                .layout()
                .channels
                .iter()
                .map(|c| (c.base, c.size))
                .collect(),
            connected_devices: firmware.topology()?,
        };
        tracing::debug!(device = self.core.index, "device info cached");
        *cached = Some(info.clone());
        Ok(info)
    }

    /// Stops the reset worker and force-frees every chunk. Returns the chunks freed.
    pub fn shutdown(self) -> usize {
        self.reset.stop();
        let freed = self.core.pools.teardown();
        tracing::info!(device = self.core.index, freed, "device shut down");
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{ManualClock, SimConfig};

    fn probe(config: &DriverConfig) -> (Arc<SimDevice>, Device) {
        let sim = SimDevice::new(hal::for_arch(ChipArch::V3), SimConfig::default());
        let resources = DeviceResources::simulated(&sim, Arc::new(ManualClock::new()));
        let device = Device::probe(0, ChipArch::V3, config, resources).unwrap();
        (sim, device)
    }

    #[test]
    fn dma_ownership_is_exclusive() {
        let (_sim, device) = probe(&DriverConfig::default());
        device.dma_owner_attach(ProcessId(10)).unwrap();
        device.dma_owner_attach(ProcessId(10)).unwrap();
        assert!(matches!(
            device.dma_owner_attach(ProcessId(11)),
            Err(DriverError::Busy(_))
        ));
        assert!(matches!(
            device.dma_engine_init(ProcessId(11), 0),
            Err(DriverError::Busy(_))
        ));
        assert!(device.dma_owner_release(ProcessId(11)).is_err());
        device.dma_owner_release(ProcessId(10)).unwrap();
        device.dma_owner_attach(ProcessId(11)).unwrap();
    }

    #[test]
    fn h2t_queues_are_not_user_queues() {
        let (_sim, device) = probe(&DriverConfig::default());
        let pid = ProcessId(3);
        device.dma_owner_attach(pid).unwrap();
        let hal = device.hal().clone();
        let ring = device
            .mem_alloc(pid, AllocRequest::device(0, 0, 4096))
            .unwrap();
        let rings = QueueSpec {
            tx_count: 64,
            rx_count: 64,
            tx: ring,
            rx: ring,
            completion: None,
            axi_port: AxiPort::Default,
        };
        assert!(matches!(
            device.dma_queue_init(pid, hal.h2t_engine(1), hal.h2t_queue(), &rings),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn semaphores_are_bounds_checked() {
        let (_sim, device) = probe(&DriverConfig::default());
        device.semaphore_write(1, 3, 10).unwrap();
        device.semaphore_increment(1, 3, 5).unwrap();
        device.semaphore_decrement(1, 3, 2).unwrap();
        assert_eq!(device.semaphore_read(1, 3).unwrap(), 13);
        assert_eq!(device.semaphore_read(2, 3).unwrap(), 0);

        device.event_write(0, 7, 1).unwrap();
        assert_eq!(device.event_read(0, 7).unwrap(), 1);

        let sems = device.hal().semaphore_count();
        assert!(device.semaphore_read(0, sems).is_err());
        assert!(device.semaphore_write(4, 0, 1).is_err());
        assert!(device.event_read(0, device.hal().event_count()).is_err());
    }

    #[test]
    fn device_info_is_cached() {
        let (sim, device) = probe(&DriverConfig::default());
        let info = device.device_info().unwrap();
        assert_eq!(info.arch, ChipArch::V3);
        assert_eq!(info.core_count, 4);
        assert_eq!(info.connected_devices, vec![1, 3]);
        assert_eq!(info.dram_channels.len(), 2);
        assert_eq!(device.device_info().unwrap(), info);
        drop(sim);
    }

    #[test]
    fn device_memory_round_trips_through_bounce() {
        let (_sim, device) = probe(&DriverConfig::default());
        let pid = ProcessId(4);
        let h = device
            .mem_alloc(pid, AllocRequest::device(1, 1, 300_000))
            .unwrap();
        let data: Vec<u8> = (0..300_000u32).map(|i| (i * 7) as u8).collect();
        device.mem_write(h, 0, &data).unwrap();
        let mut back = vec![0u8; data.len()];
        device.mem_read(h, 0, &mut back).unwrap();
        assert_eq!(back, data);

        device.memset(h, 1000, 0xAB, 10).unwrap();
        let mut small = [0u8; 12];
        device.mem_read(h, 999, &mut small).unwrap();
        assert_eq!(small[0], data[999]);
        assert!(small[1..11].iter().all(|b| *b == 0xAB));
        assert_eq!(small[11], data[1010]);

        assert!(device.mem_read(h, 299_999, &mut [0u8; 8]).is_err());
    }

    #[test]
    fn detach_reclaims_process_memory() {
        let (_sim, device) = probe(&DriverConfig::default());
        let pid = ProcessId(21);
        device.process_attach(pid).unwrap();
        device.process_attach(pid).unwrap();
        let before = device.pool_usage().device;

        device
            .mem_alloc(pid, AllocRequest::device(0, 0, 8192))
            .unwrap();
        assert_eq!(device.datastore_counters(pid).device, 8192);

        assert_eq!(device.process_detach(pid), 0);
        assert!(device.process_detach(pid) >= 1);
        assert_eq!(device.pool_usage().device, before);
        assert!(matches!(device.datastore_pa(pid), Err(DriverError::NotFound)));
    }
}
