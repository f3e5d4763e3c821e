//! Device DRAM and reserved host memory pools, plus the life cycle of every chunk carved from
//! them.
//!
//! All bookkeeping lives behind one pool-set lock. The physical-address search tree sits behind
//! its own reader/writer lock so DMA validation never contends with allocation. Lock order is
//! pool set, then search tree, then handle table.

use super::arena::Arena;
use super::handle::{Handle, HandleTable};
use super::{AllocRequest, ChunkId, Lifespan, MemCategory, MemChunkInfo, MemLocation, ProcessId};
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::hal::{ArchHal, CoherentBuffer, DmaMemory, MemoryLayout};
use crate::utils::{align_up, is_aligned};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, OnceLock, Weak};

/// Largest size a caller may ask for.
const MAX_ALLOC_SIZE: u64 = i64::MAX as u64;

/// Receives chunk life-cycle events for accounting. Called without any pool lock held.
pub trait ChunkObserver: Send + Sync {
    fn chunk_allocated(&self, info: &MemChunkInfo);

    fn chunk_freed(&self, info: &MemChunkInfo);
}

/// Bytes currently allocated, per location and per category.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub host: u64,
    pub device: u64,
    pub by_category: [u64; MemCategory::COUNT],
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessUsage {
    pub host: u64,
    pub device: u64,
}

/// Occupancy of one device pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DevicePoolUsage {
    pub size: u64,
    pub allocated: u64,
    pub small_allocated: u64,
    pub scratchpad_size: u64,
}

/// Occupancy of one reserved host pool class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HostPoolUsage {
    pub page_size: u64,
    pub blocks: usize,
    pub allocated: u64,
}

// ===============================================================================================
// Internal Structures
// ===============================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArenaKind {
    Small,
    Main,
    Scratchpad,
}

#[derive(Debug, Clone, Copy)]
enum Backing {
    Coherent(CoherentBuffer),
    HostPool { class: usize, block: usize },
    Device { pool: usize, arena: ArenaKind },
}

#[derive(Debug)]
struct Chunk {
    pa: u64,
    va: Option<u64>,
    size: u64,
    location: MemLocation,
    channel: u32,
    region: u32,
    core: Option<u32>,
    ref_count: u32,
    lifespan: Lifespan,
    category: MemCategory,
    pid: ProcessId,
    handle: Option<Handle>,
    backing: Backing,

    // Lifespan list links (slot indices).
    prev: Option<u32>,
    next: Option<u32>,
}

/// A slab entry. `generation` is the identity tag of the live chunk and is poisoned to 0 on
/// release.
#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    chunk: Option<Chunk>,
}

#[derive(Debug, Default, Clone, Copy)]
struct LifespanList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

#[derive(Debug)]
struct DevicePool {
    channel: u32,
    region: u32,
    small: Option<Arena>,
    main: Arena,
    /// Bytes claimed from the tail of `main` by the contiguous scratchpad.
    scratchpad_size: u64,
}

impl DevicePool {
    fn arena_mut(&mut self, kind: ArenaKind) -> Option<&mut Arena> {
        match kind {
            ArenaKind::Small => self.small.as_mut(),
            ArenaKind::Main | ArenaKind::Scratchpad => Some(&mut self.main),
        }
    }

    fn alloc(&mut self, size: u64, align: u64, small_threshold: u64) -> Option<(u64, ArenaKind)> {
        let order = if self.small.is_some() && size < small_threshold {
            [ArenaKind::Small, ArenaKind::Main]
        } else {
            [ArenaKind::Main, ArenaKind::Small]
        };
        for kind in order {
            if let Some(arena) = self.arena_mut(kind)
                && let Some(pa) = arena.alloc(size, align)
            {
                return Some((pa, kind));
            }
        }
        None
    }

    /// Claims the `size` bytes directly below the current scratchpad bottom.
    fn alloc_scratchpad(&mut self, size: u64) -> Option<u64> {
        let bottom = self.main.end() - self.scratchpad_size;
        let addr = bottom.checked_sub(size)?;
        self.main.alloc_fixed(addr, size)?;
        self.scratchpad_size += size;
        Some(addr)
    }

    fn release(&mut self, pa: u64, size: u64, kind: ArenaKind) {
        if kind == ArenaKind::Scratchpad {
            let bottom = self.main.end() - self.scratchpad_size;
            if pa != bottom {
                tracing::error!(
                    channel = self.channel,
                    region = self.region,
                    pa,
                    expected = bottom,
                    "scratchpad freed out of order"
                );
            }
            self.scratchpad_size = self.scratchpad_size.saturating_sub(size);
        }

        let freed = self.arena_mut(kind).and_then(|arena| arena.free(pa));
        assert!(
            freed.is_some(),
            "chunk {pa:#x} is not owned by device pool {}/{}",
            self.channel,
            self.region
        );
    }
}

#[derive(Debug)]
struct HostBlock {
    buffer: CoherentBuffer,
    /// Arena over the block's bus addresses.
    arena: Arena,
}

#[derive(Debug)]
struct HostPoolClass {
    page_size: u64,
    blocks: Vec<HostBlock>,
}

struct Placement {
    pa: u64,
    va: Option<u64>,
    backing: Backing,
}

#[derive(Debug, Default)]
struct PoolState {
    slots: Vec<Slot>,
    free_slots: Vec<u32>,
    next_generation: u32,
    lists: [LifespanList; 4],

    device_pools: Vec<DevicePool>,
    host_pools: Vec<HostPoolClass>,

    usage: PoolUsage,
    per_process: HashMap<ProcessId, ProcessUsage>,
    torn_down: bool,
}

impl PoolState {
    fn live(&self, id: ChunkId) -> Option<&Chunk> {
        let slot = self.slots.get(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.chunk.as_ref()
    }

    fn live_mut(&mut self, id: ChunkId) -> Option<&mut Chunk> {
        let slot = self.slots.get_mut(id.slot as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.chunk.as_mut()
    }

    fn chunk_mut(&mut self, slot: u32) -> &mut Chunk {
        match self.slots[slot as usize].chunk.as_mut() {
            Some(chunk) => chunk,
            None => panic!("lifespan list references empty slot {slot}"),
        }
    }

    fn fresh_generation(&mut self) -> u32 {
        loop {
            self.next_generation = self.next_generation.wrapping_add(1) & ChunkId::GENERATION_MASK;
            if self.next_generation != 0 {
                return self.next_generation;
            }
        }
    }

    fn insert(&mut self, chunk: Chunk) -> ChunkId {
        let generation = self.fresh_generation();
        let lifespan = chunk.lifespan;
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                u32::try_from(self.slots.len() - 1).unwrap_or(u32::MAX)
            }
        };
        self.slots[slot as usize] = Slot {
            generation,
            chunk: Some(chunk),
        };
        self.link(slot, lifespan);
        ChunkId { slot, generation }
    }

    fn link(&mut self, slot: u32, lifespan: Lifespan) {
        let tail = self.lists[lifespan.index()].tail;
        {
            let chunk = self.chunk_mut(slot);
            chunk.lifespan = lifespan;
            chunk.prev = tail;
            chunk.next = None;
        }
        match tail {
            Some(t) => self.chunk_mut(t).next = Some(slot),
            None => self.lists[lifespan.index()].head = Some(slot),
        }
        let list = &mut self.lists[lifespan.index()];
        list.tail = Some(slot);
        list.len += 1;
    }

    fn unlink(&mut self, slot: u32) {
        let (lifespan, prev, next) = {
            let chunk = self.chunk_mut(slot);
            let links = (chunk.lifespan, chunk.prev, chunk.next);
            chunk.prev = None;
            chunk.next = None;
            links
        };
        match prev {
            Some(p) => self.chunk_mut(p).next = next,
            None => self.lists[lifespan.index()].head = next,
        }
        match next {
            Some(n) => self.chunk_mut(n).prev = prev,
            None => self.lists[lifespan.index()].tail = prev,
        }
        self.lists[lifespan.index()].len -= 1;
    }

    fn list_slots(&self, lifespan: Lifespan) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.lists[lifespan.index()].len);
        let mut cursor = self.lists[lifespan.index()].head;
        while let Some(slot) = cursor {
            out.push(slot);
            cursor = self.slots[slot as usize]
                .chunk
                .as_ref()
                .and_then(|c| c.next);
        }
        out
    }

    fn account(&mut self, chunk: &Chunk, add: bool) {
        let apply = |v: &mut u64| {
            if add {
                *v += chunk.size;
            } else {
                *v -= chunk.size;
            }
        };
        apply(&mut self.usage.by_category[chunk.category.index()]);
        let process = self.per_process.entry(chunk.pid).or_default();
        match chunk.location {
            MemLocation::Host => {
                apply(&mut self.usage.host);
                apply(&mut process.host);
            }
            MemLocation::Device => {
                apply(&mut self.usage.device);
                apply(&mut process.device);
            }
        }
        if *process == ProcessUsage::default() {
            self.per_process.remove(&chunk.pid);
        }
    }

    fn place_in_host_pool(&mut self, size: u64, page_size: u64) -> Option<Placement> {
        for (class_idx, class) in self.host_pools.iter_mut().enumerate() {
            if class.page_size < size {
                continue;
            }
            for (block_idx, block) in class.blocks.iter_mut().enumerate() {
                if let Some(pa) = block.arena.alloc(size, page_size) {
                    return Some(Placement {
                        pa,
                        va: Some(block.buffer.va + (pa - block.arena.base())),
                        backing: Backing::HostPool {
                            class: class_idx,
                            block: block_idx,
                        },
                    });
                }
            }
        }
        None
    }
}

fn info_of(id: ChunkId, chunk: &Chunk) -> MemChunkInfo {
    MemChunkInfo {
        id,
        pa: chunk.pa,
        va: chunk.va,
        size: chunk.size,
        location: chunk.location,
        channel: chunk.channel,
        region: chunk.region,
        core: chunk.core,
        ref_count: chunk.ref_count,
        lifespan: chunk.lifespan,
        category: chunk.category,
        pid: chunk.pid,
        handle: chunk.handle,
    }
}

// ===============================================================================================
// Pool Set
// ===============================================================================================

pub struct MempoolSet {
    hal: Arc<dyn ArchHal>,
    memory: Arc<dyn DmaMemory>,
    layout: MemoryLayout,
    page_size: u64,
    small_threshold: u64,

    inner: Mutex<PoolState>,
    tree: RwLock<BTreeMap<u64, (ChunkId, u64)>>,
    handles: HandleTable,
    observer: OnceLock<Weak<dyn ChunkObserver>>,
}

impl std::fmt::Debug for MempoolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MempoolSet")
            .field("layout", &self.layout)
            .field("page_size", &self.page_size)
            .field("usage", &self.usage())
            .finish_non_exhaustive()
    }
}

impl MempoolSet {
    /// Builds the device pools for every (channel, region) of `layout` and reserves the
    /// configured host pools.
    ///
    /// Host pool blocks that cannot be reserved are skipped with a warning.
    #[must_use]
    pub fn new(
        hal: Arc<dyn ArchHal>,
        memory: Arc<dyn DmaMemory>,
        layout: MemoryLayout,
        config: &DriverConfig,
    ) -> Self {
        let page_size = memory.page_size();
        let mut state = PoolState::default();

        // 1. Device pools, one per (channel, region).
        for (channel, ch) in (0u32..).zip(&layout.channels) {
            let region_size = ch.size / u64::from(layout.regions_per_channel);
            for region in 0..layout.regions_per_channel {
                let base = ch.base + u64::from(region) * region_size;
                let small_size = align_up(config.small_pool_size, page_size);
                let (small, main) = if small_size > 0 && small_size < region_size {
                    (
                        Some(Arena::new(base, small_size, page_size)),
                        Arena::new(base + small_size, region_size - small_size, page_size),
                    )
                } else {
                    (None, Arena::new(base, region_size, page_size))
                };
                state.device_pools.push(DevicePool {
                    channel,
                    region,
                    small,
                    main,
                    scratchpad_size: 0,
                });
            }
        }

        // 2. Reserved host pools, smallest page-size class first.
        let mut classes = config.host_pools.clone();
        classes.sort_by_key(|c| c.page_size);
        for class in classes {
            let size = align_up(class.page_size, page_size);
            let mut blocks = Vec::with_capacity(class.count as usize);
            for _ in 0..class.count {
                let Some(buffer) = memory.alloc_coherent(size) else {
                    tracing::warn!(page_size = size, "failed to reserve host pool block");
                    break;
                };
                let bus = memory.virt_to_bus(buffer.va);
                blocks.push(HostBlock {
                    buffer,
                    arena: Arena::new(bus, buffer.size, page_size),
                });
            }
            tracing::debug!(page_size = size, blocks = blocks.len(), "reserved host pool");
            state.host_pools.push(HostPoolClass {
                page_size: size,
                blocks,
            });
        }

        Self {
            hal,
            memory,
            layout,
            page_size,
            small_threshold: config.small_alloc_threshold,
            inner: Mutex::new(state),
            tree: RwLock::new(BTreeMap::new()),
            handles: HandleTable::new(config.handle_l1_size, config.handle_l2_size),
            observer: OnceLock::new(),
        }
    }

    /// Registers the accounting observer. Only the first registration takes effect.
    pub fn set_observer(&self, observer: Weak<dyn ChunkObserver>) {
        if self.observer.set(observer).is_err() {
            tracing::warn!("chunk observer already registered");
        }
    }

    fn notify(&self, info: &MemChunkInfo, allocated: bool) {
        if let Some(observer) = self.observer.get().and_then(Weak::upgrade) {
            if allocated {
                observer.chunk_allocated(info);
            } else {
                observer.chunk_freed(info);
            }
        }
    }

    #[must_use]
    pub const fn page_size(&self) -> u64 {
        self.page_size
    }

    #[must_use]
    pub const fn layout(&self) -> &MemoryLayout {
        &self.layout
    }

    #[must_use]
    pub const fn handles(&self) -> &HandleTable {
        &self.handles
    }

    fn pool_index(&self, channel: u32, region: u32) -> DriverResult<usize> {
        self.layout.region(channel, region)?;
        Ok((channel * self.layout.regions_per_channel + region) as usize)
    }

    // -------------------------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------------------------

    /// Allocates a chunk on behalf of `pid`.
    ///
    /// # Errors
    /// * `InvalidArgument` for a zero or oversized request, a bad channel/region/core, or an
    ///   alignment the pool cannot honor.
    /// * `OutOfMemory` when every eligible pool is exhausted.
    pub fn alloc(&self, pid: ProcessId, req: AllocRequest) -> DriverResult<ChunkId> {
        if req.size == 0 || req.size > MAX_ALLOC_SIZE {
            return Err(DriverError::invalid(format!("invalid size {:#x}", req.size)));
        }
        if req.align != 0 && !req.align.is_power_of_two() {
            return Err(DriverError::invalid(format!("invalid alignment {:#x}", req.align)));
        }
        if let Some(core) = req.core
            && core >= self.hal.core_count()
        {
            return Err(DriverError::invalid(format!("invalid core {core}")));
        }
        let size = align_up(req.size, self.page_size);

        // Direct coherent memory may sleep, so it is tried before taking the pool lock.
        let direct = match req.location {
            MemLocation::Host => {
                if req.align != 0 && req.align != self.page_size {
                    return Err(DriverError::invalid(format!(
                        "host memory only supports page alignment, got {:#x}",
                        req.align
                    )));
                }
                self.memory.alloc_coherent(size)
            }
            MemLocation::Device => {
                self.pool_index(req.channel, req.region)?;
                None
            }
        };

        let mut state = self.inner.lock();
        if state.torn_down {
            drop(state);
            if let Some(buf) = direct {
                self.memory.free_coherent(buf);
            }
            return Err(DriverError::Busy("memory pools torn down".into()));
        }

        let placement = match req.location {
            MemLocation::Host => match direct {
                Some(buffer) => Placement {
                    pa: self.memory.virt_to_bus(buffer.va),
                    va: Some(buffer.va),
                    backing: Backing::Coherent(buffer),
                },
                None => state
                    .place_in_host_pool(size, self.page_size)
                    .ok_or(DriverError::OutOfMemory)?,
            },
            MemLocation::Device => self.place_device(&mut state, &req, size)?,
        };

        let chunk = Chunk {
            pa: placement.pa,
            va: placement.va,
            size,
            location: req.location,
            channel: req.channel,
            region: req.region,
            core: req.core,
            ref_count: 1,
            lifespan: req.lifespan,
            category: req.category,
            pid,
            handle: None,
            backing: placement.backing,
            prev: None,
            next: None,
        };
        state.account(&chunk, true);
        let id = state.insert(chunk);
        let info = state
            .live(id)
            .map(|c| info_of(id, c))
            .ok_or(DriverError::NotFound)?;
        self.tree.write().insert(info.pa, (id, size));
        drop(state);

        tracing::trace!(pa = info.pa, size, pid = pid.0, location = ?req.location, "chunk allocated");
        self.notify(&info, true);
        Ok(id)
    }

    fn place_device(
        &self,
        state: &mut PoolState,
        req: &AllocRequest,
        size: u64,
    ) -> DriverResult<Placement> {
        let pool_idx = self.pool_index(req.channel, req.region)?;
        let pool = &mut state.device_pools[pool_idx];
        let align = req.align.max(self.page_size);

        let (pa, kind) = if req.category == MemCategory::Scratchpad {
            let pa = pool.alloc_scratchpad(size).ok_or(DriverError::OutOfMemory)?;
            (pa, ArenaKind::Scratchpad)
        } else {
            pool.alloc(size, align, self.small_threshold)
                .ok_or(DriverError::OutOfMemory)?
        };

        if !is_aligned(pa, align) {
            pool.release(pa, size, kind);
            return Err(DriverError::invalid(format!(
                "pool returned {pa:#x}, not aligned to {align:#x}"
            )));
        }

        Ok(Placement {
            pa,
            va: None,
            backing: Backing::Device {
                pool: pool_idx,
                arena: kind,
            },
        })
    }

    // -------------------------------------------------------------------------------------------
    // Reference counting and release
    // -------------------------------------------------------------------------------------------

    /// Takes an extra reference on a live chunk.
    ///
    /// # Errors
    /// `NotFound` if `id` is stale.
    pub fn inc_ref(&self, id: ChunkId) -> DriverResult<()> {
        let mut state = self.inner.lock();
        let chunk = state.live_mut(id).ok_or(DriverError::NotFound)?;
        chunk.ref_count += 1;
        Ok(())
    }

    /// Drops one reference, releasing the chunk when it was the last. Returns whether the
    /// memory was released.
    ///
    /// # Panics
    /// Panics if `id` does not name a live chunk: a double free or a corrupted id cannot be
    /// continued past.
    pub fn free(&self, id: ChunkId) -> bool {
        let info = {
            let mut state = self.inner.lock();
            if state.live(id).is_none() {
                panic!("freeing stale or corrupt chunk {id:?}");
            }
            self.put_locked(&mut state, id.slot)
        };
        let Some(info) = info else {
            return false;
        };
        self.notify(&info, false);
        true
    }

    /// Drops one reference on the chunk published under `handle`. The handle is resolved under
    /// the pool-set lock, so racing frees of the same handle release the chunk once and the
    /// losers see `NotFound`. Returns whether the chunk was released.
    ///
    /// # Errors
    /// `NotFound` if the handle does not name a live chunk.
    pub fn free_handle(&self, handle: Handle) -> DriverResult<bool> {
        let info = {
            let mut state = self.inner.lock();
            let id = self.handles.find(handle).ok_or(DriverError::NotFound)?;
            if state.live(id).is_none() {
                return Err(DriverError::NotFound);
            }
            self.put_locked(&mut state, id.slot)
        };
        let Some(info) = info else {
            return Ok(false);
        };
        self.notify(&info, false);
        Ok(true)
    }

    fn put_locked(&self, state: &mut PoolState, slot: u32) -> Option<MemChunkInfo> {
        let chunk = state.chunk_mut(slot);
        chunk.ref_count -= 1;
        if chunk.ref_count > 0 {
            return None;
        }
        Some(self.release_locked(state, slot))
    }

    fn release_locked(&self, state: &mut PoolState, slot: u32) -> MemChunkInfo {
        state.unlink(slot);
        let entry = &mut state.slots[slot as usize];
        let id = ChunkId {
            slot,
            generation: entry.generation,
        };
        let Some(chunk) = entry.chunk.take() else {
            panic!("releasing empty slot {slot}");
        };
        entry.generation = 0;
        let info = info_of(id, &chunk);

        self.tree.write().remove(&chunk.pa);
        if let Some(handle) = chunk.handle
            && self.handles.free_handle(handle).is_err()
            && !self.handles.is_down()
        {
            tracing::error!(handle = handle.value(), "chunk handle already retired");
        }

        match chunk.backing {
            Backing::Coherent(buffer) => self.memory.free_coherent(buffer),
            Backing::HostPool { class, block } => {
                let freed = state
                    .host_pools
                    .get_mut(class)
                    .and_then(|c| c.blocks.get_mut(block))
                    .and_then(|b| b.arena.free(chunk.pa));
                assert!(freed.is_some(), "host chunk {:#x} has no pool", chunk.pa);
            }
            Backing::Device { pool, arena } => match state.device_pools.get_mut(pool) {
                Some(p) => p.release(chunk.pa, chunk.size, arena),
                None => panic!("device chunk {:#x} has no pool", chunk.pa),
            },
        }

        state.account(&chunk, false);
        state.free_slots.push(slot);
        tracing::trace!(pa = chunk.pa, size = chunk.size, "chunk released");
        info
    }

    // -------------------------------------------------------------------------------------------
    // Lifespan sweeps
    // -------------------------------------------------------------------------------------------

    /// Drops the lifespan reference of every chunk on the `lifespans` lists owned by `pid` (every
    /// owner when `None`). Survivors move to the next lifespan. The lists are snapshotted first,
    /// so a chunk demoted onto a later swept list loses one reference per sweep, not two.
    /// Returns the number of chunks released.
    fn sweep(&self, lifespans: &[Lifespan], pid: Option<ProcessId>) -> usize {
        let mut released = Vec::new();
        {
            let mut state = self.inner.lock();
            let targets: Vec<(Lifespan, u32)> = lifespans
                .iter()
                .flat_map(|&l| state.list_slots(l).into_iter().map(move |slot| (l, slot)))
                .collect();
            for (lifespan, slot) in targets {
                let chunk = state.chunk_mut(slot);
                if pid.is_some_and(|p| p != chunk.pid) {
                    continue;
                }
                chunk.ref_count -= 1;
                if chunk.ref_count == 0 {
                    released.push(self.release_locked(&mut state, slot));
                } else if let Some(next) = lifespan.next() {
                    state.unlink(slot);
                    state.link(slot, next);
                    tracing::debug!(slot, from = ?lifespan, to = ?next, "demoted referenced chunk");
                }
            }
        }
        for info in &released {
            self.notify(info, false);
        }
        released.len()
    }

    /// Ends a call context of `pid`.
    pub fn release_local(&self, pid: ProcessId) -> usize {
        self.sweep(&[Lifespan::Local], Some(pid))
    }

    /// Reclaims everything `pid` left behind when it detaches.
    pub fn release_process(&self, pid: ProcessId) -> usize {
        self.sweep(&[Lifespan::Local, Lifespan::CurrentProcess], Some(pid))
    }

    /// Reclaims every chunk whose lifespan ends with the last attached process.
    pub fn release_all_processes(&self) -> usize {
        self.sweep(
            &[Lifespan::Local, Lifespan::CurrentProcess, Lifespan::AllProcess],
            None,
        )
    }

    /// Force-frees every chunk regardless of its reference count and returns the reserved host
    /// blocks. The pool set refuses allocations afterwards.
    pub fn teardown(&self) -> usize {
        let mut released = Vec::new();
        let blocks = {
            let mut state = self.inner.lock();
            if state.torn_down {
                return 0;
            }
            for lifespan in Lifespan::ALL {
                for slot in state.list_slots(lifespan) {
                    released.push(self.release_locked(&mut state, slot));
                }
            }
            state.torn_down = true;
            std::mem::take(&mut state.host_pools)
        };

        for block in blocks.into_iter().flat_map(|c| c.blocks) {
            self.memory.free_coherent(block.buffer);
        }
        for info in &released {
            self.notify(info, false);
        }
        tracing::debug!(released = released.len(), "memory pools torn down");
        released.len()
    }

    // -------------------------------------------------------------------------------------------
    // Handles
    // -------------------------------------------------------------------------------------------

    /// Publishes a chunk under a user-visible handle. Idempotent.
    ///
    /// # Errors
    /// `NotFound` for a stale id, `OutOfMemory` when the handle table is exhausted.
    pub fn publish(&self, id: ChunkId) -> DriverResult<Handle> {
        let mut state = self.inner.lock();
        let chunk = state.live_mut(id).ok_or(DriverError::NotFound)?;
        if let Some(handle) = chunk.handle {
            return Ok(handle);
        }
        let handle = self.handles.alloc_handle(id)?;
        chunk.handle = Some(handle);
        Ok(handle)
    }

    /// Lock-free handle resolution.
    ///
    /// # Errors
    /// `NotFound` if the handle does not name a live chunk.
    pub fn resolve(&self, handle: Handle) -> DriverResult<ChunkId> {
        self.handles.find(handle).ok_or(DriverError::NotFound)
    }

    // -------------------------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------------------------

    /// # Errors
    /// `NotFound` if `id` is stale.
    pub fn chunk_info(&self, id: ChunkId) -> DriverResult<MemChunkInfo> {
        let state = self.inner.lock();
        state
            .live(id)
            .map(|c| info_of(id, c))
            .ok_or(DriverError::NotFound)
    }

    /// Reverse lookup: the live chunk containing `pa`.
    #[must_use]
    pub fn find_by_pa(&self, pa: u64) -> Option<ChunkId> {
        let tree = self.tree.read();
        let (&start, &(id, size)) = tree.range(..=pa).next_back()?;
        (pa < start + size).then_some(id)
    }

    /// Checks that `[pa, pa + size)` lies entirely inside one live chunk.
    ///
    /// # Errors
    /// `InvalidArgument` otherwise.
    pub fn validate_dma_range(&self, pa: u64, size: u64) -> DriverResult<ChunkId> {
        let tree = self.tree.read();
        if let Some((&start, &(id, len))) = tree.range(..=pa).next_back()
            && let Some(end) = pa.checked_add(size)
            && end <= start + len
        {
            return Ok(id);
        }
        Err(DriverError::invalid(format!(
            "DMA range {pa:#x}+{size:#x} is not backed by a chunk"
        )))
    }

    #[must_use]
    pub fn usage(&self) -> PoolUsage {
        self.inner.lock().usage.clone()
    }

    #[must_use]
    pub fn process_usage(&self, pid: ProcessId) -> ProcessUsage {
        self.inner
            .lock()
            .per_process
            .get(&pid)
            .copied()
            .unwrap_or_default()
    }

    /// # Errors
    /// `InvalidArgument` for a channel/region outside the layout.
    pub fn device_pool_usage(&self, channel: u32, region: u32) -> DriverResult<DevicePoolUsage> {
        let idx = self.pool_index(channel, region)?;
        let state = self.inner.lock();
        let pool = &state.device_pools[idx];
        let small = pool.small.as_ref();
        Ok(DevicePoolUsage {
            size: pool.main.size() + small.map_or(0, Arena::size),
            allocated: pool.main.allocated() + small.map_or(0, Arena::allocated),
            small_allocated: small.map_or(0, Arena::allocated),
            scratchpad_size: pool.scratchpad_size,
        })
    }

    #[must_use]
    pub fn host_pool_usage(&self) -> Vec<HostPoolUsage> {
        self.inner
            .lock()
            .host_pools
            .iter()
            .map(|class| HostPoolUsage {
                page_size: class.page_size,
                blocks: class.blocks.len(),
                allocated: class.blocks.iter().map(|b| b.arena.allocated()).sum(),
            })
            .collect()
    }

    // -------------------------------------------------------------------------------------------
    // CPU access
    // -------------------------------------------------------------------------------------------

    fn span(&self, id: ChunkId, offset: u64, len: usize) -> DriverResult<u64> {
        let state = self.inner.lock();
        let chunk = state.live(id).ok_or(DriverError::NotFound)?;
        match offset.checked_add(len as u64) {
            Some(end) if end <= chunk.size => Ok(chunk.pa + offset),
            _ => Err(DriverError::invalid(format!(
                "access {offset:#x}+{len:#x} beyond chunk of {:#x} bytes",
                chunk.size
            ))),
        }
    }

    /// # Errors
    /// `NotFound` for a stale id, `InvalidArgument` for an out-of-bounds range.
    pub fn read(&self, id: ChunkId, offset: u64, buf: &mut [u8]) -> DriverResult<()> {
        let pa = self.span(id, offset, buf.len())?;
        self.memory.read(pa, buf);
        Ok(())
    }

    /// # Errors
    /// `NotFound` for a stale id, `InvalidArgument` for an out-of-bounds range.
    pub fn write(&self, id: ChunkId, offset: u64, data: &[u8]) -> DriverResult<()> {
        let pa = self.span(id, offset, data.len())?;
        self.memory.write(pa, data);
        Ok(())
    }
}

impl Drop for MempoolSet {
    fn drop(&mut self) {
        self.teardown();
    }
}
