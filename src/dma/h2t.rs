//! The per-core host-to-target queue reserved for driver copies.
//!
//! One UDMA queue is shared by three reusable contexts. Each context owns a completion slot in
//! a small host buffer; a transfer ends with a barrier descriptor that copies a fresh marker
//! value into that slot.

#![allow(clippy::cast_possible_truncation)]

use super::engine::{AxiPort, DmaEngines, QueueInit, ring_bytes};
use super::udma::{
    DESC_BARRIER, DESC_COMPLETION, DescPair, MAX_DESC_SIZE, MAX_DESCS_PER_CACHE_LINE,
    ring_size_for,
};
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::hal::{ArchHal, Clock, DmaMemory};
use crate::mem::{AllocRequest, ChunkId, Lifespan, MemCategory, MempoolSet, ProcessId};
use parking_lot::Mutex;

/// Distance between two completion slots, one cache line.
pub const COMPLETION_SLOT_STRIDE: u64 = 64;
/// Offset of the marker source words inside the completion buffer.
pub const MARKER_SOURCE_OFFSET: u64 = 256;
/// Size of the fixed source used for broadcast transfers such as memset.
pub const PATTERN_SIZE: u64 = MAX_DESC_SIZE;

/// DMA context of the H2T queue a transfer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DmaContext {
    None,
    Sync,
    Async1,
    Async2,
}

impl DmaContext {
    /// Context the next pipelined transfer uses after `prev`.
    #[must_use]
    pub const fn next_async(prev: Self) -> Self {
        match prev {
            Self::Async1 => Self::Async2,
            Self::None | Self::Sync | Self::Async2 => Self::Async1,
        }
    }

    const fn index(self) -> Option<usize> {
        match self {
            Self::None => None,
            Self::Sync => Some(0),
            Self::Async1 => Some(1),
            Self::Async2 => Some(2),
        }
    }
}

#[derive(Debug, Default)]
struct ContextState {
    in_use: bool,
    /// Clock reading taken right before the current chain was issued.
    start_ns: u64,
    marker: u32,
    /// Descriptors of the most recent launch, kept for reissue after a reset.
    chain: Vec<DescPair>,
}

#[derive(Debug, Default)]
struct H2tState {
    contexts: [ContextState; 3],
    seq: u32,
}

/// What a waiter needs to poll a context.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingMarker {
    pub slot_pa: u64,
    pub marker: u32,
    pub start_ns: u64,
}

#[derive(Debug)]
pub struct H2tQueue {
    core: u32,
    engine: u32,
    queue: u32,
    ring_size: u32,

    completion: ChunkId,
    completion_pa: u64,
    pattern: ChunkId,
    pattern_pa: u64,

    state: Mutex<H2tState>,
    /// Serializes synchronous callers and users of the pattern buffer.
    sync_lock: Mutex<()>,
}

impl H2tQueue {
    /// Allocates ring and completion memory for `core` and brings its H2T queue up.
    ///
    /// # Errors
    /// Propagates allocation and queue setup failures.
    pub fn new(
        core: u32,
        hal: &dyn ArchHal,
        pools: &MempoolSet,
        engines: &DmaEngines,
        config: &DriverConfig,
    ) -> DriverResult<Self> {
        let engine = hal.h2t_engine(core);
        let queue = hal.h2t_queue();
        let channel = core % hal.dram_channel_count();
        let (Some(ring_size), Some(ring_len)) = (
            ring_size_for(config.h2t_desc_count),
            ring_bytes(config.h2t_desc_count),
        ) else {
            return Err(DriverError::invalid(format!(
                "H2T ring of {} descriptors is too large",
                config.h2t_desc_count
            )));
        };

        // 1. Ring memory in device DRAM, completion and pattern buffers in host memory.
        let ring_req = AllocRequest::device(channel, 0, ring_len)
            .with_lifespan(Lifespan::Device)
            .with_category(MemCategory::DmaRings)
            .with_core(core);
        let tx = pools.alloc(ProcessId::KERNEL, ring_req)?;
        let rx = pools.alloc(ProcessId::KERNEL, ring_req)?;
        let host_req = |size| {
            AllocRequest::host(size)
                .with_lifespan(Lifespan::Device)
                .with_category(MemCategory::Driver)
        };
        let completion = pools.alloc(ProcessId::KERNEL, host_req(pools.page_size()))?;
        let pattern = pools.alloc(ProcessId::KERNEL, host_req(PATTERN_SIZE))?;

        // 2. Engine and queue.
        let init = QueueInit {
            tx_count: config.h2t_desc_count,
            rx_count: config.h2t_desc_count,
            tx: pools.chunk_info(tx)?,
            rx: pools.chunk_info(rx)?,
            completion: None,
            axi_port: AxiPort::Default,
        };
        {
            let mut guard = engines.acquire_engine(engine)?;
            guard.init();
            guard.queue_init(queue, &init)?;
        }

        tracing::debug!(core, engine, queue, ring_size, "H2T queue ready");
        Ok(Self {
            core,
            engine,
            queue,
            ring_size,
            completion_pa: pools.chunk_info(completion)?.pa,
            completion,
            pattern_pa: pools.chunk_info(pattern)?.pa,
            pattern,
            state: Mutex::new(H2tState::default()),
            sync_lock: Mutex::new(()),
        })
    }

    #[must_use]
    pub const fn core(&self) -> u32 {
        self.core
    }

    #[must_use]
    pub const fn engine(&self) -> u32 {
        self.engine
    }

    #[must_use]
    pub const fn queue(&self) -> u32 {
        self.queue
    }

    #[must_use]
    pub const fn ring_size(&self) -> u32 {
        self.ring_size
    }

    /// Data pairs a synchronous launch may carry before it must wait.
    #[must_use]
    pub const fn sync_threshold(&self) -> usize {
        (self.ring_size / 2 - MAX_DESCS_PER_CACHE_LINE) as usize
    }

    /// Data pairs an asynchronous launch may carry; both async contexts fit beside a sync one.
    #[must_use]
    pub const fn async_threshold(&self) -> usize {
        (self.ring_size / 4 - MAX_DESCS_PER_CACHE_LINE) as usize
    }

    pub(crate) const fn pattern_pa(&self) -> u64 {
        self.pattern_pa
    }

    pub(crate) fn lock_sync(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.sync_lock.lock()
    }

    fn context_index(ctx: DmaContext) -> DriverResult<usize> {
        ctx.index()
            .ok_or_else(|| DriverError::invalid("no DMA context selected"))
    }

    fn slot_pa(&self, idx: usize) -> u64 {
        self.completion_pa + idx as u64 * COMPLETION_SLOT_STRIDE
    }

    fn marker_source_pa(&self, idx: usize) -> u64 {
        self.completion_pa + MARKER_SOURCE_OFFSET + idx as u64 * COMPLETION_SLOT_STRIDE
    }

    /// Marks `ctx` in use before any descriptor is built for it.
    ///
    /// # Errors
    /// `InUse` if the context still has an outstanding transfer.
    pub(crate) fn claim(&self, ctx: DmaContext) -> DriverResult<()> {
        let idx = Self::context_index(ctx)?;
        let mut state = self.state.lock();
        let c = &mut state.contexts[idx];
        if c.in_use {
            return Err(DriverError::InUse(format!(
                "{ctx:?} context of core {} is outstanding",
                self.core
            )));
        }
        c.in_use = true;
        c.chain.clear();
        Ok(())
    }

    /// Returns `ctx` to the idle pool.
    pub(crate) fn release(&self, ctx: DmaContext) {
        if let Some(idx) = ctx.index() {
            let mut state = self.state.lock();
            let c = &mut state.contexts[idx];
            if !c.in_use {
                tracing::warn!(core = self.core, ?ctx, "releasing idle DMA context");
            }
            c.in_use = false;
            c.chain.clear();
        }
    }

    #[must_use]
    pub(crate) fn is_claimed(&self, ctx: DmaContext) -> bool {
        ctx.index()
            .is_some_and(|idx| self.state.lock().contexts[idx].in_use)
    }

    fn submit(&self, engines: &DmaEngines, pairs: &[DescPair]) -> DriverResult<()> {
        let mut guard = engines.acquire_engine(self.engine)?;
        guard.push_pairs(self.queue, pairs)?;
        guard.doorbell(self.queue, pairs.len() as u32);
        Ok(())
    }

    /// Issues `pairs` followed by the completion marker of `ctx`.
    ///
    /// # Errors
    /// `Busy` if the ring cannot hold the chain.
    pub(crate) fn launch(
        &self,
        engines: &DmaEngines,
        memory: &dyn DmaMemory,
        clock: &dyn Clock,
        ctx: DmaContext,
        mut pairs: Vec<DescPair>,
    ) -> DriverResult<()> {
        let idx = Self::context_index(ctx)?;
        let mut state = self.state.lock();
        state.seq = state.seq.wrapping_add(1).max(1);
        let marker = state.seq;

        let slot = self.slot_pa(idx);
        let source = self.marker_source_pa(idx);
        memory.store_u32_release(slot, 0);
        memory.write(source, &marker.to_le_bytes());
        pairs.push(DescPair::copy(
            source,
            slot,
            4,
            DESC_BARRIER | DESC_COMPLETION,
        ));

        let start_ns = clock.now_ns();
        self.submit(engines, &pairs)?;
        tracing::trace!(core = self.core, ?ctx, descs = pairs.len(), "H2T chain issued");

        let c = &mut state.contexts[idx];
        c.marker = marker;
        c.start_ns = start_ns;
        c.chain = pairs;
        Ok(())
    }

    pub(crate) fn pending(&self, ctx: DmaContext) -> DriverResult<PendingMarker> {
        let idx = Self::context_index(ctx)?;
        let state = self.state.lock();
        let c = &state.contexts[idx];
        Ok(PendingMarker {
            slot_pa: self.slot_pa(idx),
            marker: c.marker,
            start_ns: c.start_ns,
        })
    }

    /// Rebuilds the ring from scratch and issues the last chain of `ctx` again.
    ///
    /// # Errors
    /// Propagates ring setup and submission failures.
    pub(crate) fn reissue(
        &self,
        engines: &DmaEngines,
        memory: &dyn DmaMemory,
        clock: &dyn Clock,
        ctx: DmaContext,
    ) -> DriverResult<()> {
        let idx = Self::context_index(ctx)?;
        let mut state = self.state.lock();
        memory.store_u32_release(self.slot_pa(idx), 0);

        let mut guard = engines.acquire_engine(self.engine)?;
        guard.reinit_queue(self.queue)?;
        let chain = &state.contexts[idx].chain;
        guard.push_pairs(self.queue, chain)?;
        guard.doorbell(self.queue, chain.len() as u32);
        drop(guard);

        state.contexts[idx].start_ns = clock.now_ns();
        Ok(())
    }
}
