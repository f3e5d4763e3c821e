#![allow(clippy::cast_possible_truncation)]

use super::completion::{PollConfig, ResetWindow, poll_marker};
use super::engine::DmaEngines;
use super::h2t::{DmaContext, H2tQueue, PATTERN_SIZE};
use super::udma::{DescPair, MAX_DESC_SIZE};
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverResult};
use crate::hal::{ArchHal, Clock, DmaMemory};
use crate::mem::MempoolSet;
use std::sync::Arc;

/// Which sides of a transfer advance from one descriptor to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyMode {
    pub move_src: bool,
    pub move_dst: bool,
}

impl CopyMode {
    pub const COPY: Self = Self {
        move_src: true,
        move_dst: true,
    };

    /// Source stays put: every descriptor reads the same bytes.
    pub const FIXED_SOURCE: Self = Self {
        move_src: false,
        move_dst: true,
    };
}

/// Outstanding pipelined transfer. Must be passed to [`DmaCopy::memcpy_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct AsyncHandle {
    core: u32,
    context: DmaContext,
}

impl AsyncHandle {
    #[must_use]
    pub const fn core(&self) -> u32 {
        self.core
    }

    #[must_use]
    pub const fn context(&self) -> DmaContext {
        self.context
    }
}

/// Splits a transfer into descriptor pairs of at most [`MAX_DESC_SIZE`] bytes.
#[must_use]
pub fn chunk_pairs(src: u64, dst: u64, size: u64, mode: CopyMode) -> Vec<DescPair> {
    let mut pairs = Vec::with_capacity(size.div_ceil(MAX_DESC_SIZE) as usize);
    let (mut src, mut dst, mut remaining) = (src, dst, size);
    while remaining > 0 {
        let len = remaining.min(MAX_DESC_SIZE);
        pairs.push(DescPair::copy(src, dst, len as u32, 0));
        if mode.move_src {
            src += len;
        }
        if mode.move_dst {
            dst += len;
        }
        remaining -= len;
    }
    pairs
}

/// Copies through the per-core H2T queues.
pub struct DmaCopy {
    engines: Arc<DmaEngines>,
    memory: Arc<dyn DmaMemory>,
    clock: Arc<dyn Clock>,
    window: Arc<ResetWindow>,
    poll: PollConfig,
    queues: Vec<H2tQueue>,
}

impl std::fmt::Debug for DmaCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaCopy")
            .field("poll", &self.poll)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl DmaCopy {
    /// Sets up one H2T queue per core.
    ///
    /// # Errors
    /// Propagates ring allocation or queue setup failures.
    pub fn new(
        hal: &dyn ArchHal,
        pools: &MempoolSet,
        engines: Arc<DmaEngines>,
        memory: Arc<dyn DmaMemory>,
        clock: Arc<dyn Clock>,
        window: Arc<ResetWindow>,
        config: &DriverConfig,
    ) -> DriverResult<Self> {
        let queues = (0..hal.core_count())
            .map(|core| H2tQueue::new(core, hal, pools, &engines, config))
            .collect::<DriverResult<Vec<_>>>()?;
        Ok(Self {
            engines,
            memory,
            clock,
            window,
            poll: PollConfig {
                initial_delay_us: config.dma_poll_initial_delay_us,
                interval_us: config.dma_poll_interval_us,
                timeout_us: config.dma_timeout_us,
            },
            queues,
        })
    }

    /// The H2T queue of `core`.
    ///
    /// # Errors
    /// `InvalidArgument` for a core outside the chip.
    pub fn queue(&self, core: u32) -> DriverResult<&H2tQueue> {
        self.queues
            .get(core as usize)
            .ok_or_else(|| DriverError::invalid(format!("invalid core {core}")))
    }

    fn check_size(size: u64) -> DriverResult<()> {
        if size == 0 {
            return Err(DriverError::invalid("zero-length copy"));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Context plumbing shared with zero-copy
    // -------------------------------------------------------------------------------------------

    pub(crate) fn claim(&self, core: u32, ctx: DmaContext) -> DriverResult<()> {
        self.queue(core)?.claim(ctx)
    }

    pub(crate) fn release(&self, core: u32, ctx: DmaContext) {
        if let Ok(q) = self.queue(core) {
            q.release(ctx);
        }
    }

    /// Issues `pairs` on `ctx`, waiting between batches so no launch exceeds `threshold` data
    /// pairs. The final batch is left outstanding.
    fn issue(
        &self,
        q: &H2tQueue,
        ctx: DmaContext,
        pairs: Vec<DescPair>,
        threshold: usize,
    ) -> DriverResult<()> {
        let threshold = threshold.max(1);
        let mut batches = pairs.chunks(threshold).peekable();
        while let Some(batch) = batches.next() {
            q.launch(
                &self.engines,
                self.memory.as_ref(),
                self.clock.as_ref(),
                ctx,
                batch.to_vec(),
            )?;
            if batches.peek().is_some() {
                self.wait_queue(q, ctx)?;
            }
        }
        Ok(())
    }

    /// Issues a pipelined chain on an already claimed async context.
    pub(crate) fn launch_async(
        &self,
        core: u32,
        ctx: DmaContext,
        pairs: Vec<DescPair>,
    ) -> DriverResult<()> {
        let q = self.queue(core)?;
        self.issue(q, ctx, pairs, q.async_threshold())
    }

    /// Waits for the outstanding chain of `ctx` without releasing the context.
    pub(crate) fn wait_context(&self, core: u32, ctx: DmaContext) -> DriverResult<()> {
        self.wait_queue(self.queue(core)?, ctx)
    }

    fn wait_queue(&self, q: &H2tQueue, ctx: DmaContext) -> DriverResult<()> {
        let pending = q.pending(ctx)?;
        let poll = |pending: &super::h2t::PendingMarker| {
            poll_marker(
                self.memory.as_ref(),
                self.clock.as_ref(),
                pending.slot_pa,
                pending.marker,
                &self.poll,
            )
        };

        if poll(&pending) {
            return Ok(());
        }

        if !self.window.covers(pending.start_ns) {
            tracing::error!(core = q.core(), ?ctx, "DMA completion timed out");
            return Err(DriverError::DmaTimeout);
        }

        // The transfer overlapped a reset: rebuild the ring and try once more.
        tracing::warn!(core = q.core(), ?ctx, "DMA timed out across a reset, reissuing");
        q.reissue(&self.engines, self.memory.as_ref(), self.clock.as_ref(), ctx)?;
        if poll(&q.pending(ctx)?) {
            return Ok(());
        }
        tracing::error!(core = q.core(), ?ctx, "DMA reissue timed out");
        Err(DriverError::DmaTimeout)
    }

    // -------------------------------------------------------------------------------------------
    // Synchronous copies
    // -------------------------------------------------------------------------------------------

    /// Copies `size` bytes between bus addresses and waits for completion.
    ///
    /// # Errors
    /// `InvalidArgument` for a bad core or empty copy, `DmaTimeout` if the completion marker
    /// never shows up.
    pub fn memcpy(&self, core: u32, src: u64, dst: u64, size: u64) -> DriverResult<()> {
        self.memcpy_mode(core, src, dst, size, CopyMode::COPY)
    }

    /// [`Self::memcpy`] with explicit source/destination advancement.
    ///
    /// # Errors
    /// Same as [`Self::memcpy`].
    pub fn memcpy_mode(
        &self,
        core: u32,
        src: u64,
        dst: u64,
        size: u64,
        mode: CopyMode,
    ) -> DriverResult<()> {
        Self::check_size(size)?;
        let q = self.queue(core)?;
        let _sync = q.lock_sync();
        self.sync_copy(q, src, dst, size, mode)
    }

    fn sync_copy(
        &self,
        q: &H2tQueue,
        src: u64,
        dst: u64,
        size: u64,
        mode: CopyMode,
    ) -> DriverResult<()> {
        q.claim(DmaContext::Sync)?;
        let pairs = chunk_pairs(src, dst, size, mode);
        let result = self
            .issue(q, DmaContext::Sync, pairs, q.sync_threshold())
            .and_then(|()| self.wait_queue(q, DmaContext::Sync));
        q.release(DmaContext::Sync);
        result
    }

    /// Fills `size` bytes at `dst` with `value`.
    ///
    /// # Errors
    /// Same as [`Self::memcpy`].
    pub fn memset(&self, core: u32, dst: u64, value: u8, size: u64) -> DriverResult<()> {
        Self::check_size(size)?;
        let q = self.queue(core)?;
        let _sync = q.lock_sync();

        let fill = size.min(PATTERN_SIZE) as usize;
        self.memory.write(q.pattern_pa(), &vec![value; fill]);
        self.sync_copy(q, q.pattern_pa(), dst, size, CopyMode::FIXED_SOURCE)
    }

    // -------------------------------------------------------------------------------------------
    // Pipelined copies
    // -------------------------------------------------------------------------------------------

    /// Starts a copy on the async context following `prev` and returns without waiting.
    ///
    /// # Errors
    /// `InUse` if that context still holds an unwaited transfer; otherwise as
    /// [`Self::memcpy`].
    pub fn memcpy_async(
        &self,
        core: u32,
        src: u64,
        dst: u64,
        size: u64,
        prev: Option<AsyncHandle>,
    ) -> DriverResult<AsyncHandle> {
        Self::check_size(size)?;
        if let Some(p) = prev
            && p.core != core
        {
            return Err(DriverError::invalid(format!(
                "previous transfer ran on core {}, not {core}",
                p.core
            )));
        }

        let q = self.queue(core)?;
        let ctx = DmaContext::next_async(prev.map_or(DmaContext::None, |p| p.context));
        q.claim(ctx)?;

        let pairs = chunk_pairs(src, dst, size, CopyMode::COPY);
        if let Err(e) = self.issue(q, ctx, pairs, q.async_threshold()) {
            q.release(ctx);
            return Err(e);
        }
        Ok(AsyncHandle { core, context: ctx })
    }

    /// Waits for a transfer started by [`Self::memcpy_async`] and frees its context.
    ///
    /// # Errors
    /// `NotFound` if the handle was already waited on, `DmaTimeout` on timeout.
    pub fn memcpy_wait(&self, handle: AsyncHandle) -> DriverResult<()> {
        let q = self.queue(handle.core)?;
        if !q.is_claimed(handle.context) {
            return Err(DriverError::NotFound);
        }
        let result = self.wait_queue(q, handle.context);
        q.release(handle.context);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunking_covers_the_whole_transfer() {
        for size in [1, 4096, MAX_DESC_SIZE, MAX_DESC_SIZE + 1, 150_000, 10 * MAX_DESC_SIZE] {
            let pairs = chunk_pairs(0x1000, 0x9000_0000, size, CopyMode::COPY);
            assert_eq!(pairs.len() as u64, size.div_ceil(MAX_DESC_SIZE));
            assert_eq!(pairs.iter().map(|p| u64::from(p.len())).sum::<u64>(), size);
            assert!(pairs.iter().all(|p| u64::from(p.len()) <= MAX_DESC_SIZE));
        }
    }

    #[test]
    fn chunking_advances_requested_sides() {
        let pairs = chunk_pairs(0x1000, 0x10_0000, 3 * MAX_DESC_SIZE, CopyMode::FIXED_SOURCE);
        assert!(pairs.iter().all(|p| p.tx.buf_ptr == 0x1000));
        assert_eq!(pairs[2].rx.buf_ptr, 0x10_0000 + 2 * MAX_DESC_SIZE);
    }

    #[test]
    fn split_of_150000_bytes() {
        let lens: Vec<u32> = chunk_pairs(0, 0, 150_000, CopyMode::COPY)
            .iter()
            .map(DescPair::len)
            .collect();
        assert_eq!(lens, [65_536, 65_536, 18_928]);
    }
}
