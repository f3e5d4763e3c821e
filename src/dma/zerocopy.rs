//! DMA straight between pinned user pages and device memory.
//!
//! User memory is pinned in batches of [`PIN_BATCH_PAGES`]. Batches alternate between the two
//! async contexts so pinning and descriptor building for one batch overlaps the transfer of the
//! previous one.

#![allow(clippy::cast_possible_truncation)]

use super::copy::DmaCopy;
use super::h2t::DmaContext;
use super::udma::{DescPair, MAX_DESC_SIZE};
use crate::error::{DriverError, DriverResult};
use crate::hal::UserPages;
use crate::mem::ProcessId;

pub const PIN_BATCH_PAGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// User buffer to device memory.
    ToDevice,
    /// Device memory to user buffer.
    FromDevice,
}

impl Direction {
    /// Whether the device writes the pinned pages.
    const fn writes_host(self) -> bool {
        matches!(self, Self::FromDevice)
    }
}

/// Pages pinned for one in-flight batch.
struct Batch {
    ctx: DmaContext,
    pfns: Vec<u64>,
}

/// Pins `n_pages` starting at the page-aligned `uaddr`, falling back to the blocking pin for
/// whatever the fast path could not get.
fn pin_batch(
    pages: &dyn UserPages,
    pid: ProcessId,
    uaddr: u64,
    n_pages: usize,
    writable: bool,
) -> DriverResult<Vec<u64>> {
    let mut pfns = pages.pin_fast(pid.0, uaddr, n_pages, writable);
    if pfns.len() < n_pages {
        let got = pfns.len();
        let rest = uaddr + got as u64 * pages.page_size();
        match pages.pin_slow(pid.0, rest, n_pages - got, writable) {
            Ok(more) => pfns.extend(more),
            Err(e) => {
                pages.unpin(&pfns, false);
                return Err(e);
            }
        }
    }
    Ok(pfns)
}

/// Builds one descriptor per physically contiguous run of the batch, split at the
/// per-descriptor limit.
///
/// `first_offset` is the byte offset of the transfer inside the first page.
#[must_use]
pub fn build_pairs(
    pfns: &[u64],
    page_size: u64,
    first_offset: u64,
    len: u64,
    device_pa: u64,
    dir: Direction,
) -> Vec<DescPair> {
    // Coalesce adjacent frames into (host address, length) runs.
    let mut runs: Vec<(u64, u64)> = Vec::new();
    let mut remaining = len;
    for (i, pfn) in pfns.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let offset = if i == 0 { first_offset } else { 0 };
        let seg_len = (page_size - offset).min(remaining);
        let host = pfn * page_size + offset;
        match runs.last_mut() {
            Some((start, run_len)) if *start + *run_len == host => *run_len += seg_len,
            _ => runs.push((host, seg_len)),
        }
        remaining -= seg_len;
    }

    let mut pairs = Vec::with_capacity(runs.len());
    let mut device = device_pa;
    for (mut host, mut run_len) in runs {
        while run_len > 0 {
            let n = run_len.min(MAX_DESC_SIZE);
            let (src, dst) = match dir {
                Direction::ToDevice => (host, device),
                Direction::FromDevice => (device, host),
            };
            pairs.push(DescPair::copy(src, dst, n as u32, 0));
            host += n;
            device += n;
            run_len -= n;
        }
    }
    pairs
}

/// Waits for an outstanding batch, then unpins it.
fn finish(copy: &DmaCopy, pages: &dyn UserPages, core: u32, batch: Batch, dir: Direction) -> DriverResult<()> {
    let result = copy.wait_context(core, batch.ctx);
    copy.release(core, batch.ctx);
    pages.unpin(&batch.pfns, dir.writes_host());
    result
}

/// Copies between the user buffer `[uaddr, uaddr + size)` of `pid` and device memory at
/// `device_pa` without an intermediate kernel buffer.
///
/// # Errors
/// `InvalidArgument` for an empty transfer, pinning failures from the platform, and
/// `InUse`/`DmaTimeout` from the H2T queue. On error no pinned page is left behind and no
/// batch is left in flight.
#[allow(clippy::too_many_arguments)]
pub fn memcpy_zero_copy(
    copy: &DmaCopy,
    pages: &dyn UserPages,
    pid: ProcessId,
    core: u32,
    uaddr: u64,
    device_pa: u64,
    size: u64,
    dir: Direction,
) -> DriverResult<()> {
    if size == 0 {
        return Err(DriverError::invalid("zero-length transfer"));
    }
    let page_size = pages.page_size();
    let writable = dir.writes_host();
    let batch_bytes = PIN_BATCH_PAGES as u64 * page_size;

    let mut prev: Option<Batch> = None;
    let mut ctx = DmaContext::Async1;
    let mut offset = 0u64;

    while offset < size {
        let addr = uaddr + offset;
        let first_offset = addr % page_size;
        let len = (size - offset).min(batch_bytes - first_offset);
        let n_pages = (first_offset + len).div_ceil(page_size) as usize;

        // 1. Claim the context and pin this batch while the previous one is in flight.
        let step = copy.claim(core, ctx).and_then(|()| {
            pin_batch(pages, pid, addr - first_offset, n_pages, writable).inspect_err(|_| {
                copy.release(core, ctx);
            })
        });
        let pfns = match step {
            Ok(pfns) => pfns,
            Err(e) => {
                if let Some(p) = prev.take() {
                    let _ = finish(copy, pages, core, p, dir);
                }
                return Err(e);
            }
        };

        // 2. Launch it.
        let pairs = build_pairs(&pfns, page_size, first_offset, len, device_pa + offset, dir);
        if let Err(e) = copy.launch_async(core, ctx, pairs) {
            copy.release(core, ctx);
            pages.unpin(&pfns, false);
            if let Some(p) = prev.take() {
                let _ = finish(copy, pages, core, p, dir);
            }
            return Err(e);
        }

        // 3. Retire the previous batch.
        if let Some(p) = prev.take()
            && let Err(e) = finish(copy, pages, core, p, dir)
        {
            let _ = finish(copy, pages, core, Batch { ctx, pfns }, dir);
            return Err(e);
        }

        prev = Some(Batch { ctx, pfns });
        ctx = DmaContext::next_async(ctx);
        offset += len;
    }

    match prev {
        Some(p) => finish(copy, pages, core, p, dir),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    #[test]
    fn contiguous_frames_coalesce_and_split() {
        // 20 contiguous pages: one run of 80K, split at 64K.
        let pfns: Vec<u64> = (100..120).collect();
        let pairs = build_pairs(&pfns, PAGE, 0, 20 * PAGE, 0x80_0000_0000, Direction::ToDevice);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].len(), 65_536);
        assert_eq!(pairs[1].len(), 16_384);
        assert_eq!(pairs[0].tx.buf_ptr, 100 * PAGE);
        assert_eq!(pairs[1].rx.buf_ptr, 0x80_0000_0000 + 65_536);
    }

    #[test]
    fn scattered_frames_get_one_descriptor_each() {
        let pfns = [10, 12, 13, 20];
        let pairs = build_pairs(&pfns, PAGE, 100, 3 * PAGE, 0x5000_0000, Direction::FromDevice);
        // Runs: [10] from offset 100, [12, 13], [20] partial.
        let lens: Vec<u32> = pairs.iter().map(DescPair::len).collect();
        assert_eq!(lens, [4096 - 100, 8192, 100]);
        assert_eq!(pairs[0].rx.buf_ptr, 10 * PAGE + 100);
        assert_eq!(pairs[0].tx.buf_ptr, 0x5000_0000);
        assert_eq!(pairs[2].tx.buf_ptr, 0x5000_0000 + 3 * PAGE - 100);
    }
}
