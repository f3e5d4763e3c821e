//! Platform services consumed by the core: MMIO, coherent memory, user page pinning, time.

use crate::error::DriverResult;
use crate::utils::host_page_size;
use std::time::{Duration, Instant};

/// Synchronous 32-bit MMIO access to the device BARs.
pub trait RegisterAccess: Send + Sync {
    fn read32(&self, addr: u64) -> u32;

    fn write32(&self, addr: u64, value: u32);
}

/// A DMA-coherent host buffer: kernel virtual address plus the bus address the device sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoherentBuffer {
    pub va: u64,
    pub pa: u64,
    pub size: u64,
}

/// Host memory services and CPU access to physical memory (host pages and device DRAM
/// through the BAR window).
pub trait DmaMemory: Send + Sync {
    /// Direct coherent allocation. `None` when the platform cannot satisfy the request.
    fn alloc_coherent(&self, size: u64) -> Option<CoherentBuffer>;

    fn free_coherent(&self, buffer: CoherentBuffer);

    /// Translates a kernel virtual address of coherent memory to its bus address.
    fn virt_to_bus(&self, va: u64) -> u64;

    fn read(&self, pa: u64, buf: &mut [u8]);

    fn write(&self, pa: u64, data: &[u8]);

    /// Reads a 32-bit word that the device may be writing concurrently.
    fn load_u32_acquire(&self, pa: u64) -> u32;

    fn store_u32_release(&self, pa: u64, value: u32);

    /// Granule every chunk size is rounded up to.
    fn page_size(&self) -> u64 {
        host_page_size()
    }
}

/// Pins and unpins user-space pages for zero-copy DMA.
pub trait UserPages: Send + Sync {
    /// Best-effort pin that never sleeps. May return fewer frames than requested.
    fn pin_fast(&self, pid: u32, uaddr: u64, n_pages: usize, writable: bool) -> Vec<u64>;

    /// Guaranteed pin that may block. Returns exactly `n_pages` frames or an error.
    fn pin_slow(&self, pid: u32, uaddr: u64, n_pages: usize, writable: bool)
    -> DriverResult<Vec<u64>>;

    /// Releases page frames. `dirty` marks them modified by the device.
    fn unpin(&self, pfns: &[u64], dirty: bool);

    fn page_size(&self) -> u64;
}

/// Time source for polling loops. Injected so waits can run against a manual clock in tests.
pub trait Clock: Send + Sync {
    /// Monotonic nanoseconds since an arbitrary origin. Never wraps within a device session.
    fn now_ns(&self) -> u64;

    /// Busy-waits for roughly `us` microseconds.
    fn delay_us(&self, us: u64);

    /// Gives up the processor for one scheduling quantum.
    fn yield_now(&self);
}

/// Wall-clock backed [`Clock`] using spin delays.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    #[allow(clippy::cast_possible_truncation)]
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn delay_us(&self, us: u64) {
        let deadline = Instant::now() + Duration::from_micros(us);
        while Instant::now() < deadline {
            std::hint::spin_loop();
        }
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}
