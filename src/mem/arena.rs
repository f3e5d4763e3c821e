use crate::utils::{align_up, is_aligned};
use std::collections::BTreeMap;

/// A sub-allocator over a fixed physical range.
///
/// First-fit for regular requests, fixed-offset for callers that pick the address themselves.
#[derive(Debug)]
pub struct Arena {
    base: u64,
    end: u64,
    min_align: u64,

    // Occupied ranges: start -> size.
    allocations: BTreeMap<u64, u64>,
    allocated: u64,
}

impl Arena {
    #[must_use]
    pub fn new(base: u64, size: u64, min_align: u64) -> Self {
        Self {
            base,
            end: base + size,
            min_align,
            allocations: BTreeMap::new(),
            allocated: 0,
        }
    }

    #[must_use]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// One past the last byte of the arena.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.end
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.end - self.base
    }

    #[must_use]
    pub const fn allocated(&self) -> u64 {
        self.allocated
    }

    /// First-fit allocation of `size` bytes aligned to `max(align, min_align)`.
    pub fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 || size > self.size() - self.allocated {
            return None;
        }
        let align = align.max(self.min_align);
        let mut candidate = align_up(self.base, align);

        for (&start, &len) in &self.allocations {
            if start >= candidate && start - candidate >= size {
                break;
            }
            candidate = candidate.max(align_up(start + len, align));
        }

        if candidate.checked_add(size)? > self.end {
            return None;
        }
        self.insert(candidate, size);
        Some(candidate)
    }

    /// Claims exactly `[addr, addr + size)`, failing if any byte of it is taken.
    pub fn alloc_fixed(&mut self, addr: u64, size: u64) -> Option<u64> {
        if size == 0 || addr < self.base || addr.checked_add(size)? > self.end {
            return None;
        }
        if !is_aligned(addr, self.min_align) {
            return None;
        }
        // The closest allocation at or below `addr` must end before it.
        if let Some((&start, &len)) = self.allocations.range(..=addr).next_back()
            && start + len > addr
        {
            return None;
        }
        // And nothing may start inside the requested range.
        if self.allocations.range(addr..addr + size).next().is_some() {
            return None;
        }
        self.insert(addr, size);
        Some(addr)
    }

    /// Releases an allocation, returning its size.
    pub fn free(&mut self, addr: u64) -> Option<u64> {
        let size = self.allocations.remove(&addr)?;
        self.allocated -= size;
        Some(size)
    }

    fn insert(&mut self, addr: u64, size: u64) {
        self.allocations.insert(addr, size);
        self.allocated += size;
    }
}
