//! Two-level table mapping opaque 64-bit handles to chunks.
//!
//! Level one is a fixed array of lazily allocated level-two blocks. Every cell is a single
//! `AtomicU64` holding either an occupied chunk reference or a free-list link, so lookups can
//! run without the table lock and still never observe a torn value.

#![allow(clippy::cast_possible_truncation)]

use super::ChunkId;
use crate::error::{DriverError, DriverResult};
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const OCCUPIED_TAG: u64 = 1 << 63;

/// Opaque user-visible memory handle. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cell {
    Occupied(ChunkId),
    /// Free-list link to the next free index. `0` marks a cell that was never handed out.
    Free(u32),
}

impl Cell {
    const fn encode(self) -> u64 {
        match self {
            Self::Occupied(id) => OCCUPIED_TAG | id.to_bits(),
            Self::Free(next) => next as u64,
        }
    }

    const fn decode(raw: u64) -> Self {
        if raw & OCCUPIED_TAG != 0 {
            Self::Occupied(ChunkId::from_bits(raw & !OCCUPIED_TAG))
        } else {
            Self::Free(raw as u32)
        }
    }
}

#[derive(Debug)]
pub struct HandleTable {
    blocks: Box<[OnceLock<Box<[AtomicU64]>>]>,
    block_size: u32,
    capacity: u32,
    /// Set once capacity is exhausted. Every later operation fails closed.
    down: AtomicBool,
    /// Head of the free list; alloc and free serialize on it.
    free_head: Mutex<u32>,
}

impl HandleTable {
    /// # Panics
    /// Panics if either dimension is zero.
    #[must_use]
    pub fn new(l1_size: u32, l2_size: u32) -> Self {
        assert!(l1_size > 0 && l2_size > 0, "empty handle table geometry");
        let capacity = l1_size.saturating_mul(l2_size);
        Self {
            blocks: (0..l1_size).map(|_| OnceLock::new()).collect(),
            block_size: l2_size,
            capacity,
            down: AtomicBool::new(false),
            free_head: Mutex::new(1),
        }
    }

    #[must_use]
    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    fn locate(&self, idx: u32) -> (usize, usize) {
        (
            (idx / self.block_size) as usize,
            (idx % self.block_size) as usize,
        )
    }

    fn cell(&self, idx: u32) -> Option<&AtomicU64> {
        let (l1, l2) = self.locate(idx);
        self.blocks.get(l1)?.get().map(|block| &block[l2])
    }

    fn cell_or_init(&self, idx: u32) -> &AtomicU64 {
        let (l1, l2) = self.locate(idx);
        let block = self.blocks[l1].get_or_init(|| {
            (0..self.block_size)
                .map(|_| AtomicU64::new(Cell::Free(0).encode()))
                .collect()
        });
        &block[l2]
    }

    /// Publishes `chunk` under a fresh handle.
    ///
    /// # Errors
    /// `OutOfMemory` once the table has run out of indices; the table then stays down.
    ///
    /// # Panics
    /// Panics if the free list points at an occupied cell.
    pub fn alloc_handle(&self, chunk: ChunkId) -> DriverResult<Handle> {
        let mut head = self.free_head.lock();
        if self.is_down() {
            return Err(DriverError::OutOfMemory);
        }

        let idx = *head;
        if idx >= self.capacity {
            self.down.store(true, Ordering::Release);
            tracing::error!(capacity = self.capacity, "handle table exhausted");
            return Err(DriverError::OutOfMemory);
        }

        let cell = self.cell_or_init(idx);
        let next = match Cell::decode(cell.load(Ordering::Acquire)) {
            Cell::Free(0) => idx + 1,
            Cell::Free(next) => next,
            Cell::Occupied(other) => {
                panic!("handle free list corrupted: index {idx} holds {other:?}")
            }
        };

        cell.store(Cell::Occupied(chunk).encode(), Ordering::Release);
        *head = next;
        Ok(Handle(u64::from(idx)))
    }

    /// Retires `handle` and returns the chunk it referenced.
    ///
    /// # Errors
    /// `InvalidArgument` for an out-of-range handle, `NotFound` if it is not live or the table
    /// is down.
    pub fn free_handle(&self, handle: Handle) -> DriverResult<ChunkId> {
        let idx = self.index_of(handle)?;
        let mut head = self.free_head.lock();
        if self.is_down() {
            return Err(DriverError::NotFound);
        }

        let cell = self.cell(idx).ok_or(DriverError::NotFound)?;
        let Cell::Occupied(chunk) = Cell::decode(cell.load(Ordering::Acquire)) else {
            return Err(DriverError::NotFound);
        };

        cell.store(Cell::Free(*head).encode(), Ordering::Release);
        *head = idx;
        Ok(chunk)
    }

    /// Lock-free lookup. A concurrent free may make the answer stale, never invalid.
    #[must_use]
    pub fn find(&self, handle: Handle) -> Option<ChunkId> {
        if self.is_down() {
            return None;
        }
        let idx = self.index_of(handle).ok()?;
        match Cell::decode(self.cell(idx)?.load(Ordering::Acquire)) {
            Cell::Occupied(chunk) => Some(chunk),
            Cell::Free(_) => None,
        }
    }

    fn index_of(&self, handle: Handle) -> DriverResult<u32> {
        match u32::try_from(handle.0) {
            Ok(idx) if idx != 0 && idx < self.capacity => Ok(idx),
            _ => Err(DriverError::invalid(format!("invalid handle {:#x}", handle.0))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(slot: u32) -> ChunkId {
        ChunkId {
            slot,
            generation: slot + 100,
        }
    }

    #[test]
    fn handles_start_at_one_and_resolve() {
        let table = HandleTable::new(4, 8);
        let h = table.alloc_handle(chunk(3)).unwrap();
        assert_eq!(h.value(), 1);
        assert_eq!(table.find(h), Some(chunk(3)));
        assert_eq!(table.find(Handle::from_raw(0)), None);
        assert_eq!(table.find(Handle::from_raw(2)), None);
    }

    #[test]
    fn freed_index_is_reused_first() {
        let table = HandleTable::new(4, 8);
        let a = table.alloc_handle(chunk(1)).unwrap();
        let b = table.alloc_handle(chunk(2)).unwrap();
        assert_eq!(table.free_handle(a).unwrap(), chunk(1));
        assert_eq!(table.find(a), None);

        let c = table.alloc_handle(chunk(3)).unwrap();
        assert_eq!(c, a);
        let d = table.alloc_handle(chunk(4)).unwrap();
        assert_eq!(d.value(), b.value() + 1);
    }

    #[test]
    fn double_free_is_not_found() {
        let table = HandleTable::new(2, 4);
        let h = table.alloc_handle(chunk(1)).unwrap();
        table.free_handle(h).unwrap();
        assert!(matches!(table.free_handle(h), Err(DriverError::NotFound)));
        assert!(matches!(
            table.free_handle(Handle::from_raw(0)),
            Err(DriverError::InvalidArgument(_))
        ));
        // Never-populated block.
        assert!(matches!(
            table.free_handle(Handle::from_raw(6)),
            Err(DriverError::NotFound)
        ));
    }

    #[test]
    fn exhaustion_takes_table_down() {
        let table = HandleTable::new(2, 2);
        let handles: Vec<_> = (0..3).map(|i| table.alloc_handle(chunk(i)).unwrap()).collect();
        assert_eq!(
            handles.iter().map(|h| h.value()).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert!(matches!(
            table.alloc_handle(chunk(9)),
            Err(DriverError::OutOfMemory)
        ));
        assert!(table.is_down());

        // Handles that were live before the table went down no longer resolve.
        assert_eq!(table.find(handles[0]), None);
        assert!(matches!(
            table.free_handle(handles[0]),
            Err(DriverError::NotFound)
        ));
        assert!(table.alloc_handle(chunk(9)).is_err());
    }

    #[test]
    fn concurrent_lookups_see_consistent_cells() {
        let table = std::sync::Arc::new(HandleTable::new(8, 64));
        let h = table.alloc_handle(chunk(5)).unwrap();
        let reader = {
            let table = table.clone();
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    if let Some(id) = table.find(h) {
                        assert_eq!(id.generation, id.slot + 100);
                    }
                }
            })
        };
        for i in 0..1000 {
            let id = table.free_handle(h).unwrap();
            assert_eq!(id.generation, id.slot + 100);
            assert_eq!(table.alloc_handle(chunk(i)).unwrap(), h);
        }
        reader.join().unwrap();
    }
}
