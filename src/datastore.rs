//! Per-process datastore: a host chunk mirroring the memory a process holds, so tooling can map
//! it and read usage without a round trip through the driver.
//!
//! Layout (little-endian `u64`s): host bytes, device bytes, then one counter per
//! [`MemCategory`].

#![allow(clippy::cast_possible_truncation)]

use crate::error::DriverResult;
use crate::mem::{
    AllocRequest, ChunkId, ChunkObserver, Lifespan, MemCategory, MemChunkInfo, MemLocation,
    MempoolSet, ProcessId,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

pub const DS_HOST_OFFSET: u64 = 0;
pub const DS_DEVICE_OFFSET: u64 = 8;
pub const DS_CATEGORY_OFFSET: u64 = 16;
/// Bytes of the datastore holding counters.
pub const DS_COUNTERS_SIZE: u64 = DS_CATEGORY_OFFSET + MemCategory::COUNT as u64 * 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatastoreCounters {
    pub host: u64,
    pub device: u64,
    pub by_category: [u64; MemCategory::COUNT],
}

impl DatastoreCounters {
    fn apply(&mut self, info: &MemChunkInfo, allocated: bool) {
        let bump = |v: &mut u64| {
            *v = if allocated {
                v.saturating_add(info.size)
            } else {
                v.saturating_sub(info.size)
            };
        };
        match info.location {
            MemLocation::Host => bump(&mut self.host),
            MemLocation::Device => bump(&mut self.device),
        }
        bump(&mut self.by_category[info.category.index()]);
    }

    fn to_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(DS_COUNTERS_SIZE as usize);
        out.extend_from_slice(&self.host.to_le_bytes());
        out.extend_from_slice(&self.device.to_le_bytes());
        for v in self.by_category {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    /// Decodes a counter block as laid out in the datastore chunk.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let word = |off: usize| {
            bytes
                .get(off..off + 8)
                .and_then(|b| b.try_into().ok())
                .map_or(0, u64::from_le_bytes)
        };
        let mut counters = Self {
            host: word(DS_HOST_OFFSET as usize),
            device: word(DS_DEVICE_OFFSET as usize),
            by_category: [0; MemCategory::COUNT],
        };
        for (i, v) in counters.by_category.iter_mut().enumerate() {
            *v = word(DS_CATEGORY_OFFSET as usize + i * 8);
        }
        counters
    }
}

#[derive(Debug, Default)]
struct DatastoreState {
    /// Running totals for every process seen, with or without a datastore.
    counters: HashMap<ProcessId, DatastoreCounters>,
    chunks: HashMap<ProcessId, ChunkId>,
}

#[derive(Debug)]
pub struct Datastore {
    pools: Arc<MempoolSet>,
    size: u64,
    state: Mutex<DatastoreState>,
}

impl Datastore {
    /// Creates the datastore and registers it as the pool set's observer.
    #[must_use]
    pub fn new(pools: Arc<MempoolSet>, size: u64) -> Arc<Self> {
        let ds = Arc::new(Self {
            pools: pools.clone(),
            size: size.max(DS_COUNTERS_SIZE),
            state: Mutex::new(DatastoreState::default()),
        });
        let observer: Arc<dyn ChunkObserver> = ds.clone();
        pools.set_observer(Arc::downgrade(&observer));
        ds
    }

    /// Returns the datastore chunk of `pid`, creating it on first use.
    ///
    /// # Errors
    /// Propagates allocation failures.
    pub fn acquire(&self, pid: ProcessId) -> DriverResult<ChunkId> {
        if let Some(id) = self.state.lock().chunks.get(&pid) {
            return Ok(*id);
        }

        // The allocation reports back through the observer: no lock held here.
        let req = AllocRequest::host(self.size)
            .with_lifespan(Lifespan::Device)
            .with_category(MemCategory::Datastore);
        let id = self.pools.alloc(ProcessId::KERNEL, req)?;

        let mut state = self.state.lock();
        if let Some(existing) = state.chunks.get(&pid).copied() {
            drop(state);
            self.pools.free(id);
            return Ok(existing);
        }
        state.chunks.insert(pid, id);
        let snapshot = state.counters.get(&pid).copied().unwrap_or_default();
        self.pools.write(id, 0, &snapshot.to_bytes())?;
        tracing::debug!(pid = pid.0, "datastore created");
        Ok(id)
    }

    /// Frees the datastore of `pid`. Returns whether one existed.
    pub fn release(&self, pid: ProcessId) -> bool {
        let chunk = {
            let mut state = self.state.lock();
            state.counters.remove(&pid);
            state.chunks.remove(&pid)
        };
        match chunk {
            Some(id) => {
                self.pools.free(id);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn chunk(&self, pid: ProcessId) -> Option<ChunkId> {
        self.state.lock().chunks.get(&pid).copied()
    }

    /// Counters as tracked in memory.
    #[must_use]
    pub fn counters(&self, pid: ProcessId) -> DatastoreCounters {
        self.state
            .lock()
            .counters
            .get(&pid)
            .copied()
            .unwrap_or_default()
    }

    /// Counters as published in the datastore chunk.
    ///
    /// # Errors
    /// `NotFound` if `pid` has no datastore.
    pub fn read_published(&self, pid: ProcessId) -> DriverResult<DatastoreCounters> {
        let id = self
            .chunk(pid)
            .ok_or(crate::error::DriverError::NotFound)?;
        let mut bytes = vec![0u8; DS_COUNTERS_SIZE as usize];
        self.pools.read(id, 0, &mut bytes)?;
        Ok(DatastoreCounters::from_bytes(&bytes))
    }

    fn record(&self, info: &MemChunkInfo, allocated: bool) {
        if info.pid == ProcessId::KERNEL {
            return;
        }
        let mut state = self.state.lock();
        let counters = state.counters.entry(info.pid).or_default();
        counters.apply(info, allocated);
        let snapshot = *counters;
        if let Some(id) = state.chunks.get(&info.pid).copied()
            && let Err(e) = self.pools.write(id, 0, &snapshot.to_bytes())
        {
            tracing::warn!(pid = info.pid.0, error = %e, "datastore update failed");
        }
    }
}

impl ChunkObserver for Datastore {
    fn chunk_allocated(&self, info: &MemChunkInfo) {
        self.record(info, true);
    }

    fn chunk_freed(&self, info: &MemChunkInfo) {
        self.record(info, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::hal::firmware::discover_memory_layout;
    use crate::hal::sim::{SimConfig, SimDevice};
    use crate::hal::{ArchHal, ArchV2};

    fn setup() -> (Arc<MempoolSet>, Arc<Datastore>) {
        let hal: Arc<dyn ArchHal> = Arc::new(ArchV2);
        let sim = SimDevice::new(hal.clone(), SimConfig::default());
        let layout = discover_memory_layout(sim.as_ref(), hal.as_ref()).unwrap();
        let config = DriverConfig::default()
            .with_small_pool(0, 0)
            .with_host_pools(Vec::new());
        let pools = Arc::new(MempoolSet::new(hal, sim, layout, &config));
        let ds = Datastore::new(pools.clone(), config.datastore_size);
        (pools, ds)
    }

    #[test]
    fn counters_follow_allocations() {
        let (pools, ds) = setup();
        let pid = ProcessId(42);
        ds.acquire(pid).unwrap();

        let a = pools
            .alloc(pid, AllocRequest::device(0, 0, 8192).with_category(MemCategory::Tensors))
            .unwrap();
        let b = pools.alloc(pid, AllocRequest::host(100)).unwrap();

        let published = ds.read_published(pid).unwrap();
        assert_eq!(published, ds.counters(pid));
        assert_eq!(published.device, 8192);
        assert_eq!(published.host, pools.page_size());
        assert_eq!(published.by_category[MemCategory::Tensors.index()], 8192);

        assert!(pools.free(a));
        assert!(pools.free(b));
        assert_eq!(ds.read_published(pid).unwrap(), DatastoreCounters::default());
    }

    #[test]
    fn datastore_created_late_sees_earlier_usage() {
        let (pools, ds) = setup();
        let pid = ProcessId(5);
        pools.alloc(pid, AllocRequest::device(0, 0, 4096)).unwrap();
        ds.acquire(pid).unwrap();
        assert_eq!(ds.read_published(pid).unwrap().device, 4096);
    }

    #[test]
    fn acquire_is_idempotent_and_release_frees() {
        let (pools, ds) = setup();
        let pid = ProcessId(9);
        let before = pools.usage().by_category[MemCategory::Datastore.index()];
        let first = ds.acquire(pid).unwrap();
        assert_eq!(ds.acquire(pid).unwrap(), first);
        assert!(pools.usage().by_category[MemCategory::Datastore.index()] > before);

        assert!(ds.release(pid));
        assert!(!ds.release(pid));
        assert_eq!(
            pools.usage().by_category[MemCategory::Datastore.index()],
            before
        );
        assert!(matches!(
            ds.read_published(pid),
            Err(crate::error::DriverError::NotFound)
        ));
    }
}
