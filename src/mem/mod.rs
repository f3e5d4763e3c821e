pub mod arena;
pub mod handle;
pub mod mempool;

pub use handle::{Handle, HandleTable};
pub use mempool::{
    ChunkObserver, DevicePoolUsage, HostPoolUsage, MempoolSet, PoolUsage, ProcessUsage,
};

/// Where a chunk's backing memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemLocation {
    Host,
    Device,
}

/// Reclamation tier of a chunk. Sweeps run from the shortest tier to the longest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Lifespan {
    /// Released when the owning call context ends.
    Local,
    CurrentProcess,
    /// Survives its creator; released when the last attached process detaches.
    AllProcess,
    /// Lives as long as the device binding.
    Device,
}

impl Lifespan {
    pub const ALL: [Self; 4] = [
        Self::Local,
        Self::CurrentProcess,
        Self::AllProcess,
        Self::Device,
    ];

    /// The tier a still-referenced chunk is demoted to when its own tier expires.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Local => Some(Self::CurrentProcess),
            Self::CurrentProcess => Some(Self::AllProcess),
            Self::AllProcess => Some(Self::Device),
            Self::Device => None,
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Accounting bucket for a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemCategory {
    Code,
    Tensors,
    Constants,
    DmaRings,
    /// Contiguous scratchpad carved from the tail of the main device arena.
    Scratchpad,
    Datastore,
    Driver,
    Misc,
}

impl MemCategory {
    pub const COUNT: usize = 8;

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

/// Identity of the process issuing a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub u32);

impl ProcessId {
    /// Identity used for allocations the driver makes on its own behalf.
    pub const KERNEL: Self = Self(0);
}

/// Reference to a live chunk: slab index plus the generation the slot had when the chunk was
/// created. A stale id never resolves to a newer chunk reusing the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl ChunkId {
    /// Largest generation value; wider values would collide with the handle table's tag bit.
    pub(crate) const GENERATION_MASK: u32 = 0x7FFF_FFFF;

    #[must_use]
    pub(crate) const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.slot as u64
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) const fn from_bits(bits: u64) -> Self {
        Self {
            slot: bits as u32,
            generation: (bits >> 32) as u32 & Self::GENERATION_MASK,
        }
    }
}

/// Parameters of a single allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub size: u64,
    /// `0` means the natural page alignment.
    pub align: u64,
    pub location: MemLocation,
    pub channel: u32,
    pub region: u32,
    pub core: Option<u32>,
    pub lifespan: Lifespan,
    pub category: MemCategory,
}

impl AllocRequest {
    #[must_use]
    pub const fn host(size: u64) -> Self {
        Self {
            size,
            align: 0,
            location: MemLocation::Host,
            channel: 0,
            region: 0,
            core: None,
            lifespan: Lifespan::CurrentProcess,
            category: MemCategory::Misc,
        }
    }

    #[must_use]
    pub const fn device(channel: u32, region: u32, size: u64) -> Self {
        Self {
            size,
            align: 0,
            location: MemLocation::Device,
            channel,
            region,
            core: None,
            lifespan: Lifespan::CurrentProcess,
            category: MemCategory::Misc,
        }
    }

    #[must_use]
    pub const fn with_align(mut self, align: u64) -> Self {
        self.align = align;
        self
    }

    #[must_use]
    pub const fn with_lifespan(mut self, lifespan: Lifespan) -> Self {
        self.lifespan = lifespan;
        self
    }

    #[must_use]
    pub const fn with_core(mut self, core: u32) -> Self {
        self.core = Some(core);
        self
    }

    #[must_use]
    pub const fn with_category(mut self, category: MemCategory) -> Self {
        self.category = category;
        self
    }
}

/// Snapshot of a live chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemChunkInfo {
    pub id: ChunkId,
    pub pa: u64,
    /// Kernel virtual address, for host chunks.
    pub va: Option<u64>,
    pub size: u64,
    pub location: MemLocation,
    pub channel: u32,
    pub region: u32,
    pub core: Option<u32>,
    pub ref_count: u32,
    pub lifespan: Lifespan,
    pub category: MemCategory,
    pub pid: ProcessId,
    pub handle: Option<Handle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifespans_demote_in_order() {
        let mut tier = Lifespan::Local;
        let mut seen = vec![tier];
        while let Some(next) = tier.next() {
            seen.push(next);
            tier = next;
        }
        assert_eq!(seen, Lifespan::ALL);
    }

    #[test]
    fn chunk_id_bits() {
        let id = ChunkId {
            slot: 17,
            generation: 0x1234,
        };
        assert_eq!(ChunkId::from_bits(id.to_bits()), id);
        assert_eq!(ChunkId::from_bits(id.to_bits() | 1 << 63), id);
    }
}
