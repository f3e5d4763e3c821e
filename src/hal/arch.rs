use super::regs::{
    ENGINE_REG_STRIDE, EVENT_OFFSET, FW_REG_DRAM_SIZE_BASE, SEM_BLOCK_STRIDE, SEM_READ_OFFSET,
};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::Range;

/// Chip generations supported by the driver core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum ChipArch {
    V2,
    V3,
}

/// Address map and topology constants for one chip generation.
///
/// Selected once at probe time (see [`super::select`]); everything above the HAL talks to the
/// hardware exclusively through this trait.
pub trait ArchHal: Send + Sync + Debug {
    fn arch(&self) -> ChipArch;

    fn core_count(&self) -> u32;

    fn dram_channel_count(&self) -> u32;

    /// Number of pool regions each DRAM channel is split into.
    fn dram_region_count(&self) -> u32;

    /// Physical base address of a DRAM channel.
    fn dram_channel_base(&self, channel: u32) -> u64;

    fn dma_engine_count(&self) -> u32;

    /// Queues per DMA engine.
    fn dma_queue_count(&self) -> u32;

    /// Engines owned by a core, including its H2T engine.
    fn core_engines(&self, core: u32) -> Range<u32>;

    /// Engine reserved for host<->device copies issued by the driver for `core`.
    fn h2t_engine(&self, core: u32) -> u32;

    /// Queue reserved for driver copies on the H2T engine.
    fn h2t_queue(&self) -> u32;

    fn engine_reg_base(&self, engine: u32) -> u64;

    /// Address bit OR'ed into ring addresses routed through the alternate AXI port.
    fn axi_port_bit(&self) -> u64;

    fn semaphore_count(&self) -> u32;

    fn event_count(&self) -> u32;

    fn semaphore_block_base(&self, core: u32) -> u64;

    /// Register holding the value of semaphore `idx`; set/inc/dec live at fixed offsets from it.
    fn semaphore_reg(&self, core: u32, idx: u32) -> u64 {
        self.semaphore_block_base(core) + SEM_READ_OFFSET + u64::from(idx) * 4
    }

    fn event_reg(&self, core: u32, idx: u32) -> u64 {
        self.semaphore_block_base(core) + EVENT_OFFSET + u64::from(idx) * 4
    }

    /// Firmware register reporting the size (MiB) of a DRAM channel.
    fn dram_size_reg(&self, channel: u32) -> u64 {
        FW_REG_DRAM_SIZE_BASE + u64::from(channel) * 4
    }
}

// ===============================================================================================
// Generation 2
// ===============================================================================================

#[derive(Debug, Default)]
pub struct ArchV2;

impl ArchV2 {
    const CORES: u32 = 2;
    const ENGINES_PER_CORE: u32 = 16;
    const ENGINE_BASE: u64 = 0x0010_0000;
    const SEM_BASE: u64 = 0x0800_0000;
}

impl ArchHal for ArchV2 {
    fn arch(&self) -> ChipArch {
        ChipArch::V2
    }

    fn core_count(&self) -> u32 {
        Self::CORES
    }

    fn dram_channel_count(&self) -> u32 {
        2
    }

    fn dram_region_count(&self) -> u32 {
        1
    }

    fn dram_channel_base(&self, channel: u32) -> u64 {
        0x40_0000_0000 + u64::from(channel) * 0x10_0000_0000
    }

    fn dma_engine_count(&self) -> u32 {
        Self::CORES * Self::ENGINES_PER_CORE
    }

    fn dma_queue_count(&self) -> u32 {
        16
    }

    fn core_engines(&self, core: u32) -> Range<u32> {
        core * Self::ENGINES_PER_CORE..(core + 1) * Self::ENGINES_PER_CORE
    }

    fn h2t_engine(&self, core: u32) -> u32 {
        core * Self::ENGINES_PER_CORE + Self::ENGINES_PER_CORE - 1
    }

    fn h2t_queue(&self) -> u32 {
        0
    }

    fn engine_reg_base(&self, engine: u32) -> u64 {
        Self::ENGINE_BASE + u64::from(engine) * ENGINE_REG_STRIDE
    }

    fn axi_port_bit(&self) -> u64 {
        1 << 46
    }

    fn semaphore_count(&self) -> u32 {
        32
    }

    fn event_count(&self) -> u32 {
        256
    }

    fn semaphore_block_base(&self, core: u32) -> u64 {
        Self::SEM_BASE + u64::from(core) * SEM_BLOCK_STRIDE
    }
}

// ===============================================================================================
// Generation 3
// ===============================================================================================

#[derive(Debug, Default)]
pub struct ArchV3;

impl ArchV3 {
    const CORES: u32 = 4;
    const ENGINES_PER_CORE: u32 = 16;
    const ENGINE_BASE: u64 = 0x0020_0000;
    const SEM_BASE: u64 = 0x0900_0000;
}

impl ArchHal for ArchV3 {
    fn arch(&self) -> ChipArch {
        ChipArch::V3
    }

    fn core_count(&self) -> u32 {
        Self::CORES
    }

    fn dram_channel_count(&self) -> u32 {
        2
    }

    fn dram_region_count(&self) -> u32 {
        2
    }

    fn dram_channel_base(&self, channel: u32) -> u64 {
        0x80_0000_0000 + u64::from(channel) * 0x20_0000_0000
    }

    fn dma_engine_count(&self) -> u32 {
        Self::CORES * Self::ENGINES_PER_CORE
    }

    fn dma_queue_count(&self) -> u32 {
        16
    }

    fn core_engines(&self, core: u32) -> Range<u32> {
        core * Self::ENGINES_PER_CORE..(core + 1) * Self::ENGINES_PER_CORE
    }

    fn h2t_engine(&self, core: u32) -> u32 {
        core * Self::ENGINES_PER_CORE + Self::ENGINES_PER_CORE - 1
    }

    fn h2t_queue(&self) -> u32 {
        15
    }

    fn engine_reg_base(&self, engine: u32) -> u64 {
        Self::ENGINE_BASE + u64::from(engine) * ENGINE_REG_STRIDE
    }

    fn axi_port_bit(&self) -> u64 {
        1 << 47
    }

    fn semaphore_count(&self) -> u32 {
        48
    }

    fn event_count(&self) -> u32 {
        512
    }

    fn semaphore_block_base(&self, core: u32) -> u64 {
        Self::SEM_BASE + u64::from(core) * SEM_BLOCK_STRIDE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn h2t_engine_belongs_to_core() {
        for hal in [&ArchV2 as &dyn ArchHal, &ArchV3] {
            for core in 0..hal.core_count() {
                assert!(hal.core_engines(core).contains(&hal.h2t_engine(core)));
                assert!(hal.h2t_queue() < hal.dma_queue_count());
            }
            let last = hal.dma_engine_count() - 1;
            assert!(hal.engine_reg_base(last) < hal.semaphore_block_base(0));
        }
    }
}
