//! Generation-independent UDMA and semaphore register map.
//!
//! Offsets are relative to the block bases reported by [`super::ArchHal`].

// ===============================================================================================
// UDMA Engine Block
// ===============================================================================================

/// Distance between two consecutive engine register blocks.
pub const ENGINE_REG_STRIDE: u64 = 0x4000;

/// Write: requested state for the memory-to-stream (submission) direction.
pub const ENG_M2S_STATE_CHANGE: u64 = 0x000;
/// Write: requested state for the stream-to-memory (completion) direction.
pub const ENG_S2M_STATE_CHANGE: u64 = 0x004;
/// Read: packed sub-status fields of the submission direction.
pub const ENG_M2S_STATUS: u64 = 0x010;
/// Read: packed sub-status fields of the completion direction.
pub const ENG_S2M_STATUS: u64 = 0x014;
/// Read/Write: engine stream configuration.
pub const ENG_STREAM_CFG: u64 = 0x020;

pub const STREAM_CFG_ENABLE: u32 = 1 << 0;

// Sub-status field positions inside `ENG_*_STATUS` (4 bits each).
pub const STATUS_COMP_CTRL_SHIFT: u32 = 0;
pub const STATUS_STREAM_IF_SHIFT: u32 = 4;
pub const STATUS_DATA_RD_SHIFT: u32 = 8;
pub const STATUS_DESC_PREF_SHIFT: u32 = 12;
pub const STATUS_FIELD_MASK: u32 = 0xF;

// State codes shared by state-change requests and status fields.
pub const STATE_DISABLE: u32 = 0;
pub const STATE_IDLE: u32 = 1;
pub const STATE_NORMAL: u32 = 2;
pub const STATE_ABORT: u32 = 3;
pub const STATE_RESET: u32 = 4;

// ===============================================================================================
// UDMA Queue Block
// ===============================================================================================

pub const QUEUE_BLOCK_OFFSET: u64 = 0x1000;
pub const QUEUE_REG_STRIDE: u64 = 0x100;

pub const Q_TX_BASE_LO: u64 = 0x00;
pub const Q_TX_BASE_HI: u64 = 0x04;
pub const Q_TX_SIZE: u64 = 0x08;
/// Doorbell: number of descriptors appended to the submission ring.
pub const Q_TX_TAIL_INC: u64 = 0x0C;
/// Running count of submission descriptors consumed by hardware.
pub const Q_TX_HEAD: u64 = 0x10;

pub const Q_RX_BASE_LO: u64 = 0x20;
pub const Q_RX_BASE_HI: u64 = 0x24;
pub const Q_RX_SIZE: u64 = 0x28;
pub const Q_RX_TAIL_INC: u64 = 0x2C;
pub const Q_RX_HEAD: u64 = 0x30;

pub const Q_CMPL_BASE_LO: u64 = 0x40;
pub const Q_CMPL_BASE_HI: u64 = 0x44;
pub const Q_CMPL_SIZE: u64 = 0x48;
pub const Q_CMPL_HEAD_INC: u64 = 0x4C;

pub const Q_CFG: u64 = 0x50;
pub const Q_CFG_ENABLE: u32 = 1 << 0;
pub const Q_CFG_STREAM_ENABLE: u32 = 1 << 1;

#[must_use]
pub const fn queue_reg(engine_base: u64, queue: u32, reg: u64) -> u64 {
    engine_base + QUEUE_BLOCK_OFFSET + (queue as u64) * QUEUE_REG_STRIDE + reg
}

// ===============================================================================================
// Semaphore / Event Block
// ===============================================================================================

/// Distance between the semaphore blocks of two cores.
pub const SEM_BLOCK_STRIDE: u64 = 0x1_0000;

pub const SEM_READ_OFFSET: u64 = 0x0000;
pub const SEM_SET_OFFSET: u64 = 0x1000;
pub const SEM_INC_OFFSET: u64 = 0x2000;
pub const SEM_DEC_OFFSET: u64 = 0x3000;
pub const EVENT_OFFSET: u64 = 0x8000;

// ===============================================================================================
// Firmware-visible registers
// ===============================================================================================

/// Size in MiB of DRAM channel `n` lives at `FW_REG_DRAM_SIZE_BASE + 4 * n`.
pub const FW_REG_DRAM_SIZE_BASE: u64 = 0x0F00_0000;
pub const FW_REG_REVISION: u64 = 0x0F00_1000;
pub const FW_REG_SERIAL: u64 = 0x0F00_1004;
