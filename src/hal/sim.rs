//! Software model of an accelerator: sparse physical memory, a UDMA engine that executes
//! descriptors when the doorbell is rung, semaphores, a firmware endpoint and a user address
//! space for pinning.
//!
//! Used by the test suites and demos; it implements every platform trait the core consumes.

#![allow(clippy::cast_possible_truncation)]

use crate::dma::udma::{DESC_SIZE, UdmaDesc, ring_id_for};
use crate::error::{DriverError, DriverResult};
use crate::hal::firmware::FirmwareIo;
use crate::hal::platform::{Clock, CoherentBuffer, DmaMemory, RegisterAccess, UserPages};
use crate::hal::regs::{
    ENG_M2S_STATE_CHANGE, ENG_M2S_STATUS, ENG_S2M_STATE_CHANGE, ENG_S2M_STATUS, ENG_STREAM_CFG,
    ENGINE_REG_STRIDE, EVENT_OFFSET, FW_REG_REVISION, FW_REG_SERIAL, Q_CFG, Q_CFG_ENABLE,
    Q_CMPL_BASE_HI, Q_CMPL_BASE_LO, Q_CMPL_HEAD_INC, Q_CMPL_SIZE, Q_RX_BASE_HI, Q_RX_BASE_LO,
    Q_RX_HEAD, Q_RX_SIZE, Q_RX_TAIL_INC, Q_TX_BASE_HI, Q_TX_BASE_LO, Q_TX_HEAD, Q_TX_SIZE,
    Q_TX_TAIL_INC, QUEUE_BLOCK_OFFSET, QUEUE_REG_STRIDE, SEM_BLOCK_STRIDE, SEM_DEC_OFFSET,
    SEM_INC_OFFSET, SEM_SET_OFFSET, STATE_DISABLE, STATE_NORMAL, STATUS_COMP_CTRL_SHIFT,
    STATUS_DATA_RD_SHIFT, STATUS_DESC_PREF_SHIFT, STATUS_STREAM_IF_SHIFT,
};
use crate::hal::ArchHal;
use crate::mem::arena::Arena;
use crate::utils::{CoreMask, align_up};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const SIM_PAGE: u64 = 4096;
pub const HOST_PHYS_BASE: u64 = 0x1_0000_0000;
/// Kernel direct-map offset: coherent buffers live at `pa + HOST_VA_OFFSET`.
pub const HOST_VA_OFFSET: u64 = 0xFFFF_8000_0000_0000;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub host_memory: u64,
    pub dram_channel_mib: u32,
    pub topology: Vec<u32>,
    pub revision: u32,
    pub serial: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            host_memory: 256 * 1024 * 1024,
            dram_channel_mib: 64,
            topology: vec![1, 3],
            revision: 0x30,
            serial: 0x5eed,
        }
    }
}

/// One descriptor pair executed by the simulated engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimTransfer {
    pub src: u64,
    pub dst: u64,
    pub len: u32,
    pub flags: u32,
}

/// How a simulated user buffer is backed by physical pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimUserLayout {
    Contiguous,
    /// Every page lands in its own frame, none adjacent to its neighbours.
    Scattered,
}

/// Clock that only moves when told to, or when a caller delays on it.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, ns: u64) {
        self.now_ns.store(ns, Ordering::SeqCst);
    }

    pub fn advance_us(&self, us: u64) {
        self.now_ns.fetch_add(us * 1_000, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }

    fn delay_us(&self, us: u64) {
        self.advance_us(us);
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

// ===============================================================================================
// Internal State
// ===============================================================================================

#[derive(Debug, Default)]
struct SparseMemory {
    pages: BTreeMap<u64, Box<[u8]>>,
}

impl SparseMemory {
    fn read(&self, mut pa: u64, buf: &mut [u8]) {
        let mut done = 0;
        while done < buf.len() {
            let page = pa & !(SIM_PAGE - 1);
            let off = (pa - page) as usize;
            let n = (SIM_PAGE as usize - off).min(buf.len() - done);
            match self.pages.get(&page) {
                Some(p) => buf[done..done + n].copy_from_slice(&p[off..off + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
            pa += n as u64;
        }
    }

    fn write(&mut self, mut pa: u64, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let page = pa & !(SIM_PAGE - 1);
            let off = (pa - page) as usize;
            let n = (SIM_PAGE as usize - off).min(data.len() - done);
            let p = self
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; SIM_PAGE as usize].into_boxed_slice());
            p[off..off + n].copy_from_slice(&data[done..done + n]);
            done += n;
            pa += n as u64;
        }
    }

    fn discard(&mut self, pa: u64, size: u64) {
        let start = pa & !(SIM_PAGE - 1);
        let keys: Vec<u64> = self.pages.range(start..pa + size).map(|(k, _)| *k).collect();
        for k in keys {
            self.pages.remove(&k);
        }
    }
}

#[derive(Debug, Default)]
struct SimQueue {
    tx_base: u64,
    tx_size: u32,
    tx_tail: u64,
    tx_head: u64,
    rx_base: u64,
    rx_size: u32,
    rx_tail: u64,
    rx_head: u64,
    cmpl_base: u64,
    cmpl_size: u32,
    cmpl_head: u64,
    cfg: u32,
    stall_doorbells: u32,
    stalled: bool,
    log: Vec<SimTransfer>,
}

impl SimQueue {
    fn reset_tx(&mut self) {
        self.tx_head = 0;
        self.tx_tail = 0;
        self.stalled = false;
    }

    fn reset_rx(&mut self) {
        self.rx_head = 0;
        self.rx_tail = 0;
        self.stalled = false;
    }
}

#[derive(Debug)]
struct SimEngine {
    m2s: u32,
    s2m: u32,
    stream_cfg: u32,
    stuck_stream_if: bool,
    queues: Vec<SimQueue>,
}

#[derive(Debug, Default)]
struct SimRegs {
    engines: Vec<SimEngine>,
    semaphores: HashMap<(u32, u32), u32>,
    events: HashMap<(u32, u32), u32>,
    other: HashMap<u64, u32>,
}

#[derive(Debug, Default)]
struct SimFirmware {
    regs: HashMap<u64, u32>,
    resets: Vec<CoreMask>,
    reset_initiated: bool,
    ready_after_polls: u32,
    polls_remaining: u32,
    fail_resets: u32,
    never_ready: bool,
    metrics: Vec<Vec<u8>>,
    topology: Vec<u32>,
}

#[derive(Debug, Default)]
struct SimUser {
    mappings: HashMap<(u32, u64), u64>,
    pinned: HashMap<u64, u32>,
    dirty: Vec<u64>,
    fast_pin_limit: Option<usize>,
    fast_pins: usize,
    slow_pins: usize,
}

enum RegTarget {
    Engine { engine: usize, off: u64 },
    Queue { engine: usize, queue: usize, off: u64 },
    Semaphore { core: u32, off: u64 },
    Other,
}

// ===============================================================================================
// Simulated Device
// ===============================================================================================

#[derive(Debug)]
pub struct SimDevice {
    hal: Arc<dyn ArchHal>,
    memory: Mutex<SparseMemory>,
    host_phys: Mutex<Arena>,
    coherent_fail: AtomicBool,
    regs: Mutex<SimRegs>,
    firmware: Mutex<SimFirmware>,
    user: Mutex<SimUser>,
}

impl SimDevice {
    #[must_use]
    pub fn new(hal: Arc<dyn ArchHal>, config: SimConfig) -> Arc<Self> {
        let engines = (0..hal.dma_engine_count())
            .map(|_| SimEngine {
                m2s: STATE_DISABLE,
                s2m: STATE_DISABLE,
                stream_cfg: 0,
                stuck_stream_if: false,
                queues: (0..hal.dma_queue_count())
                    .map(|_| SimQueue::default())
                    .collect(),
            })
            .collect();

        let mut fw_regs = HashMap::new();
        for ch in 0..hal.dram_channel_count() {
            fw_regs.insert(hal.dram_size_reg(ch), config.dram_channel_mib);
        }
        fw_regs.insert(FW_REG_REVISION, config.revision);
        fw_regs.insert(FW_REG_SERIAL, config.serial);

        Arc::new(Self {
            memory: Mutex::new(SparseMemory::default()),
            host_phys: Mutex::new(Arena::new(HOST_PHYS_BASE, config.host_memory, SIM_PAGE)),
            coherent_fail: AtomicBool::new(false),
            regs: Mutex::new(SimRegs {
                engines,
                ..Default::default()
            }),
            firmware: Mutex::new(SimFirmware {
                regs: fw_regs,
                topology: config.topology,
                ..Default::default()
            }),
            user: Mutex::new(SimUser::default()),
            hal,
        })
    }

    #[must_use]
    pub fn hal(&self) -> &Arc<dyn ArchHal> {
        &self.hal
    }

    // -------------------------------------------------------------------------------------------
    // Test knobs
    // -------------------------------------------------------------------------------------------

    /// Makes direct coherent allocations fail, forcing callers onto reserved pools.
    pub fn set_coherent_failure(&self, fail: bool) {
        self.coherent_fail.store(fail, Ordering::SeqCst);
    }

    /// The next `doorbells` completion-side doorbells on the queue hang until the ring is
    /// reprogrammed.
    pub fn stall_queue(&self, engine: u32, queue: u32, doorbells: u32) {
        self.regs.lock().engines[engine as usize].queues[queue as usize].stall_doorbells =
            doorbells;
    }

    /// Emulates the stream interface reporting busy after the stream was disabled.
    pub fn set_stream_quirk(&self, engine: u32, stuck: bool) {
        self.regs.lock().engines[engine as usize].stuck_stream_if = stuck;
    }

    #[must_use]
    pub fn transfer_log(&self, engine: u32, queue: u32) -> Vec<SimTransfer> {
        self.regs.lock().engines[engine as usize].queues[queue as usize]
            .log
            .clone()
    }

    pub fn clear_transfer_log(&self, engine: u32, queue: u32) {
        self.regs.lock().engines[engine as usize].queues[queue as usize]
            .log
            .clear();
    }

    #[must_use]
    pub fn completion_head(&self, engine: u32, queue: u32) -> u64 {
        self.regs.lock().engines[engine as usize].queues[queue as usize].cmpl_head
    }

    /// `(m2s, s2m)` state codes currently latched by the engine.
    #[must_use]
    pub fn engine_state(&self, engine: u32) -> (u32, u32) {
        let regs = self.regs.lock();
        let e = &regs.engines[engine as usize];
        (e.m2s, e.s2m)
    }

    #[must_use]
    pub fn reset_history(&self) -> Vec<CoreMask> {
        self.firmware.lock().resets.clone()
    }

    /// Fails the next `fail` reset requests; successful resets report ready after
    /// `ready_after_polls` polls.
    pub fn set_reset_behavior(&self, fail: u32, ready_after_polls: u32) {
        let mut fw = self.firmware.lock();
        fw.fail_resets = fail;
        fw.ready_after_polls = ready_after_polls;
    }

    pub fn set_never_ready(&self, never: bool) {
        self.firmware.lock().never_ready = never;
    }

    #[must_use]
    pub fn metrics(&self) -> Vec<Vec<u8>> {
        self.firmware.lock().metrics.clone()
    }

    pub fn set_fast_pin_limit(&self, limit: Option<usize>) {
        self.user.lock().fast_pin_limit = limit;
    }

    /// `(fast pin calls, slow pin calls)`.
    #[must_use]
    pub fn pin_calls(&self) -> (usize, usize) {
        let user = self.user.lock();
        (user.fast_pins, user.slow_pins)
    }

    /// Frames currently pinned.
    #[must_use]
    pub fn pinned_pages(&self) -> usize {
        self.user.lock().pinned.values().map(|&n| n as usize).sum()
    }

    #[must_use]
    pub fn dirty_pages(&self) -> usize {
        self.user.lock().dirty.len()
    }

    // -------------------------------------------------------------------------------------------
    // User address space
    // -------------------------------------------------------------------------------------------

    /// Backs `[uaddr, uaddr + len)` of process `pid` with host frames.
    ///
    /// # Errors
    /// `InvalidArgument` for an unaligned address, `OutOfMemory` if the host range is exhausted.
    pub fn map_user_buffer(
        &self,
        pid: u32,
        uaddr: u64,
        len: u64,
        layout: SimUserLayout,
    ) -> DriverResult<()> {
        if uaddr % SIM_PAGE != 0 {
            return Err(DriverError::invalid("user buffer must be page aligned"));
        }
        let n_pages = align_up(len, SIM_PAGE) / SIM_PAGE;
        let span = match layout {
            SimUserLayout::Contiguous => n_pages,
            SimUserLayout::Scattered => n_pages * 2,
        };
        let block = self
            .host_phys
            .lock()
            .alloc(span * SIM_PAGE, SIM_PAGE)
            .ok_or(DriverError::OutOfMemory)?;
        self.memory.lock().discard(block, span * SIM_PAGE);

        let mut user = self.user.lock();
        for i in 0..n_pages {
            let frame = match layout {
                SimUserLayout::Contiguous => block + i * SIM_PAGE,
                // Reverse order with a gap: no two neighbours share a boundary.
                SimUserLayout::Scattered => block + (n_pages - 1 - i) * 2 * SIM_PAGE,
            };
            user.mappings
                .insert((pid, uaddr + i * SIM_PAGE), frame / SIM_PAGE);
        }
        Ok(())
    }

    fn translate_user(&self, pid: u32, uaddr: u64) -> DriverResult<u64> {
        let page = uaddr & !(SIM_PAGE - 1);
        let pfn = self
            .user
            .lock()
            .mappings
            .get(&(pid, page))
            .copied()
            .ok_or_else(|| DriverError::invalid(format!("unmapped user address {uaddr:#x}")))?;
        Ok(pfn * SIM_PAGE + (uaddr - page))
    }

    /// CPU write into a process' buffer.
    ///
    /// # Errors
    /// `InvalidArgument` if part of the range is unmapped.
    pub fn user_write(&self, pid: u32, uaddr: u64, data: &[u8]) -> DriverResult<()> {
        let mut done = 0usize;
        while done < data.len() {
            let addr = uaddr + done as u64;
            let n = ((SIM_PAGE - addr % SIM_PAGE) as usize).min(data.len() - done);
            let pa = self.translate_user(pid, addr)?;
            self.memory.lock().write(pa, &data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    /// CPU read from a process' buffer.
    ///
    /// # Errors
    /// `InvalidArgument` if part of the range is unmapped.
    pub fn user_read(&self, pid: u32, uaddr: u64, buf: &mut [u8]) -> DriverResult<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let addr = uaddr + done as u64;
            let n = ((SIM_PAGE - addr % SIM_PAGE) as usize).min(buf.len() - done);
            let pa = self.translate_user(pid, addr)?;
            self.memory.lock().read(pa, &mut buf[done..done + n]);
            done += n;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Register decoding
    // -------------------------------------------------------------------------------------------

    fn decode(&self, addr: u64) -> RegTarget {
        let eng_base = self.hal.engine_reg_base(0);
        let eng_end = eng_base + u64::from(self.hal.dma_engine_count()) * ENGINE_REG_STRIDE;
        if (eng_base..eng_end).contains(&addr) {
            let engine = ((addr - eng_base) / ENGINE_REG_STRIDE) as usize;
            let off = (addr - eng_base) % ENGINE_REG_STRIDE;
            if off >= QUEUE_BLOCK_OFFSET {
                let queue = ((off - QUEUE_BLOCK_OFFSET) / QUEUE_REG_STRIDE) as usize;
                if queue < self.hal.dma_queue_count() as usize {
                    return RegTarget::Queue {
                        engine,
                        queue,
                        off: (off - QUEUE_BLOCK_OFFSET) % QUEUE_REG_STRIDE,
                    };
                }
                return RegTarget::Other;
            }
            return RegTarget::Engine { engine, off };
        }

        let sem_base = self.hal.semaphore_block_base(0);
        let sem_end = sem_base + u64::from(self.hal.core_count()) * SEM_BLOCK_STRIDE;
        if (sem_base..sem_end).contains(&addr) {
            return RegTarget::Semaphore {
                core: ((addr - sem_base) / SEM_BLOCK_STRIDE) as u32,
                off: (addr - sem_base) % SEM_BLOCK_STRIDE,
            };
        }
        RegTarget::Other
    }

    fn status_word(state: u32, stuck_stream_if: bool) -> u32 {
        let stream = if stuck_stream_if { STATE_NORMAL } else { state };
        (state << STATUS_COMP_CTRL_SHIFT)
            | (stream << STATUS_STREAM_IF_SHIFT)
            | (state << STATUS_DATA_RD_SHIFT)
            | (state << STATUS_DESC_PREF_SHIFT)
    }

    fn strip(&self, addr: u64) -> u64 {
        addr & !self.hal.axi_port_bit()
    }

    /// Executes every descriptor pair both rings hold.
    fn process_queue(&self, engine: &mut SimEngine, queue: usize) {
        if engine.m2s != STATE_NORMAL || engine.s2m != STATE_NORMAL {
            return;
        }
        let q = &mut engine.queues[queue];
        if q.stalled || q.cfg & Q_CFG_ENABLE == 0 || q.tx_size == 0 || q.rx_size == 0 {
            return;
        }

        let mut memory = self.memory.lock();
        while q.tx_head < q.tx_tail && q.rx_head < q.rx_tail {
            let tx = Self::fetch_desc(&memory, self.strip(q.tx_base), q.tx_head, q.tx_size);
            let rx = Self::fetch_desc(&memory, self.strip(q.rx_base), q.rx_head, q.rx_size);
            if tx.ring_id() != ring_id_for(q.tx_head, q.tx_size)
                || rx.ring_id() != ring_id_for(q.rx_head, q.rx_size)
            {
                tracing::warn!(queue, "sim: stale descriptor, stopping");
                break;
            }

            let mut data = vec![0u8; tx.len() as usize];
            memory.read(self.strip(tx.buf_ptr), &mut data);
            memory.write(self.strip(rx.buf_ptr), &data);

            q.log.push(SimTransfer {
                src: self.strip(tx.buf_ptr),
                dst: self.strip(rx.buf_ptr),
                len: tx.len(),
                flags: tx.flags() | rx.flags(),
            });
            q.tx_head += 1;
            q.rx_head += 1;
        }
    }

    fn fetch_desc(memory: &SparseMemory, base: u64, index: u64, size: u32) -> UdmaDesc {
        let slot = index & (u64::from(size) - 1);
        let mut bytes = [0u8; 16];
        memory.read(base + slot * DESC_SIZE, &mut bytes);
        UdmaDesc::from_bytes(&bytes)
    }

    fn reset_cores(&self, cores: CoreMask) {
        let mut regs = self.regs.lock();
        for core in cores.cores(self.hal.core_count()) {
            for eng in self.hal.core_engines(core) {
                let engine = &mut regs.engines[eng as usize];
                engine.m2s = STATE_DISABLE;
                engine.s2m = STATE_DISABLE;
                engine.stream_cfg = 0;
                for q in &mut engine.queues {
                    q.cfg = 0;
                    q.stall_doorbells = 0;
                    q.reset_tx();
                    q.reset_rx();
                }
            }
            regs.semaphores.retain(|(c, _), _| *c != core);
            regs.events.retain(|(c, _), _| *c != core);
        }
    }
}

// ===============================================================================================
// Trait Implementations
// ===============================================================================================

impl RegisterAccess for SimDevice {
    fn read32(&self, addr: u64) -> u32 {
        let regs = self.regs.lock();
        match self.decode(addr) {
            RegTarget::Engine { engine, off } => {
                let e = &regs.engines[engine];
                match off {
                    ENG_M2S_STATUS => Self::status_word(e.m2s, e.stuck_stream_if),
                    ENG_S2M_STATUS => Self::status_word(e.s2m, false),
                    ENG_STREAM_CFG => e.stream_cfg,
                    _ => 0,
                }
            }
            RegTarget::Queue { engine, queue, off } => {
                let q = &regs.engines[engine].queues[queue];
                match off {
                    Q_TX_HEAD => q.tx_head as u32,
                    Q_RX_HEAD => q.rx_head as u32,
                    Q_TX_SIZE => q.tx_size,
                    Q_RX_SIZE => q.rx_size,
                    Q_CMPL_SIZE => q.cmpl_size,
                    Q_CFG => q.cfg,
                    _ => 0,
                }
            }
            RegTarget::Semaphore { core, off } => {
                if off >= EVENT_OFFSET {
                    let idx = ((off - EVENT_OFFSET) / 4) as u32;
                    regs.events.get(&(core, idx)).copied().unwrap_or(0)
                } else {
                    let idx = ((off % SEM_SET_OFFSET) / 4) as u32;
                    regs.semaphores.get(&(core, idx)).copied().unwrap_or(0)
                }
            }
            RegTarget::Other => regs.other.get(&addr).copied().unwrap_or(0),
        }
    }

    fn write32(&self, addr: u64, value: u32) {
        let mut regs = self.regs.lock();
        match self.decode(addr) {
            RegTarget::Engine { engine, off } => {
                let e = &mut regs.engines[engine];
                match off {
                    ENG_M2S_STATE_CHANGE => e.m2s = value,
                    ENG_S2M_STATE_CHANGE => e.s2m = value,
                    ENG_STREAM_CFG => e.stream_cfg = value,
                    _ => {}
                }
                if e.m2s == STATE_NORMAL && e.s2m == STATE_NORMAL {
                    for q in 0..e.queues.len() {
                        self.process_queue(e, q);
                    }
                }
            }
            RegTarget::Queue { engine, queue, off } => {
                let e = &mut regs.engines[engine];
                let q = &mut e.queues[queue];
                match off {
                    Q_TX_BASE_LO => {
                        q.tx_base = (q.tx_base & !0xFFFF_FFFF) | u64::from(value);
                        q.reset_tx();
                    }
                    Q_TX_BASE_HI => {
                        q.tx_base = (u64::from(value) << 32) | (q.tx_base & 0xFFFF_FFFF);
                    }
                    Q_TX_SIZE => q.tx_size = value,
                    Q_TX_TAIL_INC => q.tx_tail += u64::from(value),
                    Q_RX_BASE_LO => {
                        q.rx_base = (q.rx_base & !0xFFFF_FFFF) | u64::from(value);
                        q.reset_rx();
                    }
                    Q_RX_BASE_HI => {
                        q.rx_base = (u64::from(value) << 32) | (q.rx_base & 0xFFFF_FFFF);
                    }
                    Q_RX_SIZE => q.rx_size = value,
                    Q_RX_TAIL_INC => {
                        q.rx_tail += u64::from(value);
                        if q.stall_doorbells > 0 {
                            q.stall_doorbells -= 1;
                            q.stalled = true;
                        }
                    }
                    Q_CMPL_BASE_LO => {
                        q.cmpl_base = (q.cmpl_base & !0xFFFF_FFFF) | u64::from(value);
                        q.cmpl_head = 0;
                    }
                    Q_CMPL_BASE_HI => {
                        q.cmpl_base = (u64::from(value) << 32) | (q.cmpl_base & 0xFFFF_FFFF);
                    }
                    Q_CMPL_SIZE => q.cmpl_size = value,
                    Q_CMPL_HEAD_INC => q.cmpl_head += u64::from(value),
                    Q_CFG => q.cfg = value,
                    _ => {}
                }
                if matches!(off, Q_TX_TAIL_INC | Q_RX_TAIL_INC | Q_CFG) {
                    self.process_queue(e, queue);
                }
            }
            RegTarget::Semaphore { core, off } => {
                if off >= EVENT_OFFSET {
                    let idx = ((off - EVENT_OFFSET) / 4) as u32;
                    regs.events.insert((core, idx), value);
                    return;
                }
                let idx = ((off % SEM_SET_OFFSET) / 4) as u32;
                let slot = regs.semaphores.entry((core, idx)).or_insert(0);
                match off - off % SEM_SET_OFFSET {
                    SEM_SET_OFFSET => *slot = value,
                    SEM_INC_OFFSET => *slot = slot.wrapping_add(value),
                    SEM_DEC_OFFSET => *slot = slot.wrapping_sub(value),
                    // The read window is not writable.
                    _ => {}
                }
            }
            RegTarget::Other => {
                regs.other.insert(addr, value);
            }
        }
    }
}

impl DmaMemory for SimDevice {
    fn alloc_coherent(&self, size: u64) -> Option<CoherentBuffer> {
        if self.coherent_fail.load(Ordering::SeqCst) {
            return None;
        }
        let size = align_up(size, SIM_PAGE);
        let pa = self.host_phys.lock().alloc(size, SIM_PAGE)?;
        self.memory.lock().discard(pa, size);
        Some(CoherentBuffer {
            va: pa + HOST_VA_OFFSET,
            pa,
            size,
        })
    }

    fn free_coherent(&self, buffer: CoherentBuffer) {
        if self.host_phys.lock().free(buffer.pa).is_none() {
            tracing::error!(pa = buffer.pa, "sim: freeing untracked coherent buffer");
        }
    }

    fn virt_to_bus(&self, va: u64) -> u64 {
        va - HOST_VA_OFFSET
    }

    fn read(&self, pa: u64, buf: &mut [u8]) {
        self.memory.lock().read(self.strip(pa), buf);
    }

    fn write(&self, pa: u64, data: &[u8]) {
        self.memory.lock().write(self.strip(pa), data);
    }

    fn load_u32_acquire(&self, pa: u64) -> u32 {
        let mut b = [0u8; 4];
        self.memory.lock().read(self.strip(pa), &mut b);
        u32::from_le_bytes(b)
    }

    fn store_u32_release(&self, pa: u64, value: u32) {
        self.memory.lock().write(self.strip(pa), &value.to_le_bytes());
    }

    fn page_size(&self) -> u64 {
        SIM_PAGE
    }
}

impl FirmwareIo for SimDevice {
    fn read_registers(&self, addrs: &[u64]) -> DriverResult<Vec<u32>> {
        let fw = self.firmware.lock();
        addrs
            .iter()
            .map(|a| {
                fw.regs.get(a).copied().ok_or_else(|| {
                    DriverError::HardwareFault(format!("firmware register {a:#x} unreadable"))
                })
            })
            .collect()
    }

    fn post_metric(&self, blob: &[u8]) -> DriverResult<()> {
        self.firmware.lock().metrics.push(blob.to_vec());
        Ok(())
    }

    fn initiate_reset(&self, cores: CoreMask) -> DriverResult<()> {
        {
            let mut fw = self.firmware.lock();
            if fw.fail_resets > 0 {
                fw.fail_resets -= 1;
                return Err(DriverError::HardwareFault("firmware rejected reset".into()));
            }
            fw.resets.push(cores);
            fw.reset_initiated = true;
            fw.polls_remaining = fw.ready_after_polls;
        }
        self.reset_cores(cores);
        Ok(())
    }

    fn is_reset_initiated(&self) -> bool {
        self.firmware.lock().reset_initiated
    }

    fn is_device_ready(&self) -> DriverResult<bool> {
        let mut fw = self.firmware.lock();
        if fw.never_ready {
            return Ok(false);
        }
        if fw.polls_remaining > 0 {
            fw.polls_remaining -= 1;
            return Ok(false);
        }
        fw.reset_initiated = false;
        Ok(true)
    }

    fn topology(&self) -> DriverResult<Vec<u32>> {
        Ok(self.firmware.lock().topology.clone())
    }
}

impl UserPages for SimDevice {
    fn pin_fast(&self, pid: u32, uaddr: u64, n_pages: usize, _writable: bool) -> Vec<u64> {
        let mut user = self.user.lock();
        user.fast_pins += 1;
        let limit = user.fast_pin_limit.unwrap_or(n_pages).min(n_pages);
        let mut pfns = Vec::with_capacity(limit);
        for i in 0..limit {
            match user.mappings.get(&(pid, uaddr + i as u64 * SIM_PAGE)).copied() {
                Some(pfn) => pfns.push(pfn),
                None => break,
            }
        }
        for pfn in &pfns {
            *user.pinned.entry(*pfn).or_insert(0) += 1;
        }
        pfns
    }

    fn pin_slow(
        &self,
        pid: u32,
        uaddr: u64,
        n_pages: usize,
        _writable: bool,
    ) -> DriverResult<Vec<u64>> {
        let mut user = self.user.lock();
        user.slow_pins += 1;
        let pfns = (0..n_pages)
            .map(|i| {
                user.mappings
                    .get(&(pid, uaddr + i as u64 * SIM_PAGE))
                    .copied()
                    .ok_or_else(|| DriverError::invalid(format!("cannot pin {uaddr:#x}")))
            })
            .collect::<DriverResult<Vec<_>>>()?;
        for pfn in &pfns {
            *user.pinned.entry(*pfn).or_insert(0) += 1;
        }
        Ok(pfns)
    }

    fn unpin(&self, pfns: &[u64], dirty: bool) {
        let mut user = self.user.lock();
        for pfn in pfns {
            match user.pinned.get_mut(pfn) {
                Some(n) if *n > 1 => *n -= 1,
                Some(_) => {
                    user.pinned.remove(pfn);
                }
                None => tracing::error!(pfn, "sim: unpinning a frame that is not pinned"),
            }
            if dirty {
                user.dirty.push(*pfn);
            }
        }
    }

    fn page_size(&self) -> u64 {
        SIM_PAGE
    }
}
