//! UDMA descriptor format and ring bookkeeping.

use crate::hal::DmaMemory;

// ===============================================================================================
// Constants
// ===============================================================================================

pub const DESC_SIZE: u64 = 16;

/// Hardware limit on the bytes moved by a single descriptor.
pub const MAX_DESC_SIZE: u64 = 64 * 1024;

/// Descriptors the prefetcher may hold per cache line; rings keep this much slack.
pub const MAX_DESCS_PER_CACHE_LINE: u32 = 4;

pub const MIN_RING_DESCS: u32 = 64;
/// Largest descriptor count a ring may be asked for.
pub const MAX_RING_DESCS: u32 = 1 << 16;

pub const DESC_LEN_MASK: u32 = 0x1_FFFF;
pub const DESC_RING_ID_SHIFT: u32 = 24;
pub const DESC_RING_ID_MASK: u32 = 0x3;
pub const DESC_FIRST: u32 = 1 << 26;
pub const DESC_LAST: u32 = 1 << 27;
/// Wait for every earlier descriptor of the queue to finish before this one starts.
pub const DESC_BARRIER: u32 = 1 << 28;
/// Marks the descriptor that writes a transfer's completion marker.
pub const DESC_COMPLETION: u32 = 1 << 29;

const FLAGS_MASK: u32 = DESC_FIRST | DESC_LAST | DESC_BARRIER | DESC_COMPLETION;

/// Ring id used for the first pass over a freshly initialized ring.
pub const INITIAL_RING_ID: u32 = 1;

/// Ring id the descriptor at absolute position `count` carries.
#[must_use]
pub const fn ring_id_for(count: u64, ring_size: u32) -> u32 {
    ((INITIAL_RING_ID as u64 + count / ring_size as u64) & DESC_RING_ID_MASK as u64) as u32
}

/// Rounds a requested descriptor count up to a legal ring size.
///
/// Adds cache-line slack so producer and consumer never alias while descriptors are in flight.
/// `None` for counts above [`MAX_RING_DESCS`].
#[must_use]
pub const fn ring_size_for(count: u32) -> Option<u32> {
    if count > MAX_RING_DESCS {
        return None;
    }
    let count = if count < MIN_RING_DESCS {
        MIN_RING_DESCS
    } else {
        count
    };
    (count + MAX_DESCS_PER_CACHE_LINE).checked_next_power_of_two()
}

// ===============================================================================================
// Descriptor
// ===============================================================================================

/// One submission or completion descriptor, exactly as laid out in ring memory.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct UdmaDesc {
    pub len_ctrl: u32,
    pub meta_ctrl: u32,
    pub buf_ptr: u64,
}

const _: () = assert!(std::mem::size_of::<UdmaDesc>() == DESC_SIZE as usize);

impl UdmaDesc {
    #[must_use]
    pub const fn new(buf_ptr: u64, len: u32, flags: u32) -> Self {
        Self {
            len_ctrl: (len & DESC_LEN_MASK) | (flags & FLAGS_MASK),
            meta_ctrl: 0,
            buf_ptr,
        }
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.len_ctrl & DESC_LEN_MASK
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub const fn flags(&self) -> u32 {
        self.len_ctrl & FLAGS_MASK
    }

    #[must_use]
    pub const fn ring_id(&self) -> u32 {
        (self.len_ctrl >> DESC_RING_ID_SHIFT) & DESC_RING_ID_MASK
    }

    #[must_use]
    pub const fn with_ring_id(mut self, ring_id: u32) -> Self {
        self.len_ctrl &= !(DESC_RING_ID_MASK << DESC_RING_ID_SHIFT);
        self.len_ctrl |= (ring_id & DESC_RING_ID_MASK) << DESC_RING_ID_SHIFT;
        self
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.len_ctrl.to_le_bytes());
        out[4..8].copy_from_slice(&self.meta_ctrl.to_le_bytes());
        out[8..16].copy_from_slice(&self.buf_ptr.to_le_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; 16]) -> Self {
        let word = |r: std::ops::Range<usize>| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&bytes[r]);
            u32::from_le_bytes(b)
        };
        let mut ptr = [0u8; 8];
        ptr.copy_from_slice(&bytes[8..16]);
        Self {
            len_ctrl: word(0..4),
            meta_ctrl: word(4..8),
            buf_ptr: u64::from_le_bytes(ptr),
        }
    }
}

/// A memory-to-memory transfer: the submission side reads `tx`, the completion side writes `rx`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DescPair {
    pub tx: UdmaDesc,
    pub rx: UdmaDesc,
}

impl DescPair {
    #[must_use]
    pub const fn copy(src: u64, dst: u64, len: u32, flags: u32) -> Self {
        Self {
            tx: UdmaDesc::new(src, len, flags),
            rx: UdmaDesc::new(dst, len, flags),
        }
    }

    #[must_use]
    pub const fn len(&self) -> u32 {
        self.tx.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }
}

// ===============================================================================================
// Ring
// ===============================================================================================

/// Driver-side view of one descriptor ring.
#[derive(Debug, Clone)]
pub struct UdmaRing {
    /// Address the CPU writes descriptors through.
    pa: u64,
    /// Address programmed into the queue registers.
    bus_addr: u64,
    size: u32,
    /// Total descriptors pushed since the ring was (re)initialized.
    submitted: u64,
}

impl UdmaRing {
    /// # Panics
    /// Panics if `size` is not a power of two.
    #[must_use]
    pub fn new(pa: u64, bus_addr: u64, size: u32) -> Self {
        assert!(size.is_power_of_two(), "ring size {size} is not a power of two");
        Self {
            pa,
            bus_addr,
            size,
            submitted: 0,
        }
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.size
    }

    #[must_use]
    pub const fn bus_addr(&self) -> u64 {
        self.bus_addr
    }

    #[must_use]
    pub const fn pa(&self) -> u64 {
        self.pa
    }

    #[must_use]
    pub const fn submitted(&self) -> u64 {
        self.submitted
    }

    #[must_use]
    pub const fn producer_index(&self) -> u32 {
        (self.submitted & (self.size as u64 - 1)) as u32
    }

    #[must_use]
    pub const fn ring_id(&self) -> u32 {
        ring_id_for(self.submitted, self.size)
    }

    /// Free slots given how many descriptors hardware has consumed, keeping cache-line slack.
    #[must_use]
    pub const fn free_slots(&self, consumed: u64) -> u32 {
        let in_flight = self.submitted.saturating_sub(consumed);
        let usable = (self.size - MAX_DESCS_PER_CACHE_LINE) as u64;
        usable.saturating_sub(in_flight) as u32
    }

    /// Writes `desc` at the producer index, stamping the current ring id.
    pub fn push(&mut self, mem: &dyn DmaMemory, desc: UdmaDesc) {
        let desc = desc.with_ring_id(self.ring_id());
        let slot = self.pa + u64::from(self.producer_index()) * DESC_SIZE;
        mem.write(slot, &desc.to_bytes());
        self.submitted += 1;
    }

    /// Writes `descs` verbatim starting at `index`, without moving the producer.
    pub fn write_at(&self, mem: &dyn DmaMemory, index: u32, descs: &[UdmaDesc]) {
        for (i, desc) in descs.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            let slot = (index + i as u32) & (self.size - 1);
            mem.write(self.pa + u64::from(slot) * DESC_SIZE, &desc.to_bytes());
        }
    }

    /// Accounts for `count` descriptors written in place by someone else.
    pub fn advance(&mut self, count: u32) {
        self.submitted += u64::from(count);
    }

    pub fn reset(&mut self) {
        self.submitted = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_sizes_are_powers_of_two_with_slack() {
        assert_eq!(ring_size_for(1), Some(128));
        assert_eq!(ring_size_for(64), Some(128));
        assert_eq!(ring_size_for(100), Some(128));
        assert_eq!(ring_size_for(124), Some(128));
        assert_eq!(ring_size_for(125), Some(256));
        assert_eq!(ring_size_for(4096), Some(8192));
        assert_eq!(ring_size_for(MAX_RING_DESCS), Some(2 * MAX_RING_DESCS));
        assert_eq!(ring_size_for(MAX_RING_DESCS + 1), None);
        assert_eq!(ring_size_for(u32::MAX), None);
    }

    #[test]
    fn descriptor_layout() {
        let desc = UdmaDesc::new(0xdead_beef_0000, 0x1_0000, DESC_BARRIER | DESC_LAST)
            .with_ring_id(2);
        assert_eq!(desc.len(), 0x1_0000);
        assert_eq!(desc.ring_id(), 2);
        assert_eq!(desc.flags(), DESC_BARRIER | DESC_LAST);
        assert_eq!(UdmaDesc::from_bytes(&desc.to_bytes()), desc);
    }

    #[test]
    fn ring_id_advances_on_wrap() {
        assert_eq!(ring_id_for(0, 128), 1);
        assert_eq!(ring_id_for(127, 128), 1);
        assert_eq!(ring_id_for(128, 128), 2);
        assert_eq!(ring_id_for(3 * 128, 128), 0);
    }
}
