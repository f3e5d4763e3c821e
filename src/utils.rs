#![allow(clippy::cast_sign_loss)]

use std::sync::OnceLock;

/// Host page size, queried once from the OS.
#[must_use]
pub fn host_page_size() -> u64 {
    static PAGE_SIZE: OnceLock<u64> = OnceLock::new();

    *PAGE_SIZE.get_or_init(|| {
        // SAFETY: sysconf has no memory-safety preconditions.
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret > 0 { ret as u64 } else { 4096 }
    })
}

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

/// Bitmap of accelerator cores affected by an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CoreMask(pub u64);

impl CoreMask {
    /// Sentinel used by requests that target every core of the device.
    pub const ALL: Self = Self(u64::MAX);

    #[must_use]
    pub const fn single(core: u32) -> Self {
        if core < 64 { Self(1 << core) } else { Self(0) }
    }

    #[must_use]
    pub const fn is_all(self) -> bool {
        self.0 == u64::MAX
    }

    #[must_use]
    pub const fn contains(self, core: u32) -> bool {
        core < 64 && self.0 & (1 << core) != 0
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Iterates over the cores in the mask, bounded by `core_count`.
    pub fn cores(self, core_count: u32) -> impl Iterator<Item = u32> {
        (0..core_count.min(64)).filter(move |&c| self.contains(c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert!(is_aligned(0x20_0000, 0x1_0000));
        assert!(!is_aligned(0x20_1000, 0x1_0000));
    }

    #[test]
    fn core_mask_iteration() {
        let mask = CoreMask::single(0).union(CoreMask::single(3));
        assert_eq!(mask.cores(8).collect::<Vec<_>>(), vec![0, 3]);
        assert_eq!(CoreMask::ALL.cores(2).count(), 2);
        assert!(CoreMask::ALL.is_all());
    }
}
