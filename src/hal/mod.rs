pub mod arch;
pub mod firmware;
pub mod platform;
pub mod regs;
pub mod sim;

pub use arch::{ArchHal, ArchV2, ArchV3, ChipArch};
pub use firmware::{FirmwareIo, MemoryLayout};
pub use platform::{Clock, CoherentBuffer, DmaMemory, MonotonicClock, RegisterAccess, UserPages};

use crate::error::{DriverError, DriverResult};
use std::sync::{Arc, OnceLock};

// ===============================================================================================
// Global HAL Selection
// ===============================================================================================

static ARCH_HAL: OnceLock<Arc<dyn ArchHal>> = OnceLock::new();

/// Builds the HAL for `arch` without touching the global selection.
#[must_use]
pub fn for_arch(arch: ChipArch) -> Arc<dyn ArchHal> {
    match arch {
        ChipArch::V2 => Arc::new(ArchV2),
        ChipArch::V3 => Arc::new(ArchV3),
    }
}

/// Selects the process-wide HAL on first call and returns it on every later call.
///
/// A driver instance only ever binds devices of a single generation.
///
/// # Errors
/// `InvalidArgument` if a different generation was selected earlier.
pub fn select(arch: ChipArch) -> DriverResult<Arc<dyn ArchHal>> {
    let hal = ARCH_HAL.get_or_init(|| {
        tracing::info!(?arch, "selected hardware abstraction layer");
        for_arch(arch)
    });

    if hal.arch() != arch {
        return Err(DriverError::invalid(format!(
            "HAL already bound to {:?}, cannot switch to {arch:?}",
            hal.arch()
        )));
    }
    Ok(hal.clone())
}

/// The HAL chosen by [`select`], if any.
pub fn current() -> Option<Arc<dyn ArchHal>> {
    ARCH_HAL.get().cloned()
}
