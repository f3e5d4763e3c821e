use crate::error::{DriverError, DriverResult};
use crate::hal::ArchHal;
use crate::hal::regs::{FW_REG_REVISION, FW_REG_SERIAL};
use crate::utils::CoreMask;

/// Request/response channel to the device firmware.
///
/// Every call is synchronous and bounded by the firmware's own timeout.
pub trait FirmwareIo: Send + Sync {
    fn read_registers(&self, addrs: &[u64]) -> DriverResult<Vec<u32>>;

    fn post_metric(&self, blob: &[u8]) -> DriverResult<()>;

    /// Starts a reset of the given cores (`CoreMask::ALL` resets the whole device).
    fn initiate_reset(&self, cores: CoreMask) -> DriverResult<()>;

    fn is_reset_initiated(&self) -> bool;

    fn is_device_ready(&self) -> DriverResult<bool>;

    /// Ids of the devices this one is connected to.
    fn topology(&self) -> DriverResult<Vec<u32>>;
}

/// Size and placement of one DRAM channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DramChannel {
    pub base: u64,
    pub size: u64,
}

/// Memory layout discovered from the firmware at probe time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryLayout {
    pub channels: Vec<DramChannel>,
    pub regions_per_channel: u32,
}

impl MemoryLayout {
    /// Base and size of a pool region.
    ///
    /// # Errors
    /// `InvalidArgument` if the channel or region is outside the discovered topology.
    pub fn region(&self, channel: u32, region: u32) -> DriverResult<(u64, u64)> {
        let ch = self
            .channels
            .get(channel as usize)
            .ok_or_else(|| DriverError::invalid(format!("invalid DRAM channel {channel}")))?;
        if region >= self.regions_per_channel {
            return Err(DriverError::invalid(format!("invalid DRAM region {region}")));
        }
        let region_size = ch.size / u64::from(self.regions_per_channel);
        Ok((ch.base + u64::from(region) * region_size, region_size))
    }
}

/// Reads the DRAM channel sizes through the firmware and builds the pool layout.
///
/// # Errors
/// `HardwareFault` if the firmware request fails or reports an empty channel.
pub fn discover_memory_layout(
    fw: &dyn FirmwareIo,
    hal: &dyn ArchHal,
) -> DriverResult<MemoryLayout> {
    let addrs: Vec<u64> = (0..hal.dram_channel_count())
        .map(|ch| hal.dram_size_reg(ch))
        .collect();
    let sizes_mib = fw.read_registers(&addrs)?;

    let mut channels = Vec::with_capacity(sizes_mib.len());
    for (ch, size_mib) in (0u32..).zip(sizes_mib) {
        if size_mib == 0 {
            return Err(DriverError::HardwareFault(format!(
                "firmware reported empty DRAM channel {ch}"
            )));
        }
        channels.push(DramChannel {
            base: hal.dram_channel_base(ch),
            size: u64::from(size_mib) * 1024 * 1024,
        });
    }

    Ok(MemoryLayout {
        channels,
        regions_per_channel: hal.dram_region_count(),
    })
}

/// Reads `(revision, serial)` from the firmware.
///
/// # Errors
/// Propagates firmware failures.
pub fn read_identity(fw: &dyn FirmwareIo) -> DriverResult<(u32, u32)> {
    let values = fw.read_registers(&[FW_REG_REVISION, FW_REG_SERIAL])?;
    match values.as_slice() {
        [revision, serial] => Ok((*revision, *serial)),
        _ => Err(DriverError::HardwareFault(
            "short firmware register read".into(),
        )),
    }
}
