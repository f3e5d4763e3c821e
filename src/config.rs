use serde::Deserialize;

/// One reserved host pool: `count` coherent blocks of `page_size` bytes each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct HostPoolConfig {
    pub page_size: u64,
    pub count: u32,
}

/// Driver tunables. Loaded once per device binding.
///
/// Every field has a default, so a partial document deserializes into a complete config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Bytes carved from the start of every device region for the small arena. `0` disables it.
    pub small_pool_size: u64,
    /// Device allocations strictly below this size go to the small arena.
    pub small_alloc_threshold: u64,
    /// Reserved host memory, grouped by page-size class.
    pub host_pools: Vec<HostPoolConfig>,
    /// Requested descriptor count for every H2T ring (rounded up when the ring is built).
    pub h2t_desc_count: u32,
    /// Completion polling deadline for H2T transfers.
    pub dma_timeout_us: u64,
    pub dma_poll_initial_delay_us: u64,
    pub dma_poll_interval_us: u64,
    /// How long the reset worker waits for the firmware to report the device ready.
    pub reset_timeout_ms: u64,
    pub reset_poll_interval_ms: u64,
    /// Debug mode: skip the hardware reset but still rebuild DMA state.
    pub no_reset: bool,
    /// Handle table geometry (L1 slots x L2 cells).
    pub handle_l1_size: u32,
    pub handle_l2_size: u32,
    /// Size of each per-process datastore region.
    pub datastore_size: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            small_pool_size: 32 * 1024 * 1024,
            small_alloc_threshold: 1024 * 1024,
            host_pools: vec![
                HostPoolConfig {
                    page_size: 64 * 1024,
                    count: 16,
                },
                HostPoolConfig {
                    page_size: 2 * 1024 * 1024,
                    count: 4,
                },
            ],
            h2t_desc_count: 4096,
            dma_timeout_us: 2_000_000,
            dma_poll_initial_delay_us: 4,
            dma_poll_interval_us: 2,
            reset_timeout_ms: 15_000,
            reset_poll_interval_ms: 10,
            no_reset: false,
            handle_l1_size: 256,
            handle_l2_size: 4096,
            datastore_size: 64 * 1024,
        }
    }
}

impl DriverConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn with_small_pool(mut self, size: u64, threshold: u64) -> Self {
        self.small_pool_size = size;
        self.small_alloc_threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_host_pools(mut self, pools: Vec<HostPoolConfig>) -> Self {
        self.host_pools = pools;
        self
    }

    #[must_use]
    pub const fn with_h2t_desc_count(mut self, count: u32) -> Self {
        self.h2t_desc_count = count;
        self
    }

    #[must_use]
    pub const fn with_dma_timeout_us(mut self, timeout: u64) -> Self {
        self.dma_timeout_us = timeout;
        self
    }

    #[must_use]
    pub const fn with_reset_timeout_ms(mut self, timeout: u64) -> Self {
        self.reset_timeout_ms = timeout;
        self
    }

    #[must_use]
    pub const fn no_reset(mut self) -> Self {
        self.no_reset = true;
        self
    }

    #[must_use]
    pub const fn with_handle_geometry(mut self, l1: u32, l2: u32) -> Self {
        self.handle_l1_size = l1;
        self.handle_l2_size = l2;
        self
    }
}
