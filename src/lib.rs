//! Memory and DMA core of an accelerator driver: device memory pools, host-to-device copy
//! queues, user DMA queues and coordinated core resets, driven through a hardware abstraction
//! layer so every generation and the simulator share one code path.

pub mod config;
pub mod datastore;
pub mod device;
pub mod dma;
pub mod error;
pub mod hal;
pub mod mem;
pub mod reset;
pub mod utils;

pub use config::DriverConfig;
pub use device::{Device, DeviceInfo, DeviceResources, QueueSpec};
pub use error::{DriverError, DriverResult};
pub use reset::{DeviceState, ResetId, ResetState};
pub use utils::CoreMask;
