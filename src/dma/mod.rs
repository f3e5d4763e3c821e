pub mod completion;
pub mod copy;
pub mod engine;
pub mod h2t;
pub mod udma;
pub mod zerocopy;

pub use completion::{PollConfig, ResetWindow};
pub use copy::{AsyncHandle, CopyMode, DmaCopy};
pub use engine::{AxiPort, DmaEngines, EngineGuard, EngineState, QueueInit, RingKind};
pub use h2t::{DmaContext, H2tQueue};
pub use udma::{DescPair, MAX_DESC_SIZE, UdmaDesc};
pub use zerocopy::{Direction, memcpy_zero_copy};
