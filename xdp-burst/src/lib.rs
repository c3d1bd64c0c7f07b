// Public modules and re-exports
pub mod addr;
pub mod addr_pool;
pub mod config;
pub mod create;
pub mod mempool;
pub mod mmap;
pub mod port;
pub mod queue;
pub mod registry;
pub mod ring;
pub mod socket;
pub mod stats;
pub mod umem;
pub mod wakeup;

pub use addr::UmemAddress;
pub use config::{BufferMode, BusyPoll, XskConfig};
pub use create::{BindFlags, Capabilities, QueueFactory, RingSizes, XdpQueueFactory, XskRings};
pub use mempool::{Mbuf, Mempool, PoolId};
pub use port::{PortInfo, XskPort};
pub use queue::{QueueSetup, XskQueue};
pub use registry::{QueueKey, UmemRegistry};
pub use ring::{Ring, RingError, XdpDesc};
pub use socket::{SocketOption, XdpStatistics, XskFd, XskSocket};
pub use stats::QueueStats;
pub use umem::UmemRegion;
pub use wakeup::WakeupMode;

// Engine internals, hidden from documentation
#[doc(hidden)]
pub mod copy;
#[doc(hidden)]
pub mod engine;
#[doc(hidden)]
pub mod kick;
#[doc(hidden)]
pub mod zero_copy;

#[cfg(test)]
mod tests;
