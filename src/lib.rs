//! pgas-shmem is a partitioned global address space communication layer in the
//! OpenSHMEM style for accelerator clusters.
//!
//! Every processing element (PE) owns a slice of a symmetric heap: an
//! allocation made collectively lands at the same offset on every PE, so a
//! local [SymmPtr] names the matching object on any peer. Remote memory is
//! reached through one of three engines, chosen per peer by the topology:
//! the direct link (load/store into peer memory mapped into our address
//! space), the bulk DMA queues, and the network (RDMA) engine for peers on
//! other hosts.
//!
//! On top of that sit teams (strided subsets of the PEs), barriers run by
//! every compute core of a device, and the signal and wait families.
//!
//! EXAMPLES
//! --------
//!
//! # A ring exchange
//! ```no_run
//! use pgas_shmem::{ShmemContextBuilder, ShmemDriver, ShmemBootstrap};
//!
//! fn main() -> Result<(), pgas_shmem::ShmemError> {
//!     let (my_pe, n_pes) = (0, 1); // usually from the launcher
//!     let bootstrap = ShmemBootstrap::new(my_pe, n_pes, 7)?;
//!     let driver = ShmemDriver::new(7, my_pe);
//!     let ctx = ShmemContextBuilder::new(my_pe, n_pes)
//!         .with_heap_size(64 * 1024 * 1024)
//!         .build(bootstrap, driver)?;
//!     let buf = ctx.malloc::<i32>(1)?;
//!     ctx.put(buf, &[my_pe as i32], (my_pe + 1) % n_pes)?;
//!     ctx.barrier_all()?;
//!     let mut got = [0i32];
//!     ctx.read_local(buf, &mut got)?;
//!     ctx.free(buf)?;
//!     Ok(())
//! }
//! ```

#[macro_use]
extern crate lazy_static;

pub(crate) mod addr;
pub(crate) mod alloc;
pub mod bootstrap;
pub(crate) mod config;
pub(crate) mod context;
pub mod driver;
pub(crate) mod error;
pub(crate) mod heap;
pub(crate) mod state;
pub mod stream;
pub(crate) mod sync;
pub(crate) mod team;
pub(crate) mod topology;
pub(crate) mod transport;
pub(crate) mod types;

pub use crate::addr::{GlobalAddr, MemKind, StrideDesc, SymmPtr};
pub use crate::bootstrap::{Bootstrap, BootstrapOps, ShmemBootstrap, ThreadBootstrap};
pub use crate::config::{config, Backend, BarrierAlgorithm, Config};
pub use crate::context::{CoreCtx, InitStatus, ShmemContext, ShmemContextBuilder, NAME, VERSION};
pub use crate::driver::{Driver, MemDriver, ShmemDriver, SimDriver};
pub use crate::error::{BootstrapError, DriverError, ShmemError, ShmemResult, SUCCESS};
pub use crate::heap::{HEAP_ALIGN, MAX_LOCAL_SIZE, PAGE_SIZE};
pub use crate::state::MteConfig;
pub use crate::stream::{HostStream, Stream, StreamWork};
pub use crate::sync::barrier::MAX_CORES;
pub use crate::sync::{CmpOp, SpinPolicy};
pub use crate::team::{Team, TeamConfig, MAX_PES, MAX_TEAMS};
pub use crate::transport::SignalOp;
pub use crate::types::{AtomicAdd, AtomicWord, ShmemType};
