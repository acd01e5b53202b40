//! Synchronisation: the busy-wait policy shared by every wait, the
//! point-to-point wait/test families and the team barriers.

pub(crate) mod barrier;
pub(crate) mod signal;
pub(crate) mod spin;

pub use signal::CmpOp;
pub use spin::SpinPolicy;
