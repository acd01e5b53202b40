//! The rendezvous collaborator.
//!
//! Only used while a context is being set up (and during collective team
//! creation): a barrier, a fixed-size allgather and a broadcast. The one piece
//! that stays live afterwards is the global-exit flag, which every spin loop in
//! the sync engine checks.

use std::time::Duration;

use enum_dispatch::enum_dispatch;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::BootstrapError;

pub mod shmem;
pub mod thread;

pub use shmem::ShmemBootstrap;
pub use thread::ThreadBootstrap;

pub type BootstrapResult<T> = Result<T, BootstrapError>;

#[enum_dispatch]
pub trait BootstrapOps {
    fn my_pe(&self) -> usize;
    fn n_pes(&self) -> usize;
    fn barrier(&self) -> BootstrapResult<()>;
    /// every PE contributes `data` (identical length on every PE), the result
    /// holds the contributions ordered by PE
    fn allgather(&self, data: &[u8]) -> BootstrapResult<Vec<u8>>;
    /// the contribution of `root`, delivered to every PE
    fn broadcast(&self, data: &[u8], root: usize) -> BootstrapResult<Vec<u8>>;
    /// best effort abort: unblocks every peer waiting in a collective or a spin loop
    fn global_exit(&self, status: i32);
    fn exit_status(&self) -> Option<i32>;
    /// how long a collective waits before it reports a potential deadlock
    fn set_deadlock_timeout(&mut self, timeout: Duration);
}

#[enum_dispatch(BootstrapOps)]
#[derive(Debug)]
pub enum Bootstrap {
    ThreadBootstrap,
    ShmemBootstrap,
}

/// Allgather for values whose encoding differs in length across PEs.
///
/// Lengths are exchanged first so the payload exchange stays fixed size.
pub(crate) fn allgather_obj<B: BootstrapOps, T: Serialize + DeserializeOwned>(
    bootstrap: &B,
    val: &T,
) -> BootstrapResult<Vec<T>> {
    let bytes = bincode::serialize(val).map_err(|e| BootstrapError::Codec(e.to_string()))?;
    let lens = bootstrap.allgather(&(bytes.len() as u64).to_le_bytes())?;
    let lens: Vec<usize> = lens
        .chunks_exact(8)
        .map(|c| {
            let mut word = [0u8; 8];
            word.copy_from_slice(c);
            u64::from_le_bytes(word) as usize
        })
        .collect();
    let max_len = lens.iter().copied().max().unwrap_or(0);
    let mut padded = bytes;
    padded.resize(max_len, 0);
    let all = bootstrap.allgather(&padded)?;
    if max_len == 0 {
        return Err(BootstrapError::Codec("empty contribution".to_owned()));
    }
    all.chunks_exact(max_len)
        .zip(lens.iter())
        .map(|(chunk, len)| {
            bincode::deserialize(&chunk[..*len]).map_err(|e| BootstrapError::Codec(e.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allgather_obj_variable_lengths() {
        let group = ThreadBootstrap::group(3);
        let results: Vec<Vec<String>> = std::thread::scope(|s| {
            let handles: Vec<_> = group
                .into_iter()
                .map(|b| {
                    s.spawn(move || {
                        let name = "x".repeat(b.my_pe() * 5 + 1);
                        allgather_obj(&b, &name).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for r in results {
            assert_eq!(r, vec!["x".to_owned(), "x".repeat(6), "x".repeat(11)]);
        }
    }
}
