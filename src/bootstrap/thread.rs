use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::bootstrap::{BootstrapOps, BootstrapResult};
use crate::config::config;
use crate::error::BootstrapError;

#[derive(Default)]
struct Round {
    generation: u64,
    arrived: usize,
    slots: Vec<Option<Vec<u8>>>,
    last: Option<Arc<Vec<Vec<u8>>>>,
}

struct ThreadGroup {
    num_pes: usize,
    round: Mutex<Round>,
    cvar: Condvar,
    exit_set: AtomicBool,
    exit_status: AtomicI32,
}

impl ThreadGroup {
    fn exit(&self) -> Option<i32> {
        if self.exit_set.load(Ordering::Acquire) {
            Some(self.exit_status.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// generation barrier that also gathers one contribution per PE
    fn exchange(&self, my_pe: usize, data: Vec<u8>, timeout: Duration) -> BootstrapResult<Arc<Vec<Vec<u8>>>> {
        let mut round = self.round.lock();
        if let Some(status) = self.exit() {
            return Err(BootstrapError::GlobalExit(status));
        }
        let my_gen = round.generation;
        round.slots[my_pe] = Some(data);
        round.arrived += 1;
        if round.arrived == self.num_pes {
            let slots: Vec<Vec<u8>> = round
                .slots
                .iter_mut()
                .map(|s| s.take().unwrap_or_default())
                .collect();
            let slots = Arc::new(slots);
            round.last = Some(slots.clone());
            round.arrived = 0;
            round.generation += 1;
            self.cvar.notify_all();
            return Ok(slots);
        }
        let mut timer = Instant::now();
        while round.generation == my_gen {
            if let Some(status) = self.exit() {
                return Err(BootstrapError::GlobalExit(status));
            }
            self.cvar.wait_for(&mut round, Duration::from_millis(10));
            if timer.elapsed() > timeout {
                warn!(
                    "potential deadlock detected in bootstrap collective on pe {}, {} of {} pes arrived",
                    my_pe, round.arrived, self.num_pes
                );
                timer = Instant::now();
            }
        }
        round.last.clone().ok_or(BootstrapError::Closed)
    }
}

/// Rendezvous for PEs that are threads of one process
#[derive(Clone)]
pub struct ThreadBootstrap {
    my_pe: usize,
    group: Arc<ThreadGroup>,
    deadlock_timeout: Duration,
}

impl std::fmt::Debug for ThreadBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadBootstrap")
            .field("my_pe", &self.my_pe)
            .field("num_pes", &self.group.num_pes)
            .finish()
    }
}

impl ThreadBootstrap {
    /// one endpoint per PE, hand endpoint `i` to the thread running PE `i`
    pub fn group(num_pes: usize) -> Vec<ThreadBootstrap> {
        let group = Arc::new(ThreadGroup {
            num_pes,
            round: Mutex::new(Round {
                slots: vec![None; num_pes],
                ..Default::default()
            }),
            cvar: Condvar::new(),
            exit_set: AtomicBool::new(false),
            exit_status: AtomicI32::new(0),
        });
        (0..num_pes)
            .map(|my_pe| ThreadBootstrap {
                my_pe,
                group: group.clone(),
                deadlock_timeout: Duration::from_secs_f64(config().deadlock_timeout),
            })
            .collect()
    }
}

impl BootstrapOps for ThreadBootstrap {
    fn my_pe(&self) -> usize {
        self.my_pe
    }
    fn n_pes(&self) -> usize {
        self.group.num_pes
    }
    fn barrier(&self) -> BootstrapResult<()> {
        self.group.exchange(self.my_pe, vec![], self.deadlock_timeout)?;
        Ok(())
    }
    fn allgather(&self, data: &[u8]) -> BootstrapResult<Vec<u8>> {
        let slots = self.group.exchange(self.my_pe, data.to_vec(), self.deadlock_timeout)?;
        if let Some(slot) = slots.iter().find(|s| s.len() != data.len()) {
            return Err(BootstrapError::SizeMismatch {
                expected: data.len(),
                found: slot.len(),
            });
        }
        Ok(slots.concat())
    }
    fn broadcast(&self, data: &[u8], root: usize) -> BootstrapResult<Vec<u8>> {
        if root >= self.group.num_pes {
            return Err(BootstrapError::InvalidPe(root));
        }
        let contribution = if self.my_pe == root {
            data.to_vec()
        } else {
            vec![]
        };
        let slots = self.group.exchange(self.my_pe, contribution, self.deadlock_timeout)?;
        Ok(slots[root].clone())
    }
    fn global_exit(&self, status: i32) {
        warn!("pe {} raised global exit with status {}", self.my_pe, status);
        self.group.exit_status.store(status, Ordering::Release);
        self.group.exit_set.store(true, Ordering::Release);
        let _round = self.group.round.lock();
        self.group.cvar.notify_all();
    }
    fn exit_status(&self) -> Option<i32> {
        self.group.exit()
    }
    fn set_deadlock_timeout(&mut self, timeout: Duration) {
        self.deadlock_timeout = timeout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<F, R>(num_pes: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadBootstrap) -> R + Sync,
        R: Send,
    {
        let group = ThreadBootstrap::group(num_pes);
        std::thread::scope(|s| {
            let handles: Vec<_> = group.into_iter().map(|b| s.spawn(|| f(b))).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn allgather_orders_by_pe() {
        let res = run(4, |b| {
            b.barrier().unwrap();
            b.allgather(&[b.my_pe() as u8; 2]).unwrap()
        });
        for r in res {
            assert_eq!(r, vec![0, 0, 1, 1, 2, 2, 3, 3]);
        }
    }

    #[test]
    fn allgather_size_mismatch() {
        let res = run(2, |b| b.allgather(&vec![0u8; b.my_pe() + 1]));
        assert!(res
            .iter()
            .all(|r| matches!(r, Err(BootstrapError::SizeMismatch { .. }))));
    }

    #[test]
    fn broadcast_from_root() {
        let res = run(3, |b| b.broadcast(&[7, 8, 9], 1).unwrap());
        for r in res {
            assert_eq!(r, vec![7, 8, 9]);
        }
    }

    #[test]
    fn global_exit_unblocks_waiters() {
        let res = run(3, |b| {
            if b.my_pe() == 2 {
                std::thread::sleep(Duration::from_millis(50));
                b.global_exit(5);
                b.exit_status()
            } else {
                match b.barrier() {
                    Err(BootstrapError::GlobalExit(s)) => Some(s),
                    _ => None,
                }
            }
        });
        assert_eq!(res, vec![Some(5), Some(5), Some(5)]);
    }

    #[test]
    fn late_arrival_past_the_deadlock_timeout() {
        let res = run(2, |mut b| {
            b.set_deadlock_timeout(Duration::from_millis(5));
            assert_eq!(b.deadlock_timeout, Duration::from_millis(5));
            if b.my_pe() == 1 {
                std::thread::sleep(Duration::from_millis(40));
            }
            b.barrier()
        });
        assert!(res.iter().all(|r| r.is_ok()));
    }
}
