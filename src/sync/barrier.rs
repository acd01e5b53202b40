//! Barriers.
//!
//! Every team owns a sync array of cache line sized slots and one counter line
//! at the start of the device heap. A barrier works with
//! `count = counter + 1`; every slot a peer signals ends up holding `count`,
//! and a waiter accepts `count` or `count + 1` since a peer may already have
//! moved on to the next barrier. The compute cores of one PE synchronise among
//! themselves through a local pool of per-core slots.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

use crossbeam::utils::CachePadded;
use tracing::trace;

use super::spin::{spin_until, SpinPolicy};
use crate::addr::GlobalAddr;
use crate::bootstrap::BootstrapOps;
use crate::config::BarrierAlgorithm;
use crate::error::{ShmemError, ShmemResult};
use crate::team::{TeamRecord, MAX_TEAMS, TEAM_MASK_WORDS};
use crate::transport::{SignalOp, Transport};
use crate::types::AtomicWord;

/// one notification slot
pub const SYNC_LINE: usize = 64;
/// dissemination rounds provisioned per team, times the largest fan-out
const SYNC_LOG_MAX_PES: usize = 5;
/// the largest fan-out of the group algorithm
pub const GROUP_K_MAX: usize = 8;
const SYNC_ARRAY_SIZE: usize = SYNC_LINE * SYNC_LOG_MAX_PES * GROUP_K_MAX;
const SYNC_SLOTS: usize = SYNC_ARRAY_SIZE / SYNC_LINE;
const SYNC_COUNTER_SIZE: usize = SYNC_LINE;
const SPLIT_SCRATCH_SIZE: usize = TEAM_MASK_WORDS * 8;
/// the most compute cores a launch may use
pub const MAX_CORES: usize = 48;
/// rounds of the local-group barrier, enough for `MAX_CORES`
const CORE_ROUNDS: usize = 6;

/// bytes reserved at the start of the device heap for the sync pools
pub const SYNC_POOL_SIZE: usize = MAX_TEAMS * (SYNC_ARRAY_SIZE + SYNC_COUNTER_SIZE) + SPLIT_SCRATCH_SIZE;

/// Addresses of the per-team sync pools, in this PE's view
#[derive(Copy, Clone, Debug)]
pub(crate) struct SyncPools {
    base: GlobalAddr,
}

impl SyncPools {
    pub(crate) fn new(heap_base: GlobalAddr) -> SyncPools {
        SyncPools { base: heap_base }
    }
    pub(crate) fn slot(&self, team_idx: usize, slot: usize) -> GlobalAddr {
        debug_assert!(slot < SYNC_SLOTS);
        self.base + (team_idx * SYNC_ARRAY_SIZE + slot * SYNC_LINE)
    }
    pub(crate) fn counter(&self, team_idx: usize) -> GlobalAddr {
        self.base + (MAX_TEAMS * SYNC_ARRAY_SIZE + team_idx * SYNC_COUNTER_SIZE)
    }
    /// where a PE publishes its used team indices during a split
    pub(crate) fn split_scratch(&self) -> GlobalAddr {
        self.base + (MAX_TEAMS * (SYNC_ARRAY_SIZE + SYNC_COUNTER_SIZE))
    }
}

/// The local-group slots, never visible to peers
struct CorePool {
    slots: Vec<CachePadded<AtomicI32>>,
    counters: Vec<CachePadded<AtomicI32>>,
}

impl CorePool {
    fn new() -> CorePool {
        CorePool {
            slots: (0..MAX_CORES * CORE_ROUNDS).map(|_| CachePadded::new(AtomicI32::new(0))).collect(),
            counters: (0..MAX_CORES).map(|_| CachePadded::new(AtomicI32::new(0))).collect(),
        }
    }
}

fn arrived(v: i32, count: i32) -> bool {
    v == count || v == count.wrapping_add(1)
}

/// The barrier machinery of one PE
pub(crate) struct SyncEngine {
    my_pe: usize,
    pools: SyncPools,
    cores: CorePool,
    num_cores: usize,
    algorithm: BarrierAlgorithm,
    fanout: usize,
    policy: SpinPolicy,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("my_pe", &self.my_pe)
            .field("num_cores", &self.num_cores)
            .field("algorithm", &self.algorithm)
            .field("fanout", &self.fanout)
            .finish()
    }
}

impl SyncEngine {
    pub(crate) fn new(
        my_pe: usize,
        heap_base: GlobalAddr,
        num_cores: usize,
        algorithm: BarrierAlgorithm,
        fanout: usize,
        policy: SpinPolicy,
    ) -> SyncEngine {
        SyncEngine {
            my_pe,
            pools: SyncPools::new(heap_base),
            cores: CorePool::new(),
            num_cores: num_cores.clamp(1, MAX_CORES),
            algorithm,
            fanout: fanout.clamp(2, GROUP_K_MAX),
            policy,
        }
    }

    pub(crate) fn pools(&self) -> &SyncPools {
        &self.pools
    }
    pub(crate) fn num_cores(&self) -> usize {
        self.num_cores
    }
    pub(crate) fn policy(&self) -> &SpinPolicy {
        &self.policy
    }
    pub(crate) fn algorithm(&self) -> BarrierAlgorithm {
        self.algorithm
    }

    fn local_word(&self, transport: &Transport, addr: GlobalAddr) -> ShmemResult<NonNull<u8>> {
        transport
            .local_ptr(addr, std::mem::size_of::<i32>())
            .ok_or_else(|| ShmemError::Inner(format!("sync word {:x} is not mapped", addr)))
    }

    fn wait_slot<B: BootstrapOps>(&self, bootstrap: &B, word: NonNull<u8>, count: i32, what: &str) -> ShmemResult<()> {
        spin_until(&self.policy, bootstrap, what, || {
            let v = unsafe { i32::load_raw(word.as_ptr()) };
            Ok(if arrived(v, count) { Some(()) } else { None })
        })
    }

    /// Dissemination over the cores of this PE. Every core keeps its own
    /// counter so the cores never race on a shared one.
    pub(crate) fn core_barrier<B: BootstrapOps>(&self, core: usize, bootstrap: &B) -> ShmemResult<()> {
        let n = self.num_cores;
        if n <= 1 {
            return Ok(());
        }
        let counter = &self.cores.counters[core];
        let count = counter.load(Ordering::Acquire).wrapping_add(1);
        let mut shift = 1;
        let mut offset = 0;
        while shift < n {
            let next = (core + shift) % n;
            self.cores.slots[next * CORE_ROUNDS + offset].store(count, Ordering::Release);
            let own = &self.cores.slots[core * CORE_ROUNDS + offset];
            spin_until(&self.policy, bootstrap, "core barrier", || {
                Ok(if arrived(own.load(Ordering::Acquire), count) {
                    Some(())
                } else {
                    None
                })
            })?;
            shift *= 2;
            offset += 1;
        }
        counter.store(count, Ordering::Release);
        Ok(())
    }

    /// The full device barrier run by every core of a launch: local-group
    /// barrier, the configured cross-device algorithm, local-group barrier.
    pub(crate) fn device_barrier<B: BootstrapOps>(
        &self,
        core: usize,
        team: &TeamRecord,
        transport: &Transport,
        bootstrap: &B,
    ) -> ShmemResult<()> {
        let counter = self.local_word(transport, self.pools.counter(team.idx))?;
        // every core reads the counter before core 0 can pass the first local barrier
        let count = unsafe { i32::load_raw(counter.as_ptr()) }.wrapping_add(1);
        self.core_barrier(core, bootstrap)?;
        match self.algorithm {
            BarrierAlgorithm::Dissem => {
                if core == 0 {
                    self.dissem(team, transport, bootstrap, count)?;
                }
            }
            BarrierAlgorithm::Group => self.group(core, team, transport, bootstrap, count)?,
            BarrierAlgorithm::Pull => self.pull(core, team, transport, bootstrap, count)?,
        }
        if core == 0 {
            unsafe { i32::store_raw(counter.as_ptr(), count) };
        }
        self.core_barrier(core, bootstrap)
    }

    fn peer(team: &TeamRecord, team_pe: usize) -> ShmemResult<usize> {
        team.world_pe(team_pe)
            .ok_or_else(|| ShmemError::Inner(format!("team pe {} out of range", team_pe)))
    }

    /// pairwise dissemination, run by core 0 only
    fn dissem<B: BootstrapOps>(&self, team: &TeamRecord, transport: &Transport, bootstrap: &B, count: i32) -> ShmemResult<()> {
        let size = team.size();
        let me = team.mype;
        let mut shift = 1;
        let mut offset = 0;
        while shift < size {
            let next = Self::peer(team, (me + shift) % size)?;
            let slot = self.pools.slot(team.idx, offset);
            transport.signal(slot, count, SignalOp::Set, next, 0)?;
            self.wait_slot(bootstrap, self.local_word(transport, slot)?, count, "dissemination barrier")?;
            shift *= 2;
            offset += 1;
        }
        trace!("pe {} passed dissemination barrier {} of team {}", self.my_pe, count, team.idx);
        Ok(())
    }

    /// The k-ary dissemination. The `k - 1` signals of a round are spread over
    /// the cores; a local-group barrier closes every round so that the next
    /// round only starts once all of this round's signals have arrived.
    fn group<B: BootstrapOps>(
        &self,
        core: usize,
        team: &TeamRecord,
        transport: &Transport,
        bootstrap: &B,
        count: i32,
    ) -> ShmemResult<()> {
        let size = team.size();
        let me = team.mype;
        let k = self.fanout.min(size).min(self.num_cores).max(2);
        let mut shift = 1;
        let mut offset = 0;
        while shift < size {
            for i in (core + 1..k).step_by(self.num_cores) {
                let next = Self::peer(team, (me + i * shift) % size)?;
                transport.signal(self.pools.slot(team.idx, offset + i), count, SignalOp::Set, next, core)?;
            }
            for i in (core + 1..k).step_by(self.num_cores) {
                let slot = self.local_word(transport, self.pools.slot(team.idx, offset + i))?;
                self.wait_slot(bootstrap, slot, count, "group barrier")?;
            }
            self.core_barrier(core, bootstrap)?;
            shift *= k;
            offset += k;
        }
        Ok(())
    }

    /// Every PE publishes `count` in its own slot 0; cores `c < k` read the
    /// slot 0 of team members `c, c + k, c + 2k ...` until they show it.
    fn pull<B: BootstrapOps>(
        &self,
        core: usize,
        team: &TeamRecord,
        transport: &Transport,
        bootstrap: &B,
        count: i32,
    ) -> ShmemResult<()> {
        let size = team.size();
        let k = self.fanout.min(size).min(self.num_cores).max(1);
        if core >= k {
            return Ok(());
        }
        let slot = self.pools.slot(team.idx, 0);
        for i in (core..size).step_by(k) {
            if i == team.mype {
                unsafe { i32::store_raw(self.local_word(transport, slot)?.as_ptr(), count) };
                continue;
            }
            let pe = Self::peer(team, i)?;
            spin_until(&self.policy, bootstrap, "pull barrier", || match transport.fetch_i32(slot, pe, core)? {
                Some(v) if arrived(v, count) => Ok(Some(())),
                Some(_) => Ok(None),
                None => {
                    trace!("pe {} cannot reach pe {}, skipping it", self.my_pe, pe);
                    Ok(Some(()))
                }
            })?;
        }
        Ok(())
    }

    /// Dissemination with the signals routed through the network engine.
    /// The counter is advanced before the first round.
    pub(crate) fn cross_host_barrier<B: BootstrapOps>(
        &self,
        team: &TeamRecord,
        transport: &Transport,
        bootstrap: &B,
    ) -> ShmemResult<()> {
        let counter = self.local_word(transport, self.pools.counter(team.idx))?;
        let count = unsafe { i32::load_raw(counter.as_ptr()) }.wrapping_add(1);
        unsafe { i32::store_raw(counter.as_ptr(), count) };
        let size = team.size();
        let me = team.mype;
        let mut shift = 1;
        let mut offset = 0;
        while shift < size {
            let next = Self::peer(team, (me + shift) % size)?;
            let slot = self.pools.slot(team.idx, offset);
            transport.rdma_signal(slot, count, next, 0)?;
            self.wait_slot(bootstrap, self.local_word(transport, slot)?, count, "cross-host barrier")?;
            shift *= 2;
            offset += 1;
        }
        Ok(())
    }

    /// drain network traffic to every other team member, then the cross-host barrier
    pub(crate) fn handle_wait<B: BootstrapOps>(
        &self,
        team: &TeamRecord,
        transport: &Transport,
        bootstrap: &B,
    ) -> ShmemResult<()> {
        for pe in team.members().iter().filter(|pe| **pe != self.my_pe) {
            transport.rdma_quiet_pe(*pe)?;
        }
        self.cross_host_barrier(team, transport, bootstrap)
    }
}

/// Runs `f` once per compute core, each on its own scoped thread, and
/// reports the first failure.
pub(crate) fn launch_cores<F>(num_cores: usize, f: F) -> ShmemResult<()>
where
    F: Fn(usize) -> ShmemResult<()> + Sync,
{
    if num_cores <= 1 {
        return f(0);
    }
    let f = &f;
    let results = crossbeam::thread::scope(|s| {
        let handles: Vec<_> = (0..num_cores).map(|core| s.spawn(move |_| f(core))).collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(ShmemError::Inner("compute core panicked".to_owned())))
            })
            .collect::<Vec<_>>()
    })
    .map_err(|_| ShmemError::Inner("compute grid panicked".to_owned()))?;
    results.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::ThreadBootstrap;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn pool_layout() {
        let pools = SyncPools::new(GlobalAddr::new(0x1000));
        assert_eq!(SYNC_ARRAY_SIZE, 2560);
        assert_eq!(pools.slot(0, 0), GlobalAddr::new(0x1000));
        assert_eq!(pools.slot(1, 2), GlobalAddr::new(0x1000 + 2560 + 128));
        assert_eq!(pools.counter(0), GlobalAddr::new(0x1000 + 2048 * 2560));
        assert_eq!(pools.counter(3), GlobalAddr::new(0x1000 + 2048 * 2560 + 192));
        assert_eq!(pools.split_scratch().as_u64() + SPLIT_SCRATCH_SIZE as u64, 0x1000 + SYNC_POOL_SIZE as u64);
        assert_eq!(SYNC_POOL_SIZE, 5_373_952 + 256);
    }

    #[test]
    fn arrival_accepts_one_ahead() {
        assert!(arrived(4, 4));
        assert!(arrived(5, 4));
        assert!(!arrived(3, 4));
        assert!(!arrived(6, 4));
        assert!(arrived(i32::MIN, i32::MAX));
    }

    #[test]
    fn core_barrier_separates_phases() {
        let b = ThreadBootstrap::group(1).pop().unwrap();
        let engine = SyncEngine::new(0, GlobalAddr::new(0x1000), 5, BarrierAlgorithm::Pull, 8, SpinPolicy::default());
        let arrivals = AtomicUsize::new(0);
        launch_cores(engine.num_cores(), |core| {
            for round in 1..=20 {
                arrivals.fetch_add(1, Ordering::SeqCst);
                engine.core_barrier(core, &b)?;
                assert!(arrivals.load(Ordering::SeqCst) >= round * 5);
                engine.core_barrier(core, &b)?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(arrivals.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn launch_reports_failure() {
        let r = launch_cores(4, |core| {
            if core == 2 {
                Err(ShmemError::Timeout)
            } else {
                Ok(())
            }
        });
        assert_eq!(r, Err(ShmemError::Timeout));
    }
}
