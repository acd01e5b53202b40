//! The per-PE shared state record.
//!
//! Built once by the collective setup of a context and read-mostly afterwards;
//! team creation and destruction are the only later mutations. Everything a
//! host call or a launched core needs hangs off this record.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::addr::{GlobalAddr, MemKind};
use crate::bootstrap::{Bootstrap, BootstrapOps};
use crate::config::Config;
use crate::driver::Driver;
use crate::error::{ShmemError, ShmemResult};
use crate::heap::{Heaps, SymmetricHeap};
use crate::sync::barrier::{launch_cores, SyncEngine, SYNC_POOL_SIZE};
use crate::sync::SpinPolicy;
use crate::team::{Team, TeamRecord, TeamRegistry, TEAM_MASK_WORDS};
use crate::topology::Topology;
use crate::transport::{DmaEngine, EngineCtx, LinkEngine, LocalBuf, RdmaEngine, Transport, Xfer};

/// Scratch configuration of the link engine
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MteConfig {
    pub ub_size: usize,
    pub event_id: u64,
}

pub(crate) struct ShmemState {
    pub(crate) my_pe: usize,
    pub(crate) n_pes: usize,
    pub(crate) config: Config,
    pub(crate) bootstrap: Bootstrap,
    pub(crate) driver: Arc<Driver>,
    pub(crate) heaps: Arc<Heaps>,
    pub(crate) transport: Transport,
    pub(crate) teams: TeamRegistry,
    pub(crate) sync: SyncEngine,
    pub(crate) mte: RwLock<MteConfig>,
    /// where the next `_any`/`_some` scan starts
    pub(crate) cursor: Mutex<usize>,
}

impl std::fmt::Debug for ShmemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemState")
            .field("my_pe", &self.my_pe)
            .field("n_pes", &self.n_pes)
            .field("heaps", &self.heaps)
            .field("teams", &self.teams)
            .field("sync", &self.sync)
            .finish()
    }
}

/// a PE that gives up on setup takes the job down with it
fn raise_exit(bootstrap: &Bootstrap, e: &ShmemError) {
    if !matches!(e, ShmemError::GlobalExit(_)) {
        warn!("pe {} failed to initialize: {}", bootstrap.my_pe(), e);
        bootstrap.global_exit(e.code());
    }
}

/// undo a partially built heap set
fn teardown_heaps(driver: &Driver, heaps: &Heaps) {
    heaps.remove(driver);
    heaps.unreserve(driver);
}

impl ShmemState {
    /// The collective setup: topology, heaps, network registration, engines,
    /// teams, sync pools and a closing control barrier. On failure every
    /// mapping made so far is undone and the global exit flag is raised, so
    /// peers blocked in a setup collective return instead of hanging.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn init(config: Config, policy: SpinPolicy, bootstrap: Bootstrap, driver: Driver) -> ShmemResult<ShmemState> {
        let my_pe = bootstrap.my_pe();
        let n_pes = bootstrap.n_pes();
        let driver = Arc::new(driver);

        let (heaps, transport, teams) = match Self::assemble(&config, &bootstrap, &driver) {
            Ok(parts) => parts,
            Err(e) => {
                raise_exit(&bootstrap, &e);
                return Err(e);
            }
        };

        let sync = SyncEngine::new(
            my_pe,
            heaps.device.heap_base(),
            config.num_cores,
            config.barrier,
            config.barrier_fanout,
            policy,
        );
        let mte = MteConfig {
            ub_size: transport.link().map(|l| l.scratch_size()).unwrap_or(config.link_scratch_size),
            event_id: 0,
        };
        let state = ShmemState {
            my_pe,
            n_pes,
            config,
            bootstrap,
            driver,
            heaps,
            transport,
            teams,
            sync,
            mte: RwLock::new(mte),
            cursor: Mutex::new(0),
        };
        if let Err(e) = state.control_barrier() {
            raise_exit(&state.bootstrap, &e);
            state.transport.shutdown();
            teardown_heaps(&state.driver, &state.heaps);
            return Err(e);
        }
        debug!(
            "pe {} of {} initialized: heap {:x} ({} bytes) {:?} barrier over {} cores",
            my_pe,
            n_pes,
            state.heaps.device.heap_base(),
            state.heaps.device.size(),
            state.sync.algorithm(),
            state.sync.num_cores()
        );
        Ok(state)
    }

    /// topology, heap reservation and [ShmemState::connect]
    fn assemble(
        config: &Config,
        bootstrap: &Bootstrap,
        driver: &Arc<Driver>,
    ) -> ShmemResult<(Arc<Heaps>, Transport, TeamRegistry)> {
        let my_pe = bootstrap.my_pe();
        let n_pes = bootstrap.n_pes();
        let topology = Topology::new(my_pe, n_pes, config.pes_per_node);
        topology.cross_check(bootstrap)?;

        let device = SymmetricHeap::reserve(driver, MemKind::Device, my_pe, n_pes, config.heap_size + SYNC_POOL_SIZE)?;
        let host = if config.host_heap_size > 0 {
            match SymmetricHeap::reserve(driver, MemKind::Host, my_pe, n_pes, config.host_heap_size) {
                Ok(host) => Some(host),
                Err(e) => {
                    device.unreserve(driver);
                    return Err(e);
                }
            }
        } else {
            None
        };
        let heaps = Arc::new(Heaps { device, host });

        match Self::connect(config, bootstrap, driver, &heaps, topology) {
            Ok((transport, teams)) => Ok((heaps, transport, teams)),
            Err(e) => {
                teardown_heaps(driver, &heaps);
                Err(e)
            }
        }
    }

    /// heap setup, network registration and the engines
    fn connect(
        config: &Config,
        bootstrap: &Bootstrap,
        driver: &Arc<Driver>,
        heaps: &Arc<Heaps>,
        topology: Topology,
    ) -> ShmemResult<(Transport, TeamRegistry)> {
        heaps.device.setup(driver, bootstrap, &topology, SYNC_POOL_SIZE)?;
        if let Some(host) = &heaps.host {
            host.setup(driver, bootstrap, &topology, 0)?;
        }
        let ctx = EngineCtx {
            my_pe: bootstrap.my_pe(),
            num_pes: bootstrap.n_pes(),
            driver: driver.clone(),
            heaps: heaps.clone(),
            deadlock_timeout: Duration::from_secs_f64(config.deadlock_timeout),
        };
        let rdma = RdmaEngine::new(ctx.clone())?;
        let link = LinkEngine::new(ctx.clone(), config.num_cores, config.link_scratch_size);
        let dma = DmaEngine::new(
            ctx.clone(),
            config.num_cores,
            config.dma_block_size,
            config.dma_queue_depth,
            config.dma_poll_cap,
        );
        let transport = Transport::new(ctx, topology, link, dma, rdma);
        match TeamRegistry::new(bootstrap.my_pe(), bootstrap.n_pes()) {
            Ok(teams) => Ok((transport, teams)),
            Err(e) => {
                transport.shutdown();
                Err(e)
            }
        }
    }

    /// barrier over the rendezvous collaborator, independent of the heap
    pub(crate) fn control_barrier(&self) -> ShmemResult<()> {
        Ok(self.bootstrap.barrier()?)
    }

    pub(crate) fn check_pe(&self, pe: usize) -> ShmemResult<()> {
        if pe >= self.n_pes {
            return Err(ShmemError::InvalidParam(format!("pe {} out of range [0, {})", pe, self.n_pes)));
        }
        Ok(())
    }

    /// host pointer to `[addr, addr + len)` of local symmetric memory
    pub(crate) fn local_ptr(&self, addr: GlobalAddr, len: usize) -> ShmemResult<NonNull<u8>> {
        self.transport
            .local_ptr(addr, len)
            .ok_or_else(|| ShmemError::InvalidParam(format!("{:x} (+{}) is not local symmetric memory", addr, len)))
    }

    /// The cross-device barrier over `team`, run by every core of a launch.
    /// `quiet` drains outstanding traffic first (barrier vs. sync).
    pub(crate) fn barrier(&self, team: Team, quiet: bool) -> ShmemResult<()> {
        let record = self.teams.get(team)?;
        if quiet {
            self.transport.quiet()?;
        }
        launch_cores(self.sync.num_cores(), |core| {
            self.sync.device_barrier(core, &record, &self.transport, &self.bootstrap)
        })
    }

    pub(crate) fn cross_host_barrier(&self, team: Team) -> ShmemResult<()> {
        let record = self.teams.get(team)?;
        self.sync.cross_host_barrier(&record, &self.transport, &self.bootstrap)
    }

    pub(crate) fn handle_wait(&self, team: Team) -> ShmemResult<()> {
        let record = self.teams.get(team)?;
        self.sync.handle_wait(&record, &self.transport, &self.bootstrap)
    }

    /// Union of the used team index masks of every member of `parent`.
    ///
    /// Each member publishes its mask in the split scratch area, then every
    /// member reads all of them. The barriers on either side keep a later
    /// split from overwriting a mask that is still being read.
    pub(crate) fn agree_team_mask(&self, parent: &TeamRecord, mask: &[u64]) -> ShmemResult<Vec<u64>> {
        let scratch = self.sync.pools().split_scratch();
        let bytes = TEAM_MASK_WORDS * 8;
        let local = self.local_ptr(scratch, bytes)?;
        let published: Vec<u8> = mask.iter().flat_map(|w| w.to_le_bytes()).collect();
        unsafe { std::ptr::copy_nonoverlapping(published.as_ptr(), local.as_ptr(), bytes.min(published.len())) };

        let parent_team = Team(parent.idx);
        self.barrier(parent_team, true)?;
        let mut union = mask.to_vec();
        let mut theirs = vec![0u8; bytes];
        for pe in parent.members().iter().copied().filter(|pe| *pe != self.my_pe) {
            let dst = LocalBuf::from_slice(&mut theirs)
                .ok_or_else(|| ShmemError::Inner("empty team mask buffer".to_owned()))?;
            self.transport.get(&Xfer::contiguous(scratch, pe, bytes, 8, 0), dst, false)?;
            for (word, chunk) in union.iter_mut().zip(theirs.chunks_exact(8)) {
                let mut w = [0u8; 8];
                w.copy_from_slice(chunk);
                *word |= u64::from_le_bytes(w);
            }
        }
        self.barrier(parent_team, false)?;
        trace!("pe {} agreed on team mask over team {}", self.my_pe, parent.idx);
        Ok(union)
    }

    /// Quiet, stop the engines and release the heaps. Collective.
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn finalize(&self) -> ShmemResult<()> {
        let quiet = self.transport.quiet();
        // peers may still be reading our heap until everyone got here
        let first = self.control_barrier();
        self.teams.destroy_all();
        self.transport.shutdown();
        teardown_heaps(&self.driver, &self.heaps);
        let last = self.control_barrier();
        if let Err(e) = &quiet {
            warn!("pe {} quiet during finalize failed: {}", self.my_pe, e);
        }
        debug!("pe {} finalized", self.my_pe);
        quiet.and(first).and(last)
    }
}
