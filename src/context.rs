//! The host-facing API.
//!
//! A [ShmemContext] is one PE's handle on the communication layer. It is built
//! collectively through a [ShmemContextBuilder], after which every PE can put,
//! get and update remote symmetric memory, synchronise with barriers and
//! signals, and derive teams. Dropping (or finalizing) a context is collective
//! as well.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::addr::{GlobalAddr, MemKind, StrideDesc, SymmPtr};
use crate::bootstrap::{Bootstrap, BootstrapOps, ShmemBootstrap, ThreadBootstrap};
use crate::config::{config, Backend, BarrierAlgorithm, Config};
use crate::driver::{Driver, ShmemDriver, SimDriver};
use crate::error::{ShmemError, ShmemResult};
use crate::heap::{PeerTable, MAX_LOCAL_SIZE};
use crate::state::{MteConfig, ShmemState};
use crate::stream::Stream;
use crate::sync::barrier::launch_cores;
use crate::sync::signal::{self, Target, Words};
use crate::sync::{CmpOp, SpinPolicy};
use crate::team::{Team, TeamConfig, MAX_PES};
use crate::transport::{AtomicFn, LocalBuf, SignalOp, Xfer};
use crate::types::{as_bytes, as_bytes_mut, AtomicAdd, AtomicWord, ShmemType};

/// default alignment of symmetric allocations
const MALLOC_ALIGN: usize = 64;

/// `(major, minor)` of the interface
pub const VERSION: (i32, i32) = (1, 0);
pub const NAME: &str = "PGAS-SHMEM v1.0.0";

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum InitStatus {
    NotInitialized,
    Initialized,
}

/// Builds a [ShmemContext]; starts from the environment configuration.
#[derive(Debug, Clone)]
pub struct ShmemContextBuilder {
    my_pe: usize,
    n_pes: usize,
    config: Config,
    policy: Option<SpinPolicy>,
}

impl ShmemContextBuilder {
    pub fn new(my_pe: usize, n_pes: usize) -> ShmemContextBuilder {
        ShmemContextBuilder {
            my_pe,
            n_pes,
            config: config().clone(),
            policy: None,
        }
    }

    /// replace the whole configuration
    pub fn with_config(mut self, config: Config) -> ShmemContextBuilder {
        self.config = config;
        self
    }

    pub fn with_heap_size(mut self, bytes: usize) -> ShmemContextBuilder {
        self.config.heap_size = bytes;
        self
    }

    /// bytes of the host-side heap kind, 0 disables it
    pub fn with_host_heap_size(mut self, bytes: usize) -> ShmemContextBuilder {
        self.config.host_heap_size = bytes;
        self
    }

    pub fn with_barrier(mut self, algorithm: BarrierAlgorithm) -> ShmemContextBuilder {
        self.config.barrier = algorithm;
        self
    }

    pub fn with_barrier_fanout(mut self, fanout: usize) -> ShmemContextBuilder {
        self.config.barrier_fanout = fanout;
        self
    }

    pub fn with_num_cores(mut self, num_cores: usize) -> ShmemContextBuilder {
        self.config.num_cores = num_cores;
        self
    }

    /// PEs sharing the direct interconnect, 0 puts everyone on one node
    pub fn with_pes_per_node(mut self, pes_per_node: usize) -> ShmemContextBuilder {
        self.config.pes_per_node = pes_per_node;
        self
    }

    pub fn with_link_scratch_size(mut self, bytes: usize) -> ShmemContextBuilder {
        self.config.link_scratch_size = bytes;
        self
    }

    pub fn with_dma_block_size(mut self, bytes: usize) -> ShmemContextBuilder {
        self.config.dma_block_size = bytes;
        self
    }

    pub fn with_dma_queue_depth(mut self, depth: usize) -> ShmemContextBuilder {
        self.config.dma_queue_depth = depth;
        self
    }

    pub fn with_dma_poll_cap(mut self, polls: u64) -> ShmemContextBuilder {
        self.config.dma_poll_cap = polls;
        self
    }

    /// seconds after which any wait of this context reports a potential deadlock
    pub fn with_deadlock_timeout(mut self, secs: f64) -> ShmemContextBuilder {
        self.config.deadlock_timeout = secs;
        if let Some(policy) = self.policy.as_mut() {
            policy.deadlock_timeout = Duration::from_secs_f64(secs);
        }
        self
    }

    /// how waits back off and when they give up, its deadlock timeout applies to the whole context
    pub fn with_spin_policy(mut self, policy: SpinPolicy) -> ShmemContextBuilder {
        self.config.deadlock_timeout = policy.deadlock_timeout.as_secs_f64();
        self.policy = Some(policy);
        self
    }

    fn validate(&self, bootstrap: &Bootstrap) -> ShmemResult<()> {
        if self.n_pes == 0 || self.n_pes > MAX_PES || self.my_pe >= self.n_pes {
            return Err(ShmemError::InvalidParam(format!(
                "pe {} of {} (max {} pes)",
                self.my_pe, self.n_pes, MAX_PES
            )));
        }
        if bootstrap.my_pe() != self.my_pe || bootstrap.n_pes() != self.n_pes {
            return Err(ShmemError::InvalidParam(format!(
                "bootstrap is pe {} of {}, expected pe {} of {}",
                bootstrap.my_pe(),
                bootstrap.n_pes(),
                self.my_pe,
                self.n_pes
            )));
        }
        if self.config.heap_size == 0 || self.config.heap_size > MAX_LOCAL_SIZE {
            return Err(ShmemError::InvalidValue(format!(
                "heap size {} must be in (0, {}]",
                self.config.heap_size, MAX_LOCAL_SIZE
            )));
        }
        Ok(())
    }

    /// the backend `build_on_backend` sets up
    pub fn with_backend(mut self, backend: Backend) -> ShmemContextBuilder {
        self.config.backend = backend;
        self
    }

    /// namespace of the backend's shared objects, unique per concurrently running job
    pub fn with_job_id(mut self, job_id: usize) -> ShmemContextBuilder {
        self.config.job_id = job_id;
        self
    }

    /// Collective: builds the context on the configured backend, every object
    /// named after the configured job id. The shmem backend rendezvous with its
    /// peer processes by itself; the sim backend needs this PE's endpoint of a
    /// [ThreadBootstrap] group.
    pub fn build_on_backend(self, endpoint: Option<ThreadBootstrap>) -> ShmemResult<ShmemContext> {
        let (job_id, my_pe) = (self.config.job_id, self.my_pe);
        match self.config.backend {
            Backend::Sim => match endpoint {
                Some(endpoint) => self.build(endpoint, SimDriver::new(job_id, my_pe)),
                None => Err(ShmemError::InvalidParam(
                    "the sim backend needs a thread bootstrap endpoint".to_owned(),
                )),
            },
            Backend::Shmem => {
                let bootstrap = ShmemBootstrap::new(my_pe, self.n_pes, job_id)?;
                self.build(bootstrap, ShmemDriver::new(job_id, my_pe))
            }
        }
    }

    /// Collective: every PE of the bootstrap group must call it. A PE whose
    /// setup fails raises the global exit flag so its peers return as well.
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn build(self, bootstrap: impl Into<Bootstrap>, driver: impl Into<Driver>) -> ShmemResult<ShmemContext> {
        let mut bootstrap = bootstrap.into();
        if let Err(e) = self.validate(&bootstrap) {
            bootstrap.global_exit(e.code());
            return Err(e);
        }
        let deadlock_timeout = Duration::from_secs_f64(self.config.deadlock_timeout);
        bootstrap.set_deadlock_timeout(deadlock_timeout);
        let policy = self.policy.clone().unwrap_or_else(|| SpinPolicy {
            deadlock_timeout,
            ..Default::default()
        });
        let state = ShmemState::init(self.config, policy, bootstrap, driver.into())?;
        Ok(ShmemContext {
            my_pe: self.my_pe,
            n_pes: self.n_pes,
            state: Some(Arc::new(state)),
        })
    }
}

/// which engine family a transfer may use
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Route {
    /// link when the peer shares the interconnect, network otherwise
    Auto,
    /// the bulk DMA queues only
    Dma,
}

fn check_aligned<T>(addr: GlobalAddr) -> ShmemResult<()> {
    if addr.as_u64() % std::mem::align_of::<T>() as u64 != 0 {
        return Err(ShmemError::InvalidParam(format!(
            "{:x} is not aligned for a {} byte word",
            addr,
            std::mem::size_of::<T>()
        )));
    }
    Ok(())
}

fn check_desc(desc: &StrideDesc, src_len: usize, dst_len: usize) -> ShmemResult<()> {
    if !desc.is_valid() || src_len < desc.src_extent() || dst_len < desc.dst_extent() {
        return Err(ShmemError::InvalidParam(format!(
            "{:?} does not fit a source of {} and a destination of {} elements",
            desc, src_len, dst_len
        )));
    }
    Ok(())
}

/// RMA issued by one core of this PE
#[derive(Copy, Clone)]
struct Rma<'a> {
    st: &'a ShmemState,
    core: usize,
}

impl<'a> Rma<'a> {
    fn xfer<T: ShmemType>(&self, remote: GlobalAddr, pe: usize, desc: &StrideDesc) -> Xfer {
        let elem_size = std::mem::size_of::<T>();
        Xfer {
            remote,
            pe,
            desc: desc.in_bytes(elem_size),
            elem_size,
            core: self.core,
        }
    }

    fn put<T: ShmemType>(
        &self,
        dst: SymmPtr<T>,
        src: &[T],
        desc: StrideDesc,
        pe: usize,
        route: Route,
        nbi: bool,
    ) -> ShmemResult<()> {
        self.st.check_pe(pe)?;
        check_desc(&desc, src.len(), dst.len())?;
        if desc.num_elems() == 0 {
            return Ok(());
        }
        let x = self.xfer::<T>(dst.addr(), pe, &desc);
        match route {
            Route::Auto => self.st.transport.put(&x, as_bytes(src), nbi),
            Route::Dma => self.st.transport.put_dma(&x, as_bytes(src), nbi),
        }
    }

    /// blocking get into a host buffer
    fn get<T: ShmemType>(&self, dst: &mut [T], src: SymmPtr<T>, desc: StrideDesc, pe: usize, route: Route) -> ShmemResult<()> {
        self.st.check_pe(pe)?;
        check_desc(&desc, src.len(), dst.len())?;
        if desc.num_elems() == 0 {
            return Ok(());
        }
        let x = self.xfer::<T>(src.addr(), pe, &desc);
        let buf = LocalBuf::from_slice(as_bytes_mut(dst))
            .ok_or_else(|| ShmemError::InvalidParam("empty destination".to_owned()))?;
        match route {
            Route::Auto => self.st.transport.get(&x, buf, false),
            Route::Dma => self.st.transport.get_dma(&x, buf, false),
        }
    }

    /// get into local symmetric memory, which outlives a non-blocking transfer
    fn get_symm<T: ShmemType>(&self, dst: SymmPtr<T>, src: SymmPtr<T>, pe: usize, route: Route, nbi: bool) -> ShmemResult<()> {
        self.st.check_pe(pe)?;
        let n = src.len().min(dst.len());
        if n == 0 {
            return Ok(());
        }
        let desc = StrideDesc::contiguous(n);
        let bytes = n * std::mem::size_of::<T>();
        let local = self.st.local_ptr(dst.addr(), bytes)?;
        let buf = LocalBuf::symmetric(local, bytes);
        let x = self.xfer::<T>(src.addr(), pe, &desc);
        match route {
            Route::Auto => self.st.transport.get(&x, buf, nbi),
            Route::Dma => self.st.transport.get_dma(&x, buf, nbi),
        }
    }

    fn atomic_add<T: AtomicAdd>(&self, dst: SymmPtr<T>, value: T, pe: usize) -> ShmemResult<()> {
        self.st.check_pe(pe)?;
        check_aligned::<T>(dst.addr())?;
        let op: AtomicFn = Box::new(move |p| unsafe { T::atomic_add_raw(p.as_ptr(), value) });
        self.st
            .transport
            .atomic(dst.addr(), std::mem::size_of::<T>(), pe, op, self.core)
    }

    fn signal_op(&self, sig: SymmPtr<i32>, value: i32, op: SignalOp, pe: usize) -> ShmemResult<()> {
        self.st.check_pe(pe)?;
        check_aligned::<i32>(sig.addr())?;
        self.st.transport.signal(sig.addr(), value, op, pe, self.core)
    }

    /// payload first, then the signal on the same route so it cannot overtake the data
    #[allow(clippy::too_many_arguments)]
    fn put_signal<T: ShmemType>(
        &self,
        dst: SymmPtr<T>,
        src: &[T],
        sig: SymmPtr<i32>,
        value: i32,
        op: SignalOp,
        pe: usize,
        nbi: bool,
    ) -> ShmemResult<()> {
        self.put(dst, src, StrideDesc::contiguous(src.len()), pe, Route::Auto, nbi)?;
        self.signal_op(sig, value, op, pe)
    }
}

/// One PE's handle on the communication layer
pub struct ShmemContext {
    my_pe: usize,
    n_pes: usize,
    state: Option<Arc<ShmemState>>,
}

impl std::fmt::Debug for ShmemContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemContext")
            .field("my_pe", &self.my_pe)
            .field("n_pes", &self.n_pes)
            .field("state", &self.state)
            .finish()
    }
}

impl ShmemContext {
    fn state(&self) -> ShmemResult<&Arc<ShmemState>> {
        self.state.as_ref().ok_or(ShmemError::NotInitialized)
    }

    fn rma(&self) -> ShmemResult<Rma<'_>> {
        Ok(Rma {
            st: self.state()?.as_ref(),
            core: 0,
        })
    }

    fn words<T: AtomicWord>(&self, ivars: SymmPtr<T>) -> ShmemResult<Words<T>> {
        check_aligned::<T>(ivars.addr())?;
        let ptr = self.state()?.local_ptr(ivars.addr(), ivars.num_bytes())?;
        Ok(unsafe { Words::new(ptr, ivars.len()) })
    }

    pub fn my_pe(&self) -> usize {
        self.my_pe
    }

    pub fn n_pes(&self) -> usize {
        self.n_pes
    }

    pub fn init_status(&self) -> InitStatus {
        match self.state {
            Some(_) => InitStatus::Initialized,
            None => InitStatus::NotInitialized,
        }
    }

    pub fn info_get_version(&self) -> (i32, i32) {
        VERSION
    }

    pub fn info_get_name(&self) -> &'static str {
        NAME
    }

    /// the configuration this context was built with
    pub fn config(&self) -> ShmemResult<&Config> {
        Ok(&self.state()?.config)
    }

    //#################################################
    // memory
    //#################################################

    fn alloc_bytes(&self, kind: MemKind, size: usize, align: usize, zero: bool) -> ShmemResult<GlobalAddr> {
        let st = self.state()?;
        if size == 0 {
            return Err(ShmemError::InvalidValue("zero sized allocation".to_owned()));
        }
        if !align.is_power_of_two() {
            return Err(ShmemError::InvalidValue(format!("alignment {} is not a power of two", align)));
        }
        let heap = st
            .heaps
            .get(kind)
            .ok_or_else(|| ShmemError::InvalidParam(format!("no {:?} heap configured", kind)))?;
        let addr = heap.malloc(size, align).ok_or(ShmemError::MallocFailed(size))?;
        if zero {
            let ptr = st.local_ptr(addr, size)?;
            unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, size) };
        }
        if let Err(e) = st.control_barrier() {
            heap.free(addr);
            return Err(e);
        }
        debug!("pe {} allocated {} bytes at {:x}", self.my_pe, size, addr);
        Ok(addr)
    }

    fn elems_to_bytes<T>(len: usize) -> ShmemResult<usize> {
        len.checked_mul(std::mem::size_of::<T>())
            .ok_or_else(|| ShmemError::InvalidValue(format!("{} elements overflow the heap", len)))
    }

    /// Collective symmetric allocation of `len` elements on the device heap
    pub fn malloc<T: ShmemType>(&self, len: usize) -> ShmemResult<SymmPtr<T>> {
        self.malloc_in(MemKind::Device, len)
    }

    pub fn malloc_in<T: ShmemType>(&self, kind: MemKind, len: usize) -> ShmemResult<SymmPtr<T>> {
        let bytes = Self::elems_to_bytes::<T>(len)?;
        let addr = self.alloc_bytes(kind, bytes, MALLOC_ALIGN.max(std::mem::align_of::<T>()), false)?;
        Ok(SymmPtr::from_raw_parts(addr, len))
    }

    /// like [ShmemContext::malloc] with the memory zeroed
    pub fn calloc<T: ShmemType>(&self, len: usize) -> ShmemResult<SymmPtr<T>> {
        let bytes = Self::elems_to_bytes::<T>(len)?;
        let addr = self.alloc_bytes(MemKind::Device, bytes, MALLOC_ALIGN.max(std::mem::align_of::<T>()), true)?;
        Ok(SymmPtr::from_raw_parts(addr, len))
    }

    /// `alignment` must be a power of two
    pub fn align<T: ShmemType>(&self, alignment: usize, len: usize) -> ShmemResult<SymmPtr<T>> {
        let bytes = Self::elems_to_bytes::<T>(len)?;
        if !alignment.is_power_of_two() {
            return Err(ShmemError::InvalidValue(format!(
                "alignment {} is not a power of two",
                alignment
            )));
        }
        let addr = self.alloc_bytes(MemKind::Device, bytes, alignment.max(std::mem::align_of::<T>()), false)?;
        Ok(SymmPtr::from_raw_parts(addr, len))
    }

    /// Collective release of a symmetric allocation
    pub fn free<T: ShmemType>(&self, ptr: SymmPtr<T>) -> ShmemResult<()> {
        let st = self.state()?;
        let heap = st
            .heaps
            .owning(ptr.addr())
            .ok_or_else(|| ShmemError::InvalidParam(format!("{:x} is not symmetric memory", ptr.addr())))?;
        heap.free(ptr.addr())
            .ok_or_else(|| ShmemError::InvalidParam(format!("{:x} is not an allocation", ptr.addr())))?;
        st.control_barrier()
    }

    /// `ptr` as mapped for direct access to `pe`, `None` when `pe` is not in the link domain
    pub fn ptr<T: ShmemType>(&self, ptr: SymmPtr<T>, pe: usize) -> Option<GlobalAddr> {
        let st = self.state().ok()?;
        if pe >= self.n_pes {
            return None;
        }
        st.heaps.translate(ptr.addr(), pe, PeerTable::P2p)
    }

    pub fn heap_base(&self) -> ShmemResult<GlobalAddr> {
        Ok(self.state()?.heaps.device.heap_base())
    }

    /// free bytes left in the device heap
    pub fn space_avail(&self) -> ShmemResult<usize> {
        Ok(self.state()?.heaps.device.space_avail())
    }

    /// copy local symmetric memory into `dst`
    pub fn read_local<T: ShmemType>(&self, src: SymmPtr<T>, dst: &mut [T]) -> ShmemResult<()> {
        let n = dst.len().min(src.len());
        if n == 0 {
            return Ok(());
        }
        let ptr = self.state()?.local_ptr(src.addr(), n * std::mem::size_of::<T>())?;
        unsafe { std::ptr::copy(ptr.as_ptr() as *const T, dst.as_mut_ptr(), n) };
        Ok(())
    }

    /// copy `src` into local symmetric memory
    pub fn write_local<T: ShmemType>(&self, dst: SymmPtr<T>, src: &[T]) -> ShmemResult<()> {
        if src.len() > dst.len() {
            return Err(ShmemError::InvalidParam(format!(
                "{} elements do not fit {}",
                src.len(),
                dst.len()
            )));
        }
        if src.is_empty() {
            return Ok(());
        }
        let ptr = self.state()?.local_ptr(dst.addr(), std::mem::size_of_val(src))?;
        unsafe { std::ptr::copy(src.as_ptr(), ptr.as_ptr() as *mut T, src.len()) };
        Ok(())
    }

    //#################################################
    // rma
    //#################################################

    pub fn put<T: ShmemType>(&self, dst: SymmPtr<T>, src: &[T], pe: usize) -> ShmemResult<()> {
        self.rma()?.put(dst, src, StrideDesc::contiguous(src.len()), pe, Route::Auto, false)
    }

    /// only issues, `src` is consumed before returning; completion needs [ShmemContext::quiet]
    pub fn put_nbi<T: ShmemType>(&self, dst: SymmPtr<T>, src: &[T], pe: usize) -> ShmemResult<()> {
        self.rma()?.put(dst, src, StrideDesc::contiguous(src.len()), pe, Route::Auto, true)
    }

    pub fn get<T: ShmemType>(&self, dst: &mut [T], src: SymmPtr<T>, pe: usize) -> ShmemResult<()> {
        let desc = StrideDesc::contiguous(dst.len());
        self.rma()?.get(dst, src, desc, pe, Route::Auto)
    }

    /// the destination is local symmetric memory, valid once [ShmemContext::quiet] returns
    pub fn get_nbi<T: ShmemType>(&self, dst: SymmPtr<T>, src: SymmPtr<T>, pe: usize) -> ShmemResult<()> {
        self.rma()?.get_symm(dst, src, pe, Route::Auto, true)
    }

    /// non-contiguous put, `desc` counts elements
    pub fn put_strided<T: ShmemType>(&self, dst: SymmPtr<T>, src: &[T], desc: StrideDesc, pe: usize) -> ShmemResult<()> {
        self.rma()?.put(dst, src, desc, pe, Route::Auto, false)
    }

    pub fn put_strided_nbi<T: ShmemType>(
        &self,
        dst: SymmPtr<T>,
        src: &[T],
        desc: StrideDesc,
        pe: usize,
    ) -> ShmemResult<()> {
        self.rma()?.put(dst, src, desc, pe, Route::Auto, true)
    }

    /// non-contiguous get, `desc.src_stride` applies to the remote side
    pub fn get_strided<T: ShmemType>(&self, dst: &mut [T], src: SymmPtr<T>, desc: StrideDesc, pe: usize) -> ShmemResult<()> {
        self.rma()?.get(dst, src, desc, pe, Route::Auto)
    }

    /// put through the bulk DMA queues, a silent no-op outside the DMA domain
    pub fn put_dma<T: ShmemType>(&self, dst: SymmPtr<T>, src: &[T], pe: usize) -> ShmemResult<()> {
        self.rma()?.put(dst, src, StrideDesc::contiguous(src.len()), pe, Route::Dma, false)
    }

    pub fn put_dma_nbi<T: ShmemType>(&self, dst: SymmPtr<T>, src: &[T], pe: usize) -> ShmemResult<()> {
        self.rma()?.put(dst, src, StrideDesc::contiguous(src.len()), pe, Route::Dma, true)
    }

    pub fn get_dma<T: ShmemType>(&self, dst: &mut [T], src: SymmPtr<T>, pe: usize) -> ShmemResult<()> {
        let desc = StrideDesc::contiguous(dst.len());
        self.rma()?.get(dst, src, desc, pe, Route::Dma)
    }

    pub fn get_dma_nbi<T: ShmemType>(&self, dst: SymmPtr<T>, src: SymmPtr<T>, pe: usize) -> ShmemResult<()> {
        self.rma()?.get_symm(dst, src, pe, Route::Dma, true)
    }

    /// byte oriented put to a symmetric address
    pub fn putmem(&self, dst: GlobalAddr, src: &[u8], pe: usize) -> ShmemResult<()> {
        self.put(SymmPtr::from_raw_parts(dst, src.len()), src, pe)
    }

    pub fn putmem_nbi(&self, dst: GlobalAddr, src: &[u8], pe: usize) -> ShmemResult<()> {
        self.put_nbi(SymmPtr::from_raw_parts(dst, src.len()), src, pe)
    }

    pub fn getmem(&self, dst: &mut [u8], src: GlobalAddr, pe: usize) -> ShmemResult<()> {
        let src = SymmPtr::from_raw_parts(src, dst.len());
        self.get(dst, src, pe)
    }

    /// fetch-free remote add of one element
    pub fn atomic_add<T: AtomicAdd>(&self, dst: SymmPtr<T>, value: T, pe: usize) -> ShmemResult<()> {
        self.rma()?.atomic_add(dst, value, pe)
    }

    //#################################################
    // signals
    //#################################################

    pub fn signal_op(&self, sig: SymmPtr<i32>, value: i32, op: SignalOp, pe: usize) -> ShmemResult<()> {
        self.rma()?.signal_op(sig, value, op, pe)
    }

    /// current value of a local signal word
    pub fn signal_fetch(&self, sig: SymmPtr<i32>) -> ShmemResult<i32> {
        Ok(self.words(sig.slice(0, 1))?.load(0))
    }

    pub fn put_signal<T: ShmemType>(
        &self,
        dst: SymmPtr<T>,
        src: &[T],
        sig: SymmPtr<i32>,
        value: i32,
        op: SignalOp,
        pe: usize,
    ) -> ShmemResult<()> {
        self.rma()?.put_signal(dst, src, sig, value, op, pe, false)
    }

    pub fn put_signal_nbi<T: ShmemType>(
        &self,
        dst: SymmPtr<T>,
        src: &[T],
        sig: SymmPtr<i32>,
        value: i32,
        op: SignalOp,
        pe: usize,
    ) -> ShmemResult<()> {
        self.rma()?.put_signal(dst, src, sig, value, op, pe, true)
    }

    /// wait on a local signal word, returns the value that satisfied the comparison
    pub fn signal_wait_until(&self, sig: SymmPtr<i32>, cmp: CmpOp, value: i32) -> ShmemResult<i32> {
        self.wait_until(sig.slice(0, 1), cmp, value)
    }

    //#################################################
    // point to point waits
    //#################################################

    /// wait until `ivar[0] cmp value` holds
    pub fn wait_until<T: AtomicWord>(&self, ivar: SymmPtr<T>, cmp: CmpOp, value: T) -> ShmemResult<T> {
        let st = self.state()?;
        let words = self.words(ivar.slice(0, 1))?;
        signal::wait_until(st.sync.policy(), &st.bootstrap, &words, 0, cmp, value)
    }

    pub fn test<T: AtomicWord>(&self, ivar: SymmPtr<T>, cmp: CmpOp, value: T) -> ShmemResult<bool> {
        let words = self.words(ivar.slice(0, 1))?;
        Ok(signal::test(&words, 0, cmp, value))
    }

    /// a non-zero `status` entry excludes its slot
    pub fn wait_until_all<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        value: T,
    ) -> ShmemResult<()> {
        let st = self.state()?;
        let words = self.words(ivars)?;
        signal::wait_until_all(st.sync.policy(), &st.bootstrap, &words, status, cmp, Target::All(value))
    }

    pub fn wait_until_all_vector<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        values: &[T],
    ) -> ShmemResult<()> {
        let st = self.state()?;
        let words = self.words(ivars)?;
        signal::wait_until_all(st.sync.policy(), &st.bootstrap, &words, status, cmp, Target::Each(values))
    }

    fn with_cursor<R>(&self, f: impl FnOnce(&mut usize) -> ShmemResult<R>) -> ShmemResult<R> {
        let st = self.state()?;
        let mut cursor = *st.cursor.lock();
        let res = f(&mut cursor);
        *st.cursor.lock() = cursor;
        res
    }

    /// index of one satisfied slot, `None` when every slot is excluded
    pub fn wait_until_any<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        value: T,
    ) -> ShmemResult<Option<usize>> {
        let st = self.state()?;
        let words = self.words(ivars)?;
        self.with_cursor(|cursor| {
            signal::wait_until_any(st.sync.policy(), &st.bootstrap, &words, status, cmp, Target::All(value), cursor)
        })
    }

    pub fn wait_until_any_vector<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        values: &[T],
    ) -> ShmemResult<Option<usize>> {
        let st = self.state()?;
        let words = self.words(ivars)?;
        self.with_cursor(|cursor| {
            signal::wait_until_any(st.sync.policy(), &st.bootstrap, &words, status, cmp, Target::Each(values), cursor)
        })
    }

    /// indices of every satisfied slot once at least one is, empty when every slot is excluded
    pub fn wait_until_some<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        value: T,
    ) -> ShmemResult<Vec<usize>> {
        let st = self.state()?;
        let words = self.words(ivars)?;
        self.with_cursor(|cursor| {
            signal::wait_until_some(st.sync.policy(), &st.bootstrap, &words, status, cmp, Target::All(value), cursor)
        })
    }

    pub fn wait_until_some_vector<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        values: &[T],
    ) -> ShmemResult<Vec<usize>> {
        let st = self.state()?;
        let words = self.words(ivars)?;
        self.with_cursor(|cursor| {
            signal::wait_until_some(st.sync.policy(), &st.bootstrap, &words, status, cmp, Target::Each(values), cursor)
        })
    }

    pub fn test_all<T: AtomicWord>(&self, ivars: SymmPtr<T>, status: Option<&[i32]>, cmp: CmpOp, value: T) -> ShmemResult<bool> {
        signal::test_all(&self.words(ivars)?, status, cmp, Target::All(value))
    }

    pub fn test_all_vector<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        values: &[T],
    ) -> ShmemResult<bool> {
        signal::test_all(&self.words(ivars)?, status, cmp, Target::Each(values))
    }

    pub fn test_any<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        value: T,
    ) -> ShmemResult<Option<usize>> {
        let words = self.words(ivars)?;
        self.with_cursor(|cursor| signal::test_any(&words, status, cmp, Target::All(value), cursor))
    }

    pub fn test_any_vector<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        values: &[T],
    ) -> ShmemResult<Option<usize>> {
        let words = self.words(ivars)?;
        self.with_cursor(|cursor| signal::test_any(&words, status, cmp, Target::Each(values), cursor))
    }

    pub fn test_some<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        value: T,
    ) -> ShmemResult<Vec<usize>> {
        let words = self.words(ivars)?;
        self.with_cursor(|cursor| signal::test_some(&words, status, cmp, Target::All(value), cursor))
    }

    pub fn test_some_vector<T: AtomicWord>(
        &self,
        ivars: SymmPtr<T>,
        status: Option<&[i32]>,
        cmp: CmpOp,
        values: &[T],
    ) -> ShmemResult<Vec<usize>> {
        let words = self.words(ivars)?;
        self.with_cursor(|cursor| signal::test_some(&words, status, cmp, Target::Each(values), cursor))
    }

    //#################################################
    // ordering and collectives
    //#################################################

    /// block until everything this PE issued is complete and visible
    pub fn quiet(&self) -> ShmemResult<()> {
        self.state()?.transport.quiet()
    }

    /// ordering cannot be separated from completion here, so this is a quiet
    pub fn fence(&self) -> ShmemResult<()> {
        self.quiet()
    }

    /// quiet, then the cross-device barrier over `team`
    pub fn barrier(&self, team: Team) -> ShmemResult<()> {
        self.state()?.barrier(team, true)
    }

    pub fn barrier_all(&self) -> ShmemResult<()> {
        self.barrier(Team::WORLD)
    }

    /// the barrier without draining outstanding traffic
    pub fn sync(&self, team: Team) -> ShmemResult<()> {
        self.state()?.barrier(team, false)
    }

    pub fn sync_all(&self) -> ShmemResult<()> {
        self.sync(Team::WORLD)
    }

    /// dissemination barrier with every signal routed through the network engine
    pub fn cross_host_barrier(&self, team: Team) -> ShmemResult<()> {
        self.state()?.cross_host_barrier(team)
    }

    /// drain network traffic to every member of `team`, then the cross-host barrier
    pub fn handle_wait(&self, team: Team) -> ShmemResult<()> {
        self.state()?.handle_wait(team)
    }

    //#################################################
    // stream forms
    //#################################################

    pub fn barrier_on_stream(&self, team: Team, stream: &dyn Stream) -> ShmemResult<()> {
        let st = self.state()?.clone();
        stream.enqueue(Box::new(move || Ok(st.barrier(team, true)?)))
    }

    pub fn barrier_all_on_stream(&self, stream: &dyn Stream) -> ShmemResult<()> {
        self.barrier_on_stream(Team::WORLD, stream)
    }

    pub fn sync_on_stream(&self, team: Team, stream: &dyn Stream) -> ShmemResult<()> {
        let st = self.state()?.clone();
        stream.enqueue(Box::new(move || Ok(st.barrier(team, false)?)))
    }

    pub fn sync_all_on_stream(&self, stream: &dyn Stream) -> ShmemResult<()> {
        self.sync_on_stream(Team::WORLD, stream)
    }

    pub fn quiet_on_stream(&self, stream: &dyn Stream) -> ShmemResult<()> {
        let st = self.state()?.clone();
        stream.enqueue(Box::new(move || Ok(st.transport.quiet()?)))
    }

    /// enqueue a blocking put of `src`
    pub fn put_on_stream<T: ShmemType>(&self, dst: SymmPtr<T>, src: Vec<T>, pe: usize, stream: &dyn Stream) -> ShmemResult<()> {
        let st = self.state()?.clone();
        stream.enqueue(Box::new(move || {
            let rma = Rma { st: &*st, core: 0 };
            Ok(rma.put(dst, &src, StrideDesc::contiguous(src.len()), pe, Route::Auto, false)?)
        }))
    }

    /// enqueue a blocking get into local symmetric memory
    pub fn get_on_stream<T: ShmemType>(&self, dst: SymmPtr<T>, src: SymmPtr<T>, pe: usize, stream: &dyn Stream) -> ShmemResult<()> {
        let st = self.state()?.clone();
        stream.enqueue(Box::new(move || {
            let rma = Rma { st: &*st, core: 0 };
            Ok(rma.get_symm(dst, src, pe, Route::Auto, false)?)
        }))
    }

    //#################################################
    // teams
    //#################################################

    /// Collective over `parent`. Members get the new team, others `Ok(None)`.
    pub fn split_strided(&self, parent: Team, start: usize, stride: usize, size: usize) -> ShmemResult<Option<Team>> {
        let st = self.state()?;
        st.teams
            .split_strided(parent, start, stride, size, |rec, mask| st.agree_team_mask(rec, mask))
    }

    /// Collective over `parent`, returns this PE's row (x) and column (y) team
    pub fn split_2d(&self, parent: Team, x_range: usize) -> ShmemResult<(Option<Team>, Option<Team>)> {
        let st = self.state()?;
        st.teams.split_2d(parent, x_range, |rec, mask| st.agree_team_mask(rec, mask))
    }

    /// `src_pe` of `src` as an index of `dst`, `None` if it is not a member
    pub fn translate_pe(&self, src: Team, src_pe: usize, dst: Team) -> Option<usize> {
        self.state().ok()?.teams.translate_pe(src, src_pe, dst)
    }

    pub fn team_my_pe(&self, team: Team) -> Option<usize> {
        self.state().ok()?.teams.get(team).ok().map(|t| t.mype)
    }

    pub fn team_n_pes(&self, team: Team) -> Option<usize> {
        self.state().ok()?.teams.get(team).ok().map(|t| t.size())
    }

    pub fn team_get_config(&self, team: Team) -> ShmemResult<TeamConfig> {
        Ok(self.state()?.teams.get(team)?.config)
    }

    /// the index stays retired, its sync slots are never handed to another team
    pub fn team_destroy(&self, team: Team) -> ShmemResult<()> {
        self.state()?.teams.destroy(team)
    }

    //#################################################
    // launches
    //#################################################

    /// Run `f` once on every compute core of this PE, concurrently. The first
    /// failing core's error is returned.
    pub fn launch<F>(&self, f: F) -> ShmemResult<()>
    where
        F: Fn(&CoreCtx<'_>) -> ShmemResult<()> + Sync,
    {
        let st: &ShmemState = self.state()?;
        let num_cores = st.sync.num_cores();
        launch_cores(num_cores, |core| {
            f(&CoreCtx {
                rma: Rma { st, core },
                num_cores,
            })
        })
    }

    //#################################################
    // lifecycle
    //#################################################

    /// change the link engine scratch buffer size and event id
    pub fn set_mte_config(&self, ub_size: usize, event_id: u64) -> ShmemResult<()> {
        let st = self.state()?;
        if let Some(link) = st.transport.link() {
            link.set_mte_config(ub_size, event_id)?;
        }
        *st.mte.write() = MteConfig { ub_size, event_id };
        Ok(())
    }

    pub fn mte_config(&self) -> ShmemResult<MteConfig> {
        Ok(*self.state()?.mte.read())
    }

    /// best effort abort: every PE blocked in a wait or barrier returns `GlobalExit(status)`
    pub fn global_exit(&self, status: i32) -> ShmemResult<()> {
        let st = self.state()?;
        warn!("pe {} raised global exit with status {}", self.my_pe, status);
        st.bootstrap.global_exit(status);
        Ok(())
    }

    /// Collective teardown, the context is unusable afterwards
    pub fn finalize(&mut self) -> ShmemResult<()> {
        let st = self.state.take().ok_or(ShmemError::NotInitialized)?;
        st.finalize()
    }
}

impl Drop for ShmemContext {
    fn drop(&mut self) {
        if let Some(st) = self.state.take() {
            if let Err(e) = st.finalize() {
                warn!("pe {} finalize on drop failed: {}", self.my_pe, e);
            }
        }
    }
}

/// One compute core's view inside [ShmemContext::launch]
pub struct CoreCtx<'a> {
    rma: Rma<'a>,
    num_cores: usize,
}

impl<'a> CoreCtx<'a> {
    pub fn core(&self) -> usize {
        self.rma.core
    }

    pub fn num_cores(&self) -> usize {
        self.num_cores
    }

    pub fn my_pe(&self) -> usize {
        self.rma.st.my_pe
    }

    pub fn n_pes(&self) -> usize {
        self.rma.st.n_pes
    }

    pub fn put<T: ShmemType>(&self, dst: SymmPtr<T>, src: &[T], pe: usize) -> ShmemResult<()> {
        self.rma.put(dst, src, StrideDesc::contiguous(src.len()), pe, Route::Auto, false)
    }

    pub fn put_nbi<T: ShmemType>(&self, dst: SymmPtr<T>, src: &[T], pe: usize) -> ShmemResult<()> {
        self.rma.put(dst, src, StrideDesc::contiguous(src.len()), pe, Route::Auto, true)
    }

    pub fn get_nbi<T: ShmemType>(&self, dst: SymmPtr<T>, src: SymmPtr<T>, pe: usize) -> ShmemResult<()> {
        self.rma.get_symm(dst, src, pe, Route::Auto, true)
    }

    pub fn atomic_add<T: AtomicAdd>(&self, dst: SymmPtr<T>, value: T, pe: usize) -> ShmemResult<()> {
        self.rma.atomic_add(dst, value, pe)
    }

    pub fn signal_op(&self, sig: SymmPtr<i32>, value: i32, op: SignalOp, pe: usize) -> ShmemResult<()> {
        self.rma.signal_op(sig, value, op, pe)
    }

    pub fn quiet(&self) -> ShmemResult<()> {
        self.rma.st.transport.quiet()
    }

    /// synchronise the cores of this PE only
    pub fn core_barrier(&self) -> ShmemResult<()> {
        self.rma.st.sync.core_barrier(self.rma.core, &self.rma.st.bootstrap)
    }

    /// this core's share of the cross-device barrier, every core must call it
    pub fn barrier(&self, team: Team) -> ShmemResult<()> {
        self.quiet()?;
        self.sync(team)
    }

    pub fn sync(&self, team: Team) -> ShmemResult<()> {
        let st = self.rma.st;
        let record = st.teams.get(team)?;
        st.sync.device_barrier(self.rma.core, &record, &st.transport, &st.bootstrap)
    }
}
