//! RMA dispatch over the three data movement engines.
//!
//! Every request is expressed in bytes against a symmetric address in the
//! caller's view; the engine translates it through its own peer table. The
//! topology bitmap picks the engine: the link engine when the peer shares the
//! interconnect, otherwise the network engine. The DMA engine is only used when
//! asked for explicitly. A peer no engine can reach, or an address that does
//! not translate, turns the request into a silent no-op.

use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;

use enum_dispatch::enum_dispatch;
use tracing::trace;

use crate::addr::{GlobalAddr, StrideDesc};
use crate::driver::{Driver, MemDriver};
use crate::error::{ShmemError, ShmemResult};
use crate::heap::{Heaps, PeerTable};
use crate::topology::Topology;

pub(crate) mod dma;
pub(crate) mod link;
pub(crate) mod rdma;

pub(crate) use dma::DmaEngine;
pub(crate) use link::LinkEngine;
pub(crate) use rdma::RdmaEngine;

/// How a signal word is updated
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignalOp {
    /// plain store, no atomicity guarantee against concurrent updates
    Set,
    /// remote atomic add
    Add,
}

/// A raw pointer that may be handed to an engine worker thread
#[derive(Copy, Clone, Debug)]
pub(crate) struct SendPtr(pub(crate) NonNull<u8>);

unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// Local memory a get writes into. Either a host buffer borrowed for the
/// duration of a blocking call or local symmetric memory.
#[derive(Copy, Clone, Debug)]
pub(crate) struct LocalBuf {
    pub(crate) ptr: SendPtr,
    pub(crate) len: usize,
    /// a borrowed host slice, every write must land before the call returns
    pub(crate) host: bool,
}

impl LocalBuf {
    pub(crate) fn from_slice(buf: &mut [u8]) -> Option<LocalBuf> {
        Some(LocalBuf {
            ptr: SendPtr(NonNull::new(buf.as_mut_ptr())?),
            len: buf.len(),
            host: true,
        })
    }
    pub(crate) fn symmetric(ptr: NonNull<u8>, len: usize) -> LocalBuf {
        LocalBuf {
            ptr: SendPtr(ptr),
            len,
            host: false,
        }
    }
}

/// A type erased read-modify-write applied at the resolved remote address
pub(crate) type AtomicFn = Box<dyn FnOnce(NonNull<u8>) + Send>;

/// One transfer, all sizes in bytes
#[derive(Copy, Clone, Debug)]
pub(crate) struct Xfer {
    /// symmetric address in the caller's view
    pub(crate) remote: GlobalAddr,
    pub(crate) pe: usize,
    /// for a put `src` is the local side, for a get `src` is the remote side
    pub(crate) desc: StrideDesc,
    pub(crate) elem_size: usize,
    pub(crate) core: usize,
}

impl Xfer {
    pub(crate) fn contiguous(remote: GlobalAddr, pe: usize, len: usize, elem_size: usize, core: usize) -> Xfer {
        Xfer {
            remote,
            pe,
            desc: StrideDesc::contiguous(len),
            elem_size,
            core,
        }
    }
    pub(crate) fn remote_extent(&self, is_put: bool) -> usize {
        if is_put {
            self.desc.dst_extent()
        } else {
            self.desc.src_extent()
        }
    }
}

/// Copy `desc.repeat` rows of `desc.length` bytes.
///
/// # Safety
/// both sides must be valid for their extents and must not overlap
pub(crate) unsafe fn strided_copy(src: *const u8, dst: *mut u8, desc: &StrideDesc) {
    if desc.repeat == 1 || (desc.src_stride == desc.length && desc.dst_stride == desc.length) {
        std::ptr::copy(src, dst, desc.num_elems());
        return;
    }
    for row in 0..desc.repeat {
        std::ptr::copy(
            src.add(row * desc.src_stride),
            dst.add(row * desc.dst_stride),
            desc.length,
        );
    }
}

/// Shared by all engines: the local driver and the heap tables
#[derive(Clone)]
pub(crate) struct EngineCtx {
    pub(crate) my_pe: usize,
    pub(crate) num_pes: usize,
    pub(crate) driver: Arc<Driver>,
    pub(crate) heaps: Arc<Heaps>,
    /// a drain longer than this logs a potential deadlock
    pub(crate) deadlock_timeout: Duration,
}

impl EngineCtx {
    /// resolve `[addr, addr + len)` of `pe` through `table` to a pointer in this process
    pub(crate) fn remote_ptr(&self, addr: GlobalAddr, len: usize, pe: usize, table: PeerTable) -> Option<NonNull<u8>> {
        let remote = self.heaps.translate(addr, pe, table)?;
        self.driver.resolve(remote, len.max(1))
    }
    pub(crate) fn local_ptr(&self, addr: GlobalAddr, len: usize) -> Option<NonNull<u8>> {
        self.heaps.owning(addr)?;
        self.driver.resolve(addr, len.max(1))
    }
}

#[enum_dispatch]
pub(crate) trait RmaEngine {
    /// write `src` to the remote side of `x`; `nbi` only issues
    fn put(&self, x: &Xfer, src: &[u8], nbi: bool) -> ShmemResult<()>;
    /// read the remote side of `x` into `dst`; `nbi` only issues
    fn get(&self, x: &Xfer, dst: LocalBuf, nbi: bool) -> ShmemResult<()>;
    fn atomic(&self, remote: GlobalAddr, len: usize, pe: usize, op: AtomicFn, core: usize) -> ShmemResult<()>;
    /// block until everything issued through this engine is complete and visible
    fn quiet(&self) -> ShmemResult<()>;
}

#[enum_dispatch(RmaEngine)]
pub(crate) enum Engine {
    LinkEngine,
    DmaEngine,
    RdmaEngine,
}

pub(crate) struct Transport {
    my_pe: usize,
    topology: Topology,
    ctx: EngineCtx,
    link: Engine,
    dma: Engine,
    rdma: Engine,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("my_pe", &self.my_pe).finish()
    }
}

impl Transport {
    pub(crate) fn new(ctx: EngineCtx, topology: Topology, link: LinkEngine, dma: DmaEngine, rdma: RdmaEngine) -> Transport {
        Transport {
            my_pe: ctx.my_pe,
            topology,
            ctx,
            link: link.into(),
            dma: dma.into(),
            rdma: rdma.into(),
        }
    }

    /// the engine a peer is reached through, `None` when nothing reaches it
    pub(crate) fn route(&self, pe: usize) -> Option<&Engine> {
        let reach = self.topology.reach(pe);
        if reach.has_link() {
            Some(&self.link)
        } else if reach.has_rdma() {
            Some(&self.rdma)
        } else {
            None
        }
    }

    pub(crate) fn link(&self) -> Option<&LinkEngine> {
        match &self.link {
            Engine::LinkEngine(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn rdma(&self) -> Option<&RdmaEngine> {
        match &self.rdma {
            Engine::RdmaEngine(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn dma(&self) -> Option<&DmaEngine> {
        match &self.dma {
            Engine::DmaEngine(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn put(&self, x: &Xfer, src: &[u8], nbi: bool) -> ShmemResult<()> {
        match self.route(x.pe) {
            Some(engine) => engine.put(x, src, nbi),
            None => {
                trace!("pe {} unreachable from pe {}, put dropped", x.pe, self.my_pe);
                Ok(())
            }
        }
    }

    pub(crate) fn get(&self, x: &Xfer, dst: LocalBuf, nbi: bool) -> ShmemResult<()> {
        check_local(x, &dst)?;
        match self.route(x.pe) {
            Some(engine) => engine.get(x, dst, nbi),
            None => {
                trace!("pe {} unreachable from pe {}, get dropped", x.pe, self.my_pe);
                Ok(())
            }
        }
    }

    /// explicit bulk DMA put, a no-op for peers outside the DMA domain
    pub(crate) fn put_dma(&self, x: &Xfer, src: &[u8], nbi: bool) -> ShmemResult<()> {
        if !self.topology.reach(x.pe).has_dma() {
            trace!("pe {} outside the dma domain of pe {}, put dropped", x.pe, self.my_pe);
            return Ok(());
        }
        self.dma.put(x, src, nbi)
    }

    pub(crate) fn get_dma(&self, x: &Xfer, dst: LocalBuf, nbi: bool) -> ShmemResult<()> {
        check_local(x, &dst)?;
        if !self.topology.reach(x.pe).has_dma() {
            trace!("pe {} outside the dma domain of pe {}, get dropped", x.pe, self.my_pe);
            return Ok(());
        }
        self.dma.get(x, dst, nbi)
    }

    pub(crate) fn atomic(&self, remote: GlobalAddr, len: usize, pe: usize, op: AtomicFn, core: usize) -> ShmemResult<()> {
        match self.route(pe) {
            Some(engine) => engine.atomic(remote, len, pe, op, core),
            None => {
                trace!("pe {} unreachable from pe {}, atomic dropped", pe, self.my_pe);
                Ok(())
            }
        }
    }

    /// update a remote i32 signal word
    pub(crate) fn signal(&self, sig: GlobalAddr, value: i32, op: SignalOp, pe: usize, core: usize) -> ShmemResult<()> {
        self.atomic(sig, 4, pe, signal_fn(value, op), core)
    }

    /// signal store forced through the network engine (cross-host barrier)
    pub(crate) fn rdma_signal(&self, sig: GlobalAddr, value: i32, pe: usize, core: usize) -> ShmemResult<()> {
        if pe == self.my_pe || !self.topology.reach(pe).has_rdma() {
            return self.signal(sig, value, SignalOp::Set, pe, core);
        }
        self.rdma.atomic(sig, 4, pe, signal_fn(value, SignalOp::Set), core)
    }

    /// read a remote i32 word, re-fetched on every call
    pub(crate) fn fetch_i32(&self, addr: GlobalAddr, pe: usize, core: usize) -> ShmemResult<Option<i32>> {
        if pe == self.my_pe {
            return Ok(self
                .ctx
                .local_ptr(addr, 4)
                .map(|p| unsafe { <i32 as crate::types::AtomicWord>::load_raw(p.as_ptr()) }));
        }
        let mut word = [0u8; 4];
        let engine = match self.route(pe) {
            Some(engine) => engine,
            None => return Ok(None),
        };
        let dst = LocalBuf::from_slice(&mut word)
            .ok_or_else(|| ShmemError::Inner("empty signal word buffer".to_owned()))?;
        engine.get(&Xfer::contiguous(addr, pe, 4, 4, core), dst, false)?;
        Ok(Some(i32::from_ne_bytes(word)))
    }

    pub(crate) fn local_ptr(&self, addr: GlobalAddr, len: usize) -> Option<NonNull<u8>> {
        self.ctx.local_ptr(addr, len)
    }

    /// link fence, DMA completion poll, network drain
    pub(crate) fn quiet(&self) -> ShmemResult<()> {
        self.link.quiet()?;
        self.dma.quiet()?;
        self.rdma.quiet()
    }

    /// drain network traffic towards one peer
    pub(crate) fn rdma_quiet_pe(&self, pe: usize) -> ShmemResult<()> {
        match self.rdma() {
            Some(rdma) => rdma.quiet_pe(pe),
            None => Ok(()),
        }
    }

    /// stop engine workers and drop network registrations
    pub(crate) fn shutdown(&self) {
        if let Some(dma) = self.dma() {
            dma.shutdown();
        }
        if let Some(rdma) = self.rdma() {
            rdma.shutdown();
        }
    }
}

fn check_local(x: &Xfer, dst: &LocalBuf) -> ShmemResult<()> {
    if x.desc.dst_extent() > dst.len {
        return Err(ShmemError::InvalidParam(format!(
            "get of {} bytes into a {} byte buffer",
            x.desc.dst_extent(),
            dst.len
        )));
    }
    Ok(())
}

fn signal_fn(value: i32, op: SignalOp) -> AtomicFn {
    use crate::types::AtomicWord;
    match op {
        SignalOp::Set => Box::new(move |p: NonNull<u8>| unsafe { i32::store_raw(p.as_ptr(), value) }),
        SignalOp::Add => Box::new(move |p: NonNull<u8>| unsafe {
            i32::fetch_add_raw(p.as_ptr(), value);
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strided_copy_rows() {
        let src: Vec<u8> = (0..20).collect();
        let mut dst = vec![0u8; 12];
        // 3 rows of 2 bytes, every 5th byte in the source, every 4th in the destination
        let desc = StrideDesc::new(3, 2, 5, 4);
        unsafe { strided_copy(src.as_ptr(), dst.as_mut_ptr(), &desc) };
        assert_eq!(dst, vec![0, 1, 0, 0, 5, 6, 0, 0, 10, 11, 0, 0]);
    }

    #[test]
    fn gets_must_fit_the_local_buffer() {
        let mut word = [0u8; 4];
        let dst = LocalBuf::from_slice(&mut word).unwrap();
        assert!(dst.host);
        let x = Xfer::contiguous(GlobalAddr::new(0x1000), 1, 4, 4, 0);
        assert!(check_local(&x, &dst).is_ok());
        let x = Xfer::contiguous(GlobalAddr::new(0x1000), 1, 8, 4, 0);
        assert!(matches!(check_local(&x, &dst), Err(ShmemError::InvalidParam(_))));
    }

    #[test]
    fn contiguous_copy() {
        let src = [1u8, 2, 3, 4];
        let mut dst = [0u8; 4];
        unsafe { strided_copy(src.as_ptr(), dst.as_mut_ptr(), &StrideDesc::contiguous(4)) };
        assert_eq!(dst, src);
    }
}
