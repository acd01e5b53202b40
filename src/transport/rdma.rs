//! The one-sided network engine.
//!
//! At setup every peer heap is registered as a memory region: the peer's
//! exported backing is mapped into a separate network window and the heap's
//! rdma table points into that window. Work requests are posted onto a per-peer
//! queue pair and executed in order by one engine worker; an outstanding
//! counter per peer (and one overall) tracks what `quiet` has to drain.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use super::{strided_copy, AtomicFn, EngineCtx, LocalBuf, RmaEngine, SendPtr, Xfer};
use crate::addr::{GlobalAddr, StrideDesc};
use crate::driver::MemDriver;
use crate::error::{ShmemError, ShmemResult};
use crate::heap::PeerTable;

#[derive(Debug, Default)]
struct QueuePair {
    sq_head: u64,
    sq_tail: u64,
    /// completions observed
    cq: u64,
}

enum WrOp {
    /// packed payload scattered with `desc.dst_stride`
    Write { dst: SendPtr, data: Vec<u8>, desc: StrideDesc },
    Read { src: SendPtr, dst: SendPtr, desc: StrideDesc },
    Atomic { ptr: SendPtr, op: AtomicFn },
}

struct WorkRequest {
    pe: usize,
    op: WrOp,
}

struct Completion {
    qps: Vec<Mutex<QueuePair>>,
    per_pe: Vec<AtomicUsize>,
    total: Mutex<usize>,
    cvar: Condvar,
}

impl Completion {
    fn complete(&self, pe: usize) {
        {
            let mut qp = self.qps[pe].lock();
            qp.sq_head += 1;
            qp.cq += 1;
        }
        self.per_pe[pe].fetch_sub(1, Ordering::AcqRel);
        let mut total = self.total.lock();
        *total -= 1;
        self.cvar.notify_all();
    }
}

/// the network window of one heap kind
struct Window {
    base: GlobalAddr,
    mapped: Vec<GlobalAddr>,
}

pub(crate) struct RdmaEngine {
    ctx: EngineCtx,
    completion: Arc<Completion>,
    sender: Mutex<Option<Sender<WorkRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    windows: Mutex<Vec<Window>>,
}

impl RdmaEngine {
    /// register every peer heap and start the engine worker
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn new(ctx: EngineCtx) -> ShmemResult<RdmaEngine> {
        let num_pes = ctx.num_pes;
        let completion = Arc::new(Completion {
            qps: (0..num_pes).map(|_| Mutex::new(QueuePair::default())).collect(),
            per_pe: (0..num_pes).map(|_| AtomicUsize::new(0)).collect(),
            total: Mutex::new(0),
            cvar: Condvar::new(),
        });
        let (sender, receiver) = unbounded::<WorkRequest>();
        let worker_completion = completion.clone();
        let my_pe = ctx.my_pe;
        let worker = std::thread::spawn(move || {
            for wr in receiver.iter() {
                unsafe {
                    match wr.op {
                        WrOp::Write { dst, data, desc } => strided_copy(data.as_ptr(), dst.as_ptr(), &desc),
                        WrOp::Read { src, dst, desc } => strided_copy(src.as_ptr(), dst.as_ptr(), &desc),
                        WrOp::Atomic { ptr, op } => op(ptr.0),
                    }
                }
                worker_completion.complete(wr.pe);
            }
            trace!("pe {} rdma worker exiting", my_pe);
        });
        let engine = RdmaEngine {
            ctx,
            completion,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            windows: Mutex::new(vec![]),
        };
        if let Err(e) = engine.register() {
            engine.shutdown();
            return Err(e);
        }
        Ok(engine)
    }

    fn register(&self) -> ShmemResult<()> {
        let driver = &self.ctx.driver;
        for heap in self.ctx.heaps.iter() {
            let base = driver.reserve_range(heap.aligned_size() * self.ctx.num_pes)?;
            self.windows.lock().push(Window { base, mapped: vec![] });
            let handles = heap.peer_handles();
            for (pe, blob) in handles.iter().enumerate() {
                if pe == self.ctx.my_pe {
                    continue;
                }
                let region = driver.import_handle(blob)?;
                let at = base.byte_add(pe * heap.aligned_size());
                driver.map(at, &region)?;
                if let Some(window) = self.windows.lock().last_mut() {
                    window.mapped.push(at);
                }
                heap.set_rdma_base(pe, at);
            }
            debug!(
                "pe {} registered {} {:?} regions at {:x}",
                self.ctx.my_pe,
                handles.len().saturating_sub(1),
                heap.kind(),
                base
            );
        }
        Ok(())
    }

    fn post(&self, pe: usize, op: WrOp) -> ShmemResult<()> {
        self.completion.qps[pe].lock().sq_tail += 1;
        self.completion.per_pe[pe].fetch_add(1, Ordering::AcqRel);
        *self.completion.total.lock() += 1;
        let sent = match self.sender.lock().as_ref() {
            Some(sender) => sender.send(WorkRequest { pe, op }).is_ok(),
            None => false,
        };
        if !sent {
            self.completion.qps[pe].lock().sq_tail -= 1;
            self.completion.per_pe[pe].fetch_sub(1, Ordering::AcqRel);
            *self.completion.total.lock() -= 1;
            return Err(ShmemError::Inner("rdma engine shut down".to_owned()));
        }
        Ok(())
    }

    /// `done` is checked with the overall outstanding count held
    fn drain<F: Fn(usize) -> bool>(&self, what: &str, done: F) {
        let timeout = self.ctx.deadlock_timeout;
        let mut start = Instant::now();
        let mut total = self.completion.total.lock();
        while !done(*total) {
            self.completion.cvar.wait_for(&mut total, Duration::from_millis(10));
            if start.elapsed() > timeout {
                warn!(
                    "pe {} waiting on {} outstanding rdma requests ({}) for {:?}, potential deadlock",
                    self.ctx.my_pe, *total, what, timeout
                );
                start = Instant::now();
            }
        }
    }

    /// block until every request towards `pe` has completed
    pub(crate) fn quiet_pe(&self, pe: usize) -> ShmemResult<()> {
        if pe >= self.completion.per_pe.len() {
            return Err(ShmemError::InvalidParam(format!("pe {} out of range", pe)));
        }
        self.drain("single pe", |_| self.completion.per_pe[pe].load(Ordering::Acquire) == 0);
        let qp = self.completion.qps[pe].lock();
        trace!(
            "pe {} drained qp to pe {}: head {} tail {} cq {}",
            self.ctx.my_pe,
            pe,
            qp.sq_head,
            qp.sq_tail,
            qp.cq
        );
        Ok(())
    }

    pub(crate) fn outstanding(&self) -> usize {
        *self.completion.total.lock()
    }

    /// stop the worker after the queued requests ran, then drop the registrations
    pub(crate) fn shutdown(&self) {
        trace!("pe {} rdma shutdown with {} requests in flight", self.ctx.my_pe, self.outstanding());
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("pe {} rdma worker panicked", self.ctx.my_pe);
            }
        }
        let driver = &self.ctx.driver;
        for window in self.windows.lock().drain(..) {
            for at in window.mapped {
                if let Err(e) = driver.unmap(at) {
                    warn!("pe {} failed to unmap rdma region {:x}: {}", self.ctx.my_pe, at, e);
                }
            }
            if let Err(e) = driver.release_range(window.base) {
                warn!("pe {} failed to release rdma window {:x}: {}", self.ctx.my_pe, window.base, e);
            }
        }
    }

    fn region(&self, addr: GlobalAddr, len: usize, pe: usize) -> Option<NonNull<u8>> {
        self.ctx.remote_ptr(addr, len, pe, PeerTable::Rdma)
    }
}

impl RmaEngine for RdmaEngine {
    fn put(&self, x: &Xfer, src: &[u8], nbi: bool) -> ShmemResult<()> {
        let dst = match self.region(x.remote, x.remote_extent(true), x.pe) {
            Some(dst) => dst,
            None => {
                trace!("rdma put to pe {} at {:x} has no region", x.pe, x.remote);
                return Ok(());
            }
        };
        let mut data = Vec::with_capacity(x.desc.num_elems());
        for row in 0..x.desc.repeat {
            let s = row * x.desc.src_stride;
            data.extend_from_slice(&src[s..s + x.desc.length]);
        }
        let desc = StrideDesc::new(x.desc.repeat, x.desc.length, x.desc.length, x.desc.dst_stride);
        self.post(x.pe, WrOp::Write { dst: SendPtr(dst), data, desc })?;
        if !nbi {
            self.quiet_pe(x.pe)?;
        }
        Ok(())
    }

    fn get(&self, x: &Xfer, dst: LocalBuf, nbi: bool) -> ShmemResult<()> {
        let src = match self.region(x.remote, x.remote_extent(false), x.pe) {
            Some(src) => src,
            None => {
                trace!("rdma get from pe {} at {:x} has no region", x.pe, x.remote);
                return Ok(());
            }
        };
        self.post(
            x.pe,
            WrOp::Read {
                src: SendPtr(src),
                dst: dst.ptr,
                desc: x.desc,
            },
        )?;
        if !nbi {
            self.quiet_pe(x.pe)?;
        }
        Ok(())
    }

    fn atomic(&self, remote: GlobalAddr, len: usize, pe: usize, op: AtomicFn, _core: usize) -> ShmemResult<()> {
        match self.region(remote, len, pe) {
            Some(ptr) => self.post(pe, WrOp::Atomic { ptr: SendPtr(ptr), op }),
            None => {
                trace!("rdma atomic to pe {} at {:x} has no region", pe, remote);
                Ok(())
            }
        }
    }

    fn quiet(&self) -> ShmemResult<()> {
        self.drain("all pes", |total| total == 0);
        Ok(())
    }
}

impl Drop for RdmaEngine {
    fn drop(&mut self) {
        drop(self.sender.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}
