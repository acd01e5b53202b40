//! The bulk DMA queue engine.
//!
//! A transfer is cut into block sized descriptors that are pushed onto the
//! issuing core's bounded submission queue, followed by a flag descriptor. The
//! doorbell hands the queued descriptors to the engine worker. Completion is
//! observed by copying the remote flag into the local one until it shows the
//! expected ticket. Tickets only grow, so a flag that lands late can never
//! vouch for a later transfer. Polling device memory is bounded; a get into a
//! host buffer polls until its ticket shows, since the worker writes into the
//! caller's slice.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::{trace, warn};

use super::{AtomicFn, EngineCtx, LocalBuf, RmaEngine, SendPtr, Xfer};
use crate::addr::GlobalAddr;
use crate::error::{ShmemError, ShmemResult};
use crate::heap::PeerTable;

enum Source {
    /// snapshot of host memory taken at issue time
    Owned(Vec<u8>),
    Ptr(SendPtr),
}

/// a submission queue entry
enum Sqe {
    Copy { src: Source, dst: SendPtr, len: usize },
    Atomic { ptr: SendPtr, op: AtomicFn },
    Flag { flag: Arc<AtomicU64>, ticket: u64 },
}

impl Sqe {
    fn execute(self) {
        match self {
            Sqe::Copy { src, dst, len } => unsafe {
                match src {
                    Source::Owned(data) => std::ptr::copy(data.as_ptr(), dst.as_ptr(), len),
                    Source::Ptr(src) => std::ptr::copy(src.as_ptr(), dst.as_ptr(), len),
                }
            },
            Sqe::Atomic { ptr, op } => op(ptr.0),
            Sqe::Flag { flag, ticket } => flag.store(ticket, Ordering::Release),
        }
    }
}

struct CoreQueue {
    sq: Vec<Sqe>,
    /// last ticket handed out
    issued: u64,
}

struct CoreFlags {
    /// written by the engine when a flag descriptor executes
    remote: Arc<AtomicU64>,
    /// the poller's copy
    local: AtomicU64,
}

pub(crate) struct DmaEngine {
    ctx: EngineCtx,
    block_size: usize,
    depth: usize,
    poll_cap: u64,
    queues: Vec<Mutex<CoreQueue>>,
    flags: Vec<CoreFlags>,
    doorbell: Mutex<Option<Sender<Vec<Sqe>>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DmaEngine {
    pub(crate) fn new(ctx: EngineCtx, num_cores: usize, block_size: usize, depth: usize, poll_cap: u64) -> DmaEngine {
        let (sender, receiver) = unbounded::<Vec<Sqe>>();
        let my_pe = ctx.my_pe;
        let worker = std::thread::spawn(move || {
            for batch in receiver.iter() {
                for sqe in batch {
                    sqe.execute();
                }
            }
            trace!("pe {} dma worker exiting", my_pe);
        });
        let num_cores = num_cores.max(1);
        DmaEngine {
            ctx,
            block_size: block_size.max(1),
            depth: depth.max(2),
            poll_cap,
            queues: (0..num_cores)
                .map(|_| {
                    Mutex::new(CoreQueue {
                        sq: Vec::with_capacity(depth),
                        issued: 0,
                    })
                })
                .collect(),
            flags: (0..num_cores)
                .map(|_| CoreFlags {
                    remote: Arc::new(AtomicU64::new(0)),
                    local: AtomicU64::new(0),
                })
                .collect(),
            doorbell: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    fn ring(&self, queue: &mut CoreQueue) -> ShmemResult<()> {
        if queue.sq.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut queue.sq);
        match self.doorbell.lock().as_ref() {
            Some(doorbell) => doorbell
                .send(batch)
                .map_err(|_| ShmemError::Inner("dma worker exited".to_owned())),
            None => Err(ShmemError::Inner("dma engine shut down".to_owned())),
        }
    }

    fn push(&self, queue: &mut CoreQueue, sqe: Sqe) -> ShmemResult<()> {
        if queue.sq.len() >= self.depth {
            self.ring(queue)?;
        }
        queue.sq.push(sqe);
        Ok(())
    }

    /// queue the flag descriptor and ring the doorbell, returns the ticket to poll for
    fn submit(&self, core: usize, queue: &mut CoreQueue) -> ShmemResult<u64> {
        queue.issued += 1;
        let ticket = queue.issued;
        let flag = self.flags[core].remote.clone();
        self.push(queue, Sqe::Flag { flag, ticket })?;
        self.ring(queue)?;
        Ok(ticket)
    }

    /// copy the remote flag into the local one until it reaches `ticket`.
    /// With a `cap` the poll gives up after that many polls.
    fn poll(&self, core: usize, ticket: u64, cap: Option<u64>) {
        let flags = &self.flags[core];
        let mut polls = 0;
        loop {
            let seen = flags.remote.load(Ordering::Acquire);
            flags.local.store(seen, Ordering::Relaxed);
            if seen >= ticket {
                return;
            }
            polls += 1;
            if let Some(cap) = cap {
                if polls >= cap {
                    warn!(
                        "pe {} core {} abandoned dma completion poll after {} polls (ticket {} seen {})",
                        self.ctx.my_pe, core, polls, ticket, seen
                    );
                    return;
                }
            }
            if polls < 64 {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    fn core(&self, core: usize) -> usize {
        core % self.queues.len()
    }

    /// `host` marks a destination in caller owned host memory
    fn transfer(&self, core: usize, copies: Vec<(Source, SendPtr, usize)>, nbi: bool, host: bool) -> ShmemResult<()> {
        let core = self.core(core);
        let ticket = {
            let mut queue = self.queues[core].lock();
            for (src, dst, len) in copies {
                self.push(&mut queue, Sqe::Copy { src, dst, len })?;
            }
            self.submit(core, &mut queue)?
        };
        if !nbi {
            let cap = if host { None } else { Some(self.poll_cap) };
            self.poll(core, ticket, cap);
        }
        Ok(())
    }

    /// stop the worker once everything queued has executed
    pub(crate) fn shutdown(&self) {
        drop(self.doorbell.lock().take());
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("pe {} dma worker panicked", self.ctx.my_pe);
            }
        }
    }

    fn blocks(&self, len: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..len)
            .step_by(self.block_size)
            .map(move |start| (start, self.block_size.min(len - start)))
    }
}

impl RmaEngine for DmaEngine {
    fn put(&self, x: &Xfer, src: &[u8], nbi: bool) -> ShmemResult<()> {
        let extent = x.remote_extent(true);
        let remote = match self.ctx.remote_ptr(x.remote, extent, x.pe, PeerTable::Sdma) {
            Some(remote) => remote,
            None => {
                trace!("dma put to pe {} at {:x} has no mapping", x.pe, x.remote);
                return Ok(());
            }
        };
        let mut copies = vec![];
        for row in 0..x.desc.repeat {
            let s = row * x.desc.src_stride;
            let d = row * x.desc.dst_stride;
            for (start, len) in self.blocks(x.desc.length) {
                let data = src[s + start..s + start + len].to_vec();
                let dst = SendPtr(unsafe { std::ptr::NonNull::new_unchecked(remote.as_ptr().add(d + start)) });
                copies.push((Source::Owned(data), dst, len));
            }
        }
        self.transfer(x.core, copies, nbi, false)
    }

    fn get(&self, x: &Xfer, dst: LocalBuf, nbi: bool) -> ShmemResult<()> {
        let extent = x.remote_extent(false);
        let remote = match self.ctx.remote_ptr(x.remote, extent, x.pe, PeerTable::Sdma) {
            Some(remote) => remote,
            None => {
                trace!("dma get from pe {} at {:x} has no mapping", x.pe, x.remote);
                return Ok(());
            }
        };
        let mut copies = vec![];
        for row in 0..x.desc.repeat {
            let s = row * x.desc.src_stride;
            let d = row * x.desc.dst_stride;
            for (start, len) in self.blocks(x.desc.length) {
                unsafe {
                    let src = SendPtr(std::ptr::NonNull::new_unchecked(remote.as_ptr().add(s + start)));
                    let to = SendPtr(std::ptr::NonNull::new_unchecked(dst.ptr.as_ptr().add(d + start)));
                    copies.push((Source::Ptr(src), to, len));
                }
            }
        }
        self.transfer(x.core, copies, nbi, dst.host)
    }

    fn atomic(&self, remote: GlobalAddr, len: usize, pe: usize, op: AtomicFn, core: usize) -> ShmemResult<()> {
        let ptr = match self.ctx.remote_ptr(remote, len, pe, PeerTable::Sdma) {
            Some(ptr) => ptr,
            None => {
                trace!("dma atomic to pe {} at {:x} has no mapping", pe, remote);
                return Ok(());
            }
        };
        let core = self.core(core);
        let ticket = {
            let mut queue = self.queues[core].lock();
            self.push(&mut queue, Sqe::Atomic { ptr: SendPtr(ptr), op })?;
            self.submit(core, &mut queue)?
        };
        self.poll(core, ticket, Some(self.poll_cap));
        Ok(())
    }

    fn quiet(&self) -> ShmemResult<()> {
        for core in 0..self.queues.len() {
            let ticket = {
                let mut queue = self.queues[core].lock();
                self.ring(&mut queue)?;
                queue.issued
            };
            self.poll(core, ticket, Some(self.poll_cap));
        }
        Ok(())
    }
}

impl Drop for DmaEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
