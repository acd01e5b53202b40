//! The link copy engine.
//!
//! Data moves through a bounded per-core scratch buffer. The buffer is split in
//! two halves that alternate between the load stage (source into scratch) and
//! the store stage (scratch into destination); per-half event flags hand a half
//! from one stage to the other. When a transfer spans more than one chunk the
//! store stage runs on its own scoped thread so the two stages overlap.

use std::ptr::NonNull;
use std::sync::atomic::{fence, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::{AtomicFn, EngineCtx, LocalBuf, RmaEngine, SendPtr, Xfer};
use crate::addr::{GlobalAddr, ScratchOffset, StrideDesc};
use crate::error::{ShmemError, ShmemResult};
use crate::heap::{round_up, PeerTable};

/// rows staged for a strided transfer start on this boundary
const ROW_ALIGN: usize = 32;
/// scratch buffers never shrink below this
const MIN_SCRATCH: usize = 2 * ROW_ALIGN;

/// A one-shot handoff between the two pipeline stages
#[derive(Default)]
struct EventFlag {
    set: Mutex<bool>,
    cvar: Condvar,
}

impl EventFlag {
    fn set(&self) {
        *self.set.lock() = true;
        self.cvar.notify_one();
    }
    /// block until set, then consume it
    fn wait(&self) {
        let mut set = self.set.lock();
        while !*set {
            self.cvar.wait(&mut set);
        }
        *set = false;
    }
    fn reset(&self) {
        *self.set.lock() = false;
    }
}

struct Scratch {
    buf: Vec<u8>,
    /// load of half `h` finished, store may start
    mte2_mte3: [EventFlag; 2],
    /// store of half `h` finished, the half may be refilled
    mte3_mte2: [EventFlag; 2],
}

impl Scratch {
    fn new(size: usize) -> Scratch {
        Scratch {
            buf: vec![0; size.max(MIN_SCRATCH)],
            mte2_mte3: Default::default(),
            mte3_mte2: Default::default(),
        }
    }
    fn half(&self) -> usize {
        self.buf.len() / 2
    }
}

/// one contiguous piece of a chunk and where it sits in the scratch half
struct Piece {
    src: SendPtr,
    dst: SendPtr,
    len: usize,
    at: ScratchOffset,
}

type Chunk = Vec<Piece>;

/// cut a (possibly strided) byte transfer into chunks that fit one scratch half
fn plan(src: NonNull<u8>, dst: NonNull<u8>, desc: &StrideDesc, half: usize, elem_size: usize) -> Vec<Chunk> {
    let elem_size = elem_size.max(1);
    let chunk_bytes = ((half / elem_size) * elem_size).max(elem_size);
    let dense = desc.repeat <= 1 || (desc.src_stride == desc.length && desc.dst_stride == desc.length);
    let mut chunks = vec![];
    let split_row = |src: *mut u8, dst: *mut u8, len: usize, chunks: &mut Vec<Chunk>| {
        let mut done = 0;
        while done < len {
            let n = chunk_bytes.min(len - done);
            if let (Some(s), Some(d)) = (NonNull::new(src.wrapping_add(done)), NonNull::new(dst.wrapping_add(done))) {
                chunks.push(vec![Piece {
                    src: SendPtr(s),
                    dst: SendPtr(d),
                    len: n,
                    at: ScratchOffset(0),
                }]);
            }
            done += n;
        }
    };
    if dense {
        split_row(src.as_ptr(), dst.as_ptr(), desc.num_elems(), &mut chunks);
        return chunks;
    }
    let padded = round_up(desc.length, ROW_ALIGN);
    if padded > half {
        for row in 0..desc.repeat {
            split_row(
                src.as_ptr().wrapping_add(row * desc.src_stride),
                dst.as_ptr().wrapping_add(row * desc.dst_stride),
                desc.length,
                &mut chunks,
            );
        }
        return chunks;
    }
    let rows_per_chunk = (half / padded).max(1);
    let mut row = 0;
    while row < desc.repeat {
        let rows = rows_per_chunk.min(desc.repeat - row);
        let mut chunk = Vec::with_capacity(rows);
        for k in 0..rows {
            let r = row + k;
            if let (Some(s), Some(d)) = (
                NonNull::new(src.as_ptr().wrapping_add(r * desc.src_stride)),
                NonNull::new(dst.as_ptr().wrapping_add(r * desc.dst_stride)),
            ) {
                chunk.push(Piece {
                    src: SendPtr(s),
                    dst: SendPtr(d),
                    len: desc.length,
                    at: ScratchOffset(k * padded),
                });
            }
        }
        chunks.push(chunk);
        row += rows;
    }
    chunks
}

unsafe fn load(chunk: &Chunk, half: *mut u8) {
    for piece in chunk {
        std::ptr::copy(piece.src.as_ptr(), half.add(piece.at.0), piece.len);
    }
}

unsafe fn store(chunk: &Chunk, half: *const u8) {
    for piece in chunk {
        std::ptr::copy(half.add(piece.at.0), piece.dst.as_ptr(), piece.len);
    }
}

pub(crate) struct LinkEngine {
    ctx: EngineCtx,
    scratch: Vec<Mutex<Scratch>>,
    event_id: AtomicU64,
}

impl LinkEngine {
    pub(crate) fn new(ctx: EngineCtx, num_cores: usize, scratch_size: usize) -> LinkEngine {
        LinkEngine {
            ctx,
            scratch: (0..num_cores.max(1)).map(|_| Mutex::new(Scratch::new(scratch_size))).collect(),
            event_id: AtomicU64::new(0),
        }
    }

    /// change the scratch size and the event id used to order the stages
    pub(crate) fn set_mte_config(&self, ub_size: usize, event_id: u64) -> ShmemResult<()> {
        if ub_size < MIN_SCRATCH {
            return Err(ShmemError::InvalidValue(format!(
                "scratch size {} below the minimum of {} bytes",
                ub_size, MIN_SCRATCH
            )));
        }
        for scratch in &self.scratch {
            *scratch.lock() = Scratch::new(ub_size);
        }
        self.event_id.store(event_id, Ordering::Relaxed);
        trace!("link engine scratch {} bytes, event {}", ub_size, event_id);
        Ok(())
    }

    pub(crate) fn scratch_size(&self) -> usize {
        self.scratch[0].lock().buf.len()
    }

    fn copy(&self, core: usize, src: NonNull<u8>, dst: NonNull<u8>, desc: &StrideDesc, elem_size: usize) {
        let mut scratch = self.scratch[core % self.scratch.len()].lock();
        let half = scratch.half();
        let chunks = plan(src, dst, desc, half, elem_size);
        let base = scratch.buf.as_mut_ptr();
        let halves = [SendPtr(unsafe { NonNull::new_unchecked(base) }), SendPtr(unsafe {
            NonNull::new_unchecked(base.add(half))
        })];
        let scratch = &*scratch;
        if chunks.len() <= 1 {
            for chunk in &chunks {
                unsafe {
                    load(chunk, halves[0].as_ptr());
                    store(chunk, halves[0].as_ptr());
                }
            }
            return;
        }
        let chunks = &chunks;
        let res = crossbeam::thread::scope(|s| {
            s.spawn(move |_| {
                for (i, chunk) in chunks.iter().enumerate() {
                    let h = i % 2;
                    scratch.mte2_mte3[h].wait();
                    unsafe { store(chunk, halves[h].as_ptr()) };
                    scratch.mte3_mte2[h].set();
                }
            });
            for (i, chunk) in chunks.iter().enumerate() {
                let h = i % 2;
                if i >= 2 {
                    scratch.mte3_mte2[h].wait();
                }
                unsafe { load(chunk, halves[h].as_ptr()) };
                scratch.mte2_mte3[h].set();
            }
        });
        if res.is_err() {
            tracing::error!("link engine store stage panicked");
        }
        for h in 0..2 {
            scratch.mte2_mte3[h].reset();
            scratch.mte3_mte2[h].reset();
        }
    }
}

impl RmaEngine for LinkEngine {
    fn put(&self, x: &Xfer, src: &[u8], _nbi: bool) -> ShmemResult<()> {
        let extent = x.remote_extent(true);
        let (remote, local) = match (
            self.ctx.remote_ptr(x.remote, extent, x.pe, PeerTable::P2p),
            NonNull::new(src.as_ptr() as *mut u8),
        ) {
            (Some(remote), Some(local)) => (remote, local),
            _ => {
                trace!("link put to pe {} at {:x} has no mapping", x.pe, x.remote);
                return Ok(());
            }
        };
        self.copy(x.core, local, remote, &x.desc, x.elem_size);
        Ok(())
    }

    fn get(&self, x: &Xfer, dst: LocalBuf, _nbi: bool) -> ShmemResult<()> {
        let extent = x.remote_extent(false);
        let remote = match self.ctx.remote_ptr(x.remote, extent, x.pe, PeerTable::P2p) {
            Some(remote) => remote,
            None => {
                trace!("link get from pe {} at {:x} has no mapping", x.pe, x.remote);
                return Ok(());
            }
        };
        self.copy(x.core, remote, dst.ptr.0, &x.desc, x.elem_size);
        Ok(())
    }

    fn atomic(&self, remote: GlobalAddr, len: usize, pe: usize, op: AtomicFn, _core: usize) -> ShmemResult<()> {
        match self.ctx.remote_ptr(remote, len, pe, PeerTable::P2p) {
            Some(ptr) => op(ptr),
            None => trace!("link atomic to pe {} at {:x} has no mapping", pe, remote),
        }
        Ok(())
    }

    fn quiet(&self) -> ShmemResult<()> {
        fence(Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(v: &mut [u8]) -> NonNull<u8> {
        NonNull::new(v.as_mut_ptr()).unwrap()
    }

    #[test]
    fn contiguous_plan_respects_elem_size() {
        let mut src = vec![0u8; 100];
        let mut dst = vec![0u8; 100];
        // half of 30 bytes holds 7 u32s
        let chunks = plan(ptr(&mut src), ptr(&mut dst), &StrideDesc::contiguous(100), 30, 4);
        let lens: Vec<usize> = chunks.iter().map(|c| c[0].len).collect();
        assert_eq!(lens, vec![28, 28, 28, 16]);
    }

    #[test]
    fn strided_plan_pads_rows() {
        let mut src = vec![0u8; 64];
        let mut dst = vec![0u8; 64];
        let desc = StrideDesc::new(5, 4, 8, 12);
        let chunks = plan(ptr(&mut src), ptr(&mut dst), &desc, 64, 4);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 2);
        assert_eq!(chunks[0][1].at, ScratchOffset(32));
        assert_eq!(chunks[2].len(), 1);
    }

    #[test]
    fn event_flag_handoff() {
        let flag = EventFlag::default();
        crossbeam::thread::scope(|s| {
            s.spawn(|_| flag.set());
            flag.wait();
        })
        .unwrap();
        assert!(!*flag.set.lock());
    }
}
