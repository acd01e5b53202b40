use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, trace, warn};

use crate::bootstrap::{BootstrapOps, BootstrapResult};
use crate::config::config;
use crate::error::BootstrapError;

/// payload bytes each PE can publish per exchange step
const SLOT_BYTES: usize = 4096;
const READY: u64 = 0x5047_4153_424f_4f54;

/// Header of the rendezvous segment, followed by `num_pes` epochs, lengths and slots
#[repr(C)]
struct Header {
    ready: AtomicU64,
    exit_set: AtomicBool,
    exit_status: AtomicI32,
}

/// Rendezvous for PEs that are processes on one node.
///
/// PE 0 creates a shared memory object named after the job id, every other PE
/// attaches to it. A barrier is a monotonically increasing epoch per PE: a PE
/// publishes its epoch and waits until every epoch reached it, so nothing needs
/// resetting between rounds.
pub struct ShmemBootstrap {
    _shmem: Shmem,
    header: *const Header,
    epochs: *const AtomicU64,
    lens: *const AtomicUsize,
    slots: *mut u8,
    my_pe: usize,
    num_pes: usize,
    job_id: usize,
    epoch: AtomicU64,
    deadlock_timeout: Duration,
}

unsafe impl Sync for ShmemBootstrap {}
unsafe impl Send for ShmemBootstrap {}

impl std::fmt::Debug for ShmemBootstrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemBootstrap")
            .field("my_pe", &self.my_pe)
            .field("num_pes", &self.num_pes)
            .field("job_id", &self.job_id)
            .finish()
    }
}

fn segment_size(num_pes: usize) -> usize {
    std::mem::size_of::<Header>()
        + num_pes * std::mem::size_of::<AtomicU64>()
        + num_pes * std::mem::size_of::<AtomicUsize>()
        + num_pes * SLOT_BYTES
}

fn attach(id: &str, size: usize, create: bool) -> BootstrapResult<Shmem> {
    let timeout = Duration::from_secs_f64(config().deadlock_timeout);
    let start = Instant::now();
    loop {
        let res = if create {
            match ShmemConf::new().size(size).os_id(id).create() {
                Err(ShmemError::LinkExists) | Err(ShmemError::MappingIdExists) => {
                    warn!("rendezvous object {:?} already exists, reusing it", id);
                    ShmemConf::new().os_id(id).open()
                }
                res => res,
            }
        } else {
            ShmemConf::new().os_id(id).open()
        };
        match res {
            Ok(m) if m.len() >= size => return Ok(m),
            Ok(_) | Err(ShmemError::MapOpenFailed(_)) | Err(ShmemError::LinkDoesNotExist)
                if !create && start.elapsed() < timeout =>
            {
                std::thread::sleep(Duration::from_millis(1))
            }
            Ok(_) => return Err(BootstrapError::Closed),
            Err(e) => {
                warn!("unable to attach to rendezvous object {:?}: {:?}", id, e);
                return Err(BootstrapError::Closed);
            }
        }
    }
}

impl ShmemBootstrap {
    #[tracing::instrument(skip_all, level = "debug")]
    pub fn new(my_pe: usize, num_pes: usize, job_id: usize) -> BootstrapResult<ShmemBootstrap> {
        if my_pe >= num_pes {
            return Err(BootstrapError::InvalidPe(my_pe));
        }
        let id = format!("pgas_boot_{}_{}", job_id, num_pes);
        let size = segment_size(num_pes);
        let mut shmem = attach(&id, size, my_pe == 0)?;
        if my_pe != 0 {
            shmem.set_owner(false);
        }
        let base = shmem.as_ptr();
        let header = base as *const Header;
        if my_pe == 0 {
            unsafe {
                (*header).ready.store(0, Ordering::SeqCst);
                std::ptr::write_bytes(
                    base.add(std::mem::size_of::<u64>()),
                    0,
                    size - std::mem::size_of::<u64>(),
                );
                (*header).ready.store(READY ^ job_id as u64, Ordering::SeqCst);
            }
        }
        while unsafe { (*header).ready.load(Ordering::SeqCst) } != READY ^ job_id as u64 {
            std::thread::yield_now();
        }
        trace!("attached to rendezvous object {:?}", id);
        let epochs = unsafe { base.add(std::mem::size_of::<Header>()) } as *const AtomicU64;
        let lens = unsafe { (epochs as *mut u8).add(num_pes * std::mem::size_of::<AtomicU64>()) }
            as *const AtomicUsize;
        let slots = unsafe { (lens as *mut u8).add(num_pes * std::mem::size_of::<AtomicUsize>()) };
        let bootstrap = ShmemBootstrap {
            _shmem: shmem,
            header,
            epochs,
            lens,
            slots,
            my_pe,
            num_pes,
            job_id,
            epoch: AtomicU64::new(0),
            deadlock_timeout: Duration::from_secs_f64(config().deadlock_timeout),
        };
        bootstrap.barrier()?;
        debug!("pe {} joined rendezvous of {} pes", my_pe, num_pes);
        Ok(bootstrap)
    }

    fn epoch_of(&self, pe: usize) -> &AtomicU64 {
        unsafe { &*self.epochs.add(pe) }
    }
    fn len_of(&self, pe: usize) -> &AtomicUsize {
        unsafe { &*self.lens.add(pe) }
    }
    fn slot(&self, pe: usize) -> *mut u8 {
        unsafe { self.slots.add(pe * SLOT_BYTES) }
    }

    /// publish `chunk`, wait for everyone, read every slot, wait again before slots are reused
    fn exchange_chunk(&self, chunk: &[u8]) -> BootstrapResult<Vec<Vec<u8>>> {
        unsafe { std::ptr::copy_nonoverlapping(chunk.as_ptr(), self.slot(self.my_pe), chunk.len()) };
        self.len_of(self.my_pe).store(chunk.len(), Ordering::SeqCst);
        self.barrier()?;
        let all = (0..self.num_pes)
            .map(|pe| {
                let len = self.len_of(pe).load(Ordering::SeqCst);
                unsafe { std::slice::from_raw_parts(self.slot(pe), len) }.to_vec()
            })
            .collect();
        self.barrier()?;
        Ok(all)
    }
}

impl BootstrapOps for ShmemBootstrap {
    fn my_pe(&self) -> usize {
        self.my_pe
    }
    fn n_pes(&self) -> usize {
        self.num_pes
    }
    fn barrier(&self) -> BootstrapResult<()> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.epoch_of(self.my_pe).store(epoch, Ordering::SeqCst);
        let timeout = self.deadlock_timeout;
        let mut timer = Instant::now();
        for pe in 0..self.num_pes {
            while self.epoch_of(pe).load(Ordering::SeqCst) < epoch {
                if let Some(status) = self.exit_status() {
                    return Err(BootstrapError::GlobalExit(status));
                }
                if timer.elapsed() > timeout {
                    warn!(
                        "potential deadlock detected in rendezvous barrier, pe {} waiting on pe {}",
                        self.my_pe, pe
                    );
                    timer = Instant::now();
                }
                std::thread::yield_now();
            }
        }
        Ok(())
    }
    fn allgather(&self, data: &[u8]) -> BootstrapResult<Vec<u8>> {
        let sizes = self.exchange_chunk(&(data.len() as u64).to_le_bytes())?;
        if let Some(size) = sizes.iter().find(|s| s.as_slice() != (data.len() as u64).to_le_bytes()) {
            let mut word = [0u8; 8];
            word.copy_from_slice(&size[..8.min(size.len())]);
            return Err(BootstrapError::SizeMismatch {
                expected: data.len(),
                found: u64::from_le_bytes(word) as usize,
            });
        }
        let mut per_pe: Vec<Vec<u8>> = vec![Vec::with_capacity(data.len()); self.num_pes];
        let mut offset = 0;
        loop {
            let end = (offset + SLOT_BYTES).min(data.len());
            let chunks = self.exchange_chunk(&data[offset..end])?;
            for (pe, chunk) in chunks.into_iter().enumerate() {
                per_pe[pe].extend_from_slice(&chunk);
            }
            offset = end;
            if offset >= data.len() {
                break;
            }
        }
        Ok(per_pe.concat())
    }
    fn broadcast(&self, data: &[u8], root: usize) -> BootstrapResult<Vec<u8>> {
        if root >= self.num_pes {
            return Err(BootstrapError::InvalidPe(root));
        }
        let len_bytes = (data.len() as u64).to_le_bytes();
        let lens = self.exchange_chunk(if self.my_pe == root { &len_bytes } else { &[] })?;
        let mut word = [0u8; 8];
        word.copy_from_slice(&lens[root]);
        let total = u64::from_le_bytes(word) as usize;
        let mut res = Vec::with_capacity(total);
        while res.len() < total {
            let start = res.len();
            let end = (start + SLOT_BYTES).min(total);
            let chunk: &[u8] = if self.my_pe == root { &data[start..end] } else { &[] };
            let chunks = self.exchange_chunk(chunk)?;
            res.extend_from_slice(&chunks[root]);
        }
        Ok(res)
    }
    fn global_exit(&self, status: i32) {
        warn!("pe {} raised global exit with status {}", self.my_pe, status);
        unsafe {
            (*self.header).exit_status.store(status, Ordering::SeqCst);
            (*self.header).exit_set.store(true, Ordering::SeqCst);
        }
    }
    fn exit_status(&self) -> Option<i32> {
        let header = unsafe { &*self.header };
        if header.exit_set.load(Ordering::SeqCst) {
            Some(header.exit_status.load(Ordering::SeqCst))
        } else {
            None
        }
    }
    fn set_deadlock_timeout(&mut self, timeout: Duration) {
        self.deadlock_timeout = timeout;
    }
}
