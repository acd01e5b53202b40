use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use shared_memory::{Shmem, ShmemConf, ShmemError};
use tracing::{debug, trace, warn};

use crate::addr::GlobalAddr;
use crate::driver::page_table::AddressSpace;
use crate::driver::{Backing, DriverResult, ExportedHandle, MemDriver, PhysHandle};
use crate::error::DriverError;

/// A POSIX shared memory object backing one physical allocation
pub(crate) struct ShmemSegment {
    shmem: Shmem,
}

unsafe impl Send for ShmemSegment {}
unsafe impl Sync for ShmemSegment {}

fn create_segment(size: usize, id: &str) -> DriverResult<Shmem> {
    match ShmemConf::new().size(size).os_id(id).create() {
        Ok(m) => {
            trace!("created {:?}", id);
            // fresh objects are zero filled by the OS
            Ok(m)
        }
        Err(ShmemError::LinkExists) | Err(ShmemError::MappingIdExists) => {
            // a stale object from an earlier job with the same id
            warn!("shared memory object {:?} already exists, reusing it", id);
            let m = ShmemConf::new()
                .os_id(id)
                .open()
                .map_err(|e| DriverError::ShmemError(format!("{:?} {:?}", id, e)))?;
            if m.len() < size {
                return Err(DriverError::AllocateFailed(size));
            }
            unsafe { std::ptr::write_bytes(m.as_ptr(), 0, size) };
            Ok(m)
        }
        Err(e) => Err(DriverError::ShmemError(format!("{:?} {:?}", id, e))),
    }
}

fn open_segment(id: &str) -> DriverResult<Shmem> {
    ShmemConf::new().os_id(id).open().map_err(|e| match e {
        ShmemError::MapOpenFailed(_) | ShmemError::LinkDoesNotExist => {
            DriverError::InvalidHandle(id.to_owned())
        }
        e => DriverError::ShmemError(format!("{:?} {:?}", id, e)),
    })
}

/// A driver for PEs that are processes on one node.
///
/// Physical allocations are shared memory objects; the exported handle is the
/// object's os id, which any process on the node can open and map.
pub struct ShmemDriver {
    job_id: usize,
    my_pe: usize,
    space: AddressSpace,
    alloc_cnt: AtomicUsize,
}

impl std::fmt::Debug for ShmemDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmemDriver")
            .field("job_id", &self.job_id)
            .field("my_pe", &self.my_pe)
            .finish()
    }
}

impl ShmemDriver {
    pub fn new(job_id: usize, my_pe: usize) -> ShmemDriver {
        ShmemDriver {
            job_id,
            my_pe,
            space: AddressSpace::new(),
            alloc_cnt: AtomicUsize::new(0),
        }
    }
}

impl MemDriver for ShmemDriver {
    fn reserve_range(&self, size: usize) -> DriverResult<GlobalAddr> {
        self.space.reserve(size)
    }
    fn release_range(&self, base: GlobalAddr) -> DriverResult<()> {
        self.space.release(base)
    }
    fn allocate_physical(&self, size: usize) -> DriverResult<PhysHandle> {
        let id = format!(
            "pgas_shmem_{}_{}_{}",
            self.job_id,
            self.my_pe,
            self.alloc_cnt.fetch_add(1, Ordering::Relaxed)
        );
        let shmem = create_segment(size, &id)?;
        let ptr = NonNull::new(shmem.as_ptr()).ok_or(DriverError::AllocateFailed(size))?;
        Ok(PhysHandle::new(
            id,
            size,
            ptr,
            Backing::Shmem(Arc::new(ShmemSegment { shmem })),
        ))
    }
    fn map(&self, base: GlobalAddr, handle: &PhysHandle) -> DriverResult<()> {
        self.space.map(base, handle)
    }
    fn unmap(&self, base: GlobalAddr) -> DriverResult<()> {
        self.space.unmap(base)
    }
    fn export_handle(&self, handle: &PhysHandle) -> DriverResult<ExportedHandle> {
        match handle.backing.as_ref() {
            Backing::Shmem(_) => Ok(handle.export()),
            Backing::Sim(_) => Err(DriverError::InvalidHandle(handle.name().to_owned())),
        }
    }
    fn import_handle(&self, blob: &ExportedHandle) -> DriverResult<PhysHandle> {
        let mut shmem = open_segment(&blob.name)?;
        if shmem.len() < blob.size {
            return Err(DriverError::InvalidHandle(blob.name.clone()));
        }
        // only the creating process unlinks the object
        shmem.set_owner(false);
        let ptr = NonNull::new(shmem.as_ptr()).ok_or(DriverError::InvalidHandle(blob.name.clone()))?;
        debug!("pe {} attached {}", self.my_pe, blob.name);
        Ok(PhysHandle::new(
            blob.name.clone(),
            blob.size,
            ptr,
            Backing::Shmem(Arc::new(ShmemSegment { shmem })),
        ))
    }
    fn resolve(&self, addr: GlobalAddr, len: usize) -> Option<NonNull<u8>> {
        self.space.resolve(addr, len)
    }
}

impl std::fmt::Debug for ShmemSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ShmemSegment({:?})", self.shmem.get_os_id())
    }
}
