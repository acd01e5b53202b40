use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::addr::GlobalAddr;
use crate::driver::page_table::AddressSpace;
use crate::driver::{Backing, DriverResult, ExportedHandle, MemDriver, PhysHandle};
use crate::error::DriverError;

const PAGE_ALIGN: usize = 4096;

lazy_static! {
    /// Exported blocks of every in-process PE, by name
    static ref SIM_FABRIC: Mutex<HashMap<String, Weak<SimBlock>>> = Mutex::new(HashMap::new());
}

/// A zeroed, page aligned block of host memory standing in for device memory
pub(crate) struct SimBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

unsafe impl Send for SimBlock {}
unsafe impl Sync for SimBlock {}

impl SimBlock {
    fn new(size: usize) -> DriverResult<SimBlock> {
        let layout =
            Layout::from_size_align(size, PAGE_ALIGN).map_err(|_| DriverError::AllocateFailed(size))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(DriverError::AllocateFailed(size))?;
        Ok(SimBlock { ptr, layout })
    }
}

impl Drop for SimBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A driver for PEs that are threads of the current process.
///
/// Every PE owns a private page table; physical blocks are plain heap
/// allocations that peers find through an in-process registry when they import
/// an exported handle.
pub struct SimDriver {
    job_id: usize,
    my_pe: usize,
    space: AddressSpace,
    alloc_cnt: AtomicUsize,
}

impl std::fmt::Debug for SimDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimDriver")
            .field("job_id", &self.job_id)
            .field("my_pe", &self.my_pe)
            .finish()
    }
}

impl SimDriver {
    pub fn new(job_id: usize, my_pe: usize) -> SimDriver {
        SimDriver {
            job_id,
            my_pe,
            space: AddressSpace::new(),
            alloc_cnt: AtomicUsize::new(0),
        }
    }
}

impl MemDriver for SimDriver {
    fn reserve_range(&self, size: usize) -> DriverResult<GlobalAddr> {
        self.space.reserve(size)
    }
    fn release_range(&self, base: GlobalAddr) -> DriverResult<()> {
        self.space.release(base)
    }
    fn allocate_physical(&self, size: usize) -> DriverResult<PhysHandle> {
        let block = Arc::new(SimBlock::new(size)?);
        let name = format!(
            "pgas_sim_{}_{}_{}",
            self.job_id,
            self.my_pe,
            self.alloc_cnt.fetch_add(1, Ordering::Relaxed)
        );
        trace!("allocated {} ({} bytes)", name, size);
        let ptr = block.ptr;
        Ok(PhysHandle::new(name, size, ptr, Backing::Sim(block)))
    }
    fn map(&self, base: GlobalAddr, handle: &PhysHandle) -> DriverResult<()> {
        self.space.map(base, handle)
    }
    fn unmap(&self, base: GlobalAddr) -> DriverResult<()> {
        self.space.unmap(base)
    }
    fn export_handle(&self, handle: &PhysHandle) -> DriverResult<ExportedHandle> {
        match handle.backing.as_ref() {
            Backing::Sim(block) => {
                SIM_FABRIC
                    .lock()
                    .insert(handle.name().to_owned(), Arc::downgrade(block));
                Ok(handle.export())
            }
            Backing::Shmem(_) => Err(DriverError::InvalidHandle(handle.name().to_owned())),
        }
    }
    fn import_handle(&self, blob: &ExportedHandle) -> DriverResult<PhysHandle> {
        let mut fabric = SIM_FABRIC.lock();
        let block = fabric.get(&blob.name).and_then(|b| b.upgrade());
        match block {
            Some(block) if block.layout.size() == blob.size => {
                debug!("pe {} imported {}", self.my_pe, blob.name);
                let ptr = block.ptr;
                Ok(PhysHandle::new(blob.name.clone(), blob.size, ptr, Backing::Sim(block)))
            }
            _ => {
                fabric.retain(|_, b| b.strong_count() > 0);
                Err(DriverError::InvalidHandle(blob.name.clone()))
            }
        }
    }
    fn resolve(&self, addr: GlobalAddr, len: usize) -> Option<NonNull<u8>> {
        self.space.resolve(addr, len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_import_shares_memory() {
        let owner = SimDriver::new(9001, 0);
        let peer = SimDriver::new(9001, 1);
        let handle = owner.allocate_physical(8192).unwrap();
        let blob = owner.export_handle(&handle).unwrap();
        let imported = peer.import_handle(&blob).unwrap();

        let base = owner.reserve_range(8192).unwrap();
        owner.map(base, &handle).unwrap();
        let peer_base = peer.reserve_range(8192).unwrap();
        peer.map(peer_base, &imported).unwrap();

        unsafe { *owner.resolve(base + 100, 1).unwrap().as_ptr() = 42 };
        assert_eq!(unsafe { *peer.resolve(peer_base + 100, 1).unwrap().as_ptr() }, 42);
    }

    #[test]
    fn import_unknown_fails() {
        let peer = SimDriver::new(9002, 1);
        let blob = ExportedHandle {
            name: "pgas_sim_9002_0_77".to_owned(),
            size: 64,
        };
        assert!(matches!(
            peer.import_handle(&blob),
            Err(DriverError::InvalidHandle(_))
        ));
    }

    #[test]
    fn blocks_start_zeroed() {
        let driver = SimDriver::new(9003, 0);
        let handle = driver.allocate_physical(4096).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(handle.as_ptr().as_ptr(), 4096) };
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
