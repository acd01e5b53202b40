//! The allocation/mapping collaborator.
//!
//! A driver owns one PE's view of the global address space: it hands out
//! virtual reservations, allocates physical backing, maps backing into
//! reservations and exports/imports backing so that peers can map it too.
//! Nothing outside a driver ever turns a [GlobalAddr] into a raw pointer.

use std::ptr::NonNull;
use std::sync::Arc;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::addr::GlobalAddr;
use crate::error::DriverError;

pub(crate) mod page_table;
pub mod shmem;
pub mod sim;

pub use shmem::ShmemDriver;
pub use sim::SimDriver;

pub type DriverResult<T> = Result<T, DriverError>;

/// A shareable description of a physical allocation, exchanged through the bootstrap
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedHandle {
    pub name: String,
    pub size: usize,
}

pub(crate) enum Backing {
    Sim(Arc<sim::SimBlock>),
    Shmem(Arc<shmem::ShmemSegment>),
}

/// A physical allocation, either created locally or imported from a peer.
///
/// The backing memory stays alive for as long as any handle (or any mapping
/// made from a handle) exists.
#[derive(Clone)]
pub struct PhysHandle {
    name: String,
    size: usize,
    ptr: NonNull<u8>,
    backing: Arc<Backing>,
}

unsafe impl Send for PhysHandle {}
unsafe impl Sync for PhysHandle {}

impl std::fmt::Debug for PhysHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing.as_ref() {
            Backing::Sim(_) => "sim",
            Backing::Shmem(_) => "shmem",
        };
        f.debug_struct("PhysHandle")
            .field("name", &self.name)
            .field("size", &self.size)
            .field("kind", &kind)
            .finish()
    }
}

impl PhysHandle {
    pub(crate) fn new(name: String, size: usize, ptr: NonNull<u8>, backing: Backing) -> PhysHandle {
        PhysHandle {
            name,
            size,
            ptr,
            backing: Arc::new(backing),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn size(&self) -> usize {
        self.size
    }
    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }
    pub(crate) fn export(&self) -> ExportedHandle {
        ExportedHandle {
            name: self.name.clone(),
            size: self.size,
        }
    }
}

#[enum_dispatch]
pub trait MemDriver {
    /// reserve `size` bytes of virtual address space, no physical backing yet
    fn reserve_range(&self, size: usize) -> DriverResult<GlobalAddr>;
    /// release a reservation (and any mapping still inside it)
    fn release_range(&self, base: GlobalAddr) -> DriverResult<()>;
    fn allocate_physical(&self, size: usize) -> DriverResult<PhysHandle>;
    /// map physical backing at `base`, which must lie in a reservation
    fn map(&self, base: GlobalAddr, handle: &PhysHandle) -> DriverResult<()>;
    fn unmap(&self, base: GlobalAddr) -> DriverResult<()>;
    fn export_handle(&self, handle: &PhysHandle) -> DriverResult<ExportedHandle>;
    fn import_handle(&self, blob: &ExportedHandle) -> DriverResult<PhysHandle>;
    /// checked conversion of `[addr, addr + len)` to a host pointer,
    /// `None` if the range is not fully covered by one mapping
    fn resolve(&self, addr: GlobalAddr, len: usize) -> Option<NonNull<u8>>;
}

/// The drivers a context can be built on
#[enum_dispatch(MemDriver)]
#[derive(Debug)]
pub enum Driver {
    SimDriver,
    ShmemDriver,
}
