//! The symmetric heap manager.
//!
//! One global virtual range is reserved per heap kind, `aligned_size * n_pes`
//! bytes, identical on every PE. PE `p`'s backing lives in slot
//! `gva + p * aligned_size` of that range on every PE that can reach it, so a
//! peer address is always `slot(pe) + (ptr - heap_base)`.

use std::ptr::NonNull;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::addr::{GlobalAddr, MemKind};
use crate::alloc::SymmAlloc;
use crate::bootstrap::{allgather_obj, BootstrapOps};
use crate::driver::{Driver, ExportedHandle, MemDriver, PhysHandle};
use crate::error::{ShmemError, ShmemResult};
use crate::topology::Topology;

/// physical allocation granularity
pub const PAGE_SIZE: usize = 2 * 1024 * 1024;
/// distance between two PE slots in the global range
pub const HEAP_ALIGN: usize = 1 << 30;
/// largest heap a single PE may request
pub const MAX_LOCAL_SIZE: usize = 40 * (1 << 30);

pub(crate) fn round_up(val: usize, to: usize) -> usize {
    (val + to - 1) / to * to
}

/// The peer address tables a translation can go through
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PeerTable {
    /// link engine view, only PEs sharing the interconnect are mapped
    P2p,
    /// DMA engine view, mirrors the link view
    Sdma,
    /// network engine view, filled by memory region registration
    Rdma,
}

#[derive(Default)]
struct PeerTables {
    p2p: Vec<GlobalAddr>,
    sdma: Vec<GlobalAddr>,
    rdma: Vec<GlobalAddr>,
}

pub(crate) struct SymmetricHeap {
    kind: MemKind,
    my_pe: usize,
    num_pes: usize,
    size: usize,
    aligned_size: usize,
    gva_base: GlobalAddr,
    gva: Mutex<Option<GlobalAddr>>,
    heap_base: GlobalAddr,
    local: Mutex<Option<PhysHandle>>,
    mapped: Mutex<Vec<GlobalAddr>>,
    tables: RwLock<PeerTables>,
    handles: RwLock<Vec<ExportedHandle>>,
    alloc: RwLock<Option<SymmAlloc>>,
}

impl std::fmt::Debug for SymmetricHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricHeap")
            .field("kind", &self.kind)
            .field("my_pe", &self.my_pe)
            .field("size", &self.size)
            .field("heap_base", &format_args!("{:x}", self.heap_base))
            .finish()
    }
}

impl SymmetricHeap {
    /// reserve the global range, `size` is rounded up to the page size
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn reserve(
        driver: &Driver,
        kind: MemKind,
        my_pe: usize,
        num_pes: usize,
        size: usize,
    ) -> ShmemResult<SymmetricHeap> {
        if size == 0 || size > MAX_LOCAL_SIZE {
            return Err(ShmemError::InvalidValue(format!(
                "heap size {} must be in (0, {}]",
                size, MAX_LOCAL_SIZE
            )));
        }
        let size = round_up(size, PAGE_SIZE);
        let aligned_size = round_up(size, HEAP_ALIGN);
        let gva = driver.reserve_range(aligned_size * num_pes)?;
        let heap_base = gva.byte_add(my_pe * aligned_size);
        debug!(
            "pe {} reserved {:?} heap: gva {:x} slot {:x} size {}",
            my_pe, kind, gva, heap_base, size
        );
        Ok(SymmetricHeap {
            kind,
            my_pe,
            num_pes,
            size,
            aligned_size,
            gva_base: gva,
            gva: Mutex::new(Some(gva)),
            heap_base,
            local: Mutex::new(None),
            mapped: Mutex::new(vec![]),
            tables: RwLock::new(PeerTables::default()),
            handles: RwLock::new(vec![]),
            alloc: RwLock::new(None),
        })
    }

    fn slot(&self, pe: usize) -> GlobalAddr {
        self.gva_base.byte_add(pe * self.aligned_size)
    }

    /// allocate, export and exchange backing, then map every link-domain peer.
    ///
    /// `reserved_prefix` bytes at the start of the heap are kept out of the
    /// allocator (the sync pool lives there).
    #[tracing::instrument(skip_all, level = "debug")]
    pub(crate) fn setup<B: BootstrapOps>(
        &self,
        driver: &Driver,
        bootstrap: &B,
        topology: &Topology,
        reserved_prefix: usize,
    ) -> ShmemResult<()> {
        if reserved_prefix >= self.size {
            return Err(ShmemError::InvalidValue(format!(
                "reserved prefix {} does not fit a heap of {} bytes",
                reserved_prefix, self.size
            )));
        }
        let handle = driver.allocate_physical(self.size)?;
        driver.map(self.heap_base, &handle)?;
        self.mapped.lock().push(self.heap_base);
        let blob = driver.export_handle(&handle);
        *self.local.lock() = Some(handle);
        let blob = blob?;

        let handles: Vec<ExportedHandle> = allgather_obj(bootstrap, &blob)?;
        let mut tables = PeerTables {
            p2p: vec![GlobalAddr::NULL; self.num_pes],
            sdma: vec![GlobalAddr::NULL; self.num_pes],
            rdma: vec![GlobalAddr::NULL; self.num_pes],
        };
        tables.p2p[self.my_pe] = self.heap_base;
        for pe in topology.link_peers().filter(|pe| *pe != self.my_pe) {
            let peer = driver.import_handle(&handles[pe])?;
            let slot = self.slot(pe);
            driver.map(slot, &peer)?;
            self.mapped.lock().push(slot);
            tables.p2p[pe] = slot;
            trace!("pe {} mapped pe {} at {:x}", self.my_pe, pe, slot);
        }
        tables.sdma = tables.p2p.clone();
        *self.tables.write() = tables;
        *self.handles.write() = handles;
        *self.alloc.write() = Some(SymmAlloc::new(
            format!("{:?}_heap_{}", self.kind, self.my_pe),
            reserved_prefix,
            self.size - reserved_prefix,
        ));
        debug!("pe {} {:?} heap setup complete", self.my_pe, self.kind);
        Ok(())
    }

    /// unmap every mapping made and free the local backing
    pub(crate) fn remove(&self, driver: &Driver) {
        for base in self.mapped.lock().drain(..) {
            if let Err(e) = driver.unmap(base) {
                warn!("pe {} failed to unmap {:x}: {}", self.my_pe, base, e);
            }
        }
        self.local.lock().take();
        *self.tables.write() = PeerTables::default();
        self.alloc.write().take();
    }

    pub(crate) fn unreserve(&self, driver: &Driver) {
        if let Some(gva) = self.gva.lock().take() {
            if let Err(e) = driver.release_range(gva) {
                warn!("pe {} failed to release {:x}: {}", self.my_pe, gva, e);
            }
        }
    }

    pub(crate) fn kind(&self) -> MemKind {
        self.kind
    }
    pub(crate) fn heap_base(&self) -> GlobalAddr {
        self.heap_base
    }
    pub(crate) fn size(&self) -> usize {
        self.size
    }
    pub(crate) fn aligned_size(&self) -> usize {
        self.aligned_size
    }
    pub(crate) fn contains(&self, addr: GlobalAddr, len: usize) -> bool {
        match addr.offset_from(self.heap_base) {
            Some(offset) => offset + len <= self.size,
            None => false,
        }
    }
    pub(crate) fn peer_handles(&self) -> Vec<ExportedHandle> {
        self.handles.read().clone()
    }

    pub(crate) fn set_rdma_base(&self, pe: usize, base: GlobalAddr) {
        let mut tables = self.tables.write();
        if tables.rdma.len() == self.num_pes {
            tables.rdma[pe] = base;
        }
    }

    /// `addr` (in this PE's view) as seen through `table` for `pe`,
    /// `None` when the peer is not reachable through that table
    pub(crate) fn translate(&self, addr: GlobalAddr, pe: usize, table: PeerTable) -> Option<GlobalAddr> {
        let offset = addr.offset_from(self.heap_base)?;
        if offset >= self.size || pe >= self.num_pes {
            return None;
        }
        let tables = self.tables.read();
        let base = match table {
            PeerTable::P2p => tables.p2p.get(pe),
            PeerTable::Sdma => tables.sdma.get(pe),
            PeerTable::Rdma => tables.rdma.get(pe),
        }?;
        if base.is_null() {
            None
        } else {
            Some(base.byte_add(offset))
        }
    }

    pub(crate) fn malloc(&self, size: usize, align: usize) -> Option<GlobalAddr> {
        let alloc = self.alloc.read();
        let alloc = alloc.as_ref()?;
        match alloc.try_malloc_aligned(size, align) {
            Some(offset) => Some(self.heap_base.byte_add(offset)),
            None => {
                trace!("{} has no room for {} bytes aligned to {}", alloc.id(), size, align);
                None
            }
        }
    }

    pub(crate) fn free(&self, addr: GlobalAddr) -> Option<usize> {
        let offset = addr.offset_from(self.heap_base)?;
        self.alloc.read().as_ref()?.free(offset)
    }

    pub(crate) fn space_avail(&self) -> usize {
        self.alloc.read().as_ref().map(|a| a.space_avail()).unwrap_or(0)
    }

    /// host pointer to local heap memory
    pub(crate) fn local_ptr(&self, driver: &Driver, addr: GlobalAddr, len: usize) -> Option<NonNull<u8>> {
        if !self.contains(addr, len) {
            return None;
        }
        driver.resolve(addr, len)
    }
}

/// The device heap plus the optional host-side heap
#[derive(Debug)]
pub(crate) struct Heaps {
    pub(crate) device: SymmetricHeap,
    pub(crate) host: Option<SymmetricHeap>,
}

impl Heaps {
    /// the heap `addr` belongs to, host kind first
    pub(crate) fn owning(&self, addr: GlobalAddr) -> Option<&SymmetricHeap> {
        if let Some(host) = &self.host {
            if host.contains(addr, 1) {
                return Some(host);
            }
        }
        if self.device.contains(addr, 1) {
            Some(&self.device)
        } else {
            None
        }
    }

    pub(crate) fn get(&self, kind: MemKind) -> Option<&SymmetricHeap> {
        match kind {
            MemKind::Device => Some(&self.device),
            MemKind::Host => self.host.as_ref(),
        }
    }

    pub(crate) fn translate(&self, addr: GlobalAddr, pe: usize, table: PeerTable) -> Option<GlobalAddr> {
        self.owning(addr)?.translate(addr, pe, table)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SymmetricHeap> {
        std::iter::once(&self.device).chain(self.host.iter())
    }

    pub(crate) fn remove(&self, driver: &Driver) {
        for heap in self.iter() {
            heap.remove(driver);
        }
    }

    pub(crate) fn unreserve(&self, driver: &Driver) {
        for heap in self.iter() {
            heap.unreserve(driver);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::ThreadBootstrap;
    use crate::driver::SimDriver;

    fn setup_heaps(num_pes: usize, pes_per_node: usize, job: usize) -> Vec<(Driver, SymmetricHeap)> {
        let group = ThreadBootstrap::group(num_pes);
        std::thread::scope(|s| {
            let handles: Vec<_> = group
                .into_iter()
                .map(|b| {
                    s.spawn(move || {
                        let driver: Driver = SimDriver::new(job, b.my_pe()).into();
                        let topo = Topology::new(b.my_pe(), num_pes, pes_per_node);
                        let heap =
                            SymmetricHeap::reserve(&driver, MemKind::Device, b.my_pe(), num_pes, 4096)
                                .unwrap();
                        heap.setup(&driver, &b, &topo, 128).unwrap();
                        b.barrier().unwrap();
                        (driver, heap)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        })
    }

    #[test]
    fn reserve_rounds_sizes() {
        let driver: Driver = SimDriver::new(9100, 0).into();
        let heap = SymmetricHeap::reserve(&driver, MemKind::Device, 1, 4, 10).unwrap();
        assert_eq!(heap.size(), PAGE_SIZE);
        assert_eq!(heap.aligned_size(), HEAP_ALIGN);
        assert_eq!(heap.heap_base().as_u64() - heap.gva_base.as_u64(), HEAP_ALIGN as u64);
        assert!(SymmetricHeap::reserve(&driver, MemKind::Device, 0, 1, 0).is_err());
        heap.unreserve(&driver);
        heap.unreserve(&driver);
    }

    #[test]
    fn translation_is_symmetric() {
        let pes = setup_heaps(3, 0, 9101);
        let addr = pes[0].1.heap_base().byte_add(256);
        for (_, heap) in &pes {
            let local = heap.heap_base().byte_add(256);
            for pe in 0..3 {
                let t = heap.translate(local, pe, PeerTable::P2p).unwrap();
                assert_eq!(t.offset_from(pes[pe].1.heap_base()), Some(256));
                assert_eq!(t, pes[pe].1.heap_base().byte_add(256));
            }
            assert_eq!(heap.translate(local, 1, PeerTable::Rdma), None);
            assert_eq!(local, addr);
        }
        // the slot for pe 2 on pe 0 holds pe 2's memory
        let (d0, h0) = &pes[0];
        let (d2, h2) = &pes[2];
        let remote = h0.translate(addr, 2, PeerTable::P2p).unwrap();
        unsafe { *d0.resolve(remote, 1).unwrap().as_ptr() = 9 };
        assert_eq!(unsafe { *h2.local_ptr(d2, addr, 1).unwrap().as_ptr() }, 9);
        for (driver, heap) in &pes {
            heap.remove(driver);
            heap.unreserve(driver);
        }
    }

    #[test]
    fn off_node_peers_are_not_mapped() {
        let pes = setup_heaps(4, 2, 9102);
        let (_, h1) = &pes[1];
        let addr = h1.heap_base();
        assert!(h1.translate(addr, 0, PeerTable::P2p).is_some());
        assert!(h1.translate(addr, 2, PeerTable::P2p).is_none());
        assert!(h1.translate(addr, 3, PeerTable::Sdma).is_none());
        assert!(h1.translate(addr.byte_add(h1.size()), 0, PeerTable::P2p).is_none());
    }

    #[test]
    fn allocator_skips_reserved_prefix() {
        let pes = setup_heaps(1, 0, 9103);
        let (_, heap) = &pes[0];
        let a = heap.malloc(64, 1).unwrap();
        assert_eq!(a.offset_from(heap.heap_base()), Some(128));
        assert_eq!(heap.free(a), Some(64));
        assert_eq!(heap.free(a), None);
        assert_eq!(heap.space_avail(), PAGE_SIZE - 128);
    }
}
