use std::collections::BTreeMap;
use std::ptr::NonNull;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::addr::GlobalAddr;
use crate::driver::{DriverResult, PhysHandle};
use crate::error::DriverError;

/// Start of the range virtual reservations are carved from
pub(crate) const SVM_START: u64 = 0x1000_0000_0000;
/// Exclusive end of the reservable range (8 TiB)
pub(crate) const SVM_END: u64 = SVM_START + (8 << 40);
/// Every reservation starts on this boundary
pub(crate) const RESERVE_ALIGN: u64 = 1 << 30;

struct Mapping {
    len: usize,
    handle: PhysHandle,
}

/// One PE's page table.
///
/// Reservations are handed out by a bump pointer that starts at the same place
/// on every PE, so the same sequence of collective reservations yields the same
/// bases everywhere.
pub(crate) struct AddressSpace {
    next: Mutex<u64>,
    reservations: RwLock<BTreeMap<u64, usize>>,
    mappings: RwLock<BTreeMap<u64, Mapping>>,
}

impl AddressSpace {
    pub(crate) fn new() -> AddressSpace {
        AddressSpace {
            next: Mutex::new(SVM_START),
            reservations: RwLock::new(BTreeMap::new()),
            mappings: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn reserve(&self, size: usize) -> DriverResult<GlobalAddr> {
        if size == 0 {
            return Err(DriverError::ReserveFailed(size));
        }
        let mut next = self.next.lock();
        let base = *next;
        let span = (size as u64 + RESERVE_ALIGN - 1) / RESERVE_ALIGN * RESERVE_ALIGN;
        let end = base.checked_add(span).ok_or(DriverError::ReserveFailed(size))?;
        if end > SVM_END {
            return Err(DriverError::ReserveFailed(size));
        }
        *next = end;
        self.reservations.write().insert(base, size);
        trace!("reserved [{:x}, {:x})", base, base + size as u64);
        Ok(GlobalAddr(base))
    }

    pub(crate) fn release(&self, base: GlobalAddr) -> DriverResult<()> {
        let size = self
            .reservations
            .write()
            .remove(&base.0)
            .ok_or(DriverError::NotReserved(base))?;
        let mut mappings = self.mappings.write();
        let inside: Vec<u64> = mappings
            .range(base.0..base.0 + size as u64)
            .map(|(start, _)| *start)
            .collect();
        for start in inside {
            mappings.remove(&start);
        }
        trace!("released [{:x}, {:x})", base, base.0 + size as u64);
        Ok(())
    }

    fn reserved(&self, addr: GlobalAddr, len: usize) -> bool {
        let reservations = self.reservations.read();
        match reservations.range(..=addr.0).next_back() {
            Some((start, size)) => addr.0 + len as u64 <= start + *size as u64,
            None => false,
        }
    }

    pub(crate) fn map(&self, base: GlobalAddr, handle: &PhysHandle) -> DriverResult<()> {
        let len = handle.size();
        if !self.reserved(base, len) {
            return Err(DriverError::NotReserved(base));
        }
        let mut mappings = self.mappings.write();
        if let Some((start, m)) = mappings.range(..base.0 + len as u64).next_back() {
            if start + m.len as u64 > base.0 {
                return Err(DriverError::AlreadyMapped(base));
            }
        }
        mappings.insert(
            base.0,
            Mapping {
                len,
                handle: handle.clone(),
            },
        );
        trace!("mapped {} at {:x} ({} bytes)", handle.name(), base, len);
        Ok(())
    }

    pub(crate) fn unmap(&self, base: GlobalAddr) -> DriverResult<()> {
        match self.mappings.write().remove(&base.0) {
            Some(_) => Ok(()),
            None => Err(DriverError::NotMapped(base)),
        }
    }

    pub(crate) fn resolve(&self, addr: GlobalAddr, len: usize) -> Option<NonNull<u8>> {
        let mappings = self.mappings.read();
        let (start, m) = mappings.range(..=addr.0).next_back()?;
        let offset = (addr.0 - start) as usize;
        if offset + len > m.len {
            return None;
        }
        // offset is inside the mapped block
        NonNull::new(unsafe { m.handle.as_ptr().as_ptr().add(offset) })
    }
}
