use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default)]
struct FreeEntries {
    sizes: BTreeMap<usize, IndexSet<usize>>, //<size,<addrs>>
    addrs: BTreeMap<usize, usize>,           //<addr,size>
}

impl FreeEntries {
    fn insert(&mut self, addr: usize, size: usize) {
        self.addrs.insert(addr, size);
        self.sizes.entry(size).or_insert_with(IndexSet::new).insert(addr);
    }

    fn remove(&mut self, addr: usize, size: usize) {
        self.addrs.remove(&addr);
        let mut remove_size = false;
        if let Some(addrs) = self.sizes.get_mut(&size) {
            addrs.shift_remove(&addr);
            remove_size = addrs.is_empty();
        }
        if remove_size {
            self.sizes.remove(&size);
        }
    }
}

#[derive(Debug, Default)]
struct AllocState {
    free: FreeEntries,
    allocated: BTreeMap<usize, usize>, //<addr,size>
}

/// Best fit allocator over one symmetric heap.
///
/// Addresses are offsets from the start of the heap. The allocator never
/// blocks: a request that cannot be served returns `None`. Given the same
/// sequence of requests every PE computes the same offsets, which is what keeps
/// the heaps symmetric.
#[derive(Debug)]
pub(crate) struct SymmAlloc {
    state: Mutex<AllocState>,
    id: String,
}

fn align_up(addr: usize, align: usize) -> usize {
    (addr + align - 1) / align * align
}

impl SymmAlloc {
    pub(crate) fn new(id: String, start_addr: usize, size: usize) -> SymmAlloc {
        let mut state = AllocState::default();
        if size > 0 {
            state.free.insert(start_addr, size);
        }
        SymmAlloc {
            state: Mutex::new(state),
            id,
        }
    }

    pub(crate) fn try_malloc(&self, size: usize) -> Option<usize> {
        self.try_malloc_aligned(size, 1)
    }

    /// smallest free segment that can hold `size` bytes starting on an `align` boundary
    pub(crate) fn try_malloc_aligned(&self, size: usize, align: usize) -> Option<usize> {
        if size == 0 || align == 0 || !align.is_power_of_two() {
            return None;
        }
        let mut state = self.state.lock();
        let found = state.free.sizes.range(size..).find_map(|(fsize, addrs)| {
            addrs
                .iter()
                .rev()
                .find(|a| align_up(**a, align) + size <= **a + *fsize)
                .map(|a| (*a, *fsize))
        });
        let (faddr, fsize) = found?;
        state.free.remove(faddr, fsize);
        let addr = align_up(faddr, align);
        if addr > faddr {
            state.free.insert(faddr, addr - faddr);
        }
        let end = addr + size;
        if end < faddr + fsize {
            state.free.insert(end, faddr + fsize - end);
        }
        state.allocated.insert(addr, size);
        Some(addr)
    }

    /// returns the number of bytes released, `None` if `addr` is not the start of an allocation
    pub(crate) fn free(&self, addr: usize) -> Option<usize> {
        let mut state = self.state.lock();
        let size = state.allocated.remove(&addr)?;
        let mut temp_addr = addr;
        let mut temp_size = size;
        let mut remove: Vec<(usize, usize)> = vec![];
        if let Some((faddr, fsize)) = state.free.addrs.range(..addr).next_back() {
            //look at address before addr
            if faddr + fsize == addr {
                temp_addr = *faddr;
                temp_size = fsize + size;
                remove.push((*faddr, *fsize));
            }
        }
        if let Some((faddr, fsize)) = state.free.addrs.range(addr..).next() {
            //look at address after addr
            if temp_addr + temp_size == *faddr {
                temp_size += fsize;
                remove.push((*faddr, *fsize));
            }
        }
        for (raddr, rsize) in remove {
            state.free.remove(raddr, rsize);
        }
        state.free.insert(temp_addr, temp_size);
        Some(size)
    }

    pub(crate) fn allocated_size(&self, addr: usize) -> Option<usize> {
        self.state.lock().allocated.get(&addr).copied()
    }

    pub(crate) fn space_avail(&self) -> usize {
        self.state.lock().free.addrs.values().sum()
    }

    pub(crate) fn num_allocations(&self) -> usize {
        self.state.lock().allocated.len()
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btree_malloc_free() {
        let alloc = SymmAlloc::new("test_malloc_free".to_string(), 0, 1000);
        assert_eq!(alloc.try_malloc(50), Some(0));
        assert_eq!(alloc.try_malloc(10), Some(50));
        assert_eq!(alloc.try_malloc(600), Some(60));
        assert_eq!(alloc.try_malloc(10), Some(660));
        assert_eq!(alloc.free(0), Some(50));
        assert_eq!(alloc.try_malloc(30), Some(0));
        assert_eq!(alloc.free(50), Some(10));
        assert_eq!(alloc.try_malloc(10), Some(30));
        assert_eq!(alloc.try_malloc(10), Some(40));
        assert_eq!(alloc.free(660), Some(10));
        assert_eq!(alloc.free(30), Some(10));
        assert_eq!(alloc.try_malloc(10), Some(30));
        assert_eq!(alloc.free(30), Some(10));
        assert_eq!(alloc.try_malloc(200), Some(660));
        assert_eq!(alloc.free(12345), None);
    }

    #[test]
    fn exhaustion_and_coalesce() {
        let alloc = SymmAlloc::new("test_exhaust".to_string(), 0, 256);
        let a = alloc.try_malloc(128).unwrap();
        let b = alloc.try_malloc(128).unwrap();
        assert_eq!(alloc.try_malloc(1), None);
        assert_eq!(alloc.space_avail(), 0);
        alloc.free(a);
        alloc.free(b);
        assert_eq!(alloc.space_avail(), 256);
        assert_eq!(alloc.try_malloc(256), Some(0));
        assert_eq!(alloc.num_allocations(), 1);
    }

    #[test]
    fn aligned_malloc() {
        let alloc = SymmAlloc::new("test_aligned".to_string(), 0, 4096);
        assert_eq!(alloc.try_malloc(3), Some(0));
        let addr = alloc.try_malloc_aligned(100, 64).unwrap();
        assert_eq!(addr % 64, 0);
        assert_eq!(alloc.allocated_size(addr), Some(100));
        // the padding in front of the aligned block stays usable
        assert_eq!(alloc.try_malloc(61), Some(3));
        assert_eq!(alloc.try_malloc_aligned(8, 3), None);
        assert_eq!(alloc.try_malloc(0), None);
    }
}
