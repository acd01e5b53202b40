//! Address-space handle types.
//!
//! Three disjoint address spaces exist: the accelerator's global memory (where the
//! symmetric heaps live, named by [GlobalAddr]), the per-core local scratch buffer
//! used by the link engine (named by [ScratchOffset], only meaningful inside
//! [crate::transport::link]), and ordinary host memory (plain Rust slices).
//! There is no arithmetic between spaces; the only way from a [GlobalAddr] to a
//! dereferenceable pointer is the checked lookup performed by a memory driver.

use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::types::ShmemType;

/// A virtual address in a PE's global (device) address space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GlobalAddr(pub(crate) u64);

impl GlobalAddr {
    pub const NULL: GlobalAddr = GlobalAddr(0);

    pub fn new(addr: u64) -> GlobalAddr {
        GlobalAddr(addr)
    }
    pub fn as_u64(&self) -> u64 {
        self.0
    }
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
    pub fn byte_add(&self, bytes: usize) -> GlobalAddr {
        GlobalAddr(self.0 + bytes as u64)
    }
    /// bytes between `base` and self, `None` when self lies below `base`
    pub fn offset_from(&self, base: GlobalAddr) -> Option<usize> {
        self.0.checked_sub(base.0).map(|o| o as usize)
    }
    /// true if self lies in `[base, base + len)`
    pub fn within(&self, base: GlobalAddr, len: usize) -> bool {
        self.0 >= base.0 && self.0 < base.0 + len as u64
    }
}

impl std::fmt::LowerHex for GlobalAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::LowerHex::fmt(&self.0, f)
    }
}

impl std::ops::Add<usize> for GlobalAddr {
    type Output = GlobalAddr;
    fn add(self, rhs: usize) -> Self::Output {
        self.byte_add(rhs)
    }
}

/// Which of the two symmetric heaps an allocation lives in
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemKind {
    Device,
    Host,
}

/// A typed pointer into the symmetric heap.
///
/// The address is expressed in the calling PE's view; passing it together with
/// a peer id to an RMA call targets the same offset in that peer's heap.
pub struct SymmPtr<T> {
    addr: GlobalAddr,
    len: usize,
    _phantom: PhantomData<T>,
}

impl<T> Clone for SymmPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for SymmPtr<T> {}

impl<T> std::fmt::Debug for SymmPtr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmPtr")
            .field("addr", &format_args!("{:x}", self.addr))
            .field("len", &self.len)
            .finish()
    }
}

impl<T> PartialEq for SymmPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.len == other.len
    }
}

unsafe impl<T: Send> Send for SymmPtr<T> {}
unsafe impl<T: Sync> Sync for SymmPtr<T> {}

impl<T: ShmemType> SymmPtr<T> {
    pub(crate) fn from_raw_parts(addr: GlobalAddr, len: usize) -> SymmPtr<T> {
        SymmPtr {
            addr,
            len,
            _phantom: PhantomData,
        }
    }
    pub fn null() -> SymmPtr<T> {
        SymmPtr::from_raw_parts(GlobalAddr::NULL, 0)
    }
    pub fn addr(&self) -> GlobalAddr {
        self.addr
    }
    /// number of elements
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn is_null(&self) -> bool {
        self.addr.is_null()
    }
    pub fn num_bytes(&self) -> usize {
        self.len * std::mem::size_of::<T>()
    }
    /// pointer to element `index`, the resulting view runs to the end of self
    pub fn add(&self, index: usize) -> SymmPtr<T> {
        debug_assert!(index <= self.len);
        SymmPtr::from_raw_parts(
            self.addr.byte_add(index * std::mem::size_of::<T>()),
            self.len.saturating_sub(index),
        )
    }
    /// sub view `[start, start + len)`
    pub fn slice(&self, start: usize, len: usize) -> SymmPtr<T> {
        debug_assert!(start + len <= self.len);
        SymmPtr::from_raw_parts(self.addr.byte_add(start * std::mem::size_of::<T>()), len)
    }
    /// reinterpret the same bytes as another element type
    pub fn cast<U: ShmemType>(&self) -> SymmPtr<U> {
        SymmPtr::from_raw_parts(self.addr, self.num_bytes() / std::mem::size_of::<U>())
    }
}

/// Layout of a non-contiguous transfer, all values in elements.
///
/// `repeat` rows of `length` contiguous elements; consecutive rows start
/// `src_stride` elements apart in the source and `dst_stride` apart in the
/// destination.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrideDesc {
    pub repeat: usize,
    pub length: usize,
    pub src_stride: usize,
    pub dst_stride: usize,
}

impl StrideDesc {
    pub fn new(repeat: usize, length: usize, src_stride: usize, dst_stride: usize) -> StrideDesc {
        StrideDesc {
            repeat,
            length,
            src_stride,
            dst_stride,
        }
    }
    /// a single contiguous row
    pub fn contiguous(length: usize) -> StrideDesc {
        StrideDesc::new(1, length, length, length)
    }
    pub fn num_elems(&self) -> usize {
        self.repeat * self.length
    }
    /// number of source elements spanned (first to last touched, inclusive)
    pub fn src_extent(&self) -> usize {
        if self.repeat == 0 {
            0
        } else {
            (self.repeat - 1) * self.src_stride + self.length
        }
    }
    pub fn dst_extent(&self) -> usize {
        if self.repeat == 0 {
            0
        } else {
            (self.repeat - 1) * self.dst_stride + self.length
        }
    }
    pub(crate) fn is_valid(&self) -> bool {
        self.repeat <= 1 || (self.src_stride >= self.length && self.dst_stride >= self.length)
    }
    pub(crate) fn in_bytes(&self, elem_size: usize) -> StrideDesc {
        StrideDesc {
            repeat: self.repeat,
            length: self.length * elem_size,
            src_stride: self.src_stride * elem_size,
            dst_stride: self.dst_stride * elem_size,
        }
    }
}

/// A byte offset inside a link engine scratch buffer
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ScratchOffset(pub(crate) usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_addr_math() {
        let base = GlobalAddr::new(0x1000);
        let a = base + 0x20;
        assert_eq!(a.offset_from(base), Some(0x20));
        assert_eq!(base.offset_from(a), None);
        assert!(a.within(base, 0x21));
        assert!(!a.within(base, 0x20));
        assert!(GlobalAddr::NULL.is_null());
        assert_eq!(format!("{:x}", a), "1020");
    }

    #[test]
    fn symm_ptr_views() {
        let p = SymmPtr::<u32>::from_raw_parts(GlobalAddr::new(0x100), 16);
        assert_eq!(p.num_bytes(), 64);
        let q = p.add(4);
        assert_eq!(q.addr(), GlobalAddr::new(0x110));
        assert_eq!(q.len(), 12);
        let s = p.slice(2, 3);
        assert_eq!(s.addr(), GlobalAddr::new(0x108));
        assert_eq!(s.len(), 3);
        let b = p.cast::<u8>();
        assert_eq!(b.len(), 64);
    }

    #[test]
    fn stride_extents() {
        let d = StrideDesc::new(3, 2, 5, 4);
        assert_eq!(d.num_elems(), 6);
        assert_eq!(d.src_extent(), 12);
        assert_eq!(d.dst_extent(), 10);
        assert!(d.is_valid());
        assert!(!StrideDesc::new(2, 4, 2, 4).is_valid());
        let b = d.in_bytes(4);
        assert_eq!(b.length, 8);
        assert_eq!(b.src_stride, 20);
    }
}
