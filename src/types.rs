use std::sync::atomic::{
    AtomicI16, AtomicI32, AtomicI64, AtomicI8, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering,
};

use half::{bf16, f16};

mod private {
    pub trait Sealed {}
}

/// Element types that can be moved by the RMA engines.
///
/// The engines only ever move bytes; this trait ties a Rust type to its size
/// and a short name used in logs.
pub trait ShmemType: private::Sealed + Copy + Default + Send + Sync + std::fmt::Debug + 'static {
    const NAME: &'static str;
}

/// Element types with a remote fetch-free atomic add.
pub trait AtomicAdd: ShmemType {
    /// # Safety
    /// `ptr` must be valid and aligned for `Self` and only accessed atomically by other threads
    unsafe fn atomic_add_raw(ptr: *mut u8, val: Self);
}

/// Integer words that can be polled with a comparison (signal words, sync slots).
pub trait AtomicWord: ShmemType + PartialOrd {
    /// # Safety
    /// `ptr` must be valid and aligned for `Self`
    unsafe fn load_raw(ptr: *const u8) -> Self;
    /// # Safety
    /// `ptr` must be valid and aligned for `Self`
    unsafe fn store_raw(ptr: *mut u8, val: Self);
    /// # Safety
    /// `ptr` must be valid and aligned for `Self`
    unsafe fn fetch_add_raw(ptr: *mut u8, val: Self) -> Self;
}

macro_rules! impl_shmem_type {
    ($($t:ty),*) => {
        $(
            impl private::Sealed for $t {}
            impl ShmemType for $t {
                const NAME: &'static str = stringify!($t);
            }
        )*
    };
}

impl_shmem_type!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64, f16, bf16);

macro_rules! impl_atomic_int {
    ($(($t:ty, $atomic:ty)),*) => {
        $(
            impl AtomicAdd for $t {
                unsafe fn atomic_add_raw(ptr: *mut u8, val: Self) {
                    (*(ptr as *const $atomic)).fetch_add(val, Ordering::SeqCst);
                }
            }
            impl AtomicWord for $t {
                unsafe fn load_raw(ptr: *const u8) -> Self {
                    (*(ptr as *const $atomic)).load(Ordering::Acquire)
                }
                unsafe fn store_raw(ptr: *mut u8, val: Self) {
                    (*(ptr as *const $atomic)).store(val, Ordering::Release)
                }
                unsafe fn fetch_add_raw(ptr: *mut u8, val: Self) -> Self {
                    (*(ptr as *const $atomic)).fetch_add(val, Ordering::AcqRel)
                }
            }
        )*
    };
}

impl_atomic_int!(
    (u8, AtomicU8),
    (u16, AtomicU16),
    (u32, AtomicU32),
    (u64, AtomicU64),
    (i8, AtomicI8),
    (i16, AtomicI16),
    (i32, AtomicI32),
    (i64, AtomicI64)
);

macro_rules! impl_atomic_float {
    ($(($t:ty, $atomic:ty)),*) => {
        $(
            impl AtomicAdd for $t {
                unsafe fn atomic_add_raw(ptr: *mut u8, val: Self) {
                    let word = &*(ptr as *const $atomic);
                    let mut cur = word.load(Ordering::Relaxed);
                    loop {
                        let new = (<$t>::from_bits(cur) + val).to_bits();
                        match word.compare_exchange_weak(cur, new, Ordering::SeqCst, Ordering::Relaxed) {
                            Ok(_) => break,
                            Err(actual) => cur = actual,
                        }
                    }
                }
            }
        )*
    };
}

impl_atomic_float!((f32, AtomicU32), (f64, AtomicU64));

/// Reinterpret a typed slice as bytes for the engines
pub(crate) fn as_bytes<T: ShmemType>(data: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(data.as_ptr() as *const u8, std::mem::size_of_val(data)) }
}

pub(crate) fn as_bytes_mut<T: ShmemType>(data: &mut [T]) -> &mut [u8] {
    unsafe {
        std::slice::from_raw_parts_mut(data.as_mut_ptr() as *mut u8, std::mem::size_of_val(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_atomic_add() {
        let mut word = 5u64;
        unsafe { u64::atomic_add_raw(&mut word as *mut u64 as *mut u8, 7) };
        assert_eq!(word, 12);
        let mut word = -3i32;
        unsafe { i32::atomic_add_raw(&mut word as *mut i32 as *mut u8, 4) };
        assert_eq!(word, 1);
    }

    #[test]
    fn float_atomic_add() {
        let mut word = 1.5f64;
        unsafe { f64::atomic_add_raw(&mut word as *mut f64 as *mut u8, 2.25) };
        assert_eq!(word, 3.75);
        let mut word = 0.5f32;
        unsafe { f32::atomic_add_raw(&mut word as *mut f32 as *mut u8, 0.25) };
        assert_eq!(word, 0.75);
    }

    #[test]
    fn word_load_store() {
        let mut word = 0i64;
        let ptr = &mut word as *mut i64 as *mut u8;
        unsafe {
            i64::store_raw(ptr, 42);
            assert_eq!(i64::load_raw(ptr), 42);
            assert_eq!(i64::fetch_add_raw(ptr, 1), 42);
            assert_eq!(i64::load_raw(ptr), 43);
        }
    }

    #[test]
    fn byte_views() {
        let data = [1u16, 2, 3];
        assert_eq!(as_bytes(&data).len(), 6);
        assert_eq!(f16::NAME, "f16");
        assert_eq!(bf16::NAME, "bf16");
    }
}
