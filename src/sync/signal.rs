//! Point-to-point wait and test over local symmetric words.
//!
//! Every probe re-reads the word through an acquire load, so a value written
//! by a peer's put (followed by its signal) is observed together with the data
//! it guards.

use std::marker::PhantomData;
use std::ptr::NonNull;

use serde::{Deserialize, Serialize};

use super::spin::{spin_until, SpinPolicy};
use crate::bootstrap::BootstrapOps;
use crate::error::{ShmemError, ShmemResult};
use crate::types::AtomicWord;

/// The comparison a wait or test applies between a word and its target
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    pub fn check<T: PartialOrd>(&self, value: T, target: T) -> bool {
        match self {
            CmpOp::Eq => value == target,
            CmpOp::Ne => value != target,
            CmpOp::Gt => value > target,
            CmpOp::Ge => value >= target,
            CmpOp::Lt => value < target,
            CmpOp::Le => value <= target,
        }
    }
}

/// The comparison target of a bulk wait: one value for every slot or one per slot
#[derive(Copy, Clone, Debug)]
pub(crate) enum Target<'a, T> {
    All(T),
    Each(&'a [T]),
}

impl<'a, T: Copy> Target<'a, T> {
    fn at(&self, i: usize) -> T {
        match self {
            Target::All(v) => *v,
            Target::Each(v) => v[i],
        }
    }
}

/// `len` consecutive words of local symmetric memory
pub(crate) struct Words<T> {
    ptr: NonNull<u8>,
    len: usize,
    _phantom: PhantomData<T>,
}

impl<T: AtomicWord> Words<T> {
    /// # Safety
    /// `ptr` must stay valid and aligned for `len` words of `T` while self lives
    pub(crate) unsafe fn new(ptr: NonNull<u8>, len: usize) -> Words<T> {
        Words {
            ptr,
            len,
            _phantom: PhantomData,
        }
    }
    pub(crate) fn len(&self) -> usize {
        self.len
    }
    pub(crate) fn load(&self, i: usize) -> T {
        debug_assert!(i < self.len);
        unsafe { T::load_raw(self.ptr.as_ptr().add(i * std::mem::size_of::<T>())) }
    }
}

/// which slots take part, a non-zero status entry excludes its slot
fn included(status: Option<&[i32]>, i: usize) -> bool {
    status.map_or(true, |s| s[i] == 0)
}

fn check_lens<T>(words: &Words<T>, status: Option<&[i32]>, target: &Target<'_, T>) -> ShmemResult<()> {
    if let Some(status) = status {
        if status.len() < words.len {
            return Err(ShmemError::InvalidParam(format!(
                "status mask of {} entries for {} words",
                status.len(),
                words.len
            )));
        }
    }
    if let Target::Each(v) = target {
        if v.len() < words.len {
            return Err(ShmemError::InvalidParam(format!(
                "{} targets for {} words",
                v.len(),
                words.len
            )));
        }
    }
    Ok(())
}

pub(crate) fn test<T: AtomicWord>(words: &Words<T>, i: usize, cmp: CmpOp, target: T) -> bool {
    cmp.check(words.load(i), target)
}

/// true once every included slot satisfies the comparison (vacuously true if none is included)
pub(crate) fn test_all<T: AtomicWord>(
    words: &Words<T>,
    status: Option<&[i32]>,
    cmp: CmpOp,
    target: Target<'_, T>,
) -> ShmemResult<bool> {
    check_lens(words, status, &target)?;
    Ok((0..words.len()).all(|i| !included(status, i) || cmp.check(words.load(i), target.at(i))))
}

/// Scans from `cursor` round-robin and returns the first satisfied slot,
/// `cursor` moves past it.
pub(crate) fn test_any<T: AtomicWord>(
    words: &Words<T>,
    status: Option<&[i32]>,
    cmp: CmpOp,
    target: Target<'_, T>,
    cursor: &mut usize,
) -> ShmemResult<Option<usize>> {
    check_lens(words, status, &target)?;
    let n = words.len();
    if n == 0 {
        return Ok(None);
    }
    let start = *cursor % n;
    for k in 0..n {
        let i = (start + k) % n;
        if included(status, i) && cmp.check(words.load(i), target.at(i)) {
            *cursor = (i + 1) % n;
            return Ok(Some(i));
        }
    }
    Ok(None)
}

/// Every satisfied slot, in scan order starting at `cursor`
pub(crate) fn test_some<T: AtomicWord>(
    words: &Words<T>,
    status: Option<&[i32]>,
    cmp: CmpOp,
    target: Target<'_, T>,
    cursor: &mut usize,
) -> ShmemResult<Vec<usize>> {
    check_lens(words, status, &target)?;
    let n = words.len();
    if n == 0 {
        return Ok(vec![]);
    }
    let start = *cursor % n;
    let found: Vec<usize> = (0..n)
        .map(|k| (start + k) % n)
        .filter(|i| included(status, *i) && cmp.check(words.load(*i), target.at(*i)))
        .collect();
    if let Some(last) = found.last() {
        *cursor = (last + 1) % n;
    }
    Ok(found)
}

fn none_included(n: usize, status: Option<&[i32]>) -> bool {
    (0..n).all(|i| !included(status, i))
}

pub(crate) fn wait_until<T: AtomicWord, B: BootstrapOps>(
    policy: &SpinPolicy,
    bootstrap: &B,
    words: &Words<T>,
    i: usize,
    cmp: CmpOp,
    target: T,
) -> ShmemResult<T> {
    spin_until(policy, bootstrap, "wait_until", || {
        let v = words.load(i);
        Ok(if cmp.check(v, target) { Some(v) } else { None })
    })
}

pub(crate) fn wait_until_all<T: AtomicWord, B: BootstrapOps>(
    policy: &SpinPolicy,
    bootstrap: &B,
    words: &Words<T>,
    status: Option<&[i32]>,
    cmp: CmpOp,
    target: Target<'_, T>,
) -> ShmemResult<()> {
    check_lens(words, status, &target)?;
    for i in (0..words.len()).filter(|i| included(status, *i)) {
        wait_until(policy, bootstrap, words, i, cmp, target.at(i))?;
    }
    Ok(())
}

/// `None` when every slot is excluded
pub(crate) fn wait_until_any<T: AtomicWord, B: BootstrapOps>(
    policy: &SpinPolicy,
    bootstrap: &B,
    words: &Words<T>,
    status: Option<&[i32]>,
    cmp: CmpOp,
    target: Target<'_, T>,
    cursor: &mut usize,
) -> ShmemResult<Option<usize>> {
    check_lens(words, status, &target)?;
    if none_included(words.len(), status) {
        return Ok(None);
    }
    spin_until(policy, bootstrap, "wait_until_any", || {
        test_any(words, status, cmp, target, &mut *cursor).map(|found| found.map(Some))
    })
}

/// empty when every slot is excluded
pub(crate) fn wait_until_some<T: AtomicWord, B: BootstrapOps>(
    policy: &SpinPolicy,
    bootstrap: &B,
    words: &Words<T>,
    status: Option<&[i32]>,
    cmp: CmpOp,
    target: Target<'_, T>,
    cursor: &mut usize,
) -> ShmemResult<Vec<usize>> {
    check_lens(words, status, &target)?;
    if none_included(words.len(), status) {
        return Ok(vec![]);
    }
    spin_until(policy, bootstrap, "wait_until_some", || {
        let found = test_some(words, status, cmp, target, &mut *cursor)?;
        Ok(if found.is_empty() { None } else { Some(found) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::ThreadBootstrap;

    fn words<T: AtomicWord>(v: &mut [T]) -> Words<T> {
        unsafe { Words::new(NonNull::new(v.as_mut_ptr() as *mut u8).unwrap(), v.len()) }
    }

    #[test]
    fn comparisons() {
        assert!(CmpOp::Eq.check(3, 3));
        assert!(CmpOp::Ne.check(3, 4));
        assert!(CmpOp::Gt.check(5, 4));
        assert!(CmpOp::Ge.check(4, 4));
        assert!(CmpOp::Lt.check(-1, 0));
        assert!(CmpOp::Le.check(0u8, 0));
        assert!(!CmpOp::Lt.check(0, 0));
    }

    #[test]
    fn test_all_honours_status() {
        let mut v = [1i32, 0, 1];
        let w = words(&mut v);
        assert!(!test_all(&w, None, CmpOp::Eq, Target::All(1)).unwrap());
        assert!(test_all(&w, Some(&[0, 1, 0]), CmpOp::Eq, Target::All(1)).unwrap());
        assert!(test_all(&w, Some(&[1, 1, 1]), CmpOp::Eq, Target::All(7)).unwrap());
        assert!(test_all(&w, None, CmpOp::Eq, Target::Each(&[1, 0, 1])).unwrap());
        assert!(test_all(&w, Some(&[0]), CmpOp::Eq, Target::All(1)).is_err());
    }

    #[test]
    fn test_any_is_round_robin() {
        let mut v = [5u64, 0, 5, 5];
        let w = words(&mut v);
        let mut cursor = 0;
        let mut seen = vec![];
        for _ in 0..4 {
            seen.push(test_any(&w, None, CmpOp::Eq, Target::All(5), &mut cursor).unwrap().unwrap());
        }
        assert_eq!(seen, vec![0, 2, 3, 0]);
        assert_eq!(
            test_any(&w, Some(&[1, 0, 1, 1]), CmpOp::Eq, Target::All(5), &mut cursor).unwrap(),
            None
        );
    }

    #[test]
    fn test_some_collects_from_cursor() {
        let mut v = [1i64, 2, 3, 4];
        let w = words(&mut v);
        let mut cursor = 2;
        let found = test_some(&w, None, CmpOp::Ge, Target::All(2), &mut cursor).unwrap();
        assert_eq!(found, vec![2, 3, 1]);
        assert_eq!(cursor, 2);
        let found = test_some(&w, None, CmpOp::Gt, Target::Each(&[0, 5, 5, 5]), &mut cursor).unwrap();
        assert_eq!(found, vec![0]);
        assert_eq!(cursor, 1);
    }

    #[test]
    fn excluded_waits_return_immediately() {
        let b = ThreadBootstrap::group(1).pop().unwrap();
        let policy = SpinPolicy::default();
        let mut v = [0i32; 2];
        let w = words(&mut v);
        let mut cursor = 0;
        let status = [1, 1];
        assert_eq!(
            wait_until_any(&policy, &b, &w, Some(&status), CmpOp::Eq, Target::All(1), &mut cursor).unwrap(),
            None
        );
        assert!(wait_until_some(&policy, &b, &w, Some(&status), CmpOp::Eq, Target::All(1), &mut cursor)
            .unwrap()
            .is_empty());
        wait_until_all(&policy, &b, &w, Some(&status), CmpOp::Eq, Target::All(1)).unwrap();
    }

    #[test]
    fn wait_sees_a_concurrent_store() {
        let b = ThreadBootstrap::group(1).pop().unwrap();
        let policy = SpinPolicy::default();
        let mut v = [0u32; 1];
        let ptr = v.as_mut_ptr() as usize;
        let w = words(&mut v);
        let seen = crossbeam::thread::scope(|s| {
            s.spawn(move |_| {
                std::thread::sleep(std::time::Duration::from_millis(20));
                unsafe { u32::store_raw(ptr as *mut u8, 9) };
            });
            wait_until(&policy, &b, &w, 0, CmpOp::Gt, 4)
        })
        .unwrap();
        assert_eq!(seen.unwrap(), 9);
    }
}
