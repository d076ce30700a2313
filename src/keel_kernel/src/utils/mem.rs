//! Fallible allocation helpers.
//!
//! The kernel allocates control blocks and queue storage from the global
//! allocator but must report allocation failure as an error code instead of
//! aborting, so everything goes through these helpers rather than
//! `Box::new`/`vec!`.
use alloc::boxed::Box;
use core::{alloc::Layout, ptr::NonNull};

/// Allocate a `T` on the heap, returning `None` if the allocator is
/// exhausted. On success the value is never moved again, which makes the
/// returned box suitable for `Box::leak`ing into a `&'static` control block.
pub(crate) fn try_box<T>(value: T) -> Option<Box<T>> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Some(Box::new(value));
    }
    // Safety: `layout` has a non-zero size
    let ptr = unsafe { alloc::alloc::alloc(layout) }.cast::<T>();
    let ptr = NonNull::new(ptr)?;
    // Safety: `ptr` is valid for writes of `T` and properly aligned
    unsafe { ptr.as_ptr().write(value) };
    // Safety: `ptr` was allocated with the global allocator using `T`'s layout
    Some(unsafe { Box::from_raw(ptr.as_ptr()) })
}

/// Allocate a zero-initialized byte buffer, returning `None` on exhaustion.
pub(crate) fn try_byte_buffer(len: usize) -> Option<Box<[u8]>> {
    if len == 0 {
        return Some(Box::from([]));
    }
    let layout = Layout::array::<u8>(len).ok()?;
    // Safety: `layout` has a non-zero size
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    let ptr = NonNull::new(ptr)?;
    // Safety: `ptr` points to `len` initialized bytes from the global
    // allocator
    Some(unsafe { Box::from_raw(core::ptr::slice_from_raw_parts_mut(ptr.as_ptr(), len)) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_box_roundtrip() {
        let b = try_box([1u32, 2, 3]).unwrap();
        assert_eq!(*b, [1, 2, 3]);
    }

    #[test]
    fn byte_buffer_is_zeroed() {
        let b = try_byte_buffer(64).unwrap();
        assert_eq!(b.len(), 64);
        assert!(b.iter().all(|&x| x == 0));
    }

    #[test]
    fn zero_len_buffer() {
        assert_eq!(try_byte_buffer(0).unwrap().len(), 0);
    }
}
