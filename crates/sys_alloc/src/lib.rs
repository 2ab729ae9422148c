//! Raw system allocation primitives.
//!
//! This crate is the lowest layer under the bridge allocator: it hands out
//! untyped blocks straight from the platform heap and reports failure as a
//! null pointer instead of aborting. Retrying, collecting and error
//! reporting are the caller's business.

use std::ptr::NonNull;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Alignment guaranteed for every block returned by [`raw_allocate`].
pub const MIN_ALIGN: usize = 2 * std::mem::size_of::<usize>();

/// Allocates `size` bytes from the platform heap.
///
/// Returns `None` when the platform heap is exhausted. A zero-sized request
/// is rounded up to one byte so that every successful call yields a distinct
/// pointer.
#[must_use]
pub fn raw_allocate(size: usize) -> Option<NonNull<u8>> {
    let size = size.max(1);
    // SAFETY: `size` is non-zero; the returned block is either null or owned
    // by the caller until passed back to `raw_free`.
    NonNull::new(unsafe { os::allocate(size) })
}

/// Allocates `size` zeroed bytes from the platform heap.
#[must_use]
pub fn raw_allocate_zeroed(size: usize) -> Option<NonNull<u8>> {
    let size = size.max(1);
    // SAFETY: see `raw_allocate`.
    NonNull::new(unsafe { os::allocate_zeroed(size) })
}

/// Returns a block obtained from [`raw_allocate`] to the platform heap.
///
/// # Safety
///
/// `ptr` must come from [`raw_allocate`] or [`raw_allocate_zeroed`] and must
/// not be used after this call.
pub unsafe fn raw_free(ptr: NonNull<u8>) {
    // SAFETY: forwarded caller contract.
    unsafe { os::free(ptr.as_ptr()) }
}

/// Rounds `size` up to a whole number of pages.
#[must_use]
pub fn round_to_pages(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free() {
        let ptr = raw_allocate(64).expect("platform heap exhausted");
        assert_eq!(ptr.as_ptr() as usize % MIN_ALIGN, 0);
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, 64);
            raw_free(ptr);
        }
    }

    #[test]
    fn zero_sized_request_is_distinct() {
        let a = raw_allocate(0).unwrap();
        let b = raw_allocate(0).unwrap();
        assert_ne!(a, b);
        unsafe {
            raw_free(a);
            raw_free(b);
        }
    }

    #[test]
    fn zeroed_block_is_zero() {
        let ptr = raw_allocate_zeroed(128).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 128) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { raw_free(ptr) };
    }

    #[test]
    fn page_rounding() {
        let page = page_size();
        assert!(page.is_power_of_two());
        assert_eq!(round_to_pages(1), page);
        assert_eq!(round_to_pages(page), page);
        assert_eq!(round_to_pages(page + 1), 2 * page);
    }
}
