use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            #[allow(clippy::cast_sign_loss)]
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

/// # Safety
///
/// `size` must be non-zero.
pub unsafe fn allocate(size: usize) -> *mut u8 {
    unsafe { libc::malloc(size).cast() }
}

/// # Safety
///
/// `size` must be non-zero.
pub unsafe fn allocate_zeroed(size: usize) -> *mut u8 {
    unsafe { libc::calloc(1, size).cast() }
}

/// # Safety
///
/// `ptr` must come from `allocate` or `allocate_zeroed`.
pub unsafe fn free(ptr: *mut u8) {
    unsafe { libc::free(ptr.cast()) }
}
