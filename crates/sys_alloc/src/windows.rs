use std::mem;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{GetProcessHeap, HeapAlloc, HeapFree, HEAP_ZERO_MEMORY};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        info.dwPageSize as usize
    }
}

/// # Safety
///
/// `size` must be non-zero.
pub unsafe fn allocate(size: usize) -> *mut u8 {
    unsafe { HeapAlloc(GetProcessHeap(), 0, size).cast() }
}

/// # Safety
///
/// `size` must be non-zero.
pub unsafe fn allocate_zeroed(size: usize) -> *mut u8 {
    unsafe { HeapAlloc(GetProcessHeap(), HEAP_ZERO_MEMORY, size).cast() }
}

/// # Safety
///
/// `ptr` must come from `allocate` or `allocate_zeroed`.
pub unsafe fn free(ptr: *mut u8) {
    unsafe {
        HeapFree(GetProcessHeap(), 0, ptr.cast());
    }
}
