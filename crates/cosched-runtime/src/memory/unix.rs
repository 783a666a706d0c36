//! Unix stack mapping using mmap

use cosched_core::constants::GUARD_SIZE;
use cosched_core::error::{MemoryError, SchedResult};
use cosched_core::kwarn;

/// Map `total` bytes read/write and revoke access to the lowest page
pub(super) fn map_stack(total: usize) -> SchedResult<*mut u8> {
    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(MemoryError::AllocationFailed.into());
    }

    // Guard page at the low end; overflow runs into it and faults
    let ret = unsafe { libc::mprotect(base, GUARD_SIZE, libc::PROT_NONE) };
    if ret != 0 {
        unsafe { libc::munmap(base, total) };
        return Err(MemoryError::ProtectionFailed.into());
    }

    Ok(base as *mut u8)
}

pub(super) fn unmap_stack(base: *mut u8, total: usize) {
    let ret = unsafe { libc::munmap(base as *mut libc::c_void, total) };
    if ret != 0 {
        kwarn!("munmap of stack {:p} ({} bytes) failed", base, total);
    }
}
