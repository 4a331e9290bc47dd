//! Unix virtual memory backend using mmap/munmap/madvise/mremap.

use core::ffi::c_void;
use core::ptr;

const PROT_NONE: i32 = 0x0;
const PROT_READ: i32 = 0x1;
const PROT_WRITE: i32 = 0x2;
const MAP_PRIVATE: i32 = 0x02;
const MAP_ANONYMOUS: i32 = 0x20;
const MAP_FAILED: *mut c_void = !0usize as *mut c_void;
const MADV_DONTNEED: i32 = 4;
#[cfg(target_os = "linux")]
const MREMAP_MAYMOVE: i32 = 1;

unsafe extern "C" {
    fn mmap(
        addr: *mut c_void,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: i64,
    ) -> *mut c_void;
    fn munmap(addr: *mut c_void, length: usize) -> i32;
    fn madvise(addr: *mut c_void, length: usize, advice: i32) -> i32;
    fn mprotect(addr: *mut c_void, length: usize, prot: i32) -> i32;
    #[cfg(target_os = "linux")]
    fn mremap(
        old_addr: *mut c_void,
        old_size: usize,
        new_size: usize,
        flags: i32,
        ...
    ) -> *mut c_void;
    fn sysconf(name: i32) -> i64;
}

#[cfg(target_os = "linux")]
const SC_PAGESIZE: i32 = 30;
#[cfg(target_vendor = "apple")]
const SC_PAGESIZE: i32 = 29;
#[cfg(not(any(target_os = "linux", target_vendor = "apple")))]
const SC_PAGESIZE: i32 = 29;

pub unsafe fn reserve(hint: *mut u8, size: usize, commit_now: bool) -> *mut u8 {
    let prot = if commit_now {
        PROT_READ | PROT_WRITE
    } else {
        PROT_NONE
    };
    // `hint` is passed without MAP_FIXED: the kernel treats it as a
    // placement preference and falls back to its own search on conflict, so
    // this can never clobber an existing mapping.
    let raw = unsafe {
        mmap(
            hint as *mut c_void,
            size,
            prot,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == MAP_FAILED {
        return ptr::null_mut();
    }
    raw as *mut u8
}

pub unsafe fn commit(addr: *mut u8, size: usize) -> bool {
    unsafe { mprotect(addr as *mut c_void, size, PROT_READ | PROT_WRITE) == 0 }
}

pub unsafe fn decommit(addr: *mut u8, size: usize) {
    unsafe {
        mprotect(addr as *mut c_void, size, PROT_NONE);
        madvise(addr as *mut c_void, size, MADV_DONTNEED);
    }
}

pub unsafe fn release(addr: *mut u8, size: usize) {
    unsafe {
        munmap(addr as *mut c_void, size);
    }
}

#[cfg(target_os = "linux")]
pub unsafe fn remap(addr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    let raw = unsafe {
        mremap(
            addr as *mut c_void,
            old_size,
            new_size,
            MREMAP_MAYMOVE,
        )
    };
    if raw == MAP_FAILED {
        ptr::null_mut()
    } else {
        raw as *mut u8
    }
}

#[cfg(not(target_os = "linux"))]
pub unsafe fn remap(_addr: *mut u8, _old_size: usize, _new_size: usize) -> *mut u8 {
    ptr::null_mut()
}

pub fn page_size() -> usize {
    let n = unsafe { sysconf(SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        crate::config::PAGE_SIZE
    }
}
