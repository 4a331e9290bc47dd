//! Fallback backend for Miri and any target without a recognized OS: uses
//! the system allocator as backing store. Miri cannot execute real mmap/
//! VirtualAlloc syscalls, but this lets it still check the allocator's
//! unsafe pointer logic.

extern crate alloc;

use core::alloc::Layout;
use core::ptr;

fn layout_for(size: usize) -> Layout {
    Layout::from_size_align(size.max(1), crate::config::PAGE_SIZE).unwrap()
}

pub unsafe fn reserve(_hint: *mut u8, size: usize, _commit_now: bool) -> *mut u8 {
    unsafe { alloc::alloc::alloc_zeroed(layout_for(size)) }
}

pub unsafe fn commit(_addr: *mut u8, _size: usize) -> bool {
    true
}

pub unsafe fn decommit(_addr: *mut u8, _size: usize) {}

pub unsafe fn release(addr: *mut u8, size: usize) {
    unsafe { alloc::alloc::dealloc(addr, layout_for(size)) };
}

pub unsafe fn remap(_addr: *mut u8, _old_size: usize, _new_size: usize) -> *mut u8 {
    ptr::null_mut()
}
