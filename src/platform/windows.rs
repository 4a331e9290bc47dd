//! Windows virtual memory backend using VirtualAlloc/VirtualFree.

use core::ffi::c_void;

const MEM_COMMIT: u32 = 0x1000;
const MEM_RESERVE: u32 = 0x2000;
const MEM_RELEASE: u32 = 0x8000;
const MEM_DECOMMIT: u32 = 0x4000;
const PAGE_READWRITE: u32 = 0x04;
const PAGE_NOACCESS: u32 = 0x01;

#[repr(C)]
struct SystemInfo {
    dw_oem_id: u32,
    dw_page_size: u32,
    lp_minimum_application_address: *mut c_void,
    lp_maximum_application_address: *mut c_void,
    dw_active_processor_mask: usize,
    dw_number_of_processors: u32,
    dw_processor_type: u32,
    dw_allocation_granularity: u32,
    w_processor_level: u16,
    w_processor_revision: u16,
}

unsafe extern "system" {
    #[link_name = "VirtualAlloc"]
    fn virtual_alloc(
        lp_address: *mut c_void,
        dw_size: usize,
        fl_allocation_type: u32,
        fl_protect: u32,
    ) -> *mut c_void;

    #[link_name = "VirtualFree"]
    fn virtual_free(lp_address: *mut c_void, dw_size: usize, dw_free_type: u32) -> i32;

    #[link_name = "GetSystemInfo"]
    fn get_system_info(lp_system_info: *mut SystemInfo);
}

pub unsafe fn reserve(hint: *mut u8, size: usize, commit_now: bool) -> *mut u8 {
    let flags = if commit_now {
        MEM_COMMIT | MEM_RESERVE
    } else {
        MEM_RESERVE
    };
    let protect = if commit_now { PAGE_READWRITE } else { PAGE_NOACCESS };
    // Try the hint address first (VirtualAlloc honors a non-null address as
    // an exact request, not a preference, so fall back to no hint on failure).
    let ptr = if !hint.is_null() {
        let p = unsafe { virtual_alloc(hint as *mut c_void, size, flags, protect) };
        if !p.is_null() {
            p
        } else {
            unsafe { virtual_alloc(core::ptr::null_mut(), size, flags, protect) }
        }
    } else {
        unsafe { virtual_alloc(core::ptr::null_mut(), size, flags, protect) }
    };
    ptr as *mut u8
}

pub unsafe fn commit(addr: *mut u8, size: usize) -> bool {
    !unsafe { virtual_alloc(addr as *mut c_void, size, MEM_COMMIT, PAGE_READWRITE) }.is_null()
}

pub unsafe fn decommit(addr: *mut u8, size: usize) {
    unsafe {
        virtual_free(addr as *mut c_void, size, MEM_DECOMMIT);
    }
}

pub unsafe fn release(addr: *mut u8, size: usize) {
    // MEM_RELEASE requires dwSize = 0 (releases the entire reservation the
    // address belongs to); callers always pass the base of a whole reservation.
    let _ = size;
    unsafe {
        virtual_free(addr as *mut c_void, 0, MEM_RELEASE);
    }
}

pub fn page_size() -> usize {
    unsafe {
        let mut info: SystemInfo = core::mem::zeroed();
        get_system_info(&mut info as *mut SystemInfo);
        info.dw_page_size as usize
    }
}
