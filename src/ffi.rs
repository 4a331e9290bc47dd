//! C-ABI exports for external linking (e.g. from a benchmark harness's
//! build.rs, or an LD_PRELOAD shim).
//!
//! Gated behind `features = ["ffi"]`. With the `testing` feature, export
//! names are prefixed by TLS variant so a single test binary can link all
//! three at once:
//!   - `nightly` → `vmalloc_nightly_*`
//!   - `std`     → `vmalloc_std_*`
//!   - neither   → `vmalloc_nostd_*`
//! Without `testing`, exports plain `vmalloc_*` names.

use crate::allocator::VmAlloc;
use core::alloc::{GlobalAlloc, Layout};

static ALLOC: VmAlloc = VmAlloc;

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "vmalloc_nightly_alloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "vmalloc_std_alloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "vmalloc_nostd_alloc")
)]
pub unsafe extern "C" fn vmalloc_alloc(size: usize, align: usize) -> *mut u8 {
    if align <= 1 {
        ALLOC.alloc(size)
    } else {
        ALLOC.aligned_alloc(align, size)
    }
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "vmalloc_nightly_zalloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "vmalloc_std_zalloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "vmalloc_nostd_zalloc")
)]
pub unsafe extern "C" fn vmalloc_zalloc(n: usize, size: usize) -> *mut u8 {
    ALLOC.zalloc(n, size)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "vmalloc_nightly_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "vmalloc_std_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "vmalloc_nostd_dealloc")
)]
pub unsafe extern "C" fn vmalloc_dealloc(ptr: *mut u8) {
    ALLOC.free(ptr)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "vmalloc_nightly_realloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "vmalloc_std_realloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "vmalloc_nostd_realloc")
)]
pub unsafe extern "C" fn vmalloc_realloc(ptr: *mut u8, new_size: usize) -> *mut u8 {
    ALLOC.realloc(ptr, new_size)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "vmalloc_nightly_alloc_at")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "vmalloc_std_alloc_at")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "vmalloc_nostd_alloc_at")
)]
pub unsafe extern "C" fn vmalloc_alloc_at(size: usize, addr: usize) -> *mut u8 {
    ALLOC.alloc_at(size, addr)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "vmalloc_nightly_alloc_os")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "vmalloc_std_alloc_os")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "vmalloc_nostd_alloc_os")
)]
pub unsafe extern "C" fn vmalloc_alloc_os(size: usize) -> *mut u8 {
    ALLOC.alloc_os(size)
}

#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "vmalloc_nightly_release_local")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "vmalloc_std_release_local")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "vmalloc_nostd_release_local")
)]
pub unsafe extern "C" fn vmalloc_release_local() -> bool {
    ALLOC.release_local()
}

/// `GlobalAlloc`-shaped dealloc taking an explicit layout, for callers (a
/// `cdylib` malloc shim) that already track size/align themselves rather
/// than relying on the block recovering its own layout.
#[cfg_attr(not(feature = "testing"), unsafe(no_mangle))]
#[cfg_attr(
    all(feature = "testing", feature = "nightly"),
    unsafe(export_name = "vmalloc_nightly_layout_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", feature = "std", not(feature = "nightly")),
    unsafe(export_name = "vmalloc_std_layout_dealloc")
)]
#[cfg_attr(
    all(feature = "testing", not(any(feature = "nightly", feature = "std"))),
    unsafe(export_name = "vmalloc_nostd_layout_dealloc")
)]
pub unsafe extern "C" fn vmalloc_layout_dealloc(ptr: *mut u8, size: usize, align: usize) {
    let layout = unsafe { Layout::from_size_align_unchecked(size, align) };
    unsafe { ALLOC.dealloc(ptr, layout) }
}
