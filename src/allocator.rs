//! Top-level allocator: owns the thread-local-storage cascade around
//! [`thread_alloc::ThreadAllocator`] and exposes both the `GlobalAlloc`
//! trait and the spec's standalone entry points (§6).
//!
//! `VmAlloc` is zero-sized; all mutable state lives in the per-thread
//! allocator reached through the TLS strategy below (fastest to slowest):
//! - `nightly` feature: `#[thread_local]` with const-init (single TLS read,
//!   no branch once active)
//! - `std` feature: `std::thread_local!`, destructor drains/abandons on
//!   thread exit
//! - neither: one process-wide instance behind a spinlock (no TLS
//!   primitive exists in pure `no_std`; every "thread" collapses onto id 0,
//!   see `tid.rs`)

use crate::config::WORD_SIZE;
use crate::thread_alloc::ThreadAllocator;
use crate::{partition, platform};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

cfg_if::cfg_if! {
    if #[cfg(feature = "nightly")] {
        #[derive(Clone, Copy, PartialEq)]
        #[repr(u8)]
        enum TlsState {
            Uninitialized = 0,
            Active = 1,
            Destroyed = 2,
        }

        struct TlsSlot<T> {
            state: TlsState,
            content: T,
        }

        #[inline(always)]
        unsafe fn ta() -> *mut ThreadAllocator {
            unsafe { core::ptr::addr_of_mut!(TA.content) }
        }

        #[thread_local]
        static mut TA: TlsSlot<ThreadAllocator> = TlsSlot {
            state: TlsState::Uninitialized,
            content: ThreadAllocator::new_const(),
        };

        /// Run the thread-exit abandonment protocol and mark `TA` destroyed
        /// (reentrancy-safe: a drop glue that itself frees memory sees
        /// `Destroyed` and falls through to the fallback path below).
        #[cold]
        #[allow(dead_code)] // only called from the std cleanup guard
        unsafe fn ta_destroy() {
            unsafe {
                if TA.state == TlsState::Active {
                    TA.state = TlsState::Destroyed;
                    (*ta()).on_thread_exit();
                }
            }
        }

        #[cold]
        #[inline(never)]
        unsafe fn ta_init() {
            unsafe { (*ta()).init() };
            // Set BEFORE cleanup registration — if register() triggers
            // allocation, the reentrant call sees TA as Active already.
            unsafe { TA.state = TlsState::Active };
            ta_cleanup::register();
        }

        #[cfg(feature = "std")]
        mod ta_cleanup {
            struct Guard;

            impl Drop for Guard {
                fn drop(&mut self) {
                    if unsafe { super::TA.state } == super::TlsState::Active {
                        unsafe { super::ta_destroy() };
                    }
                }
            }

            std::thread_local! {
                static GUARD: Guard = const { Guard };
            }

            pub(super) fn register() {
                // If std's own TLS is already tearing down, skip — the
                // thread's containers are abandoned, not leaked: another
                // thread will adopt them on its next free/alloc.
                let _ = GUARD.try_with(|_| {});
            }
        }

        #[cfg(not(feature = "std"))]
        mod ta_cleanup {
            pub(super) fn register() {}
        }

        #[inline(always)]
        fn with_ta<R>(f: impl FnOnce(&mut ThreadAllocator) -> R) -> R {
            unsafe {
                if TA.state != TlsState::Active {
                    ta_init();
                }
                f(&mut *ta())
            }
        }
    } else if #[cfg(feature = "std")] {
        struct TaCell(core::cell::UnsafeCell<ThreadAllocator>);
        // SAFETY: a `std::thread_local!` cell is only ever touched by its
        // owning thread.
        unsafe impl Sync for TaCell {}

        impl Drop for TaCell {
            fn drop(&mut self) {
                unsafe { (*self.0.get()).on_thread_exit() };
            }
        }

        std::thread_local! {
            static TA_CELL: TaCell = const {
                TaCell(core::cell::UnsafeCell::new(ThreadAllocator::new_const()))
            };
        }

        #[inline(always)]
        fn with_ta<R>(f: impl FnOnce(&mut ThreadAllocator) -> R) -> R {
            match TA_CELL.try_with(|cell| {
                let ta = unsafe { &mut *cell.0.get() };
                if !ta.is_initialized() {
                    ta.init();
                }
                f(ta)
            }) {
                Ok(r) => r,
                // std's TLS already destroyed (very late in process
                // shutdown): fall back to the shared instance below.
                Err(_) => with_shared_ta(f),
            }
        }

        #[inline(never)]
        #[cold]
        fn with_shared_ta<R>(f: impl FnOnce(&mut ThreadAllocator) -> R) -> R {
            static SHARED: crate::sync::SpinMutex<ThreadAllocator> =
                crate::sync::SpinMutex::new(ThreadAllocator::new_const());
            let mut guard = SHARED.lock();
            if !guard.is_initialized() {
                guard.init();
            }
            f(&mut guard)
        }
    } else {
        // No TLS primitive available: one process-wide allocator, locked.
        // Slowest tier, used only when neither `nightly` nor `std` is
        // enabled — every caller presents as thread id 0 (see `tid.rs`).
        static SHARED: crate::sync::SpinMutex<ThreadAllocator> =
            crate::sync::SpinMutex::new(ThreadAllocator::new_const());

        #[inline(always)]
        fn with_ta<R>(f: impl FnOnce(&mut ThreadAllocator) -> R) -> R {
            let mut guard = SHARED.lock();
            if !guard.is_initialized() {
                guard.init();
            }
            f(&mut guard)
        }
    }
}

/// Address-routed multi-threaded allocator.
///
/// Register as the global allocator with:
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: vmalloc::VmAlloc = vmalloc::VmAlloc;
/// ```
pub struct VmAlloc;

impl VmAlloc {
    /// Spec §6 `alloc(size)`: at least `size` bytes aligned to machine
    /// word. Null on failure or `size == 0`.
    #[inline]
    pub fn alloc(&self, size: usize) -> *mut u8 {
        with_ta(|ta| ta.allocate(size, WORD_SIZE, false))
    }

    /// Spec §6 `aligned_alloc(align, size)`. `align` must be a power of two
    /// no larger than the page size; `size` is rounded up to a multiple of
    /// `align`.
    #[inline]
    pub fn aligned_alloc(&self, align: usize, size: usize) -> *mut u8 {
        with_ta(|ta| ta.allocate(size, align, false))
    }

    /// Spec §6 `zalloc(n, size)`: zero-initialized allocation of `n * size`
    /// bytes. Null (rather than a truncated allocation) on overflow.
    #[inline]
    pub fn zalloc(&self, n: usize, size: usize) -> *mut u8 {
        match n.checked_mul(size) {
            Some(total) => with_ta(|ta| ta.allocate(total, WORD_SIZE, true)),
            None => ptr::null_mut(),
        }
    }

    /// Spec §6 `realloc(p, size)`.
    #[inline]
    pub fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        with_ta(|ta| ta.realloc(ptr, size))
    }

    /// Spec §6 `free(p)`. Idempotent (and a no-op) on null.
    #[inline]
    pub fn free(&self, ptr: *mut u8) {
        with_ta(|ta| ta.free(ptr));
    }

    /// Spec §6 `alloc_at(size, addr)`: pointer-stable allocation at an
    /// exact virtual address, for memory-mapped-file-backed callers. Does
    /// not route through any thread's container queues.
    #[inline]
    pub fn alloc_at(&self, size: usize, addr: usize) -> *mut u8 {
        partition::alloc_at(size, addr)
    }

    /// Spec §6 `alloc_os(size)`: raw OS-page allocation outside the
    /// partition map, with a header page carrying its extent for `free`.
    #[inline]
    pub fn alloc_os(&self, size: usize) -> *mut u8 {
        partition::os_direct_alloc(size, platform::page_size())
    }

    /// Spec §6 `release_local()`: release every currently-empty region this
    /// thread owns back to the OS. Returns `true` if all were released.
    #[inline]
    pub fn release_local(&self) -> bool {
        with_ta(|ta| ta.release_local())
    }
}

unsafe impl GlobalAlloc for VmAlloc {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        with_ta(|ta| ta.allocate(layout.size(), layout.align(), false))
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if layout.size() == 0 {
            return;
        }
        with_ta(|ta| ta.free(ptr));
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.size() == 0 {
            return layout.align() as *mut u8;
        }
        with_ta(|ta| ta.allocate(layout.size(), layout.align(), true))
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.size() == 0 {
            return unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };
        }
        if new_size == 0 {
            unsafe { self.dealloc(ptr, layout) };
            return layout.align() as *mut u8;
        }
        with_ta(|ta| ta.realloc(ptr, new_size))
    }
}

#[cfg(feature = "nightly")]
unsafe impl core::alloc::Allocator for VmAlloc {
    fn allocate(
        &self,
        layout: Layout,
    ) -> Result<core::ptr::NonNull<[u8]>, core::alloc::AllocError> {
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        if ptr.is_null() {
            Err(core::alloc::AllocError)
        } else {
            let slice = core::ptr::slice_from_raw_parts_mut(ptr, layout.size());
            Ok(unsafe { core::ptr::NonNull::new_unchecked(slice) })
        }
    }

    unsafe fn deallocate(&self, ptr: core::ptr::NonNull<u8>, layout: Layout) {
        unsafe { GlobalAlloc::dealloc(self, ptr.as_ptr(), layout) }
    }
}
