//! OS virtual-memory abstraction (spec §6) plus the aligned-region retry
//! strategy used by the partition allocator (spec §4.1).
//!
//! Each OS backend exposes the primitive contract from spec §6: `reserve`,
//! `commit`, `decommit`, `release`, `remap`, `page_size`. Everything above
//! this module deals only in these six operations; no code outside this
//! module calls into `mmap`/`VirtualAlloc` directly.

#[cfg(windows)]
mod windows;

#[cfg(unix)]
mod unix;

#[cfg(any(miri, all(not(unix), not(windows))))]
mod miri;

use crate::sync::SpinLock;
use core::ptr;

/// Reserve `size` bytes of address space, optionally committing it
/// immediately. `hint`, if non-null, is a placement hint the OS tries to
/// honor but is free to ignore (never `MAP_FIXED`/`MEM_REPLACE_PLACEHOLDER`
/// semantics) — used to steer regions toward their partition's address
/// band. Returns null on failure. The returned address has no alignment
/// guarantee beyond the platform's natural allocation granularity; callers
/// needing a specific alignment use [`reserve_aligned`].
///
/// # Safety
/// Caller must eventually pass the returned pointer and the same `size` to
/// `release`.
#[inline]
pub unsafe fn reserve(hint: *mut u8, size: usize, commit_now: bool) -> *mut u8 {
    #[cfg(windows)]
    {
        unsafe { windows::reserve(hint, size, commit_now) }
    }
    #[cfg(unix)]
    {
        unsafe { unix::reserve(hint, size, commit_now) }
    }
    #[cfg(any(miri, all(not(unix), not(windows))))]
    {
        unsafe { miri::reserve(hint, size, commit_now) }
    }
}

/// Make a previously reserved range readable/writable and backed by
/// physical memory. Freshly committed pages read as zero.
///
/// # Safety
/// `addr`/`size` must lie within a single live `reserve` call.
#[inline]
pub unsafe fn commit(addr: *mut u8, size: usize) -> bool {
    #[cfg(windows)]
    {
        unsafe { windows::commit(addr, size) }
    }
    #[cfg(unix)]
    {
        unsafe { unix::commit(addr, size) }
    }
    #[cfg(any(miri, all(not(unix), not(windows))))]
    {
        unsafe { miri::commit(addr, size) }
    }
}

/// Drop physical backing for a range; the virtual range remains reserved.
///
/// # Safety
/// `addr`/`size` must lie within a single live `reserve` call.
#[inline]
pub unsafe fn decommit(addr: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::decommit(addr, size) };
    }
    #[cfg(unix)]
    {
        unsafe { unix::decommit(addr, size) };
    }
    #[cfg(any(miri, all(not(unix), not(windows))))]
    {
        unsafe { miri::decommit(addr, size) };
    }
}

/// Return a range to the OS.
///
/// # Safety
/// `addr`/`size` must exactly match a prior `reserve` call (or a
/// sub-range accepted by the platform, which on Unix is any page-aligned
/// sub-range via `munmap`).
#[inline]
pub unsafe fn release(addr: *mut u8, size: usize) {
    #[cfg(windows)]
    {
        unsafe { windows::release(addr, size) };
    }
    #[cfg(unix)]
    {
        unsafe { unix::release(addr, size) };
    }
    #[cfg(any(miri, all(not(unix), not(windows))))]
    {
        unsafe { miri::release(addr, size) };
    }
}

/// Attempt to move a mapping to a new address without copying physical
/// pages, growing or shrinking it to `new_size`. Returns null if the
/// platform cannot do this (the caller falls back to alloc-copy-free).
///
/// # Safety
/// `addr` must be the base of a live `reserve`d range of the old size.
#[inline]
pub unsafe fn remap(addr: *mut u8, old_size: usize, new_size: usize) -> *mut u8 {
    #[cfg(windows)]
    {
        let _ = (addr, old_size, new_size);
        ptr::null_mut()
    }
    #[cfg(unix)]
    {
        unsafe { unix::remap(addr, old_size, new_size) }
    }
    #[cfg(any(miri, all(not(unix), not(windows))))]
    {
        let _ = (addr, old_size, new_size);
        ptr::null_mut()
    }
}

/// The platform's natural page size.
#[inline]
pub fn page_size() -> usize {
    #[cfg(windows)]
    {
        windows::page_size()
    }
    #[cfg(unix)]
    {
        unix::page_size()
    }
    #[cfg(any(miri, all(not(unix), not(windows))))]
    {
        crate::config::PAGE_SIZE
    }
}

/// Serializes the aligned-region reservation retry sequence (spec §4.1 /
/// §9): rare, but must be serialized so two threads never race to release
/// and re-reserve the same tentative hole out from under each other.
static RESERVE_LOCK: SpinLock = SpinLock::new();

/// Reserve a `size`-byte range aligned to `align` (`align` a power of two,
/// itself a multiple of the platform granularity), preferring to land at
/// `hint` (see [`reserve`]). Tries the OS's natural reservation first; if
/// misaligned, releases it and over-reserves by `align` extra bytes purely
/// as a witness for an aligned address within range, releases that too, and
/// reserves exactly `size` bytes at the now-known-aligned address (spec
/// §4.1: "release again and reserve exactly at the rounded-up aligned
/// address"). At most three attempts; returns null if the platform still
/// can't produce an aligned range.
///
/// Deliberately never trims a reservation by releasing a sub-range of it:
/// Unix allows partial `munmap`, but Windows's `VirtualFree(MEM_RELEASE)`
/// only ever releases an entire reservation at once, so a trim-the-slack
/// strategy here would silently corrupt the Windows backend. Release-then-
/// reserve-exact works identically on every backend at the cost of a narrow
/// race (another thread's allocation can land in the freed address between
/// the two calls); the loop's final fallback attempt absorbs that.
///
/// # Safety
/// Caller must release the returned pointer with `release(ptr, size)`.
pub unsafe fn reserve_aligned(hint: *mut u8, size: usize, align: usize, commit_now: bool) -> *mut u8 {
    debug_assert!(align.is_power_of_two());

    let _guard = RESERVE_LOCK.lock();

    for _ in 0..3 {
        let raw = unsafe { reserve(hint, size, commit_now) };
        if raw.is_null() {
            return ptr::null_mut();
        }

        let raw_addr = raw as usize;
        if raw_addr % align == 0 {
            return raw;
        }
        unsafe { release(raw, size) };

        // Over-reserve purely to learn an aligned address the platform is
        // currently willing to back; then give it back in full before
        // re-requesting just `size` bytes there.
        let witness = unsafe { reserve(hint, size + align, commit_now) };
        if witness.is_null() {
            return ptr::null_mut();
        }
        let witness_addr = witness as usize;
        let aligned_addr = (witness_addr + align - 1) & !(align - 1);
        unsafe { release(witness, size + align) };

        let retry = unsafe { reserve(aligned_addr as *mut u8, size, commit_now) };
        if !retry.is_null() && retry as usize == aligned_addr {
            return retry;
        }
        if !retry.is_null() {
            unsafe { release(retry, size) };
        }
        // Raced with another allocation for the aligned slot; loop and retry
        // the whole sequence from scratch.
    }

    ptr::null_mut()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_commit_release_roundtrip() {
        unsafe {
            let size = page_size() * 4;
            let ptr = reserve(ptr::null_mut(), size, true);
            assert!(!ptr.is_null());
            ptr::write_bytes(ptr, 0xAB, size);
            assert_eq!(*ptr, 0xAB);
            release(ptr, size);
        }
    }

    #[test]
    fn reserve_aligned_produces_aligned_address() {
        unsafe {
            let align = 1 << 22; // 4 MiB, smallest region size
            let ptr = reserve_aligned(ptr::null_mut(), align, align, false);
            assert!(!ptr.is_null());
            assert_eq!(ptr as usize % align, 0);
            release(ptr, align);
        }
    }

    #[test]
    fn decommit_then_recommit_is_usable() {
        unsafe {
            let size = page_size();
            let ptr = reserve(ptr::null_mut(), size, true);
            assert!(!ptr.is_null());
            decommit(ptr, size);
            assert!(commit(ptr, size));
            *ptr = 7;
            assert_eq!(*ptr, 7);
            release(ptr, size);
        }
    }
}
