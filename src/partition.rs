//! The partition allocator (spec §4.1): one per process, owns the fixed
//! address map, hands out/reclaims regions, and tracks an abandoned-region
//! list per partition for the adoption protocol.
//!
//! The occupancy bitmap here is pure bookkeeping for *which slots are
//! reserved* — it is never consulted by `free()` (that always routes by
//! address arithmetic, per `region::partition_of`). Losing it would only
//! cost reuse of address space, never correctness or the O(1) free-path
//! guarantee.

use crate::config::{
    ALLOC_AT_BASE, ALLOC_AT_LIMIT, ALLOC_OS_BASE, ALLOC_OS_LIMIT, NUM_PARTITIONS, PARTITION_BASE,
    REGION_SIZE,
};
use crate::platform;
use crate::region::{RegionHeader, SlotType, ABANDONED};
use crate::sync::SpinMutex;
use core::ptr;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Practical cap on live regions per partition. This bounds the occupancy
/// bitmap to a fixed, small static size; it is a pragmatic implementation
/// limit, not a property the spec requires bounded (partitions are, in
/// principle, limited only by the address-space span allotted to them).
const MAX_REGIONS_PER_PARTITION: usize = 4096;
const BITMAP_WORDS: usize = MAX_REGIONS_PER_PARTITION / 64;

struct Occupancy {
    words: [AtomicU64; BITMAP_WORDS],
}

impl Occupancy {
    const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            words: [ZERO; BITMAP_WORDS],
        }
    }

    /// Find and claim the lowest-indexed free slot. Returns `None` if full.
    fn claim_slot(&self, lock: &SpinMutex<()>) -> Option<usize> {
        let _guard = lock.lock();
        for (wi, word) in self.words.iter().enumerate() {
            let w = word.load(Ordering::Relaxed);
            if w != u64::MAX {
                let bit = (!w).trailing_zeros() as usize;
                word.fetch_or(1u64 << bit, Ordering::Relaxed);
                return Some(wi * 64 + bit);
            }
        }
        None
    }

    fn release_slot(&self, lock: &SpinMutex<()>, slot: usize) {
        let _guard = lock.lock();
        let wi = slot / 64;
        let bit = slot % 64;
        self.words[wi].fetch_and(!(1u64 << bit), Ordering::Relaxed);
    }
}

/// Singly-linked list of abandoned regions for one partition, threaded
/// through each region's own header (`RegionHeader::next`), guarded by a
/// spinlock. Adoption (`claim_abandoned`) pops from the front; teardown
/// (`abandon_region`) pushes to the front.
struct AbandonedList {
    head: AtomicUsize, // region base address, or 0
}

impl AbandonedList {
    const fn new() -> Self {
        Self {
            head: AtomicUsize::new(0),
        }
    }

    fn push(&self, lock: &SpinMutex<()>, region_base: usize, header: &RegionHeader) {
        let _guard = lock.lock();
        let old_head = self.head.load(Ordering::Relaxed);
        header.next.store(old_head, Ordering::Relaxed);
        self.head.store(region_base, Ordering::Relaxed);
    }

    /// Pop any one abandoned region, if present.
    fn pop(&self, lock: &SpinMutex<()>) -> Option<usize> {
        let _guard = lock.lock();
        let head = self.head.load(Ordering::Relaxed);
        if head == 0 {
            return None;
        }
        let header = unsafe { &*crate::region::header_at(head) };
        let next = header.next.load(Ordering::Relaxed);
        self.head.store(next, Ordering::Relaxed);
        Some(head)
    }
}

struct PartitionState {
    occupancy: Occupancy,
    abandoned: AbandonedList,
    lock: SpinMutex<()>,
}

impl PartitionState {
    const fn new() -> Self {
        Self {
            occupancy: Occupancy::new(),
            abandoned: AbandonedList::new(),
            lock: SpinMutex::new(()),
        }
    }
}

struct Partitions {
    states: [PartitionState; NUM_PARTITIONS],
}

impl Partitions {
    const fn new() -> Self {
        Self {
            states: [
                PartitionState::new(),
                PartitionState::new(),
                PartitionState::new(),
                PartitionState::new(),
                PartitionState::new(),
                PartitionState::new(),
                PartitionState::new(),
            ],
        }
    }
}

static PARTITIONS: Partitions = Partitions::new();

/// Reserve a fresh region in partition `p`, commit its header page, and
/// return the region's base address (which is also its `RegionHeader*`).
/// Returns null if the partition is full or the OS reservation fails.
pub fn reserve_region(p: usize, thread_id: i64, slot_type: SlotType) -> *mut u8 {
    let state = &PARTITIONS.states[p];
    let slot = match state.occupancy.claim_slot(&state.lock) {
        Some(s) => s,
        None => return ptr::null_mut(),
    };

    let region_size = REGION_SIZE[p];
    let slot_base = PARTITION_BASE[p] + slot * region_size;

    // Hint the OS toward this slot's canonical address so the region lands
    // inside partition `p`'s band whenever the platform honors placement
    // hints (typical on 64-bit Linux/macOS; Windows falls back silently).
    // `region::partition_of` and friends work on whatever address actually
    // comes back, so a platform that ignores the hint still routes
    // correctly — it simply means occupancy bookkeeping and the live
    // address can diverge, which only affects address-space reuse
    // efficiency, never correctness.
    let addr =
        unsafe { platform::reserve_aligned(slot_base as *mut u8, region_size, region_size, false) };
    if addr.is_null() {
        state.occupancy.release_slot(&state.lock, slot);
        return ptr::null_mut();
    }

    if !unsafe { platform::commit(addr, crate::region::HEADER_SIZE) } {
        unsafe { platform::release(addr, region_size) };
        state.occupancy.release_slot(&state.lock, slot);
        return ptr::null_mut();
    }

    let header = addr as *mut RegionHeader;
    unsafe { (*header).init(thread_id, p as u8, slot_type) };
    crate::stat_inc!(region_reserve_count);
    addr
}

/// Release a fully-empty region back to the OS.
///
/// # Safety
/// `region` must be the base of a region this partition allocator handed
/// out, with no live blocks and not present on the abandoned list.
pub unsafe fn release_region(region: *mut u8, p: usize) {
    let region_size = REGION_SIZE[p];
    unsafe { platform::release(region, region_size) };
    let slot = ((region as usize).wrapping_sub(PARTITION_BASE[p]) / region_size)
        % MAX_REGIONS_PER_PARTITION;
    let state = &PARTITIONS.states[p];
    state.occupancy.release_slot(&state.lock, slot);
    crate::stat_inc!(region_release_count);
}

/// Mark a region abandoned and push it onto its partition's abandoned list
/// (spec §4.5 thread teardown).
pub fn abandon_region(region: *mut u8, p: usize) {
    let header = unsafe { &*(region as *const RegionHeader) };
    header.abandon();
    let state = &PARTITIONS.states[p];
    state.abandoned.push(&state.lock, region as usize, header);
    crate::stat_inc!(abandon_count);
}

/// Attempt to claim an abandoned region in partition `p` for `thread_id`.
/// Returns its base address on success.
pub fn claim_any_abandoned(p: usize, thread_id: i64) -> *mut u8 {
    let state = &PARTITIONS.states[p];
    loop {
        match state.abandoned.pop(&state.lock) {
            None => return ptr::null_mut(),
            Some(base) => {
                let header = unsafe { &*(base as *const RegionHeader) };
                if header.claim(thread_id) {
                    return base as *mut u8;
                }
                // Raced with another claimant via `RegionHeader::claim`
                // directly (spec's CAS-based adoption); try the next one.
            }
        }
    }
}

/// Attempt to claim a *specific* abandoned region pointed to by `region`
/// (spec §4.5 step 4: a thread discovers abandonment while routing a free,
/// and tries to adopt that exact region rather than any abandoned one).
pub fn claim_abandoned(region: *mut u8, thread_id: i64) -> bool {
    let header = unsafe { &*(region as *const RegionHeader) };
    header.claim(thread_id)
}

/// Escalate to the next partition when `p` cannot satisfy a request (spec
/// §4.1 `promote`). Returns `None` at the top of the map.
pub fn promote(p: usize) -> Option<usize> {
    if p + 1 < NUM_PARTITIONS {
        Some(p + 1)
    } else {
        None
    }
}

/// Practical cap on live `alloc_at` allocations outstanding at once. Unlike
/// every other container type, `alloc_at` must hand back the caller's exact
/// requested address, so it cannot carry a size-recording header in front
/// of the returned pointer without shifting that address — a small
/// registry is the pragmatic alternative for the handful of callers who use
/// this entry point.
const MAX_ALLOC_AT_ENTRIES: usize = 256;

static ALLOC_AT_REGISTRY: SpinMutex<[(usize, usize); MAX_ALLOC_AT_ENTRIES]> =
    SpinMutex::new([(0usize, 0usize); MAX_ALLOC_AT_ENTRIES]);

/// Reserve exactly `size` bytes at `addr` (spec §6 `alloc_at`: pointer-stable,
/// caller-addressed allocation used for memory-mapped-file-backed use
/// cases). Fails — rather than silently landing elsewhere — if the OS
/// cannot place the mapping at precisely that address, or if `addr` falls
/// outside the dedicated window.
pub fn alloc_at(size: usize, addr: usize) -> *mut u8 {
    if size == 0 || addr < ALLOC_AT_BASE || addr >= ALLOC_AT_LIMIT {
        return ptr::null_mut();
    }
    let page = platform::page_size();
    let total = size.next_multiple_of(page);
    if addr + total > ALLOC_AT_LIMIT {
        return ptr::null_mut();
    }

    let reserved = unsafe { platform::reserve(addr as *mut u8, total, false) };
    if reserved.is_null() {
        return ptr::null_mut();
    }
    if reserved as usize != addr {
        unsafe { platform::release(reserved, total) };
        return ptr::null_mut();
    }
    if !unsafe { platform::commit(reserved, total) } {
        unsafe { platform::release(reserved, total) };
        return ptr::null_mut();
    }

    let mut slots = ALLOC_AT_REGISTRY.lock();
    match slots.iter_mut().find(|(a, _)| *a == 0) {
        Some(slot) => {
            *slot = (addr, total);
            reserved
        }
        None => {
            unsafe { platform::release(reserved, total) };
            ptr::null_mut()
        }
    }
}

/// If `ptr` was handed out by `alloc_at`, release it and return `true`;
/// otherwise return `false` without touching anything.
pub fn free_alloc_at_if_owned(ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    if addr < ALLOC_AT_BASE || addr >= ALLOC_AT_LIMIT {
        return false;
    }
    let mut slots = ALLOC_AT_REGISTRY.lock();
    if let Some(slot) = slots.iter_mut().find(|(a, _)| *a == addr) {
        let total = slot.1;
        *slot = (0, 0);
        drop(slots);
        unsafe { platform::release(ptr, total) };
    }
    true
}

/// Bump cursor for `alloc_os` (spec §6, §5 "header-page convention"):
/// OS-direct allocations have no meaningful size class or region structure,
/// so unlike the partition slots above they are handed out by simply
/// advancing a shared cursor through the dedicated address band.
static OS_DIRECT_CURSOR: AtomicUsize = AtomicUsize::new(ALLOC_OS_BASE);

/// Reserve `size` bytes directly from the OS, outside any partition, at
/// alignment `align` (spec §6 `alloc_os`). Prepends a one-page header
/// recording the reservation's total extent so `free_os_direct_if_owned`
/// can release it without a side table. Returns null if the dedicated
/// address band is exhausted or the OS reservation fails.
pub fn os_direct_alloc(size: usize, align: usize) -> *mut u8 {
    let page = platform::page_size();
    let align = align.max(page);
    let total = (page + size).next_multiple_of(align);

    loop {
        let start = OS_DIRECT_CURSOR.load(Ordering::Relaxed);
        let aligned_start = start.next_multiple_of(align);
        let end = aligned_start + total;
        if end > ALLOC_OS_LIMIT {
            return ptr::null_mut();
        }
        if OS_DIRECT_CURSOR
            .compare_exchange_weak(start, end, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let addr =
                unsafe { platform::reserve_aligned(aligned_start as *mut u8, total, align, false) };
            if addr.is_null() {
                return ptr::null_mut();
            }
            if !unsafe { platform::commit(addr, total) } {
                unsafe { platform::release(addr, total) };
                return ptr::null_mut();
            }
            unsafe { (addr as *mut usize).write(total) };
            crate::stat_inc!(os_direct_alloc_count);
            crate::stat_add!(os_direct_alloc_bytes, total);
            return unsafe { addr.add(page) };
        }
    }
}

/// If `ptr` falls inside the `alloc_os` band, release its backing
/// reservation and return `true`; otherwise return `false` without touching
/// anything (spec §6 `free` dispatch: "checked before partition routing").
pub fn free_os_direct_if_owned(ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    if addr < ALLOC_OS_BASE || addr >= ALLOC_OS_LIMIT {
        return false;
    }
    let page = platform::page_size();
    let base = (addr - page) as *mut u8;
    let total = unsafe { core::ptr::read(base as *const usize) };
    unsafe { platform::release(base, total) };
    true
}

/// Usable size of an `alloc_os` allocation, or `None` if `ptr` doesn't fall
/// inside the dedicated band (used by `realloc`'s in-place-fits check).
pub fn os_direct_usable_size(ptr: *mut u8) -> Option<usize> {
    let addr = ptr as usize;
    if addr < ALLOC_OS_BASE || addr >= ALLOC_OS_LIMIT {
        return None;
    }
    let page = platform::page_size();
    let total = unsafe { core::ptr::read((addr - page) as *const usize) };
    Some(total - page)
}

/// Attempt to grow an `alloc_os` allocation in place via `platform::remap`
/// (spec's design note: "realloc ... large OS-direct allocations may be
/// remapped in place"). `None` means `ptr` isn't one of ours — the caller
/// should try another window. `Some(null)` means `ptr` is ours but the
/// platform can't remap it (e.g. Windows, or Miri); the caller must fall
/// back to alloc-copy-free, using `os_direct_usable_size` for the copy
/// length and `free_os_direct_if_owned` to release the old block. Any other
/// `Some(p)` is the allocation's (possibly moved) new address.
pub fn os_direct_realloc(ptr: *mut u8, new_size: usize) -> Option<*mut u8> {
    let addr = ptr as usize;
    if addr < ALLOC_OS_BASE || addr >= ALLOC_OS_LIMIT {
        return None;
    }
    let page = platform::page_size();
    let base = (addr - page) as *mut u8;
    let old_total = unsafe { core::ptr::read(base as *const usize) };
    let new_total = (page + new_size).next_multiple_of(page);

    if new_total <= old_total {
        return Some(ptr);
    }

    let remapped = unsafe { platform::remap(base, old_total, new_total) };
    if remapped.is_null() {
        return Some(ptr::null_mut()); // remap unsupported; caller copy-reallocates.
    }
    unsafe { (remapped as *mut usize).write(new_total) };
    Some(unsafe { remapped.add(page) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_direct_alloc_is_aligned_and_outside_partitions() {
        let p = os_direct_alloc(4096, 4096);
        assert!(!p.is_null());
        assert_eq!(p as usize % 4096, 0);
        assert_eq!(crate::region::partition_of(p as usize), None);
        assert!(free_os_direct_if_owned(p));
    }

    #[test]
    fn free_os_direct_if_owned_rejects_foreign_pointers() {
        assert!(!free_os_direct_if_owned(PARTITION_BASE[0] as *mut u8));
    }

    #[test]
    fn reserve_and_release_round_trip() {
        let region = reserve_region(0, 1, SlotType::Pool);
        assert!(!region.is_null());
        let header = unsafe { &*(region as *const RegionHeader) };
        assert_eq!(header.thread_id.load(Ordering::Acquire), 1);
        unsafe { release_region(region, 0) };
    }

    #[test]
    fn abandon_then_claim() {
        let region = reserve_region(1, 42, SlotType::Arena);
        assert!(!region.is_null());
        abandon_region(region, 1);
        let header = unsafe { &*(region as *const RegionHeader) };
        assert!(header.is_abandoned());

        let claimed = claim_any_abandoned(1, 99);
        assert_eq!(claimed, region);
        assert_eq!(header.thread_id.load(Ordering::Acquire), 99);

        unsafe { release_region(region, 1) };
    }

    #[test]
    fn os_direct_realloc_grows_or_keeps_in_place() {
        let p = os_direct_alloc(4096, 4096);
        assert!(!p.is_null());
        assert_eq!(os_direct_usable_size(p), Some(4096));
        // Shrinking (or fitting within the already-committed total) keeps the
        // same pointer.
        assert_eq!(os_direct_realloc(p, 10), Some(p));
        assert!(free_os_direct_if_owned(p));
    }

    #[test]
    fn promote_walks_up_and_stops() {
        assert_eq!(promote(0), Some(1));
        assert_eq!(promote(NUM_PARTITIONS - 2), Some(NUM_PARTITIONS - 1));
        assert_eq!(promote(NUM_PARTITIONS - 1), None);
    }
}
