//! Pool container: a single size class's equal-size free-list (spec §4.3).
//!
//! A pool occupies exactly one region (partition 0, 1, or 2 depending on the
//! class's block size — see `config::pool_partition_for`). Blocks are handed
//! out bump-pointer style until the region is fully committed, then recycled
//! off an intrusive free list threaded through the first word of each freed
//! block. The free list is split into `free` (popped by the owner until
//! exhausted) and `tail` (where returns accumulate), so the hot pop path
//! never touches the cache line the tail is growing in.

use crate::region::{HEADER_SIZE, RegionHeader, SlotType};
use crate::size_class;
use crate::sync::DeferredFreeStack;
use core::sync::atomic::Ordering;

/// No next/prev block linked (free-list terminator, or "tail empty").
const NIL: i64 = -1;

/// Header at the base of a pool's region, immediately following the common
/// `RegionHeader`. Everything after `payload_offset()` bytes from the region
/// base is the pool's block storage.
#[repr(C)]
pub struct PoolHeader {
    pub region: RegionHeader,
    /// Index into the pool size-class table (spec §4.6).
    class: u32,
    block_size: u32,
    recip: u32,
    /// Capacity: how many blocks the region's payload can hold.
    num_available: u32,
    /// Bump-pointer high-water mark: blocks `0..num_committed` have backing
    /// storage handed out at least once.
    num_committed: u32,
    /// Live blocks currently in the caller's hands.
    num_used: u32,
    /// Head of the free list the owner pops from; `NIL` when exhausted.
    free: i64,
    /// Head of the list where frees accumulate; swapped into `free` on
    /// underflow (spec §4.3: "keeps the head warm... without touching it").
    tail: i64,
    /// Cross-thread inbox: foreign frees land here, the owner drains and
    /// merges them into `tail` before its next allocation (spec §4.3
    /// "Thread-free").
    thread_free: DeferredFreeStack,
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() <= HEADER_SIZE);

#[inline]
fn payload_offset() -> usize {
    // Round the header up to the block size's own alignment requirement is
    // unnecessary here — blocks only need word alignment (spec §6 `alloc`),
    // and `HEADER_SIZE` (64) already satisfies that for every pool class.
    core::mem::size_of::<PoolHeader>().next_multiple_of(HEADER_SIZE.max(8))
}

impl PoolHeader {
    /// Initialize a freshly reserved region as a pool for `class`.
    ///
    /// # Safety
    /// `region` must be the base of a region just returned by
    /// `partition::reserve_region`, committed through at least
    /// `payload_offset()` bytes, with `RegionHeader::init` already run.
    pub unsafe fn init(region: *mut u8, region_size: usize, thread_id: i64, class: usize) {
        let header = region as *mut PoolHeader;
        let block_size = size_class::class_to_size(class) as u32;
        let payload = payload_offset();
        let available_bytes = region_size.saturating_sub(payload);
        let num_available = (available_bytes / block_size as usize) as u32;
        unsafe {
            (*header).class = class as u32;
            (*header).block_size = block_size;
            (*header).recip = size_class::class_recip(class);
            (*header).num_available = num_available;
            (*header).num_committed = 0;
            (*header).num_used = 0;
            (*header).free = NIL;
            (*header).tail = NIL;
            (*header).thread_free = DeferredFreeStack::new();
            let _ = thread_id;
        }
    }

    #[inline]
    fn base(&self) -> usize {
        self as *const _ as usize
    }

    #[inline]
    fn payload_base(&self) -> usize {
        self.base() + payload_offset()
    }

    #[inline]
    fn block_at(&self, idx: i64) -> *mut u8 {
        (self.payload_base() + idx as usize * self.block_size as usize) as *mut u8
    }

    /// Recover a block's index from its address via the class's fixed-point
    /// reciprocal (spec §4.3, §8 P7) — no division on the hot path.
    #[inline]
    fn index_of(&self, ptr: *mut u8) -> i64 {
        let offset = (ptr as usize - self.payload_base()) as u64;
        ((offset * self.recip as u64) >> 32) as i64
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.num_used == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.free == NIL && self.tail == NIL && self.num_committed >= self.num_available
    }

    #[inline]
    pub fn class(&self) -> usize {
        self.class as usize
    }

    /// Usable size of any block this pool hands out (every block in a pool
    /// is the same size, so unlike arena/implicit-list this needs no probe
    /// of `ptr` itself; used by `realloc`'s same-class fast path).
    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Pop a block off the free list, bump-allocate a fresh one, or recycle
    /// the tail into the head (spec §4.3 `Allocate`). Returns null if full.
    pub fn allocate(&mut self) -> *mut u8 {
        if self.free == NIL && self.tail != NIL {
            self.free = self.tail;
            self.tail = NIL;
        }

        if self.free != NIL {
            let idx = self.free;
            let block = self.block_at(idx);
            self.free = unsafe { *(block as *const i64) };
            self.num_used += 1;
            return block;
        }

        if self.num_committed < self.num_available {
            let idx = self.num_committed as i64;
            self.num_committed += 1;
            self.num_used += 1;
            return self.block_at(idx);
        }

        core::ptr::null_mut()
    }

    /// Owner-thread local free: push `ptr` onto `tail` (spec §4.3 `Free`).
    /// Returns `true` if this was the pool's last live block.
    pub fn free_local(&mut self, ptr: *mut u8) -> bool {
        let idx = self.index_of(ptr);
        if idx < 0 || idx as u32 >= self.num_available {
            // Invariant violation (spec §7): poison rather than corrupt.
            self.free = NIL;
            self.tail = NIL;
            return false;
        }
        unsafe { *(ptr as *mut i64) = self.tail };
        self.tail = idx;
        self.num_used -= 1;
        self.num_used == 0
    }

    /// Push a cross-thread free onto the MPSC inbox (spec §4.3
    /// "Thread-free"). Safe to call from any thread, including the owner's.
    pub fn push_thread_free(&self, ptr: *mut u8) {
        unsafe { self.thread_free.push(ptr) };
    }

    /// Splice a whole pre-linked chain of cross-thread frees onto the inbox
    /// in one CAS (the per-thread allocator's deferred-free batch flush).
    ///
    /// # Safety
    /// See `DeferredFreeStack::push_chain`.
    pub unsafe fn push_thread_free_chain(&self, head: *mut u8, tail: *mut u8) {
        unsafe { self.thread_free.push_chain(head, tail) };
    }

    /// Drain the cross-thread inbox and merge every entry into the local
    /// free list as if freed locally (spec §4.3: drain into `deferred_free`,
    /// then merge `deferred_free` into `free`; collapsed into one pass here
    /// since `deferred_free` has no independent use beyond staging).
    /// Returns `true` if the pool became empty as a result.
    pub fn drain_thread_free(&mut self) -> bool {
        let mut cur = self.thread_free.drain();
        let mut went_empty = false;
        while !cur.is_null() {
            let next = unsafe { *(cur as *mut *mut u8) };
            went_empty |= self.free_local(cur);
            cur = next;
        }
        went_empty
    }

    #[inline]
    pub fn has_pending_thread_free(&self) -> bool {
        !self.thread_free.is_empty()
    }

    #[inline]
    pub fn thread_id(&self) -> i64 {
        self.region.thread_id.load(Ordering::Acquire)
    }
}

/// Pick the smallest partition whose region comfortably hosts a pool of
/// `block_size` blocks (spec §5 "Features recovered from original_source/":
/// heap-level dispatch thresholds). Pools only ever live in partitions 0-2.
pub fn partition_for(block_size: usize) -> usize {
    const P0_CEIL: usize = 16 * 1024;
    const P1_CEIL: usize = 128 * 1024;
    if block_size <= P0_CEIL {
        0
    } else if block_size <= P1_CEIL {
        1
    } else {
        2
    }
}

pub const SLOT_TYPE: SlotType = SlotType::Pool;
