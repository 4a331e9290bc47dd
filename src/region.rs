//! The region header shared by every container type, and the O(1)
//! address-routing functions built on the partition map (spec §3, Invariant
//! A and Invariant B).
//!
//! No side table of any kind backs `partition_of`/`region_base`/
//! `chunk_index` — each is a handful of shifts and masks on the pointer's
//! own bits. This is, per spec's design notes, the single most important
//! property of the whole system.

use crate::config::{NUM_PARTITIONS, PARTITION_BASE, PARTITION_LIMIT, REGION_SHIFT, REGION_SIZE};
use core::ptr;
use core::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

/// Thread id marking a region as abandoned (spec §3).
pub const ABANDONED: i64 = -1;

/// Discriminates the container occupying a region.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum SlotType {
    Pool = 0,
    Arena = 1,
    Implicit = 2,
}

/// Per-level bitmask state for one arena level (spec §4.2).
pub struct LevelState {
    /// Bit `i` set iff slot `i` is currently reserved.
    pub allocated: AtomicU64,
    /// Two bits per multi-slot allocation: one at the start index, one at
    /// the end, so `free` can recover the run length from the start bit.
    pub range_tag: AtomicU64,
    /// Summary bit set when this level's 64 slots are all allocated, read
    /// by the parent level to skip a full child without scanning it.
    pub filter: AtomicU64,
}

impl LevelState {
    pub const fn new() -> Self {
        Self {
            allocated: AtomicU64::new(0),
            range_tag: AtomicU64::new(0),
            filter: AtomicU64::new(0),
        }
    }
}

impl Default for LevelState {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-size header at the base of every region (spec §3 "Region header").
///
/// `prev`/`next` thread the region into exactly one per-thread,
/// per-size-class intrusive list at a time (spec's Design Notes: "Intrusive
/// linked lists everywhere").
#[repr(C)]
pub struct RegionHeader {
    /// Owning thread's numeric id; `ABANDONED` (-1) when no thread owns it.
    pub thread_id: AtomicI64,
    pub partition_id: u8,
    pub slot_type: SlotType,
    /// Intrusive per-thread, per-size-class list links.
    pub prev: AtomicUsize,
    pub next: AtomicUsize,
}

impl RegionHeader {
    /// Initialize a freshly committed header. Takes `&mut self` because this
    /// must run before the region is published to any other thread (the
    /// caller holds exclusive access via a raw pointer at creation time).
    pub fn init(&mut self, thread_id: i64, partition_id: u8, slot_type: SlotType) {
        self.partition_id = partition_id;
        self.slot_type = slot_type;
        *self.prev.get_mut() = 0;
        *self.next.get_mut() = 0;
        self.thread_id.store(thread_id, Ordering::Release);
    }

    #[inline]
    pub fn is_abandoned(&self) -> bool {
        self.thread_id.load(Ordering::Acquire) == ABANDONED
    }

    /// Attempt to take ownership of an abandoned region (spec §4.5 step 4).
    #[inline]
    pub fn claim(&self, new_owner: i64) -> bool {
        self.thread_id
            .compare_exchange(ABANDONED, new_owner, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Mark the region abandoned (spec §4.5 teardown).
    #[inline]
    pub fn abandon(&self) {
        self.thread_id.store(ABANDONED, Ordering::Release);
    }
}

/// Bytes reserved for `RegionHeader` at the base of every region, rounded
/// up to a cache line so container payloads never share a line with it.
pub const HEADER_SIZE: usize = 64;

const _: () = assert!(core::mem::size_of::<RegionHeader>() <= HEADER_SIZE);

/// Compute the partition index owning address `x` in O(1) via the position
/// of its highest set bit (spec §3: "the count-leading-zeros... selects the
/// partition"). Returns `None` if `x` lies outside the partition map.
#[inline]
pub fn partition_of(x: usize) -> Option<usize> {
    if x < PARTITION_BASE[0] || x >= PARTITION_LIMIT {
        return None;
    }
    let highest_bit = usize::BITS - 1 - x.leading_zeros();
    if highest_bit < 41 {
        return None;
    }
    let p = (highest_bit - 41) as usize;
    if p >= NUM_PARTITIONS {
        return None;
    }
    // Guard against the rare case where `x` is addressed just below the
    // next partition's base but its high bit already matches it, or just
    // above the current partition's span (partitions are contiguous powers
    // of two so this only ever disambiguates an off-by-one at the boundary).
    if x < PARTITION_BASE[p] {
        return None;
    }
    Some(p)
}

/// Mask `x` down to the base of the region containing it, given its
/// partition `p`. O(1): a single shift-derived mask.
#[inline]
pub fn region_base(x: usize, p: usize) -> usize {
    let shift = REGION_SHIFT[p];
    let mask = !((1usize << shift) - 1);
    x & mask
}

/// Index, in `0..64`, of the 1/64th-region-sized chunk containing `x`
/// within its region.
#[inline]
pub fn chunk_index(x: usize, p: usize) -> usize {
    let base = region_base(x, p);
    let shift = REGION_SHIFT[p] - 6;
    (x - base) >> shift
}

/// Reinterpret a region's base address as its header.
///
/// # Safety
/// `base` must be the base address of a live region.
#[inline]
pub unsafe fn header_at(base: usize) -> *const RegionHeader {
    base as *const RegionHeader
}

#[inline]
pub unsafe fn header_at_mut(base: usize) -> *mut RegionHeader {
    base as *mut RegionHeader
}

/// Convenience: locate the owning region's header for an arbitrary pointer
/// previously returned by the allocator, or null if it's not ours.
///
/// # Safety
/// If non-null, the returned pointer must point to an initialized, live
/// `RegionHeader`.
#[inline]
pub unsafe fn header_for(ptr: *const u8) -> *mut RegionHeader {
    let x = ptr as usize;
    match partition_of(x) {
        Some(p) => unsafe { header_at_mut(region_base(x, p)) },
        None => ptr::null_mut(),
    }
}
