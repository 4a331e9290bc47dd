//! The per-thread allocator (spec §4.5): owns one intrusive queue per size
//! class, routes `alloc(size)` to a container in the matching queue and
//! `free(ptr)` to the container inferred from the pointer's address, and
//! carries the cached-slot fast path and the deferred-free batch.
//!
//! Container queues are themselves intrusive — each region's own
//! `RegionHeader::prev`/`next` thread it into exactly one queue at a time,
//! so no side allocation backs the per-thread state beyond the fixed-size
//! struct itself (Design Notes: "Intrusive linked lists everywhere").

use crate::arena::ArenaHeader;
use crate::config::{self, ARENA_MAX_BLOCK, POOL_MAX_BLOCK};
use crate::implicit_list::ImplicitListHeader;
use crate::pool::PoolHeader;
use crate::region::{self, RegionHeader, SlotType};
use crate::size_class::{self, NUM_POOL_CLASSES};
use crate::{arena, partition, platform, pool, tid};
use core::sync::atomic::Ordering;

const NUM_ARENA_PARTITIONS: usize = 4; // partitions 2..=5
const ARENA_BASE_PARTITION: usize = 2;
const IMPLICIT_PARTITION: usize = 6;

#[inline]
fn header_of(region_base: usize) -> &'static RegionHeader {
    unsafe { &*region::header_at(region_base) }
}

/// A size class's intrusive queue of regions this thread currently owns.
/// `head == 0` means empty. Links live in each region's own header.
#[derive(Clone, Copy)]
struct Queue {
    head: usize,
}

impl Queue {
    const fn new() -> Self {
        Self { head: 0 }
    }

    fn push_front(&mut self, region_base: usize) {
        let h = header_of(region_base);
        h.prev.store(0, Ordering::Relaxed);
        h.next.store(self.head, Ordering::Relaxed);
        if self.head != 0 {
            header_of(self.head).prev.store(region_base, Ordering::Relaxed);
        }
        self.head = region_base;
    }

    fn remove(&mut self, region_base: usize) {
        let h = header_of(region_base);
        let prev = h.prev.load(Ordering::Relaxed);
        let next = h.next.load(Ordering::Relaxed);
        if prev != 0 {
            header_of(prev).next.store(next, Ordering::Relaxed);
        } else {
            self.head = next;
        }
        if next != 0 {
            header_of(next).prev.store(prev, Ordering::Relaxed);
        }
    }

    fn iter(&self) -> QueueIter {
        QueueIter { cur: self.head }
    }

    /// Snapshot every member into a fixed buffer so the caller can freely
    /// remove entries while visiting them (removal mutates the very links
    /// `QueueIter` walks).
    fn snapshot(&self) -> Snapshot {
        let mut items = [0usize; Snapshot::CAP];
        let mut len = 0;
        for base in self.iter() {
            if len >= Snapshot::CAP {
                break;
            }
            items[len] = base;
            len += 1;
        }
        Snapshot { items, len }
    }
}

struct QueueIter {
    cur: usize,
}

impl Iterator for QueueIter {
    type Item = usize;
    fn next(&mut self) -> Option<usize> {
        if self.cur == 0 {
            return None;
        }
        let base = self.cur;
        self.cur = header_of(base).next.load(Ordering::Relaxed);
        Some(base)
    }
}

/// Fixed-capacity snapshot of a queue's members, bounded by
/// `MAX_REGIONS_PER_PARTITION`-scale queues in practice.
struct Snapshot {
    items: [usize; Self::CAP],
    len: usize,
}

impl Snapshot {
    const CAP: usize = 256;

    fn iter(&self) -> core::slice::Iter<'_, usize> {
        self.items[..self.len].iter()
    }
}

/// Splice a pre-linked chain onto whichever container type owns `base`.
#[inline]
fn chain_push(slot_type: SlotType, base: usize, head: *mut u8, tail: *mut u8) {
    unsafe {
        match slot_type {
            SlotType::Pool => (*(base as *const PoolHeader)).push_thread_free_chain(head, tail),
            SlotType::Arena => (*(base as *const ArenaHeader)).push_thread_free_chain(head, tail),
            SlotType::Implicit => {
                (*(base as *const ImplicitListHeader)).push_thread_free_chain(head, tail)
            }
        }
    }
}

/// Deferred-free batch: addresses recently freed by this thread that are
/// known to belong to a single foreign-owned container, staged so a run of
/// frees to the same container costs one atomic splice instead of N CAS
/// loops (spec §4.5, §9 "deferred free").
struct DeferredBatch {
    target: usize, // region base, 0 == no batch open
    target_type: SlotType,
    head: *mut u8,
    tail: *mut u8,
}

impl DeferredBatch {
    const fn new() -> Self {
        Self {
            target: 0,
            target_type: SlotType::Pool,
            head: core::ptr::null_mut(),
            tail: core::ptr::null_mut(),
        }
    }

    fn flush(&mut self) {
        if self.target == 0 {
            return;
        }
        chain_push(self.target_type, self.target, self.head, self.tail);
        crate::stat_inc!(deferred_flush_count);
        self.target = 0;
        self.head = core::ptr::null_mut();
        self.tail = core::ptr::null_mut();
    }

    fn push(&mut self, region_base: usize, slot_type: SlotType, ptr: *mut u8) {
        if self.target != region_base {
            self.flush();
            self.target = region_base;
            self.target_type = slot_type;
            unsafe { *(ptr as *mut *mut u8) = core::ptr::null_mut() };
            self.head = ptr;
            self.tail = ptr;
            return;
        }
        unsafe { *(ptr as *mut *mut u8) = core::ptr::null_mut() };
        unsafe { *(self.tail as *mut *mut u8) = ptr };
        self.tail = ptr;
    }
}

/// Per-thread allocator state. One instance lives in thread-local storage
/// per live thread (see `allocator.rs` for the TLS wiring across the
/// nightly/std/neither tiers).
pub struct ThreadAllocator {
    id: i64,
    pool_queues: [Queue; NUM_POOL_CLASSES],
    arena_queues: [Queue; NUM_ARENA_PARTITIONS],
    implicit_queue: Queue,
    cached_class: usize,
    cached_pool: usize, // region base, 0 == none
    deferred: DeferredBatch,
}

impl ThreadAllocator {
    pub const fn new_const() -> Self {
        Self {
            id: 0,
            pool_queues: [Queue::new(); NUM_POOL_CLASSES],
            arena_queues: [Queue::new(); NUM_ARENA_PARTITIONS],
            implicit_queue: Queue::new(),
            cached_class: 0,
            cached_pool: 0,
            deferred: DeferredBatch::new(),
        }
    }

    pub fn init(&mut self) {
        self.id = tid::current();
    }

    /// Whether `init` has already assigned this instance a thread id. Id 0
    /// is reserved as the "not yet initialized" sentinel — `tid::current()`
    /// never returns it to a real thread under the `std` feature (ids start
    /// at 1); under pure `no_std`, where every caller collapses onto id 0,
    /// this is always false, and `init` is idempotent enough to re-run.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.id != 0
    }

    // -- allocation --

    pub fn allocate(&mut self, size: usize, align: usize, zero: bool) -> *mut u8 {
        if size == 0 {
            return core::ptr::null_mut();
        }
        let page = platform::page_size();
        let align = if align == 0 { 1 } else { align };
        if !align.is_power_of_two() || align > page {
            return core::ptr::null_mut();
        }
        let size = size.next_multiple_of(align);
        crate::stat_inc!(alloc_count);
        crate::stat_add!(alloc_bytes, size);
        crate::hist_record!(size);

        let ptr = if size <= POOL_MAX_BLOCK && align <= 8 {
            let class = size_class::size_to_class(size);
            if class != 0 {
                self.alloc_pool(class)
            } else {
                self.alloc_arena_or_implicit(size, align)
            }
        } else {
            self.alloc_arena_or_implicit(size, align)
        };

        if !ptr.is_null() && zero {
            unsafe { core::ptr::write_bytes(ptr, 0, size) };
        }
        ptr
    }

    fn alloc_pool(&mut self, class: usize) -> *mut u8 {
        if self.cached_class == class && self.cached_pool != 0 {
            let p = unsafe { &mut *(self.cached_pool as *mut PoolHeader) };
            if p.has_pending_thread_free() {
                p.drain_thread_free();
                crate::stat_inc!(thread_free_drain_count);
            }
            let ptr = p.allocate();
            if !ptr.is_null() {
                crate::stat_inc!(pool_alloc_count);
                return ptr;
            }
        }

        let queue = &mut self.pool_queues[class];
        for base in queue.iter() {
            let p = unsafe { &mut *(base as *mut PoolHeader) };
            if p.has_pending_thread_free() {
                p.drain_thread_free();
                crate::stat_inc!(thread_free_drain_count);
            }
            let ptr = p.allocate();
            if !ptr.is_null() {
                self.cached_class = class;
                self.cached_pool = base;
                crate::stat_inc!(pool_alloc_count);
                return ptr;
            }
        }

        let block_size = size_class::class_to_size(class);
        let base = self.reserve_pool_region(pool::partition_for(block_size), class);
        if base == 0 {
            return core::ptr::null_mut();
        }
        queue.push_front(base);
        let p = unsafe { &mut *(base as *mut PoolHeader) };
        let ptr = p.allocate();
        if !ptr.is_null() {
            self.cached_class = class;
            self.cached_pool = base;
            crate::stat_inc!(pool_alloc_count);
        }
        ptr
    }

    fn reserve_pool_region(&self, mut p: usize, class: usize) -> usize {
        loop {
            let region = partition::reserve_region(p, self.id, pool::SLOT_TYPE);
            if region.is_null() {
                match partition::promote(p) {
                    Some(next) => {
                        p = next;
                        continue;
                    }
                    None => return 0,
                }
            }
            let size = config::REGION_SIZE[p];
            if !unsafe { platform::commit(region, size) } {
                unsafe { partition::release_region(region, p) };
                return 0;
            }
            unsafe { PoolHeader::init(region, size, self.id, class) };
            return region as usize;
        }
    }

    fn alloc_arena_or_implicit(&mut self, size: usize, align: usize) -> *mut u8 {
        if size <= ARENA_MAX_BLOCK && align <= 8 {
            if let Some(p) = arena::partition_for(size) {
                if let Some(ptr) = self.alloc_arena(p, size) {
                    return ptr;
                }
            }
        }
        self.alloc_implicit(size, align)
    }

    fn alloc_arena(&mut self, p: usize, size: usize) -> Option<*mut u8> {
        let idx = p - ARENA_BASE_PARTITION;
        let queue = &mut self.arena_queues[idx];
        for base in queue.iter() {
            let a = unsafe { &*(base as *const ArenaHeader) };
            if a.has_pending_thread_free() {
                a.drain_thread_free();
                crate::stat_inc!(thread_free_drain_count);
            }
            let ptr = a.allocate(size, p);
            if !ptr.is_null() {
                crate::stat_inc!(arena_alloc_count);
                return Some(ptr);
            }
        }

        let region = partition::reserve_region(p, self.id, arena::SLOT_TYPE);
        if region.is_null() {
            return None;
        }
        unsafe { ArenaHeader::init(region, p, self.id) };
        let base = region as usize;
        queue.push_front(base);
        let a = unsafe { &*(base as *const ArenaHeader) };
        let ptr = a.allocate(size, p);
        if ptr.is_null() {
            None
        } else {
            crate::stat_inc!(arena_alloc_count);
            Some(ptr)
        }
    }

    fn alloc_implicit(&mut self, size: usize, align: usize) -> *mut u8 {
        let region_size = config::REGION_SIZE[IMPLICIT_PARTITION];
        if size + 256 > region_size {
            return partition::os_direct_alloc(size, align);
        }

        for base in self.implicit_queue.iter() {
            let list = unsafe { &mut *(base as *mut ImplicitListHeader) };
            if list.has_pending_thread_free() {
                list.drain_thread_free();
                crate::stat_inc!(thread_free_drain_count);
            }
            let ptr = list.allocate(size, align);
            if !ptr.is_null() {
                crate::stat_inc!(implicit_alloc_count);
                return ptr;
            }
        }

        let region =
            partition::reserve_region(IMPLICIT_PARTITION, self.id, crate::implicit_list::SLOT_TYPE);
        if region.is_null() {
            return partition::os_direct_alloc(size, align);
        }
        if !unsafe { platform::commit(region, region_size) } {
            unsafe { partition::release_region(region, IMPLICIT_PARTITION) };
            return partition::os_direct_alloc(size, align);
        }
        unsafe { ImplicitListHeader::init(region, region_size, self.id) };
        let base = region as usize;
        self.implicit_queue.push_front(base);
        let list = unsafe { &mut *(base as *mut ImplicitListHeader) };
        let ptr = list.allocate(size, align);
        if !ptr.is_null() {
            crate::stat_inc!(implicit_alloc_count);
        }
        ptr
    }

    // -- free --

    /// Route a free to its owning container (spec §4.5 `Free`). `ptr` must
    /// either be one this allocator previously handed out, or null.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        crate::stat_inc!(dealloc_count);
        if partition::free_os_direct_if_owned(ptr) {
            return;
        }
        if partition::free_alloc_at_if_owned(ptr) {
            return;
        }

        let addr = ptr as usize;
        let p = match region::partition_of(addr) {
            Some(p) => p,
            None => return, // not ours (spec §7: caller violation, silent no-op).
        };
        let base = region::region_base(addr, p);
        let header = header_of(base);
        let owner = header.thread_id.load(Ordering::Acquire);

        if owner == self.id {
            self.free_local(base, p, ptr);
        } else if owner == region::ABANDONED {
            if partition::claim_abandoned(base as *mut u8, self.id) {
                self.adopt(base, p, header.slot_type);
                self.free_local(base, p, ptr);
            } else {
                crate::stat_inc!(deferred_free_count);
                self.deferred.push(base, header.slot_type, ptr);
            }
        } else {
            crate::stat_inc!(deferred_free_count);
            self.deferred.push(base, header.slot_type, ptr);
        }
    }

    /// Usable size of a block this allocator (or another thread's, for a
    /// block not yet freed) previously handed out, or `None` if `ptr` falls
    /// outside every recognized window. Used by `realloc`'s in-place-fits
    /// check; never mutates container state.
    pub fn usable_size(&self, ptr: *mut u8) -> Option<usize> {
        if let Some(size) = partition::os_direct_usable_size(ptr) {
            return Some(size);
        }
        let addr = ptr as usize;
        let p = region::partition_of(addr)?;
        let base = region::region_base(addr, p);
        match header_of(base).slot_type {
            SlotType::Pool => Some(unsafe { (*(base as *const PoolHeader)).block_size() }),
            SlotType::Arena => Some(unsafe { (*(base as *const ArenaHeader)).block_size_of(ptr, p) }),
            SlotType::Implicit => {
                Some(unsafe { (*(base as *const ImplicitListHeader)).usable_size(ptr) })
            }
        }
    }

    /// Grow or shrink a previous allocation (spec §6 `realloc`). Null `ptr`
    /// behaves as `allocate`; zero `new_size` behaves as `free`. Preserves
    /// the original contents up to `min(old, new)` bytes. Large `alloc_os`
    /// allocations try an in-place OS remap first (spec's design note);
    /// everything else falls back to allocate-copy-free once it no longer
    /// fits in place.
    pub fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(new_size, config::WORD_SIZE, false);
        }
        if new_size == 0 {
            self.free(ptr);
            return core::ptr::null_mut();
        }
        crate::stat_inc!(realloc_count);

        if let Some(remapped) = partition::os_direct_realloc(ptr, new_size) {
            if !remapped.is_null() {
                return remapped;
            }
            // Platform can't remap; copy through a fresh OS-direct block.
            let old_usable = partition::os_direct_usable_size(ptr).unwrap_or(new_size);
            let new_ptr = partition::os_direct_alloc(new_size, config::WORD_SIZE);
            if !new_ptr.is_null() {
                unsafe {
                    core::ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size))
                };
                partition::free_os_direct_if_owned(ptr);
            }
            return new_ptr;
        }

        let old_usable = self.usable_size(ptr);
        if let Some(old) = old_usable {
            if new_size <= old {
                return ptr;
            }
        }

        let new_ptr = self.allocate(new_size, config::WORD_SIZE, false);
        if !new_ptr.is_null() {
            let copy_len = old_usable.unwrap_or(new_size).min(new_size);
            unsafe { core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len) };
            self.free(ptr);
        }
        new_ptr
    }

    /// Enqueue a region this thread just adopted from the abandoned list
    /// into the matching queue (spec §4.5 step 4).
    fn adopt(&mut self, base: usize, p: usize, slot_type: SlotType) {
        crate::stat_inc!(adopt_count);
        match slot_type {
            SlotType::Pool => {
                let class = unsafe { (*(base as *const PoolHeader)).class() };
                self.pool_queues[class].push_front(base);
            }
            SlotType::Arena => {
                self.arena_queues[p - ARENA_BASE_PARTITION].push_front(base);
            }
            SlotType::Implicit => {
                self.implicit_queue.push_front(base);
            }
        }
    }

    fn free_local(&mut self, base: usize, p: usize, ptr: *mut u8) {
        let slot_type = header_of(base).slot_type;
        let went_empty = match slot_type {
            SlotType::Pool => {
                let pool = unsafe { &mut *(base as *mut PoolHeader) };
                let empty = pool.free_local(ptr);
                if self.cached_pool == base && pool.is_full() {
                    self.cached_pool = 0;
                }
                crate::stat_inc!(pool_free_count);
                empty
            }
            SlotType::Arena => {
                crate::stat_inc!(arena_free_count);
                unsafe { (*(base as *const ArenaHeader)).free(ptr, p) }
            }
            SlotType::Implicit => {
                crate::stat_inc!(implicit_free_count);
                unsafe { (*(base as *mut ImplicitListHeader)).free_local(ptr) }
            }
        };

        if went_empty {
            let pending = match slot_type {
                SlotType::Pool => unsafe { (*(base as *const PoolHeader)).has_pending_thread_free() },
                SlotType::Arena => unsafe { (*(base as *const ArenaHeader)).has_pending_thread_free() },
                SlotType::Implicit => unsafe {
                    (*(base as *const ImplicitListHeader)).has_pending_thread_free()
                },
            };
            if !pending {
                self.remove_from_queue(base, p, slot_type);
                unsafe { partition::release_region(base as *mut u8, p) };
            }
        }
    }

    fn remove_from_queue(&mut self, base: usize, p: usize, slot_type: SlotType) {
        match slot_type {
            SlotType::Pool => {
                let class = unsafe { (*(base as *const PoolHeader)).class() };
                self.pool_queues[class].remove(base);
                if self.cached_pool == base {
                    self.cached_pool = 0;
                }
            }
            SlotType::Arena => self.arena_queues[p - ARENA_BASE_PARTITION].remove(base),
            SlotType::Implicit => self.implicit_queue.remove(base),
        }
    }

    /// Release every currently-empty region this thread owns back to the
    /// partition allocator (spec §6 `release_local`). Returns `true` if
    /// every empty region was released (none were held back by pending
    /// cross-thread frees still in flight).
    pub fn release_local(&mut self) -> bool {
        let mut all_released = true;

        for class in 0..NUM_POOL_CLASSES {
            for &base in self.pool_queues[class].snapshot().iter() {
                let p = unsafe { &*(base as *const PoolHeader) };
                if !p.is_empty() {
                    continue;
                }
                if p.has_pending_thread_free() {
                    all_released = false;
                    continue;
                }
                let part = pool::partition_for(size_class::class_to_size(p.class()));
                self.pool_queues[class].remove(base);
                if self.cached_pool == base {
                    self.cached_pool = 0;
                }
                unsafe { partition::release_region(base as *mut u8, part) };
            }
        }

        for idx in 0..NUM_ARENA_PARTITIONS {
            let part = idx + ARENA_BASE_PARTITION;
            for &base in self.arena_queues[idx].snapshot().iter() {
                let a = unsafe { &*(base as *const ArenaHeader) };
                if !a.is_empty() {
                    continue;
                }
                if a.has_pending_thread_free() {
                    all_released = false;
                    continue;
                }
                self.arena_queues[idx].remove(base);
                unsafe { partition::release_region(base as *mut u8, part) };
            }
        }

        for &base in self.implicit_queue.snapshot().iter() {
            let list = unsafe { &*(base as *const ImplicitListHeader) };
            if !list.is_empty() {
                continue;
            }
            if list.has_pending_thread_free() {
                all_released = false;
                continue;
            }
            self.implicit_queue.remove(base);
            unsafe { partition::release_region(base as *mut u8, IMPLICIT_PARTITION) };
        }

        all_released
    }

    /// Thread teardown (spec §4.5): drain every container's cross-thread
    /// inbox, release the ones that are now empty, abandon the rest so
    /// another thread can adopt them.
    pub fn on_thread_exit(&mut self) {
        self.deferred.flush();

        for class in 0..NUM_POOL_CLASSES {
            for &base in self.pool_queues[class].snapshot().iter() {
                let p = unsafe { &mut *(base as *mut PoolHeader) };
                p.drain_thread_free();
                crate::stat_inc!(thread_free_drain_count);
                let part = pool::partition_for(size_class::class_to_size(p.class()));
                if p.is_empty() {
                    unsafe { partition::release_region(base as *mut u8, part) };
                } else {
                    partition::abandon_region(base as *mut u8, part);
                }
            }
        }

        for idx in 0..NUM_ARENA_PARTITIONS {
            let part = idx + ARENA_BASE_PARTITION;
            for &base in self.arena_queues[idx].snapshot().iter() {
                let a = unsafe { &*(base as *const ArenaHeader) };
                a.drain_thread_free();
                crate::stat_inc!(thread_free_drain_count);
                if a.is_empty() {
                    unsafe { partition::release_region(base as *mut u8, part) };
                } else {
                    partition::abandon_region(base as *mut u8, part);
                }
            }
        }

        for &base in self.implicit_queue.snapshot().iter() {
            let list = unsafe { &mut *(base as *mut ImplicitListHeader) };
            list.drain_thread_free();
            crate::stat_inc!(thread_free_drain_count);
            if list.is_empty() {
                unsafe { partition::release_region(base as *mut u8, IMPLICIT_PARTITION) };
            } else {
                partition::abandon_region(base as *mut u8, IMPLICIT_PARTITION);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_alloc_then_free_round_trips() {
        let mut ta = ThreadAllocator::new_const();
        ta.init();
        let a = ta.allocate(32, 8, false);
        assert!(!a.is_null());
        ta.free(a);
        let b = ta.allocate(32, 8, false);
        assert_eq!(a, b);
        ta.release_local();
    }

    #[test]
    fn zeroed_allocation_is_zero_filled() {
        let mut ta = ThreadAllocator::new_const();
        ta.init();
        let a = ta.allocate(256, 8, true);
        assert!(!a.is_null());
        let bytes = unsafe { core::slice::from_raw_parts(a, 256) };
        assert!(bytes.iter().all(|&b| b == 0));
        ta.free(a);
        ta.release_local();
    }

    #[test]
    fn large_allocation_routes_through_arena_or_implicit() {
        let mut ta = ThreadAllocator::new_const();
        ta.init();
        let a = ta.allocate(4 << 20, 8, false); // 4 MiB: beyond pool range.
        assert!(!a.is_null());
        ta.free(a);
        ta.release_local();
    }

    #[test]
    fn huge_allocation_falls_back_to_os_direct() {
        let mut ta = ThreadAllocator::new_const();
        ta.init();
        let a = ta.allocate(300 << 20, 8, false); // bigger than any region.
        assert!(!a.is_null());
        ta.free(a);
    }

    #[test]
    fn release_local_reclaims_emptied_containers() {
        let mut ta = ThreadAllocator::new_const();
        ta.init();
        let a = ta.allocate(64, 8, false);
        ta.free(a);
        assert!(ta.release_local());
    }
}
