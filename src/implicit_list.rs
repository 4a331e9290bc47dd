//! Implicit-list container: the Knuth-style boundary-tagged coalescing heap
//! (spec §4.4), used for allocations between roughly 16 KiB and a whole
//! region.
//!
//! Every block begins with a 4-byte header word packing `size | alloc |
//! prev_alloc` (size is always a multiple of 8, so the low two bits are
//! free for flags). A free block additionally carries a 4-byte footer
//! (identical to the header's size field, flags irrelevant) so that
//! `free()` can walk one block backward without a separate predecessor
//! pointer, and a doubly-linked free-list `prev`/`next` pair threaded
//! through its own payload — no heap metadata lives outside the blocks the
//! allocator already owns, per the Design Notes' "intrusive lists
//! everywhere."
//!
//! All of this is owner-thread-only state; cross-thread frees arrive
//! through `thread_free` (the same MPSC stack the pool container uses) and
//! are drained into the block structure before the owner's next `free` or
//! `allocate`.

use crate::region::{HEADER_SIZE, RegionHeader, SlotType};
use crate::sync::DeferredFreeStack;

/// Word size used for header/footer tags and free-list links.
const WSIZE: usize = 4;
const DSIZE: usize = 8;
/// Smallest block a split may produce: header + prev + next + footer.
const MIN_BLOCK: usize = DSIZE + 8;

const ALLOC_BIT: u32 = 0x1;
const PREV_ALLOC_BIT: u32 = 0x2;

#[inline]
fn pack(size: usize, alloc: bool, prev_alloc: bool) -> u32 {
    debug_assert_eq!(size & (DSIZE - 1), 0);
    size as u32 | if alloc { ALLOC_BIT } else { 0 } | if prev_alloc { PREV_ALLOC_BIT } else { 0 }
}

#[inline]
fn size_of_tag(word: u32) -> usize {
    (word & !(DSIZE as u32 - 1)) as usize
}

#[inline]
fn alloc_of_tag(word: u32) -> bool {
    word & ALLOC_BIT != 0
}

#[inline]
fn prev_alloc_of_tag(word: u32) -> bool {
    word & PREV_ALLOC_BIT != 0
}

#[inline]
unsafe fn read_u32(addr: usize) -> u32 {
    unsafe { core::ptr::read((addr as *const u32)) }
}

#[inline]
unsafe fn write_u32(addr: usize, val: u32) {
    unsafe { core::ptr::write(addr as *mut u32, val) };
}

/// Header at the base of an implicit-list region, immediately followed by
/// the payload and a one-word epilogue sentinel at its very end.
#[repr(C)]
pub struct ImplicitListHeader {
    pub region: RegionHeader,
    /// Offset (from the region base) of the first free block, or 0 (no
    /// block can legally start at offset 0 — that is this header) for
    /// "empty".
    free_head: usize,
    /// Cached upper bound on the largest free block, maintained as a soft
    /// hint (spec §4.4 `max_block`): updated whenever a free produces a
    /// block at least that large, never treated as authoritative for
    /// rejecting a request (so staleness after consuming the block it
    /// describes can only cost an extra scan, never a false failure).
    max_block: usize,
    payload_end: usize,
    live: usize,
    thread_free: DeferredFreeStack,
}

const _: () = assert!(core::mem::size_of::<RegionHeader>() <= HEADER_SIZE);

#[inline]
fn payload_offset() -> usize {
    core::mem::size_of::<ImplicitListHeader>().next_multiple_of(DSIZE)
}

impl ImplicitListHeader {
    /// Initialize a freshly reserved region as one large free block bounded
    /// by a zero-size allocated epilogue sentinel.
    ///
    /// # Safety
    /// `region` must be the base of a region just returned by
    /// `partition::reserve_region`, committed through `region_size` bytes,
    /// with `RegionHeader::init` already run.
    pub unsafe fn init(region: *mut u8, region_size: usize, _thread_id: i64) {
        let base = region as usize;
        let start = base + payload_offset();
        let payload_end = base + region_size - WSIZE; // one word reserved for the epilogue.
        let block_size = payload_end - start;

        let header = region as *mut ImplicitListHeader;
        unsafe {
            (*header).free_head = 0;
            (*header).max_block = block_size;
            (*header).payload_end = payload_end;
            (*header).live = 0;
            (*header).thread_free = DeferredFreeStack::new();

            write_u32(start, pack(block_size, false, true));
            write_u32(start + block_size - WSIZE, pack(block_size, false, true));
            write_u32(start + WSIZE, 0); // prev = null
            write_u32(start + WSIZE + WSIZE, 0); // next = null
            write_u32(payload_end, pack(0, true, false));

            (*header).free_head = start - base;
        }
    }

    #[inline]
    fn base(&self) -> usize {
        self as *const _ as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    #[inline]
    pub fn thread_id(&self) -> i64 {
        self.region.thread_id.load(core::sync::atomic::Ordering::Acquire)
    }

    // -- free-list bookkeeping (offsets relative to `base()`; 0 == null) --

    #[inline]
    fn link_prev(&self, off: usize) -> usize {
        unsafe { read_u32(self.base() + off + WSIZE) as usize }
    }
    #[inline]
    fn link_next(&self, off: usize) -> usize {
        unsafe { read_u32(self.base() + off + WSIZE + WSIZE) as usize }
    }
    #[inline]
    fn set_link_prev(&self, off: usize, prev: usize) {
        unsafe { write_u32(self.base() + off + WSIZE, prev as u32) };
    }
    #[inline]
    fn set_link_next(&self, off: usize, next: usize) {
        unsafe { write_u32(self.base() + off + WSIZE + WSIZE, next as u32) };
    }

    fn list_push_front(&mut self, off: usize) {
        self.set_link_prev(off, 0);
        self.set_link_next(off, self.free_head);
        if self.free_head != 0 {
            self.set_link_prev(self.free_head, off);
        }
        self.free_head = off;
    }

    fn list_remove(&mut self, off: usize) {
        let prev = self.link_prev(off);
        let next = self.link_next(off);
        if prev != 0 {
            self.set_link_next(prev, next);
        } else {
            self.free_head = next;
        }
        if next != 0 {
            self.set_link_prev(next, prev);
        }
    }

    // -- header/footer helpers, addresses absolute --

    #[inline]
    fn header_word(&self, addr: usize) -> u32 {
        unsafe { read_u32(addr) }
    }
    #[inline]
    fn set_header(&self, addr: usize, size: usize, alloc: bool, prev_alloc: bool) {
        unsafe { write_u32(addr, pack(size, alloc, prev_alloc)) };
    }
    #[inline]
    fn set_footer(&self, addr: usize, size: usize) {
        unsafe { write_u32(addr + size - WSIZE, pack(size, false, false)) };
    }

    /// Place an allocation of `asize` bytes at a free block of `block_size`
    /// bytes starting at `addr` (header address), splitting off the
    /// remainder as a new free block if it is large enough (spec §4.4
    /// `Allocate`: "splits preserve the tail as a new free block"). The
    /// block must already have been removed from the free list and is not
    /// re-inserted by this call; the leftover, if any, is inserted.
    fn place(&mut self, addr: usize, block_size: usize, asize: usize, prev_alloc: bool) -> usize {
        let remainder = block_size - asize;
        if remainder >= MIN_BLOCK {
            self.set_header(addr, asize, true, prev_alloc);
            let free_addr = addr + asize;
            self.set_header(free_addr, remainder, false, true);
            self.set_footer(free_addr, remainder);
            let next_addr = free_addr + remainder;
            self.clear_next_prev_alloc(next_addr, false);
            let free_off = free_addr - self.base();
            self.list_push_front(free_off);
            if remainder > self.max_block {
                self.max_block = remainder;
            }
        } else {
            self.set_header(addr, block_size, true, prev_alloc);
            let next_addr = addr + block_size;
            self.clear_next_prev_alloc(next_addr, true);
        }
        self.live += 1;
        addr + WSIZE
    }

    #[inline]
    fn clear_next_prev_alloc(&self, next_header_addr: usize, prev_is_alloc: bool) {
        let word = self.header_word(next_header_addr);
        let size = size_of_tag(word);
        let alloc = alloc_of_tag(word);
        unsafe { write_u32(next_header_addr, pack(size, alloc, prev_is_alloc)) };
    }

    /// First-fit scan of the free list for a block of at least `asize`
    /// bytes. Returns `(header_addr, block_size)`.
    fn find_fit(&self, asize: usize) -> Option<(usize, usize)> {
        let mut off = self.free_head;
        while off != 0 {
            let addr = self.base() + off;
            let size = size_of_tag(self.header_word(addr));
            if size >= asize {
                return Some((addr, size));
            }
            off = self.link_next(off);
        }
        None
    }

    /// Standard (<=8-byte alignment) allocation path.
    fn allocate_plain(&mut self, size: usize) -> *mut u8 {
        let asize = (size + WSIZE).next_multiple_of(DSIZE).max(MIN_BLOCK);
        let (addr, block_size) = match self.find_fit(asize) {
            Some(hit) => hit,
            None => return core::ptr::null_mut(),
        };
        let off = addr - self.base();
        let prev_alloc = prev_alloc_of_tag(self.header_word(addr));
        self.list_remove(off);
        self.place(addr, block_size, asize, prev_alloc) as *mut u8
    }

    /// Over-aligned (`align > 8`) allocation path (spec §4.4 `Allocate`):
    /// reserve enough slack to guarantee an aligned payload address exists
    /// inside the chosen block, then carve the prefix off as a standalone
    /// free block when it's big enough to stand alone, or fold it into the
    /// allocated block (by re-aiming at the next aligned slot) otherwise.
    fn allocate_aligned(&mut self, size: usize, align: usize) -> *mut u8 {
        let asize = (size + WSIZE).next_multiple_of(DSIZE).max(MIN_BLOCK);
        let slack = 2 * align;
        let (addr, block_size) = match self.find_fit(asize + slack) {
            Some(hit) => hit,
            None => return core::ptr::null_mut(),
        };
        let off = addr - self.base();
        let prev_alloc = prev_alloc_of_tag(self.header_word(addr));
        self.list_remove(off);

        let payload = addr + WSIZE;
        let mut aligned_payload = payload.next_multiple_of(align);
        let mut prefix = aligned_payload - payload;
        if prefix > 0 && prefix < MIN_BLOCK {
            aligned_payload += align;
            prefix = aligned_payload - payload;
        }

        if prefix == 0 {
            return self.place(addr, block_size, asize, prev_alloc) as *mut u8;
        }

        // Carve the prefix off as its own free block; the aligned block
        // starts at `aligned_payload - WSIZE` with the remaining size.
        self.set_header(addr, prefix, false, prev_alloc);
        self.set_footer(addr, prefix);
        self.list_push_front(off);
        if prefix > self.max_block {
            self.max_block = prefix;
        }

        let inner_addr = aligned_payload - WSIZE;
        let inner_size = block_size - prefix;
        self.place(inner_addr, inner_size, asize, false) as *mut u8
    }

    pub fn allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        if align <= DSIZE {
            self.allocate_plain(size)
        } else {
            self.allocate_aligned(size, align)
        }
    }

    /// Usable payload size of a block previously returned by `allocate`
    /// (used by `realloc`'s in-place-fits check). The header word already
    /// carries the block's total size; the payload is that minus the header
    /// word itself.
    #[inline]
    pub fn usable_size(&self, ptr: *mut u8) -> usize {
        let addr = ptr as usize - WSIZE;
        size_of_tag(self.header_word(addr)) - WSIZE
    }

    /// Free a block previously returned by `allocate`, coalescing with
    /// free neighbors (spec §4.4 `Free`, four cases). Returns `true` if the
    /// container has no live allocations left.
    pub fn free_local(&mut self, ptr: *mut u8) -> bool {
        let mut addr = ptr as usize - WSIZE;
        let word = self.header_word(addr);
        let mut size = size_of_tag(word);
        let prev_alloc = prev_alloc_of_tag(word);

        let next_addr = addr + size;
        let next_word = self.header_word(next_addr);
        let next_alloc = alloc_of_tag(next_word);

        if prev_alloc && next_alloc {
            // Case 1: neither neighbor free.
        } else if prev_alloc && !next_alloc {
            // Case 2: coalesce with next.
            let next_size = size_of_tag(next_word);
            self.list_remove(next_addr - self.base());
            size += next_size;
        } else if !prev_alloc && next_alloc {
            // Case 3: coalesce with prev.
            let prev_footer = addr - WSIZE;
            let prev_size = size_of_tag(self.header_word(prev_footer));
            let prev_addr = addr - prev_size;
            self.list_remove(prev_addr - self.base());
            size += prev_size;
            addr = prev_addr;
        } else {
            // Case 4: coalesce with both.
            let prev_footer = addr - WSIZE;
            let prev_size = size_of_tag(self.header_word(prev_footer));
            let prev_addr = addr - prev_size;
            let next_size = size_of_tag(next_word);
            self.list_remove(prev_addr - self.base());
            self.list_remove(next_addr - self.base());
            size += prev_size + next_size;
            addr = prev_addr;
        }

        let new_prev_alloc = if addr == ptr as usize - WSIZE {
            prev_alloc
        } else {
            // Merged backward; the new block's predecessor is whatever was
            // allocated before the original previous free block, which is
            // necessarily allocated (two adjacent free blocks never exist
            // unmerged).
            true
        };
        self.set_header(addr, size, false, new_prev_alloc);
        self.set_footer(addr, size);
        let new_next_addr = addr + size;
        self.clear_next_prev_alloc(new_next_addr, false);
        self.list_push_front(addr - self.base());

        if size > self.max_block {
            self.max_block = size;
        }

        self.live -= 1;
        self.live == 0
    }

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

    /// Drain cross-thread frees (which carry no size/layout information of
    /// their own — the header word at `ptr - WSIZE` already has it) into
    /// the local free list. Returns `true` if the container became empty.
    pub fn drain_thread_free(&mut self) -> bool {
        let mut cur = self.thread_free.drain();
        let mut went_empty = false;
        while !cur.is_null() {
            let next = unsafe { *(cur as *mut *mut u8) };
            // The MPSC push overwrote the first word of the payload with
            // the stack's intrusive link; that word lies inside the live
            // block and is harmless to clobber — `free_local` never reads
            // payload content, only header/footer tags.
            went_empty |= self.free_local(cur);
            cur = next;
        }
        went_empty
    }

    #[inline]
    pub fn has_pending_thread_free(&self) -> bool {
        !self.thread_free.is_empty()
    }
}

pub const SLOT_TYPE: SlotType = SlotType::Implicit;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REGION_SIZE;
    use crate::{partition, region};

    fn make_list(p: usize) -> *mut ImplicitListHeader {
        let region = partition::reserve_region(p, 1, SlotType::Implicit);
        assert!(!region.is_null());
        unsafe {
            crate::platform::commit(region, REGION_SIZE[p]);
            ImplicitListHeader::init(region, REGION_SIZE[p], 1);
        }
        region as *mut ImplicitListHeader
    }

    #[test]
    fn allocate_then_free_round_trips() {
        let list = unsafe { &mut *make_list(3) };
        let a = list.allocate(16 * 1024, 8);
        assert!(!a.is_null());
        assert!(list.free_local(a));
        let b = list.allocate(16 * 1024, 8);
        assert_eq!(a, b);
    }

    #[test]
    fn first_fit_reuses_freed_slot_without_coalescing_live_middle() {
        // Scenario 6 (spec §8): alloc(16K), alloc(32K), free(first),
        // alloc(16K) reuses the first slot via first-fit.
        let list = unsafe { &mut *make_list(3) };
        let a = list.allocate(16 * 1024, 8);
        let b = list.allocate(32 * 1024, 8);
        assert!(!a.is_null() && !b.is_null());
        assert!(!list.free_local(a));
        let c = list.allocate(16 * 1024, 8);
        assert_eq!(a, c);
        // b is still live; freeing c must not disturb it.
        let before = unsafe { *(b as *const u8) };
        unsafe { core::ptr::write(b, before) };
    }

    #[test]
    fn adjacent_frees_coalesce_into_one_block() {
        let list = unsafe { &mut *make_list(3) };
        let a = list.allocate(16 * 1024, 8);
        let b = list.allocate(16 * 1024, 8);
        let c = list.allocate(16 * 1024, 8);
        assert!(!list.free_local(a));
        assert!(!list.free_local(c));
        assert!(!list.free_local(b)); // merges a+b+c into one big free block.

        let big = list.allocate(48 * 1024 - 64, 8);
        assert!(!big.is_null());
    }

    #[test]
    fn over_aligned_allocation_is_aligned_and_usable() {
        let list = unsafe { &mut *make_list(3) };
        for align in [16usize, 64, 256, 4096] {
            let a = list.allocate(4096, align);
            assert!(!a.is_null(), "align {align}");
            assert_eq!(a as usize % align, 0, "align {align}");
            unsafe { core::ptr::write_bytes(a, 0xAB, 4096) };
            assert!(list.free_local(a));
        }
    }

    #[test]
    fn address_routing_survives_full_region() {
        let p = 3;
        let list = make_list(p);
        let ptr = list as *mut u8;
        assert_eq!(region::partition_of(ptr as usize), Some(p));
    }
}
