//! Allocation statistics counters.
//!
//! All counters use `Relaxed` ordering — they are observational only and not
//! used as synchronization primitives. The allocator's own spinlocks and
//! atomic CAS loops provide the ordering guarantees for correctness; these
//! counters are purely for monitoring.
//!
//! # Usage
//!
//! ```ignore
//! let snap = vmalloc::stats::snapshot();
//! println!("allocs: {}", snap.alloc_count);
//! ```
//!
//! Obtain a [`Snapshot`] with [`snapshot()`]. Individual counter loads are
//! individually atomic but not globally consistent with each other.

use core::sync::atomic::{AtomicU64, Ordering};

pub(crate) struct Stats {
    // ---- Global entry-point stats ----
    /// Total calls to `alloc`/`aligned_alloc`/`zalloc` with size > 0.
    pub alloc_count: AtomicU64,
    /// Total calls to `free` with a non-null pointer.
    pub dealloc_count: AtomicU64,
    /// Total calls to `realloc` (after null/zero-size guards).
    pub realloc_count: AtomicU64,
    /// Sum of all requested byte sizes passed to `allocate`.
    pub alloc_bytes: AtomicU64,

    // ---- Container hot paths ----
    /// Allocations served by an already-owned pool (free-list pop or bump).
    pub pool_alloc_count: AtomicU64,
    /// Frees landing on a pool this thread owns.
    pub pool_free_count: AtomicU64,
    /// Allocations served by an already-owned arena.
    pub arena_alloc_count: AtomicU64,
    /// Frees landing on an arena this thread owns.
    pub arena_free_count: AtomicU64,
    /// Allocations served by an already-owned implicit list.
    pub implicit_alloc_count: AtomicU64,
    /// Frees landing on an implicit list this thread owns.
    pub implicit_free_count: AtomicU64,

    // ---- Cross-thread / abandonment ----
    /// Frees that landed on a container owned by a different live thread
    /// and were staged in the deferred-free batch.
    pub deferred_free_count: AtomicU64,
    /// Times a thread's deferred-free batch was flushed (one chain splice).
    pub deferred_flush_count: AtomicU64,
    /// Times a container's cross-thread inbox was drained by its owner.
    pub thread_free_drain_count: AtomicU64,
    /// Regions abandoned on thread exit with live blocks remaining.
    pub abandon_count: AtomicU64,
    /// Regions adopted by a new owning thread.
    pub adopt_count: AtomicU64,

    // ---- Partition allocator / OS ----
    /// Regions reserved from a partition (`platform::reserve_aligned` calls
    /// that succeeded).
    pub region_reserve_count: AtomicU64,
    /// Regions released back to the OS (by `release_local`, thread exit, or
    /// an emptied container's last free).
    pub region_release_count: AtomicU64,
    /// Calls to `alloc_os`/`os_direct_alloc` that succeeded.
    pub os_direct_alloc_count: AtomicU64,
    /// Bytes requested from the OS via `os_direct_alloc`.
    pub os_direct_alloc_bytes: AtomicU64,
}

impl Stats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            dealloc_count: AtomicU64::new(0),
            realloc_count: AtomicU64::new(0),
            alloc_bytes: AtomicU64::new(0),
            pool_alloc_count: AtomicU64::new(0),
            pool_free_count: AtomicU64::new(0),
            arena_alloc_count: AtomicU64::new(0),
            arena_free_count: AtomicU64::new(0),
            implicit_alloc_count: AtomicU64::new(0),
            implicit_free_count: AtomicU64::new(0),
            deferred_free_count: AtomicU64::new(0),
            deferred_flush_count: AtomicU64::new(0),
            thread_free_drain_count: AtomicU64::new(0),
            abandon_count: AtomicU64::new(0),
            adopt_count: AtomicU64::new(0),
            region_reserve_count: AtomicU64::new(0),
            region_release_count: AtomicU64::new(0),
            os_direct_alloc_count: AtomicU64::new(0),
            os_direct_alloc_bytes: AtomicU64::new(0),
        }
    }
}

pub(crate) static STATS: Stats = Stats::new();

/// A point-in-time snapshot of all allocation statistics.
///
/// Fields are plain `u64` values loaded from the global atomic counters.
/// Individual fields are each atomically read, but the snapshot as a whole
/// is not globally consistent — concurrent allocations may race between loads.
/// For monitoring purposes this is always sufficient.
///
/// Obtain a snapshot with [`snapshot()`].
#[derive(Clone, Copy, Debug, Default)]
pub struct Snapshot {
    pub alloc_count: u64,
    pub dealloc_count: u64,
    pub realloc_count: u64,
    pub alloc_bytes: u64,
    pub pool_alloc_count: u64,
    pub pool_free_count: u64,
    pub arena_alloc_count: u64,
    pub arena_free_count: u64,
    pub implicit_alloc_count: u64,
    pub implicit_free_count: u64,
    pub deferred_free_count: u64,
    pub deferred_flush_count: u64,
    pub thread_free_drain_count: u64,
    pub abandon_count: u64,
    pub adopt_count: u64,
    pub region_reserve_count: u64,
    pub region_release_count: u64,
    pub os_direct_alloc_count: u64,
    pub os_direct_alloc_bytes: u64,
}

/// Load all counters with `Relaxed` ordering and return a [`Snapshot`].
pub fn snapshot() -> Snapshot {
    let s = &STATS;
    Snapshot {
        alloc_count: s.alloc_count.load(Ordering::Relaxed),
        dealloc_count: s.dealloc_count.load(Ordering::Relaxed),
        realloc_count: s.realloc_count.load(Ordering::Relaxed),
        alloc_bytes: s.alloc_bytes.load(Ordering::Relaxed),
        pool_alloc_count: s.pool_alloc_count.load(Ordering::Relaxed),
        pool_free_count: s.pool_free_count.load(Ordering::Relaxed),
        arena_alloc_count: s.arena_alloc_count.load(Ordering::Relaxed),
        arena_free_count: s.arena_free_count.load(Ordering::Relaxed),
        implicit_alloc_count: s.implicit_alloc_count.load(Ordering::Relaxed),
        implicit_free_count: s.implicit_free_count.load(Ordering::Relaxed),
        deferred_free_count: s.deferred_free_count.load(Ordering::Relaxed),
        deferred_flush_count: s.deferred_flush_count.load(Ordering::Relaxed),
        thread_free_drain_count: s.thread_free_drain_count.load(Ordering::Relaxed),
        abandon_count: s.abandon_count.load(Ordering::Relaxed),
        adopt_count: s.adopt_count.load(Ordering::Relaxed),
        region_reserve_count: s.region_reserve_count.load(Ordering::Relaxed),
        region_release_count: s.region_release_count.load(Ordering::Relaxed),
        os_direct_alloc_count: s.os_direct_alloc_count.load(Ordering::Relaxed),
        os_direct_alloc_bytes: s.os_direct_alloc_bytes.load(Ordering::Relaxed),
    }
}
