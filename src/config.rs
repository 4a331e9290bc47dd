//! Process-wide constants: the partition map, region sizes, and the
//! address bands reserved for `alloc_at`/`alloc_os`.

/// Natural pointer word size; the minimum alignment `alloc()` guarantees.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Default OS page size assumption, overridden at runtime by
/// `platform::page_size()` where the OS can report a different value.
pub const PAGE_SHIFT: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Number of address partitions (spec §3).
pub const NUM_PARTITIONS: usize = 7;

/// Region size `R(p)` for partition `p`, in bytes: 4 MiB .. 256 MiB.
pub const REGION_SIZE: [usize; NUM_PARTITIONS] = [
    4 << 20,
    8 << 20,
    16 << 20,
    32 << 20,
    64 << 20,
    128 << 20,
    256 << 20,
];

/// `log2(R(p))` for each partition, used for shifts instead of division.
pub const REGION_SHIFT: [u32; NUM_PARTITIONS] = [22, 23, 24, 25, 26, 27, 28];

/// Base address `B(p) = 2^(41+p)` of partition `p`. Partitions are laid out
/// contiguously starting at 2 TiB and ending just under 256 TiB. Unlike the
/// original allocator this spec was distilled from (whose partition map
/// topped out well below its `alloc_at`/`alloc_os` bands), this layout's
/// partitions span the full 2-256 TiB range, so `alloc_at`/`alloc_os` are
/// carved out of the 1-2 TiB band below partition 0 instead (see
/// `ALLOC_AT_BASE`/`ALLOC_OS_BASE`) rather than interleaved among them.
pub const PARTITION_BASE: [usize; NUM_PARTITIONS] = {
    let mut bases = [0usize; NUM_PARTITIONS];
    let mut p = 0;
    while p < NUM_PARTITIONS {
        bases[p] = 1usize << (41 + p);
        p += 1;
    }
    bases
};

/// One past the highest address any partition covers.
pub const PARTITION_LIMIT: usize = PARTITION_BASE[NUM_PARTITIONS - 1] * 2;

/// Number of chunks (arena L2 slots or pool/implicit-list top-level slots)
/// a region is divided into for bookkeeping purposes independent of the
/// container's own internal subdivision.
pub const CHUNKS_PER_REGION: usize = 64;

/// `alloc_at` serves a disjoint window below the partition map entirely, so
/// that pointer-stable, caller-addressed allocations never alias a
/// partition-routed block and a plain `free()` can tell the two apart
/// before running `partition_of`.
pub const ALLOC_AT_BASE: usize = 1usize << 40; // 1 TiB
pub const ALLOC_AT_LIMIT: usize = ALLOC_AT_BASE + (512usize << 30); // 1.5 TiB

/// `alloc_os` serves raw OS-direct allocations from the remainder of that
/// sub-partition band, each preceded by a one-page header recording the
/// reservation's total extent.
pub const ALLOC_OS_BASE: usize = ALLOC_AT_LIMIT;
pub const ALLOC_OS_LIMIT: usize = PARTITION_BASE[0]; // 2 TiB

/// Heap-level dispatch thresholds (recovered from the original's `heap.c`):
/// requests at or below this size are served by a pool; above it and up to
/// `ARENA_MAX_BLOCK`, by an arena chunk; above that, by an implicit list or
/// a whole region.
pub const POOL_MAX_BLOCK: usize = 2 << 20; // 2 MiB, matches partition 2's L2 block size
pub const ARENA_MAX_BLOCK: usize = REGION_SIZE[5]; // 128 MiB

/// Minimum block size a pool class may describe.
pub const POOL_MIN_BLOCK: usize = 8;
