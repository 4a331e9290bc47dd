#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]

//! vmalloc: an address-routed multi-threaded memory allocator.
//!
//! Unlike a span-table design (tcmalloc's radix-tree page map, or a
//! size-class slab keyed off a hash), every pointer this allocator hands
//! out carries its own metadata location: O(1) shifts and masks on the
//! address recover the owning partition, region, and chunk (`region.rs`).
//! `free()` therefore never walks a tree or probes a side table.
//!
//! Four layers, bottom-up:
//! - `platform` — OS reserve/commit/decommit/release/remap primitives.
//! - `partition` — the fixed virtual-address map; hands out/reclaims
//!   regions and runs the abandoned-region adoption protocol.
//! - `pool`/`arena`/`implicit_list` — the three container types that carve
//!   a region into blocks.
//! - `thread_alloc` — per-thread queues of containers, the cached-slot
//!   fast path, and the deferred cross-thread free batch.
//!
//! Thread-local storage strategy for the per-thread allocator (fastest to
//! slowest):
//! - `nightly` feature: `#[thread_local]` with const-init (single TLS read)
//! - `std` feature: `std::thread_local!` (no lazy-init overhead)
//! - neither: a single process-wide instance behind a spinlock

#[cfg(test)]
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod allocator;
pub mod arena;
pub mod config;
#[cfg(feature = "ffi")]
pub mod ffi;
#[cfg(feature = "alloc-histogram")]
pub mod histogram;
pub mod implicit_list;
pub mod macros;
pub mod partition;
pub mod platform;
pub mod pool;
pub mod region;
pub mod size_class;
#[cfg(feature = "stats")]
pub mod stats;
pub mod sync;
pub mod thread_alloc;
pub mod tid;

// Re-export the allocator at crate root for convenience.
pub use allocator::VmAlloc;

// Panic handler for staticlib builds (no_std has no default panic handler).
// Only active when panic="abort" (i.e., the `fast` profile), not during normal checks.
#[cfg(all(feature = "ffi", not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
