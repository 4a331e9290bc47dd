//! Thread-id acquisition (spec §5: "Thread-local-storage and thread-id
//! acquisition — specified only by their required contract").
//!
//! The contract the rest of the allocator relies on: every thread gets a
//! small, stable, non-negative `i64` identity for the lifetime of its first
//! touch of the allocator, distinct from every other live thread's id, and
//! never equal to [`crate::region::ABANDONED`] (-1). Ids may be reused after
//! a thread exits; nothing in the allocator assumes otherwise; the per-thread
//! allocator's `on_thread_exit` runs before a dead thread's id could be
//! handed to a new thread under any plausible runtime promise.

use core::sync::atomic::{AtomicI64, Ordering};

static NEXT_ID: AtomicI64 = AtomicI64::new(1);

#[cfg(feature = "std")]
std::thread_local! {
    static TID: i64 = NEXT_ID.fetch_add(1, Ordering::Relaxed);
}

/// Return the calling thread's id, assigning a fresh one on first call.
///
/// Without the `std` feature there is no portable TLS primitive available in
/// `no_std`, so every thread collapses onto id 0 (correct but serializes all
/// cross-thread traffic through the deferred-free path).
#[cfg(feature = "std")]
#[inline]
pub fn current() -> i64 {
    TID.with(|id| *id)
}

#[cfg(not(feature = "std"))]
#[inline]
pub fn current() -> i64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_per_thread_and_distinct_across_threads() {
        let a1 = current();
        let a2 = current();
        assert_eq!(a1, a2);

        let b = std::thread::spawn(current).join().unwrap();
        assert_ne!(a1, b);
    }

    #[test]
    fn ids_never_collide_with_abandoned_sentinel() {
        assert_ne!(current(), crate::region::ABANDONED);
    }
}
