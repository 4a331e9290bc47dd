//! Lightweight synchronization primitives for use in the allocator.
//!
//! We cannot use `std::sync::Mutex` because it allocates. Instead we provide
//! a simple test-and-set spinlock and a `SpinMutex<T>` wrapper.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A simple test-and-set spinlock.
pub struct SpinLock {
    locked: AtomicBool,
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn lock(&self) {
        if self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        loop {
            // Spin while locked (read-only, doesn't invalidate cache line)
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    #[inline]
    pub fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    #[inline]
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

unsafe impl Send for SpinLock {}
unsafe impl Sync for SpinLock {}

/// A mutex that uses a spinlock for synchronization.
/// Does not allocate and can be used in a `static`.
pub struct SpinMutex<T> {
    lock: SpinLock,
    data: UnsafeCell<T>,
}

impl<T> SpinMutex<T> {
    pub const fn new(val: T) -> Self {
        Self {
            lock: SpinLock::new(),
            data: UnsafeCell::new(val),
        }
    }

    #[inline]
    pub fn lock(&self) -> SpinMutexGuard<'_, T> {
        self.lock.lock();
        SpinMutexGuard { mutex: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<SpinMutexGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(SpinMutexGuard { mutex: self })
        } else {
            None
        }
    }
}

unsafe impl<T: Send> Send for SpinMutex<T> {}
unsafe impl<T: Send> Sync for SpinMutex<T> {}

/// RAII guard for `SpinMutex`. Unlocks on drop.
pub struct SpinMutexGuard<'a, T> {
    mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.mutex.lock.unlock();
    }
}

/// A lock-free MPSC intrusive stack (spec §5/§9 "deferred free"): any number
/// of foreign threads push freed blocks with a CAS-loop prepend under
/// `Release`; the single owning thread drains the whole chain at once with
/// an `Acquire` `exchange(null)`. The "next" link is stored in the first
/// word of each pushed block itself — there is no separate node allocation,
/// matching spec's requirement that freeing never touches heap metadata
/// outside the blocks the allocator already owns.
pub struct DeferredFreeStack {
    head: core::sync::atomic::AtomicPtr<u8>,
    /// Soft count of pending nodes. Relaxed; a hint for "batch is large,
    /// please flush", never load-bearing for correctness (spec §5).
    pub pending: core::sync::atomic::AtomicUsize,
}

impl Default for DeferredFreeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl DeferredFreeStack {
    pub const fn new() -> Self {
        Self {
            head: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
            pending: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Push `ptr` onto the stack. `ptr` must point to at least one word of
    /// writable memory (the block being freed); that word is overwritten
    /// with the stack's intrusive "next" link.
    ///
    /// # Safety
    /// `ptr` must be valid for a `usize`-sized write and must not already be
    /// linked into any other list.
    #[inline]
    pub unsafe fn push(&self, ptr: *mut u8) {
        let node = ptr as *mut *mut u8;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { node.write(head) };
            match self.head.compare_exchange_weak(
                head,
                ptr,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => head = actual,
            }
        }
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Push a pre-linked chain (`head..=tail`, each node's first word already
    /// pointing to the next) on in a single CAS, rather than one per node
    /// (spec §4.5 "deferred free": a run of frees destined for the same
    /// foreign container is staged locally and flushed as one splice).
    ///
    /// # Safety
    /// `head..=tail` must already form a valid singly-linked chain through
    /// each node's first word, with `tail`'s first word not yet written (it
    /// will be linked to the stack's prior head by this call).
    #[inline]
    pub unsafe fn push_chain(&self, head: *mut u8, tail: *mut u8) {
        if head.is_null() {
            return;
        }
        let tail_node = tail as *mut *mut u8;
        let mut old_head = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { tail_node.write(old_head) };
            match self.head.compare_exchange_weak(
                old_head,
                head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => old_head = actual,
            }
        }
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically take the entire chain, leaving the stack empty. Returns
    /// the head of a singly-linked list (via the first word of each block)
    /// terminated by null. Must only be called by the owning thread.
    #[inline]
    pub fn drain(&self) -> *mut u8 {
        let head = self.head.swap(core::ptr::null_mut(), Ordering::Acquire);
        if !head.is_null() {
            self.pending.store(0, Ordering::Relaxed);
        }
        head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

unsafe impl Send for DeferredFreeStack {}
unsafe impl Sync for DeferredFreeStack {}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec::Vec;
    use std::sync::Arc;

    #[test]
    fn test_spinlock_basic() {
        let lock = SpinLock::new();
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn test_spinlock_try() {
        let lock = SpinLock::new();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock();
        assert!(lock.try_lock());
        lock.unlock();
    }

    #[test]
    fn test_spinmutex_basic() {
        let mutex = SpinMutex::new(42u64);
        {
            let guard = mutex.lock();
            assert_eq!(*guard, 42);
        }
        {
            let mut guard = mutex.lock();
            *guard = 100;
        }
        {
            let guard = mutex.lock();
            assert_eq!(*guard, 100);
        }
    }

    #[test]
    fn test_spinmutex_concurrent() {
        let mutex = Arc::new(SpinMutex::new(0u64));
        let num_threads = 8;
        let iterations = 10_000;

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let m = Arc::clone(&mutex);
                std::thread::spawn(move || {
                    for _ in 0..iterations {
                        let mut guard = m.lock();
                        *guard += 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        let guard = mutex.lock();
        assert_eq!(*guard, num_threads * iterations);
    }

    #[test]
    fn deferred_free_stack_push_drain() {
        let stack = DeferredFreeStack::new();
        let mut blocks: Vec<Box<usize>> = (0..8).map(Box::new).collect();
        let ptrs: Vec<*mut u8> = blocks.iter_mut().map(|b| (&mut **b) as *mut usize as *mut u8).collect();

        for &p in &ptrs {
            unsafe { stack.push(p) };
        }
        assert!(!stack.is_empty());

        let mut seen = Vec::new();
        let mut cur = stack.drain();
        while !cur.is_null() {
            seen.push(cur);
            cur = unsafe { *(cur as *mut *mut u8) };
        }
        assert_eq!(seen.len(), ptrs.len());
        assert!(stack.is_empty());
    }

    #[test]
    fn deferred_free_stack_push_chain_then_drain() {
        let stack = DeferredFreeStack::new();
        let mut blocks: Vec<Box<usize>> = (0..5).map(Box::new).collect();
        let ptrs: Vec<*mut u8> = blocks.iter_mut().map(|b| (&mut **b) as *mut usize as *mut u8).collect();

        for w in ptrs.windows(2) {
            unsafe { *(w[0] as *mut *mut u8) = w[1] };
        }
        unsafe { stack.push_chain(ptrs[0], *ptrs.last().unwrap()) };
        assert!(!stack.is_empty());

        let mut seen = Vec::new();
        let mut cur = stack.drain();
        while !cur.is_null() {
            seen.push(cur);
            cur = unsafe { *(cur as *mut *mut u8) };
        }
        assert_eq!(seen, ptrs);
    }

    #[test]
    fn deferred_free_stack_concurrent_push() {
        let stack = Arc::new(DeferredFreeStack::new());
        let mut blocks: Vec<Box<usize>> = (0..400).map(Box::new).collect();
        let ptrs: Vec<usize> = blocks.iter_mut().map(|b| (&mut **b) as *mut usize as usize).collect();

        let chunks: Vec<Vec<usize>> = ptrs.chunks(50).map(|c| c.to_vec()).collect();
        let handles: Vec<_> = chunks
            .into_iter()
            .map(|chunk| {
                let s = Arc::clone(&stack);
                std::thread::spawn(move || {
                    for p in chunk {
                        unsafe { s.push(p as *mut u8) };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut count = 0;
        let mut cur = stack.drain();
        while !cur.is_null() {
            count += 1;
            cur = unsafe { *(cur as *mut *mut u8) };
        }
        assert_eq!(count, 400);
    }
}
