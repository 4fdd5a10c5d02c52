// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A generic object pool with an optional capacity ceiling.
//!
//! Objects are created on demand by an allocation callback and tracked in a free list and a used
//! list. The callback always runs without the pool lock held, since creating native memory can
//! be slow.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Objects that can be tracked by an [`ObjectPool`].
///
/// Pool objects are cheap handles (a clone is another reference to the same object), and the
/// pool identifies them with `same_object`.
pub trait PoolObject: Clone + Send + 'static {
    fn same_object(&self, other: &Self) -> bool;
}

impl<T: Send + Sync + 'static> PoolObject for Arc<T> {
    fn same_object(&self, other: &Self) -> bool {
        Arc::ptr_eq(self, other)
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool allocation callback failed")]
    AllocationFailed,
}

type AllocCb<T> = Box<dyn Fn() -> Option<T> + Send + Sync>;

struct PoolState<T> {
    free: VecDeque<T>,
    used: Vec<T>,
    /// Allocations running outside the lock. They count against the capacity.
    in_flight: usize,
    /// Maximum number of used objects, 0 meaning unbounded.
    capacity: usize,
}

impl<T> PoolState<T> {
    fn is_full(&self) -> bool {
        self.capacity != 0 && self.used.len() + self.in_flight >= self.capacity
    }
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    alloc_cb: AllocCb<T>,
}

impl<T> Drop for PoolInner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.used.is_empty() {
            log::debug!("Dropping pool with {} objects still in use", state.used.len());
        }
    }
}

/// A pool of objects, shared by all its clones.
pub struct ObjectPool<T: PoolObject> {
    inner: Arc<PoolInner<T>>,
}

impl<T: PoolObject> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: PoolObject> ObjectPool<T> {
    /// Creates an empty pool that calls `alloc_cb` whenever it runs out of free objects.
    ///
    /// A `capacity` of 0 makes the pool unbounded.
    pub fn new(capacity: usize, alloc_cb: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    free: VecDeque::new(),
                    used: Vec::new(),
                    in_flight: 0,
                    capacity,
                }),
                alloc_cb: Box::new(alloc_cb),
            }),
        }
    }

    /// Gets an object from the pool, allocating a new one if no free object is available.
    ///
    /// Returns `None` if the pool is at capacity or the allocation failed.
    pub fn get(&self) -> Option<T> {
        {
            let mut state = self.inner.state.lock();
            if state.is_full() {
                return None;
            }

            if let Some(object) = state.free.pop_front() {
                state.used.push(object.clone());
                return Some(object);
            }

            state.in_flight += 1;
        }

        let object = (self.inner.alloc_cb)();

        let mut state = self.inner.state.lock();
        state.in_flight -= 1;
        let object = object?;
        state.used.push(object.clone());

        Some(object)
    }

    /// Returns `object` to the free list. Objects that are not in use by this pool are ignored.
    pub fn put(&self, object: T) {
        let mut state = self.inner.state.lock();

        let Some(pos) = state.used.iter().position(|o| o.same_object(&object)) else {
            return;
        };

        let pooled = state.used.swap_remove(pos);
        state.free.push_back(pooled);
    }

    /// Allocates objects until the pool tracks `n` of them, clipped to its capacity.
    ///
    /// On failure the objects allocated so far are kept.
    pub fn reserve(&self, n: usize) -> Result<(), PoolError> {
        loop {
            {
                let mut state = self.inner.state.lock();
                let target = if state.capacity != 0 { n.min(state.capacity) } else { n };
                if state.free.len() + state.used.len() + state.in_flight >= target {
                    return Ok(());
                }
                state.in_flight += 1;
            }

            let object = (self.inner.alloc_cb)();

            let mut state = self.inner.state.lock();
            state.in_flight -= 1;
            match object {
                Some(object) => state.free.push_back(object),
                None => return Err(PoolError::AllocationFailed),
            }
        }
    }

    /// Number of free objects.
    pub fn size(&self) -> usize {
        self.inner.state.lock().free.len()
    }

    pub fn used_count(&self) -> usize {
        self.inner.state.lock().used.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.state.lock().capacity
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.inner.state.lock().capacity = capacity;
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    use super::*;

    fn counting_pool(capacity: usize) -> (ObjectPool<Arc<usize>>, Arc<AtomicUsize>) {
        let allocated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&allocated);
        let pool = ObjectPool::new(capacity, move || {
            Some(Arc::new(counter.fetch_add(1, Ordering::SeqCst)))
        });

        (pool, allocated)
    }

    #[test]
    fn capacity_bound() {
        let (pool, allocated) = counting_pool(2);

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(pool.get().is_none());
        assert_eq!(pool.used_count(), 2);

        pool.put(a);
        assert_eq!(pool.used_count(), 1);
        assert_eq!(pool.size(), 1);

        let c = pool.get().unwrap();
        assert!(pool.get().is_none());
        assert_eq!(allocated.load(Ordering::SeqCst), 2);
        assert_eq!(*c, 0);

        pool.put(b);
        pool.put(c);
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.used_count(), 0);
    }

    #[test]
    fn capacity_bound_with_concurrent_gets() {
        let allocated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&allocated);
        let pool = ObjectPool::new(3, move || {
            // Keep allocations in flight long enough for the other threads to race them.
            thread::sleep(Duration::from_millis(5));
            Some(Arc::new(counter.fetch_add(1, Ordering::SeqCst)))
        });

        let barrier = Arc::new(Barrier::new(8));
        let handles = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    pool.get()
                })
            })
            .collect::<Vec<_>>();

        let got = handles.into_iter().filter_map(|h| h.join().unwrap()).collect::<Vec<_>>();
        assert_eq!(got.len(), 3);
        assert_eq!(allocated.load(Ordering::SeqCst), 3);
        assert_eq!(pool.used_count(), 3);
        assert!(pool.get().is_none());
    }

    #[test]
    fn conservation() {
        let (pool, _) = counting_pool(0);
        let mut held = Vec::new();
        let mut total = 0;

        for round in 0..20 {
            if round % 3 == 2 {
                if let Some(object) = held.pop() {
                    pool.put(object);
                }
            } else {
                held.push(pool.get().unwrap());
            }

            let tracked = pool.size() + pool.used_count();
            assert!(tracked >= total);
            total = tracked;
            assert_eq!(pool.used_count(), held.len());
        }
    }

    #[test]
    fn put_foreign_object_is_noop() {
        let (pool, _) = counting_pool(0);
        let object = pool.get().unwrap();

        pool.put(Arc::new(42));
        assert_eq!(pool.used_count(), 1);
        assert_eq!(pool.size(), 0);

        pool.put(object.clone());
        pool.put(object);
        assert_eq!(pool.used_count(), 0);
        assert_eq!(pool.size(), 1);
    }

    #[test]
    fn reserve_clipped_to_capacity() {
        let (pool, allocated) = counting_pool(3);
        pool.reserve(8).unwrap();
        assert_eq!(pool.size(), 3);
        assert_eq!(allocated.load(Ordering::SeqCst), 3);

        let (pool, _) = counting_pool(0);
        pool.reserve(5).unwrap();
        assert_eq!(pool.size(), 5);
    }

    #[test]
    fn reserve_failure_keeps_reserved() {
        let allocated = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&allocated);
        let pool = ObjectPool::new(0, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            (n < 2).then(|| Arc::new(n))
        });

        assert!(matches!(pool.reserve(4), Err(PoolError::AllocationFailed)));
        assert_eq!(pool.size(), 2);
    }

    #[test]
    fn allocation_runs_outside_lock() {
        let pool_slot: Arc<Mutex<Option<ObjectPool<Arc<usize>>>>> = Arc::new(Mutex::new(None));
        let reentered = Arc::new(AtomicBool::new(false));

        let slot = Arc::clone(&pool_slot);
        let flag = Arc::clone(&reentered);
        let pool = ObjectPool::new(0, move || {
            // Querying the pool from the callback would deadlock if the lock were held.
            if let Some(pool) = slot.lock().as_ref() {
                let _ = pool.size();
                flag.store(true, Ordering::SeqCst);
            }
            Some(Arc::new(0))
        });
        *pool_slot.lock() = Some(pool.clone());

        assert!(pool.get().is_some());
        assert!(reentered.load(Ordering::SeqCst));

        pool_slot.lock().take();
    }

    #[test]
    fn teardown_drops_references() {
        let (pool, _) = counting_pool(0);
        let held = pool.get().unwrap();
        pool.reserve(3).unwrap();
        assert_eq!(Arc::strong_count(&held), 2);

        drop(pool);
        assert_eq!(Arc::strong_count(&held), 1);
    }
}
