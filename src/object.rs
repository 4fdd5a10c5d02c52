// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Reference-counted objects with a finalize hook.
//!
//! Every long-lived object of this crate (tasks, aggregators, surfaces) lives behind an
//! [`ObjectRef`]. Cloning an `ObjectRef` takes a reference and dropping it releases one. When the
//! last strong reference goes away the object's [`Finalize::finalize`] hook runs exactly once.
//!
//! [`ObjectSlot`] is a slot that can be replaced and read concurrently without a lock.

use std::fmt;
use std::fmt::Debug;
use std::ops::Deref;
use std::ptr;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;

use arc_swap::ArcSwapOption;

/// Cleanup run when the last reference to an object is released.
pub trait Finalize {
    fn finalize(&mut self) {}
}

struct ObjectCell<T: Finalize> {
    flags: AtomicU32,
    value: T,
}

impl<T: Finalize> Drop for ObjectCell<T> {
    fn drop(&mut self) {
        self.value.finalize();
    }
}

/// A strong reference to a reference-counted object.
pub struct ObjectRef<T: Finalize>(Arc<ObjectCell<T>>);

impl<T: Finalize> ObjectRef<T> {
    /// Creates a new object with a single reference and no flags set.
    pub fn new(value: T) -> Self {
        Self(Arc::new(ObjectCell { flags: AtomicU32::new(0), value }))
    }

    /// Number of strong references currently held on `this`.
    pub fn ref_count(this: &Self) -> usize {
        Arc::strong_count(&this.0)
    }

    /// Whether `a` and `b` reference the same object.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Address of the object, stable for its whole lifetime.
    pub fn as_ptr(this: &Self) -> *const () {
        Arc::as_ptr(&this.0) as *const ()
    }

    pub fn downgrade(this: &Self) -> WeakRef<T> {
        WeakRef(Arc::downgrade(&this.0))
    }

    pub fn flags(this: &Self) -> u32 {
        this.0.flags.load(Ordering::SeqCst)
    }

    pub fn set_flags(this: &Self, flags: u32) {
        this.0.flags.fetch_or(flags, Ordering::SeqCst);
    }

    pub fn unset_flags(this: &Self, flags: u32) {
        this.0.flags.fetch_and(!flags, Ordering::SeqCst);
    }

}

impl<T: Finalize> Clone for ObjectRef<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T: Finalize> Deref for ObjectRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0.value
    }
}

impl<T: Finalize + Debug> Debug for ObjectRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("refs", &Arc::strong_count(&self.0))
            .field("value", &self.0.value)
            .finish()
    }
}

/// A weak reference to an object, which does not keep it alive.
pub struct WeakRef<T: Finalize>(Weak<ObjectCell<T>>);

impl<T: Finalize> WeakRef<T> {
    pub fn upgrade(&self) -> Option<ObjectRef<T>> {
        self.0.upgrade().map(ObjectRef)
    }

    /// Whether the object this references has been finalized.
    pub fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

impl<T: Finalize> Clone for WeakRef<T> {
    fn clone(&self) -> Self {
        Self(Weak::clone(&self.0))
    }
}

impl<T: Finalize> Debug for WeakRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("WeakRef({:p})", self.0.as_ptr()))
    }
}

/// Replaces the object held in `slot` with `new`.
///
/// The reference on `new` is taken before the previous occupant is released. Returns `false` if
/// `slot` already held `new`.
pub fn replace<T: Finalize>(slot: &mut Option<ObjectRef<T>>, new: Option<&ObjectRef<T>>) -> bool {
    match (slot.as_ref(), new) {
        (Some(old), Some(new)) if ObjectRef::ptr_eq(old, new) => return false,
        (None, None) => return false,
        _ => (),
    }

    let new = new.cloned();
    let _old = std::mem::replace(slot, new);

    true
}

/// A shared slot holding at most one object reference.
///
/// Readers never block writers: a replaced occupant is released once the last reader holding a
/// reference to it lets go.
pub struct ObjectSlot<T: Finalize>(ArcSwapOption<ObjectCell<T>>);

impl<T: Finalize> Default for ObjectSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn cell_ptr<T: Finalize>(cell: &Option<Arc<ObjectCell<T>>>) -> *const ObjectCell<T> {
    cell.as_ref().map_or(ptr::null(), Arc::as_ptr)
}

impl<T: Finalize> ObjectSlot<T> {
    pub fn new() -> Self {
        Self(ArcSwapOption::empty())
    }

    /// Replaces the occupant of the slot with `new`.
    ///
    /// Returns `false` if the slot already held `new`.
    pub fn replace(&self, new: Option<&ObjectRef<T>>) -> bool {
        let new = new.map(|o| Arc::clone(&o.0));
        let mut current = self.0.load();

        loop {
            if cell_ptr(&*current) == cell_ptr(&new) {
                return false;
            }

            let previous = self.0.compare_and_swap(&*current, new.clone());
            if cell_ptr(&*previous) == cell_ptr(&*current) {
                return true;
            }
            current = previous;
        }
    }

    /// Empties the slot, returning its previous occupant.
    pub fn take(&self) -> Option<ObjectRef<T>> {
        self.0.swap(None).map(ObjectRef)
    }

    /// Returns a new reference to the current occupant.
    pub fn load(&self) -> Option<ObjectRef<T>> {
        self.0.load_full().map(ObjectRef)
    }
}
