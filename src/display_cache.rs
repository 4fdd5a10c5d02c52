// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A cache mapping native displays to the objects bound to them.
//!
//! The cache only holds weak references: an entry goes away once its object is finalized, and
//! dead entries are pruned whenever the cache is accessed.

use parking_lot::Mutex;

use crate::backend::BackendKind;
use crate::backend::DisplayInfo;
use crate::object::Finalize;
use crate::object::ObjectRef;
use crate::object::WeakRef;

struct CacheEntry<T: Finalize> {
    info: DisplayInfo,
    object: WeakRef<T>,
}

pub struct DisplayCache<T: Finalize> {
    entries: Mutex<Vec<CacheEntry<T>>>,
}

impl<T: Finalize> Default for DisplayCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Finalize> DisplayCache<T> {
    pub fn new() -> Self {
        Self { entries: Mutex::new(Vec::new()) }
    }

    fn find(
        entries: &mut Vec<CacheEntry<T>>,
        pred: impl Fn(&DisplayInfo) -> bool,
    ) -> Option<ObjectRef<T>> {
        entries.retain(|entry| !entry.object.is_dead());
        entries.iter().filter(|entry| pred(&entry.info)).find_map(|entry| entry.object.upgrade())
    }

    /// Binds `object` to the display described by `info`, replacing any previous binding.
    pub fn add(&self, info: &DisplayInfo, object: &ObjectRef<T>) {
        let mut entries = self.entries.lock();
        entries.retain(|entry| !entry.object.is_dead() && !same_display(&entry.info, info));
        entries.push(CacheEntry { info: info.clone(), object: ObjectRef::downgrade(object) });
    }

    /// Removes the binding of the display with native `handle`. Returns whether there was one.
    pub fn remove(&self, handle: usize) -> bool {
        let mut entries = self.entries.lock();
        let len = entries.len();
        entries.retain(|entry| entry.info.handle != handle);

        entries.len() != len
    }

    pub fn lookup(&self, handle: usize) -> Option<ObjectRef<T>> {
        Self::find(&mut self.entries.lock(), |info| info.handle == handle)
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<ObjectRef<T>> {
        Self::find(&mut self.entries.lock(), |info| info.name == name)
    }

    pub fn lookup_by_backend(&self, backend: BackendKind) -> Option<ObjectRef<T>> {
        Self::find(&mut self.entries.lock(), |info| info.backend == backend)
    }

    pub fn lookup_custom(&self, pred: impl Fn(&DisplayInfo) -> bool) -> Option<ObjectRef<T>> {
        Self::find(&mut self.entries.lock(), pred)
    }

    /// Returns the object bound to `info`, creating and binding it with `create` if there is
    /// none. The cache stays locked while `create` runs, so concurrent callers get one object.
    pub fn get_or_insert_with(
        &self,
        info: &DisplayInfo,
        create: impl FnOnce() -> ObjectRef<T>,
    ) -> ObjectRef<T> {
        let mut entries = self.entries.lock();
        if let Some(object) = Self::find(&mut entries, |i| same_display(i, info)) {
            return object;
        }

        let object = create();
        entries.push(CacheEntry { info: info.clone(), object: ObjectRef::downgrade(&object) });

        object
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|entry| !entry.object.is_dead());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn same_display(a: &DisplayInfo, b: &DisplayInfo) -> bool {
    a.handle == b.handle && a.backend == b.backend
}
