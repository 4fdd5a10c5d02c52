// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::AllocError;
use crate::surface::ExportedSurface;
use crate::surface::Surface;
use crate::surface::SurfaceMapping;
use crate::surface::SurfacePool;
use crate::task::Task;
use crate::Rect;

enum Origin {
    Pool(SurfacePool),
    /// A copy made with [`SurfaceProxy::copy`]. Keeps the original alive, so the surface only
    /// returns to its pool once every copy is gone.
    Parent(SurfaceProxy),
    Freestanding,
}

#[derive(Clone, Copy, Default)]
struct ProxyMeta {
    timestamp: u64,
    duration: u64,
    crop: Option<Rect>,
}

struct ProxyInner {
    surface: Surface,
    origin: Origin,
    meta: Mutex<ProxyMeta>,
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if let Origin::Pool(pool) = &self.origin {
            pool.put_surface(&self.surface);
        }
    }
}

/// A frame travelling through the pipeline: a surface plus per-frame metadata.
///
/// A proxy taken from a pool gives its surface back when the last clone is dropped.
#[derive(Clone)]
pub struct SurfaceProxy(Arc<ProxyInner>);

impl SurfaceProxy {
    fn with_origin(surface: Surface, origin: Origin) -> Self {
        Self(Arc::new(ProxyInner { surface, origin, meta: Mutex::new(ProxyMeta::default()) }))
    }

    pub fn new(surface: Surface) -> Self {
        Self::with_origin(surface, Origin::Freestanding)
    }

    /// Takes a surface from `pool`. Returns `None` if the pool is exhausted.
    pub fn new_from_pool(pool: &SurfacePool) -> Option<Self> {
        let surface = pool.get_surface()?;
        Some(Self::with_origin(surface, Origin::Pool(pool.clone())))
    }

    /// Wraps the next memory id allocated for `task`.
    pub fn new_from_task(task: &Task) -> Result<Self, AllocError> {
        let aggregator = task.aggregator().ok_or(AllocError::NoCurrentTask)?;
        let mid = task.next_memory_id().ok_or(AllocError::NotFound)?;
        let memory = aggregator.allocator().memory(mid).ok_or(AllocError::NotFound)?;

        Ok(Self::new(Surface::from_memory(memory)))
    }

    /// Creates a proxy on the same surface with its own copy of the metadata.
    pub fn copy(&self) -> Self {
        let meta = *self.0.meta.lock();
        let proxy = Self::with_origin(self.0.surface.clone(), Origin::Parent(self.clone()));
        *proxy.0.meta.lock() = meta;

        proxy
    }

    pub fn surface(&self) -> &Surface {
        &self.0.surface
    }

    pub fn timestamp(&self) -> u64 {
        self.0.meta.lock().timestamp
    }

    pub fn set_timestamp(&self, timestamp: u64) {
        self.0.meta.lock().timestamp = timestamp;
    }

    pub fn duration(&self) -> u64 {
        self.0.meta.lock().duration
    }

    pub fn set_duration(&self, duration: u64) {
        self.0.meta.lock().duration = duration;
    }

    /// The crop rectangle of this frame, falling back to the surface's.
    pub fn crop_rect(&self) -> Option<Rect> {
        self.0.meta.lock().crop.or_else(|| self.0.surface.crop_rect())
    }

    pub fn set_crop_rect(&self, crop: Option<Rect>) {
        self.0.meta.lock().crop = crop;
    }

    /// Whether this proxy was made with [`SurfaceProxy::copy`].
    pub fn is_derived(&self) -> bool {
        matches!(self.0.origin, Origin::Parent(_))
    }

    /// The pool the surface will return to.
    pub fn pool(&self) -> Option<SurfacePool> {
        match &self.0.origin {
            Origin::Pool(pool) => Some(pool.clone()),
            Origin::Parent(parent) => parent.pool(),
            Origin::Freestanding => None,
        }
    }

    pub fn map(&self) -> Result<SurfaceMapping<'_>, AllocError> {
        self.0.surface.map()
    }

    pub fn export(&self) -> Result<ExportedSurface, AllocError> {
        self.0.surface.export()
    }
}

impl std::fmt::Debug for SurfaceProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceProxy")
            .field("surface", &self.0.surface)
            .field("timestamp", &self.timestamp())
            .field("derived", &self.is_derived())
            .finish()
    }
}
