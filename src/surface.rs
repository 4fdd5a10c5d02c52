// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Surfaces wrap the memory handed to the codec runtime so pipeline stages can map, crop and
//! export it.

mod proxy;

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::allocator::AllocError;
use crate::allocator::TaskAllocator;
use crate::backend::system::SystemProvider;
use crate::backend::ExportedHandle;
use crate::backend::MemoryBlock;
use crate::backend::NativeHandle;
use crate::backend::PlaneAccess;
use crate::backend::ProviderMemory;
use crate::backend::ResourceKind;
use crate::object::Finalize;
use crate::object::ObjectRef;
use crate::pool::ObjectPool;
use crate::pool::PoolError;
use crate::pool::PoolObject;
use crate::runtime::FrameInfo;
use crate::runtime::MemId;
use crate::task::Task;
use crate::Fourcc;
use crate::PlaneLayout;
use crate::Rect;
use crate::Resolution;

pub use proxy::SurfaceProxy;

pub struct SurfaceInner {
    memory: Arc<dyn MemoryBlock>,
    crop: Mutex<Option<Rect>>,
    mapped: AtomicBool,
}

impl Finalize for SurfaceInner {}

/// A frame in native memory. Clones reference the same surface.
#[derive(Clone)]
pub struct Surface(ObjectRef<SurfaceInner>);

impl PoolObject for Surface {
    fn same_object(&self, other: &Self) -> bool {
        ObjectRef::ptr_eq(&self.0, &other.0)
    }
}

impl Surface {
    /// Wraps memory created by an allocator.
    pub fn from_memory(memory: Arc<dyn MemoryBlock>) -> Self {
        let info = memory.info();
        let crop = Some(info.crop).filter(|c| !c.is_empty() && *c != Rect::from(info.resolution));

        Self(ObjectRef::new(SurfaceInner {
            memory,
            crop: Mutex::new(crop),
            mapped: AtomicBool::new(false),
        }))
    }

    /// Creates a surface that is not part of any allocation response.
    pub fn new(allocator: &dyn TaskAllocator, info: &FrameInfo) -> Result<Self, AllocError> {
        Ok(Self::from_memory(allocator.create_memory(info)?))
    }

    /// Creates a surface in system memory.
    pub fn new_system(info: &FrameInfo) -> Result<Self, AllocError> {
        let memory = ProviderMemory::create(
            Arc::new(SystemProvider::new()),
            ResourceKind::Surface,
            info,
            false,
        )
        .map_err(AllocError::MemoryAlloc)?;

        Ok(Self::from_memory(Arc::new(memory)))
    }

    pub fn mem_id(&self) -> MemId {
        self.0.memory.mem_id()
    }

    pub fn memory(&self) -> &Arc<dyn MemoryBlock> {
        &self.0.memory
    }

    pub fn info(&self) -> &FrameInfo {
        self.0.memory.info()
    }

    pub fn fourcc(&self) -> Fourcc {
        self.info().fourcc
    }

    /// Allocated, aligned, resolution of the surface.
    pub fn resolution(&self) -> Resolution {
        self.info().resolution
    }

    /// The visible region of the surface, if it differs from its allocated extent.
    pub fn crop_rect(&self) -> Option<Rect> {
        *self.0.crop.lock()
    }

    pub fn set_crop_rect(&self, crop: Option<Rect>) {
        if let Some(crop) = crop {
            debug_assert!(crop.fits_in(self.resolution()));
        }
        *self.0.crop.lock() = crop;
    }

    pub fn has_video_memory(&self) -> bool {
        self.0.memory.has_video_memory()
    }

    pub fn is_mapped(&self) -> bool {
        self.0.mapped.load(Ordering::SeqCst)
    }

    pub fn native_handle(&self) -> Option<NativeHandle> {
        self.0.memory.native_handle()
    }

    /// Maps the planes of the surface for CPU access until the returned mapping is dropped.
    pub fn map(&self) -> Result<SurfaceMapping<'_>, AllocError> {
        if self.0.mapped.swap(true, Ordering::SeqCst) {
            return Err(AllocError::LockFailed(format!(
                "surface {:?} is already mapped",
                self.mem_id()
            )));
        }

        match self.0.memory.map_planes() {
            Ok(access) => Ok(SurfaceMapping { access, _mapped: MappedFlag(&self.0.mapped) }),
            Err(e) => {
                self.0.mapped.store(false, Ordering::SeqCst);
                Err(AllocError::LockFailed(format!("{:#}", e)))
            }
        }
    }

    /// Exports the surface for a zero-copy consumer.
    ///
    /// The returned handle keeps the surface alive.
    pub fn export(&self) -> Result<ExportedSurface, AllocError> {
        let handle = self.0.memory.export().map_err(AllocError::Export)?;

        Ok(ExportedSurface { handle, _surface: self.clone() })
    }

    pub fn ptr_eq(&self, other: &Surface) -> bool {
        ObjectRef::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Surface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Surface")
            .field("mem_id", &self.mem_id())
            .field("fourcc", &self.fourcc())
            .field("resolution", &self.resolution())
            .finish()
    }
}

/// Clears the mapped flag of a surface when dropped.
struct MappedFlag<'a>(&'a AtomicBool);

impl<'a> Drop for MappedFlag<'a> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A CPU mapping of the planes of a [`Surface`].
pub struct SurfaceMapping<'a> {
    // Unmaps before the surface is flagged as unmapped, as fields drop in order.
    access: Box<dyn PlaneAccess + 'a>,
    _mapped: MappedFlag<'a>,
}

impl<'a> SurfaceMapping<'a> {
    fn plane_range(&self, plane: usize) -> Option<std::ops::Range<usize>> {
        let access = &self.access;
        let layout = access.layout();
        let start = layout.get(plane)?.offset;
        let end = layout
            .iter()
            .map(|p| p.offset)
            .filter(|offset| *offset > start)
            .min()
            .unwrap_or(access.data().len());

        Some(start..end)
    }

    pub fn num_planes(&self) -> usize {
        self.access.layout().len()
    }

    pub fn layout(&self) -> &[PlaneLayout] {
        self.access.layout()
    }

    pub fn pitch(&self, plane: usize) -> Option<usize> {
        self.layout().get(plane).map(|p| p.stride)
    }

    pub fn offset(&self, plane: usize) -> Option<usize> {
        self.layout().get(plane).map(|p| p.offset)
    }

    /// Bytes of `plane`, from its first row to the start of the next plane.
    pub fn plane(&self, plane: usize) -> Option<&[u8]> {
        let range = self.plane_range(plane)?;
        self.access.data().get(range)
    }

    pub fn plane_mut(&mut self, plane: usize) -> Option<&mut [u8]> {
        let range = self.plane_range(plane)?;
        self.access.data_mut().get_mut(range)
    }
}

/// An exported surface. The surface stays alive as long as this does.
pub struct ExportedSurface {
    pub handle: ExportedHandle,
    _surface: Surface,
}

/// A pool of surfaces of one format.
#[derive(Clone)]
pub struct SurfacePool {
    pool: ObjectPool<Surface>,
    info: FrameInfo,
}

impl SurfacePool {
    /// Creates a pool of surfaces of `info` allocated by `allocator`.
    ///
    /// A `capacity` of 0 makes the pool unbounded.
    pub fn new(allocator: Arc<dyn TaskAllocator>, info: &FrameInfo, capacity: usize) -> Self {
        let alloc_info = info.clone();
        let pool = ObjectPool::new(capacity, move || {
            Surface::new(allocator.as_ref(), &alloc_info)
                .map_err(|e| log::error!("Failed to allocate pool surface: {}", e))
                .ok()
        });

        Self { pool, info: info.clone() }
    }

    /// Creates a pool of system memory surfaces of `info`.
    pub fn new_system(info: &FrameInfo, capacity: usize) -> Self {
        let alloc_info = info.clone();
        let pool = ObjectPool::new(capacity, move || {
            Surface::new_system(&alloc_info)
                .map_err(|e| log::error!("Failed to allocate system surface: {}", e))
                .ok()
        });

        Self { pool, info: info.clone() }
    }

    /// Creates a pool over the memory allocated for `task`, one surface per memory id.
    pub fn new_from_task(task: &Task) -> Result<Self, AllocError> {
        let aggregator = task.aggregator().ok_or(AllocError::NoCurrentTask)?;
        let allocator = Arc::clone(aggregator.allocator());

        let mids = task.memory_ids();
        let info = mids
            .first()
            .and_then(|mid| allocator.memory(*mid))
            .map(|memory| memory.info().clone())
            .ok_or(AllocError::NotFound)?;

        let capacity = mids.len();
        let next = AtomicUsize::new(0);
        let pool = ObjectPool::new(capacity, move || {
            let mid = mids[next.fetch_add(1, Ordering::SeqCst) % mids.len()];
            allocator.memory(mid).map(Surface::from_memory)
        });

        Ok(Self { pool, info })
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn get_surface(&self) -> Option<Surface> {
        self.pool.get()
    }

    pub fn put_surface(&self, surface: &Surface) {
        self.pool.put(surface.clone());
    }

    pub fn reserve(&self, n: usize) -> Result<(), PoolError> {
        self.pool.reserve(n)
    }

    /// Number of free surfaces.
    pub fn size(&self) -> usize {
        self.pool.size()
    }

    pub fn used_count(&self) -> usize {
        self.pool.used_count()
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.pool.set_capacity(capacity)
    }

    pub fn ptr_eq(&self, other: &SurfacePool) -> bool {
        self.pool.ptr_eq(&other.pool)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::allocator::ExternalAllocator;
    use crate::backend::dummy::DummyProvider;

    fn allocator() -> (Arc<DummyProvider>, Arc<dyn TaskAllocator>) {
        let provider = Arc::new(DummyProvider::new());
        let allocator: Arc<dyn TaskAllocator> =
            Arc::new(ExternalAllocator::new(Arc::clone(&provider)));

        (provider, allocator)
    }

    #[test]
    fn map_planes() {
        let (_, allocator) = allocator();
        let info = FrameInfo::new(Fourcc::NV12, (16, 8).into());
        let surface = Surface::new(allocator.as_ref(), &info).unwrap();
        assert!(surface.has_video_memory());

        {
            let mut mapping = surface.map().unwrap();
            assert!(surface.is_mapped());
            assert!(matches!(surface.map(), Err(AllocError::LockFailed(_))));

            assert_eq!(mapping.num_planes(), 2);
            assert_eq!(mapping.pitch(0), Some(16));
            assert_eq!(mapping.offset(1), Some(16 * 8));
            assert_eq!(mapping.plane(0).unwrap().len(), 16 * 8);
            assert_eq!(mapping.plane(1).unwrap().len(), 16 * 4);
            assert!(mapping.plane(2).is_none());

            mapping.plane_mut(1).unwrap()[0] = 0x80;
        }

        assert!(!surface.is_mapped());
        assert_eq!(surface.map().unwrap().plane(1).unwrap()[0], 0x80);
    }

    #[test]
    fn crop_rect() {
        let mut info = FrameInfo::new(Fourcc::NV12, (1920, 1088).into());
        info.crop = Rect { x: 0, y: 0, width: 1920, height: 1080 };
        let surface = Surface::new_system(&info).unwrap();
        assert!(!surface.has_video_memory());
        assert_eq!(surface.crop_rect(), Some(info.crop));

        surface.set_crop_rect(None);
        assert_eq!(surface.crop_rect(), None);

        // A crop covering the whole surface is no crop at all.
        let full = Surface::new_system(&FrameInfo::new(Fourcc::NV12, (64, 64).into())).unwrap();
        assert_eq!(full.crop_rect(), None);
    }

    #[test]
    fn pool_recycles_surfaces() {
        let (provider, allocator) = allocator();
        let info = FrameInfo::new(Fourcc::NV12, (32, 32).into());
        let pool = SurfacePool::new(allocator, &info, 2);

        let a = pool.get_surface().unwrap();
        let b = pool.get_surface().unwrap();
        assert!(pool.get_surface().is_none());
        assert_eq!(provider.created(), 2);

        pool.put_surface(&a);
        let c = pool.get_surface().unwrap();
        assert!(c.ptr_eq(&a));
        assert_eq!(provider.created(), 2);

        drop((a, b, c));
        drop(pool);
        assert_eq!(provider.live(), 0);
    }

    #[test]
    fn system_pool() {
        let info = FrameInfo::new(Fourcc::YUY2, (8, 8).into());
        let pool = SurfacePool::new_system(&info, 0);
        pool.reserve(3).unwrap();
        assert_eq!(pool.size(), 3);

        let surface = pool.get_surface().unwrap();
        assert!(!surface.has_video_memory());
        assert_eq!(surface.map().unwrap().pitch(0), Some(16));
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    #[test]
    fn export_keeps_surface_alive() {
        let (provider, allocator) = allocator();
        let info = FrameInfo::new(Fourcc::NV12, (16, 16).into());
        let surface = Surface::new(allocator.as_ref(), &info).unwrap();

        let exported = surface.export().unwrap();
        drop(surface);
        assert_eq!(provider.live(), 1);

        match &exported.handle {
            ExportedHandle::DmaBuf(descriptor) => assert_eq!(descriptor.fourcc, Fourcc::NV12),
        }
        drop(exported);
        assert_eq!(provider.live(), 0);
    }
}
