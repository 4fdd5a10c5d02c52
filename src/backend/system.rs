// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! System memory backend, used by tasks whose surfaces live in system memory.

use std::ptr::NonNull;

use anyhow::anyhow;
use anyhow::Context;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::backend::BackendKind;
use crate::backend::DisplayInfo;
use crate::backend::ExportedHandle;
use crate::backend::MappedBuffer;
use crate::backend::NativeHandle;
use crate::backend::NativeResourceProvider;
use crate::backend::PlaneAccess;
use crate::backend::ResourceKind;
use crate::runtime::FrameInfo;
use crate::utils::coded_buffer_size;
use crate::utils::packed_layout;
use crate::Fourcc;
use crate::PlaneLayout;

/// A frame or coded buffer in system memory.
pub struct SystemBuffer {
    data: Mutex<Box<[u8]>>,
    layout: Vec<PlaneLayout>,
    info: FrameInfo,
}

impl SystemBuffer {
    pub fn new(kind: ResourceKind, info: &FrameInfo) -> anyhow::Result<Self> {
        let (layout, size) = match kind {
            ResourceKind::CodedBuffer => {
                let stride = info.resolution.width as usize;
                (
                    vec![PlaneLayout { buffer_index: 0, offset: 0, stride }],
                    coded_buffer_size(info.resolution),
                )
            }
            ResourceKind::Surface | ResourceKind::Staging => packed_layout(
                info.fourcc,
                info.resolution,
            )
            .ok_or_else(|| anyhow!("unsupported format {}", info.fourcc))?,
        };

        if size == 0 {
            return Err(anyhow!("cannot allocate an empty buffer for {:?}", info.resolution));
        }

        let data = Mutex::new(vec![0u8; size].into_boxed_slice());
        Ok(Self { data, layout, info: info.clone() })
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn layout(&self) -> &[PlaneLayout] {
        &self.layout
    }

    pub(crate) fn map(&self) -> MappedBuffer {
        let mut data = self.data.lock();
        MappedBuffer {
            // The boxed slice is never reallocated, so the pointer stays valid for as long as
            // `self` lives.
            data: NonNull::new(data.as_mut_ptr()).unwrap_or(NonNull::dangling()),
            len: data.len(),
            pitch: self.layout.first().map_or(0, |p| p.stride as u32),
        }
    }

    pub(crate) fn map_planes(&self) -> SystemMapping<'_> {
        SystemMapping { data: self.data.lock(), layout: &self.layout }
    }

    pub(crate) fn copy_to(&self, dst: &SystemBuffer) -> anyhow::Result<()> {
        let src = self.data.lock();
        let mut dst = dst.data.lock();
        if src.len() != dst.len() {
            return Err(anyhow!("size mismatch: {} != {}", src.len(), dst.len()));
        }
        dst.copy_from_slice(&src);

        Ok(())
    }

    fn address(&self) -> usize {
        self.data.lock().as_ptr() as usize
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn export(&self) -> anyhow::Result<ExportedHandle> {
        use nix::sys::memfd::memfd_create;
        use nix::sys::memfd::MemFdCreateFlag;
        use nix::unistd::ftruncate;
        use nix::unistd::write;

        use crate::backend::DmaBufDescriptor;

        let data = self.data.lock();
        let fd = memfd_create(
            c"mfx-system-frame",
            MemFdCreateFlag::MFD_CLOEXEC | MemFdCreateFlag::MFD_ALLOW_SEALING,
        )
        .context("while creating memfd")?;
        ftruncate(&fd, data.len() as nix::libc::off_t).context("while sizing memfd")?;

        let mut written = 0;
        while written < data.len() {
            written += write(&fd, &data[written..]).context("while filling memfd")?;
        }

        Ok(ExportedHandle::DmaBuf(DmaBufDescriptor {
            fds: vec![fd],
            fourcc: self.info.fourcc,
            resolution: self.info.resolution,
            // DRM_FORMAT_MOD_LINEAR
            modifier: 0,
            planes: self.layout.clone(),
        }))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(crate) fn export(&self) -> anyhow::Result<ExportedHandle> {
        Err(anyhow!("system memory cannot be exported on this platform"))
    }
}

pub(crate) struct SystemMapping<'a> {
    data: MutexGuard<'a, Box<[u8]>>,
    layout: &'a [PlaneLayout],
}

impl<'a> PlaneAccess for SystemMapping<'a> {
    fn layout(&self) -> &[PlaneLayout] {
        self.layout
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Provider of system memory frames.
#[derive(Default)]
pub struct SystemProvider;

impl SystemProvider {
    pub fn new() -> Self {
        Self
    }
}

impl NativeResourceProvider for SystemProvider {
    type Resource = SystemBuffer;

    fn display_info(&self) -> DisplayInfo {
        DisplayInfo { handle: 0, backend: BackendKind::System, name: "system".into() }
    }

    fn is_video_memory(&self) -> bool {
        false
    }

    fn supports_format(&self, fourcc: Fourcc) -> bool {
        crate::utils::num_planes(fourcc).is_some()
    }

    fn needs_staging(&self, _: &FrameInfo) -> bool {
        false
    }

    fn create(&self, kind: ResourceKind, info: &FrameInfo) -> anyhow::Result<SystemBuffer> {
        SystemBuffer::new(kind, info)
    }

    fn destroy(&self, resource: SystemBuffer) {
        drop(resource);
    }

    fn map_buffer(&self, resource: &SystemBuffer) -> anyhow::Result<MappedBuffer> {
        Ok(resource.map())
    }

    fn unmap_buffer(&self, _: &SystemBuffer) {}

    fn map_planes<'a>(
        &'a self,
        resource: &'a SystemBuffer,
    ) -> anyhow::Result<Box<dyn PlaneAccess + 'a>> {
        Ok(Box::new(resource.map_planes()))
    }

    fn copy_to_staging(&self, src: &SystemBuffer, dst: &SystemBuffer) -> anyhow::Result<()> {
        src.copy_to(dst)
    }

    fn native_handle(&self, resource: &SystemBuffer) -> Option<NativeHandle> {
        Some(NativeHandle::System(resource.address()))
    }

    fn export(&self, resource: &SystemBuffer) -> anyhow::Result<ExportedHandle> {
        resource.export()
    }
}
