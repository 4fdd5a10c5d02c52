// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Native memory backends.
//!
//! A backend is a [`NativeResourceProvider`]: it knows how to create, map and destroy one native
//! resource on its display. The generic [`ProviderMemory`] combines the resources backing one
//! memory id into a [`MemoryBlock`], which is what the allocator and surfaces deal with.

#[cfg(all(windows, feature = "d3d11"))]
pub mod d3d11;
#[cfg(test)]
pub(crate) mod dummy;
pub mod system;
#[cfg(feature = "vaapi")]
pub mod vaapi;

#[cfg(unix)]
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;

use crate::runtime::FrameInfo;
use crate::runtime::MemId;
use crate::Fourcc;
use crate::PlaneLayout;
use crate::Resolution;

/// Kind of native display a backend runs on.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Vaapi,
    D3d11,
    System,
    Dummy,
}

/// Identifies the native display (or device) a backend allocates from.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DisplayInfo {
    /// Native display handle, e.g. a `VADisplay` or an `ID3D11Device` pointer.
    pub handle: usize,
    pub backend: BackendKind,
    pub name: String,
}

/// The kinds of native resources a backend can create.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// A GPU surface, possibly tiled.
    Surface,
    /// A linear companion of a surface, used to hand it to consumers that cannot read tiled
    /// memory.
    Staging,
    /// A buffer holding coded bitstream.
    CodedBuffer,
}

/// Native handle of a resource, as returned to the codec runtime by `get_hdl`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum NativeHandle {
    VaSurface(u32),
    VaBuffer(u32),
    D3d11Texture(usize),
    D3d11Buffer(usize),
    System(usize),
}

/// CPU mapping of a buffer.
#[derive(Copy, Clone, Debug)]
pub struct MappedBuffer {
    pub data: NonNull<u8>,
    pub len: usize,
    pub pitch: u32,
}

/// A description of an exported DMA-BUF.
#[cfg(unix)]
#[derive(Debug)]
pub struct DmaBufDescriptor {
    pub fds: Vec<OwnedFd>,
    pub fourcc: Fourcc,
    pub resolution: Resolution,
    pub modifier: u64,
    pub planes: Vec<PlaneLayout>,
}

/// A handle that can be given to a zero-copy consumer.
#[derive(Debug)]
pub enum ExportedHandle {
    #[cfg(unix)]
    DmaBuf(DmaBufDescriptor),
    /// A shared texture, described by its shared handle.
    #[cfg(windows)]
    SharedTexture { handle: usize, fourcc: Fourcc, resolution: Resolution },
}

/// A CPU mapping of the planes of a surface. Dropping it unmaps the surface.
pub trait PlaneAccess {
    fn layout(&self) -> &[PlaneLayout];
    fn data(&self) -> &[u8];
    fn data_mut(&mut self) -> &mut [u8];
}

/// Creates and manages native resources on one display.
///
/// All methods touching the display must be serialized by the provider.
pub trait NativeResourceProvider: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    fn display_info(&self) -> DisplayInfo;

    /// Whether resources of this provider live in video memory.
    fn is_video_memory(&self) -> bool {
        true
    }

    fn supports_format(&self, fourcc: Fourcc) -> bool;

    /// Whether surfaces of `info` need a linear staging companion.
    fn needs_staging(&self, info: &FrameInfo) -> bool;

    fn create(&self, kind: ResourceKind, info: &FrameInfo) -> anyhow::Result<Self::Resource>;

    fn destroy(&self, resource: Self::Resource);

    /// Maps a coded buffer for CPU reading.
    fn map_buffer(&self, resource: &Self::Resource) -> anyhow::Result<MappedBuffer>;

    fn unmap_buffer(&self, resource: &Self::Resource);

    /// Maps the planes of a surface for CPU access.
    fn map_planes<'a>(
        &'a self,
        resource: &'a Self::Resource,
    ) -> anyhow::Result<Box<dyn PlaneAccess + 'a>>;

    /// Copies the content of a surface into its staging companion.
    fn copy_to_staging(&self, src: &Self::Resource, dst: &Self::Resource) -> anyhow::Result<()>;

    fn native_handle(&self, resource: &Self::Resource) -> Option<NativeHandle>;

    fn export(&self, resource: &Self::Resource) -> anyhow::Result<ExportedHandle>;
}

/// Memory backing one memory id.
pub trait MemoryBlock: Send + Sync {
    fn mem_id(&self) -> MemId;
    fn kind(&self) -> ResourceKind;
    fn info(&self) -> &FrameInfo;
    fn has_video_memory(&self) -> bool;
    fn has_staging(&self) -> bool;

    /// Maps a coded buffer. Fails if it is already mapped.
    fn map_buffer(&self) -> anyhow::Result<MappedBuffer>;
    /// Unmaps a coded buffer. Returns `false` if it wasn't mapped.
    fn unmap_buffer(&self) -> bool;

    fn map_planes(&self) -> anyhow::Result<Box<dyn PlaneAccess + '_>>;
    fn native_handle(&self) -> Option<NativeHandle>;
    fn export(&self) -> anyhow::Result<ExportedHandle>;
}

/// A [`MemoryBlock`] made of resources of a [`NativeResourceProvider`].
///
/// The resources are destroyed, staging companion first, when the block is dropped.
pub struct ProviderMemory<P: NativeResourceProvider> {
    provider: Arc<P>,
    mem_id: MemId,
    kind: ResourceKind,
    info: FrameInfo,
    primary: Option<P::Resource>,
    staging: Option<P::Resource>,
    mapped: AtomicBool,
}

impl<P: NativeResourceProvider> ProviderMemory<P> {
    /// Creates the resources backing a new memory id.
    ///
    /// If the staging companion cannot be created, the primary resource is destroyed before
    /// returning.
    pub fn create(
        provider: Arc<P>,
        kind: ResourceKind,
        info: &FrameInfo,
        with_staging: bool,
    ) -> anyhow::Result<Self> {
        let primary = provider.create(kind, info)?;

        let staging = if with_staging {
            match provider.create(ResourceKind::Staging, info) {
                Ok(staging) => Some(staging),
                Err(e) => {
                    provider.destroy(primary);
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(Self {
            provider,
            mem_id: MemId::new(),
            kind,
            info: info.clone(),
            primary: Some(primary),
            staging,
            mapped: AtomicBool::new(false),
        })
    }

    fn primary(&self) -> anyhow::Result<&P::Resource> {
        self.primary.as_ref().ok_or_else(|| anyhow!("memory {:?} has no resource", self.mem_id))
    }
}

impl<P: NativeResourceProvider> MemoryBlock for ProviderMemory<P> {
    fn mem_id(&self) -> MemId {
        self.mem_id
    }

    fn kind(&self) -> ResourceKind {
        self.kind
    }

    fn info(&self) -> &FrameInfo {
        &self.info
    }

    fn has_video_memory(&self) -> bool {
        self.provider.is_video_memory()
    }

    fn has_staging(&self) -> bool {
        self.staging.is_some()
    }

    fn map_buffer(&self) -> anyhow::Result<MappedBuffer> {
        if self.mapped.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("memory {:?} is already mapped", self.mem_id));
        }

        let mapped = self.primary().and_then(|resource| self.provider.map_buffer(resource));
        if mapped.is_err() {
            self.mapped.store(false, Ordering::SeqCst);
        }

        mapped
    }

    fn unmap_buffer(&self) -> bool {
        if !self.mapped.swap(false, Ordering::SeqCst) {
            return false;
        }

        if let Some(resource) = &self.primary {
            self.provider.unmap_buffer(resource);
        }

        true
    }

    fn map_planes(&self) -> anyhow::Result<Box<dyn PlaneAccess + '_>> {
        if self.kind == ResourceKind::CodedBuffer {
            return Err(anyhow!("coded buffers have no planes"));
        }

        self.provider.map_planes(self.primary()?)
    }

    fn native_handle(&self) -> Option<NativeHandle> {
        self.primary.as_ref().and_then(|resource| self.provider.native_handle(resource))
    }

    fn export(&self) -> anyhow::Result<ExportedHandle> {
        let primary = self.primary()?;

        match &self.staging {
            Some(staging) => {
                self.provider.copy_to_staging(primary, staging)?;
                self.provider.export(staging)
            }
            None => self.provider.export(primary),
        }
    }
}

impl<P: NativeResourceProvider> Drop for ProviderMemory<P> {
    fn drop(&mut self) {
        self.unmap_buffer();

        if let Some(staging) = self.staging.take() {
            self.provider.destroy(staging);
        }
        if let Some(primary) = self.primary.take() {
            self.provider.destroy(primary);
        }
    }
}
