// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Direct3D 11 backend: textures for pixel surfaces and staging buffers for coded data.

use std::ptr::NonNull;

use anyhow::anyhow;
use anyhow::Context as _;
use parking_lot::Mutex;
use parking_lot::MutexGuard;
use windows::core::Interface;
use windows::Win32::Foundation::HMODULE;
use windows::Win32::Graphics::Direct3D::D3D_DRIVER_TYPE_UNKNOWN;
use windows::Win32::Graphics::Direct3D11::D3D11CreateDevice;
use windows::Win32::Graphics::Direct3D11::ID3D11Buffer;
use windows::Win32::Graphics::Direct3D11::ID3D11Device;
use windows::Win32::Graphics::Direct3D11::ID3D11DeviceContext;
use windows::Win32::Graphics::Direct3D11::ID3D11Texture2D;
use windows::Win32::Graphics::Direct3D11::D3D11_BIND_DECODER;
use windows::Win32::Graphics::Direct3D11::D3D11_BIND_SHADER_RESOURCE;
use windows::Win32::Graphics::Direct3D11::D3D11_BUFFER_DESC;
use windows::Win32::Graphics::Direct3D11::D3D11_CPU_ACCESS_READ;
use windows::Win32::Graphics::Direct3D11::D3D11_CPU_ACCESS_WRITE;
use windows::Win32::Graphics::Direct3D11::D3D11_CREATE_DEVICE_BGRA_SUPPORT;
use windows::Win32::Graphics::Direct3D11::D3D11_CREATE_DEVICE_VIDEO_SUPPORT;
use windows::Win32::Graphics::Direct3D11::D3D11_FORMAT_SUPPORT_TEXTURE2D;
use windows::Win32::Graphics::Direct3D11::D3D11_MAPPED_SUBRESOURCE;
use windows::Win32::Graphics::Direct3D11::D3D11_MAP_READ;
use windows::Win32::Graphics::Direct3D11::D3D11_MAP_READ_WRITE;
use windows::Win32::Graphics::Direct3D11::D3D11_RESOURCE_MISC_SHARED;
use windows::Win32::Graphics::Direct3D11::D3D11_SDK_VERSION;
use windows::Win32::Graphics::Direct3D11::D3D11_TEXTURE2D_DESC;
use windows::Win32::Graphics::Direct3D11::D3D11_USAGE_DEFAULT;
use windows::Win32::Graphics::Direct3D11::D3D11_USAGE_STAGING;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_AYUV;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_B8G8R8A8_UNORM;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_NV12;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_P010;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_R8G8B8A8_UNORM;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_Y210;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_Y410;
use windows::Win32::Graphics::Dxgi::Common::DXGI_FORMAT_YUY2;
use windows::Win32::Graphics::Dxgi::Common::DXGI_SAMPLE_DESC;
use windows::Win32::Graphics::Dxgi::CreateDXGIFactory1;
use windows::Win32::Graphics::Dxgi::IDXGIAdapter;
use windows::Win32::Graphics::Dxgi::IDXGIFactory1;
use windows::Win32::Graphics::Dxgi::IDXGIResource;

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
use crate::utils::num_planes;
use crate::utils::plane_extent;
use crate::Fourcc;
use crate::PlaneLayout;

fn dxgi_format(fourcc: Fourcc) -> Option<DXGI_FORMAT> {
    Some(match fourcc {
        Fourcc::NV12 => DXGI_FORMAT_NV12,
        Fourcc::P010 => DXGI_FORMAT_P010,
        Fourcc::YUY2 => DXGI_FORMAT_YUY2,
        Fourcc::RGB4 => DXGI_FORMAT_B8G8R8A8_UNORM,
        Fourcc::BGRA => DXGI_FORMAT_R8G8B8A8_UNORM,
        Fourcc::AYUV => DXGI_FORMAT_AYUV,
        Fourcc::Y210 => DXGI_FORMAT_Y210,
        Fourcc::Y410 => DXGI_FORMAT_Y410,
        _ => return None,
    })
}

/// Options of the Direct3D 11 provider.
#[derive(Clone, Debug, Default)]
pub struct D3d11ProviderOptions {
    /// Index of the DXGI adapter to create the device on.
    pub adapter_index: u32,
}

pub enum D3d11Resource {
    Texture { texture: ID3D11Texture2D, fourcc: Fourcc },
    /// A CPU-accessible texture.
    Staging { texture: ID3D11Texture2D, fourcc: Fourcc },
    Buffer { buffer: ID3D11Buffer, size: usize },
}

// UNSAFE: D3D11 devices are free-threaded, and the resources are only used through the provider,
// which serializes immediate context access.
unsafe impl Send for D3d11Resource {}
// UNSAFE: see above.
unsafe impl Sync for D3d11Resource {}

impl D3d11Resource {
    fn texture(&self) -> anyhow::Result<(&ID3D11Texture2D, Fourcc)> {
        match self {
            D3d11Resource::Texture { texture, fourcc }
            | D3d11Resource::Staging { texture, fourcc } => Ok((texture, *fourcc)),
            D3d11Resource::Buffer { .. } => Err(anyhow!("buffers have no planes")),
        }
    }
}

/// Resource provider allocating from a D3D11 device.
pub struct D3d11Provider {
    device: ID3D11Device,
    /// The immediate context is not thread-safe.
    context: Mutex<ID3D11DeviceContext>,
    info: DisplayInfo,
}

// UNSAFE: see `D3d11Resource`.
unsafe impl Send for D3d11Provider {}
// UNSAFE: see above.
unsafe impl Sync for D3d11Provider {}

impl D3d11Provider {
    pub fn new(options: &D3d11ProviderOptions) -> anyhow::Result<Self> {
        // SAFETY: plain D3D11/DXGI calls, all out-pointers point to locals.
        unsafe {
            let factory: IDXGIFactory1 = CreateDXGIFactory1().context("while creating factory")?;
            let adapter = factory
                .EnumAdapters1(options.adapter_index)
                .with_context(|| format!("no adapter {}", options.adapter_index))?;
            let desc = adapter.GetDesc1()?;
            let name_len = desc.Description.iter().position(|c| *c == 0).unwrap_or(128);
            let name = String::from_utf16_lossy(&desc.Description[..name_len]);

            let mut device = None;
            let mut context = None;
            D3D11CreateDevice(
                &adapter.cast::<IDXGIAdapter>()?,
                D3D_DRIVER_TYPE_UNKNOWN,
                HMODULE::default(),
                D3D11_CREATE_DEVICE_VIDEO_SUPPORT | D3D11_CREATE_DEVICE_BGRA_SUPPORT,
                None,
                D3D11_SDK_VERSION,
                Some(&mut device),
                None,
                Some(&mut context),
            )
            .context("while creating D3D11 device")?;

            let device: ID3D11Device = device.ok_or_else(|| anyhow!("no D3D11 device"))?;
            let context = context.ok_or_else(|| anyhow!("no D3D11 immediate context"))?;
            log::debug!("Created D3D11 device on adapter {}", name);

            let info = DisplayInfo {
                handle: device.as_raw() as usize,
                backend: BackendKind::D3d11,
                name,
            };

            Ok(Self { device, context: Mutex::new(context), info })
        }
    }

    fn create_texture(&self, info: &FrameInfo, staging: bool) -> anyhow::Result<ID3D11Texture2D> {
        let format =
            dxgi_format(info.fourcc).ok_or_else(|| anyhow!("unsupported format {}", info.fourcc))?;

        let desc = D3D11_TEXTURE2D_DESC {
            Width: info.resolution.width,
            Height: info.resolution.height,
            MipLevels: 1,
            ArraySize: 1,
            Format: format,
            SampleDesc: DXGI_SAMPLE_DESC { Count: 1, Quality: 0 },
            Usage: if staging { D3D11_USAGE_STAGING } else { D3D11_USAGE_DEFAULT },
            BindFlags: if staging {
                0
            } else {
                (D3D11_BIND_DECODER.0 | D3D11_BIND_SHADER_RESOURCE.0) as u32
            },
            CPUAccessFlags: if staging {
                (D3D11_CPU_ACCESS_READ.0 | D3D11_CPU_ACCESS_WRITE.0) as u32
            } else {
                0
            },
            MiscFlags: if staging { 0 } else { D3D11_RESOURCE_MISC_SHARED.0 as u32 },
        };

        let mut texture = None;
        // SAFETY: `desc` and `texture` outlive the call.
        unsafe { self.device.CreateTexture2D(&desc, None, Some(&mut texture)) }
            .context("while creating texture")?;

        texture.ok_or_else(|| anyhow!("no texture created"))
    }

    fn create_buffer(&self, info: &FrameInfo) -> anyhow::Result<D3d11Resource> {
        let size = coded_buffer_size(info.resolution);
        let desc = D3D11_BUFFER_DESC {
            ByteWidth: u32::try_from(size)?,
            Usage: D3D11_USAGE_STAGING,
            BindFlags: 0,
            CPUAccessFlags: (D3D11_CPU_ACCESS_READ.0 | D3D11_CPU_ACCESS_WRITE.0) as u32,
            MiscFlags: 0,
            StructureByteStride: 0,
        };

        let mut buffer = None;
        // SAFETY: `desc` and `buffer` outlive the call.
        unsafe { self.device.CreateBuffer(&desc, None, Some(&mut buffer)) }
            .context("while creating coded buffer")?;

        let buffer = buffer.ok_or_else(|| anyhow!("no buffer created"))?;
        Ok(D3d11Resource::Buffer { buffer, size })
    }
}

/// A texture mapped through a CPU-accessible copy, written back when dropped.
struct D3d11Mapping<'a> {
    context: MutexGuard<'a, ID3D11DeviceContext>,
    texture: &'a ID3D11Texture2D,
    cpu: ID3D11Texture2D,
    data: NonNull<u8>,
    len: usize,
    layout: Vec<PlaneLayout>,
}

impl<'a> PlaneAccess for D3d11Mapping<'a> {
    fn layout(&self) -> &[PlaneLayout] {
        &self.layout
    }

    fn data(&self) -> &[u8] {
        // SAFETY: `cpu` stays mapped, with `len` bytes at `data`, until `self` is dropped.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.len) }
    }

    fn data_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `data`.
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.len) }
    }
}

impl<'a> Drop for D3d11Mapping<'a> {
    fn drop(&mut self) {
        // SAFETY: `cpu` was mapped by `map_planes` and both textures share a description.
        unsafe {
            self.context.Unmap(&self.cpu, 0);
            self.context.CopyResource(self.texture, &self.cpu);
        }
    }
}

impl NativeResourceProvider for D3d11Provider {
    type Resource = D3d11Resource;

    fn display_info(&self) -> DisplayInfo {
        self.info.clone()
    }

    fn supports_format(&self, fourcc: Fourcc) -> bool {
        let Some(format) = dxgi_format(fourcc) else {
            return false;
        };

        // SAFETY: plain query on a valid device.
        unsafe { self.device.CheckFormatSupport(format) }
            .is_ok_and(|support| support & D3D11_FORMAT_SUPPORT_TEXTURE2D.0 as u32 != 0)
    }

    fn needs_staging(&self, _: &FrameInfo) -> bool {
        // Surfaces are created shareable and mapped through a temporary CPU copy.
        false
    }

    fn create(&self, kind: ResourceKind, info: &FrameInfo) -> anyhow::Result<D3d11Resource> {
        match kind {
            ResourceKind::Surface => Ok(D3d11Resource::Texture {
                texture: self.create_texture(info, false)?,
                fourcc: info.fourcc,
            }),
            ResourceKind::Staging => Ok(D3d11Resource::Staging {
                texture: self.create_texture(info, true)?,
                fourcc: info.fourcc,
            }),
            ResourceKind::CodedBuffer => self.create_buffer(info),
        }
    }

    fn destroy(&self, resource: D3d11Resource) {
        let _context = self.context.lock();
        drop(resource);
    }

    fn map_buffer(&self, resource: &D3d11Resource) -> anyhow::Result<MappedBuffer> {
        let D3d11Resource::Buffer { buffer, size } = resource else {
            return Err(anyhow!("only coded buffers can be mapped"));
        };

        let context = self.context.lock();
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        // SAFETY: `buffer` is a CPU-readable staging buffer of this device.
        unsafe { context.Map(buffer, 0, D3D11_MAP_READ, 0, Some(&mut mapped)) }
            .context("while mapping coded buffer")?;

        let data = NonNull::new(mapped.pData as *mut u8)
            .ok_or_else(|| anyhow!("coded buffer mapped at null"))?;
        Ok(MappedBuffer { data, len: *size, pitch: *size as u32 })
    }

    fn unmap_buffer(&self, resource: &D3d11Resource) {
        if let D3d11Resource::Buffer { buffer, .. } = resource {
            let context = self.context.lock();
            // SAFETY: `buffer` was mapped by `map_buffer`.
            unsafe { context.Unmap(buffer, 0) };
        }
    }

    fn map_planes<'a>(
        &'a self,
        resource: &'a D3d11Resource,
    ) -> anyhow::Result<Box<dyn PlaneAccess + 'a>> {
        let (texture, fourcc) = resource.texture()?;
        let mut desc = D3D11_TEXTURE2D_DESC::default();
        // SAFETY: `desc` outlives the call.
        unsafe { texture.GetDesc(&mut desc) };

        let info = FrameInfo::new(fourcc, (desc.Width, desc.Height).into());
        let cpu = self.create_texture(&info, true)?;

        let context = self.context.lock();
        let mut mapped = D3D11_MAPPED_SUBRESOURCE::default();
        // SAFETY: both textures have the same size and format, and `cpu` is CPU accessible.
        unsafe {
            context.CopyResource(&cpu, texture);
            context.Map(&cpu, 0, D3D11_MAP_READ_WRITE, 0, Some(&mut mapped))
        }
        .context("while mapping texture")?;

        // Planes follow each other with the row pitch of the first one.
        let pitch = mapped.RowPitch as usize;
        let mut layout = Vec::new();
        let mut rows_before = 0;
        for plane in 0..num_planes(fourcc).unwrap_or(1) {
            layout.push(PlaneLayout {
                buffer_index: 0,
                offset: rows_before * pitch,
                stride: pitch,
            });
            let rows = plane_extent(fourcc, info.resolution, plane).map_or(0, |(_, rows)| rows);
            rows_before += rows;
        }

        let data = NonNull::new(mapped.pData as *mut u8)
            .ok_or_else(|| anyhow!("texture mapped at null"))?;
        let len = rows_before * pitch;
        Ok(Box::new(D3d11Mapping { context, texture, cpu, data, len, layout }))
    }

    fn copy_to_staging(&self, src: &D3d11Resource, dst: &D3d11Resource) -> anyhow::Result<()> {
        let (src, _) = src.texture()?;
        let (dst, _) = dst.texture()?;

        let context = self.context.lock();
        // SAFETY: both textures were created by this provider from the same frame info.
        unsafe { context.CopyResource(dst, src) };

        Ok(())
    }

    fn native_handle(&self, resource: &D3d11Resource) -> Option<NativeHandle> {
        Some(match resource {
            D3d11Resource::Texture { texture, .. } | D3d11Resource::Staging { texture, .. } => {
                NativeHandle::D3d11Texture(texture.as_raw() as usize)
            }
            D3d11Resource::Buffer { buffer, .. } => {
                NativeHandle::D3d11Buffer(buffer.as_raw() as usize)
            }
        })
    }

    fn export(&self, resource: &D3d11Resource) -> anyhow::Result<ExportedHandle> {
        let D3d11Resource::Texture { texture, fourcc } = resource else {
            return Err(anyhow!("only surfaces can be exported"));
        };

        let mut desc = D3D11_TEXTURE2D_DESC::default();
        // SAFETY: `texture` was created with D3D11_RESOURCE_MISC_SHARED.
        let handle = unsafe {
            texture.GetDesc(&mut desc);
            texture.cast::<IDXGIResource>()?.GetSharedHandle()?
        };

        Ok(ExportedHandle::SharedTexture {
            handle: handle.0 as usize,
            fourcc: *fourcc,
            resolution: (desc.Width, desc.Height).into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::allocator::ExternalAllocator;
    use crate::allocator::TaskAllocator;
    use crate::surface::Surface;

    #[test]
    fn format_table() {
        assert_eq!(dxgi_format(Fourcc::NV12), Some(DXGI_FORMAT_NV12));
        assert_eq!(dxgi_format(Fourcc::RGB4), Some(DXGI_FORMAT_B8G8R8A8_UNORM));
        assert_eq!(dxgi_format(Fourcc::I420), None);
    }

    #[test]
    // Ignore this test by default as it requires a D3D11 capable adapter.
    #[ignore]
    fn map_nv12_texture() {
        let provider = Arc::new(D3d11Provider::new(&D3d11ProviderOptions::default()).unwrap());
        let allocator = ExternalAllocator::new(Arc::clone(&provider));
        let info = FrameInfo::new(Fourcc::NV12, (320, 240).into());
        let surface = Surface::from_memory(allocator.create_memory(&info).unwrap());
        assert!(matches!(surface.native_handle(), Some(NativeHandle::D3d11Texture(_))));

        {
            let mut mapping = surface.map().unwrap();
            assert_eq!(mapping.num_planes(), 2);
            mapping.plane_mut(1).unwrap()[0] = 0x80;
        }
        assert_eq!(surface.map().unwrap().plane(1).unwrap()[0], 0x80);

        assert!(matches!(
            surface.export().unwrap().handle,
            ExportedHandle::SharedTexture { fourcc: Fourcc::NV12, .. }
        ));
    }
}
