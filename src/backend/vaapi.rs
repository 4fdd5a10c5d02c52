// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VAAPI backend: surfaces, staging companions and coded buffers on a VA display.

use std::cell::RefCell;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::rc::Rc;

use anyhow::anyhow;
use anyhow::Context as _;
use libva::Config;
use libva::Context;
use libva::Display;
use libva::EncCodedBuffer;
use libva::MappedCodedBuffer;
use libva::Surface;
use libva::UsageHint;
use libva::VAConfigAttrib;
use libva::VAConfigAttribType;
use libva::VAEntrypoint::VAEntrypointEncSlice;
use libva::VAEntrypoint::VAEntrypointEncSliceLP;
use libva::VAProfile;
use parking_lot::Mutex;
use parking_lot::ReentrantMutex;
use parking_lot::ReentrantMutexGuard;

use crate::backend::BackendKind;
use crate::backend::DisplayInfo;
use crate::backend::DmaBufDescriptor;
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
use crate::Resolution;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
struct FormatMap {
    fourcc: Fourcc,
    rt_format: u32,
    va_fourcc: u32,
}

/// Maps the frame formats we allocate to the VA RT format and fourcc of their surfaces.
const FORMAT_MAP: [FormatMap; 11] = [
    FormatMap {
        fourcc: Fourcc::NV12,
        rt_format: libva::VA_RT_FORMAT_YUV420,
        va_fourcc: libva::VA_FOURCC_NV12,
    },
    FormatMap {
        fourcc: Fourcc::YV12,
        rt_format: libva::VA_RT_FORMAT_YUV420,
        va_fourcc: libva::VA_FOURCC_YV12,
    },
    FormatMap {
        fourcc: Fourcc::I420,
        rt_format: libva::VA_RT_FORMAT_YUV420,
        va_fourcc: libva::VA_FOURCC_I420,
    },
    FormatMap {
        fourcc: Fourcc::P010,
        rt_format: libva::VA_RT_FORMAT_YUV420_10,
        va_fourcc: libva::VA_FOURCC_P010,
    },
    FormatMap {
        fourcc: Fourcc::YUY2,
        rt_format: libva::VA_RT_FORMAT_YUV422,
        va_fourcc: libva::VA_FOURCC_YUY2,
    },
    FormatMap {
        fourcc: Fourcc::UYVY,
        rt_format: libva::VA_RT_FORMAT_YUV422,
        va_fourcc: libva::VA_FOURCC_UYVY,
    },
    FormatMap {
        fourcc: Fourcc::RGB4,
        rt_format: libva::VA_RT_FORMAT_RGB32,
        va_fourcc: libva::VA_FOURCC_ARGB,
    },
    FormatMap {
        fourcc: Fourcc::BGRA,
        rt_format: libva::VA_RT_FORMAT_RGB32,
        va_fourcc: libva::VA_FOURCC_BGRA,
    },
    FormatMap {
        fourcc: Fourcc::AYUV,
        rt_format: libva::VA_RT_FORMAT_YUV444,
        va_fourcc: libva::VA_FOURCC_AYUV,
    },
    FormatMap {
        fourcc: Fourcc::Y210,
        rt_format: libva::VA_RT_FORMAT_YUV422_10,
        va_fourcc: libva::VA_FOURCC_Y210,
    },
    FormatMap {
        fourcc: Fourcc::Y410,
        rt_format: libva::VA_RT_FORMAT_YUV444_10,
        va_fourcc: libva::VA_FOURCC_Y410,
    },
];

fn format_map(fourcc: Fourcc) -> Option<&'static FormatMap> {
    FORMAT_MAP.iter().find(|map| map.fourcc == fourcc)
}

/// Options of the VAAPI provider.
#[derive(Clone, Debug, Default)]
pub struct VaapiProviderOptions {
    /// DRM render node to open. The default VA display is used if `None`.
    pub device_path: Option<PathBuf>,
}

struct CodedContext {
    // Kept alive for as long as the context.
    _config: Config,
    context: Rc<Context>,
}

struct VaState {
    display: Rc<Display>,
    image_formats: Vec<libva::VAImageFormat>,
    /// Encode context coded buffers are created from. Created on the first coded buffer request.
    coded: Option<CodedContext>,
}

pub enum VaResource {
    Surface {
        surface: Surface<()>,
        fourcc: Fourcc,
        va_fourcc: u32,
    },
    Coded {
        buffer: EncCodedBuffer,
        /// Content of the buffer while it is mapped.
        snapshot: Mutex<Option<Vec<u8>>>,
    },
}

// UNSAFE: the `Rc`s held by VA resources are only cloned and dropped with the provider lock held,
// see `VaapiProvider`.
unsafe impl Send for VaResource {}
// UNSAFE: see above.
unsafe impl Sync for VaResource {}

/// Resource provider allocating from a VA display.
///
/// The display and every object created from it are only touched with `state` locked. The lock
/// is reentrant since mapping helpers call back into the provider on the same thread.
pub struct VaapiProvider {
    state: ReentrantMutex<RefCell<VaState>>,
    info: DisplayInfo,
}

// UNSAFE: all accesses to the non thread-safe VA objects are serialized through `state`.
unsafe impl Send for VaapiProvider {}
// UNSAFE: see above.
unsafe impl Sync for VaapiProvider {}

impl VaapiProvider {
    pub fn new(options: &VaapiProviderOptions) -> anyhow::Result<Self> {
        let (display, name) = match &options.device_path {
            Some(path) => (
                Display::open_drm_display(path)
                    .map_err(|e| anyhow!("failed to open libva display {:?}: {:?}", path, e))?,
                path.display().to_string(),
            ),
            None => (
                Display::open().ok_or_else(|| anyhow!("failed to open libva display"))?,
                String::from("default"),
            ),
        };

        let image_formats =
            display.query_image_formats().context("while querying image formats")?;
        log::debug!("Opened VA display {} with {} image formats", name, image_formats.len());

        // libva keeps the raw VADisplay to itself, so the display is keyed by its address.
        let handle = Rc::as_ptr(&display) as usize;
        let info = DisplayInfo { handle, backend: BackendKind::Vaapi, name };

        Ok(Self {
            state: ReentrantMutex::new(RefCell::new(VaState {
                display,
                image_formats,
                coded: None,
            })),
            info,
        })
    }

    fn lock(&self) -> ReentrantMutexGuard<'_, RefCell<VaState>> {
        self.state.lock()
    }

    fn image_format(&self, va_fourcc: u32) -> anyhow::Result<libva::VAImageFormat> {
        let state = self.lock();
        let state = state.borrow();
        state
            .image_formats
            .iter()
            .find(|f| f.fourcc == va_fourcc)
            .copied()
            .ok_or_else(|| anyhow!("no image format for VA fourcc {:#x}", va_fourcc))
    }

    fn create_surface(
        &self,
        info: &FrameInfo,
        usage_hint: UsageHint,
    ) -> anyhow::Result<VaResource> {
        let map = format_map(info.fourcc)
            .ok_or_else(|| anyhow!("unsupported format {}", info.fourcc))?;

        let state = self.lock();
        let display = Rc::clone(&state.borrow().display);
        let surface = display
            .create_surfaces(
                map.rt_format,
                Some(map.va_fourcc),
                info.resolution.width,
                info.resolution.height,
                Some(usage_hint),
                vec![()],
            )?
            .pop()
            .ok_or_else(|| anyhow!("VA returned no surface"))?;

        Ok(VaResource::Surface { surface, fourcc: info.fourcc, va_fourcc: map.va_fourcc })
    }

    fn create_coded_buffer(&self, info: &FrameInfo) -> anyhow::Result<VaResource> {
        let state = self.lock();
        let mut state = state.borrow_mut();

        if state.coded.is_none() {
            let display = Rc::clone(&state.display);
            let config = [VAEntrypointEncSlice, VAEntrypointEncSliceLP]
                .into_iter()
                .find_map(|entrypoint| {
                    display
                        .create_config(
                            vec![VAConfigAttrib {
                                type_: VAConfigAttribType::VAConfigAttribRTFormat,
                                value: libva::VA_RT_FORMAT_YUV420,
                            }],
                            VAProfile::VAProfileH264Main,
                            entrypoint,
                        )
                        .ok()
                })
                .ok_or_else(|| anyhow!("no encode entrypoint to create coded buffers from"))?;

            let context = display.create_context::<()>(
                &config,
                info.resolution.width,
                info.resolution.height,
                None,
                true,
            )?;

            state.coded = Some(CodedContext { _config: config, context });
        }

        let context = match &state.coded {
            Some(coded) => Rc::clone(&coded.context),
            None => return Err(anyhow!("no coded buffer context")),
        };
        let buffer = context.create_enc_coded(coded_buffer_size(info.resolution))?;

        Ok(VaResource::Coded { buffer, snapshot: Mutex::new(None) })
    }

    /// Maps `surface` as an image, along with the layout of its `fourcc` planes.
    fn map_surface<'a>(
        &self,
        surface: &'a Surface<()>,
        fourcc: Fourcc,
        va_fourcc: u32,
    ) -> anyhow::Result<(libva::Image<'a>, Vec<PlaneLayout>)> {
        let format = self.image_format(va_fourcc)?;
        surface.sync().context("while syncing surface")?;

        let image = libva::Image::create_from(surface, format, surface.size(), surface.size())?;
        let va_image = *image.image();
        let layout = (0..num_planes(fourcc).unwrap_or(1))
            .map(|i| PlaneLayout {
                buffer_index: 0,
                offset: va_image.offsets[i] as usize,
                stride: va_image.pitches[i] as usize,
            })
            .collect();

        Ok((image, layout))
    }
}

/// A surface mapped through a VA image. The provider stays locked until it is dropped.
struct VaMapping<'a> {
    image: libva::Image<'a>,
    layout: Vec<PlaneLayout>,
    _guard: ReentrantMutexGuard<'a, RefCell<VaState>>,
}

impl<'a> PlaneAccess for VaMapping<'a> {
    fn layout(&self) -> &[PlaneLayout] {
        &self.layout
    }

    fn data(&self) -> &[u8] {
        self.image.as_ref()
    }

    fn data_mut(&mut self) -> &mut [u8] {
        self.image.as_mut()
    }
}

impl NativeResourceProvider for VaapiProvider {
    type Resource = VaResource;

    fn display_info(&self) -> DisplayInfo {
        self.info.clone()
    }

    fn supports_format(&self, fourcc: Fourcc) -> bool {
        let Some(map) = format_map(fourcc) else {
            return false;
        };

        let state = self.lock();
        let state = state.borrow();
        state.image_formats.iter().any(|f| f.fourcc == map.va_fourcc)
    }

    fn needs_staging(&self, info: &FrameInfo) -> bool {
        // Packed RGB and AYUV surfaces are tiled by most drivers.
        matches!(info.fourcc, Fourcc::RGB4 | Fourcc::BGRA | Fourcc::AYUV)
    }

    fn create(&self, kind: ResourceKind, info: &FrameInfo) -> anyhow::Result<VaResource> {
        match kind {
            ResourceKind::Surface => self.create_surface(info, UsageHint::USAGE_HINT_DECODER),
            ResourceKind::Staging => self.create_surface(info, UsageHint::USAGE_HINT_EXPORT),
            ResourceKind::CodedBuffer => self.create_coded_buffer(info),
        }
    }

    fn destroy(&self, resource: VaResource) {
        let _guard = self.lock();
        drop(resource);
    }

    fn map_buffer(&self, resource: &VaResource) -> anyhow::Result<MappedBuffer> {
        let VaResource::Coded { buffer, snapshot } = resource else {
            return Err(anyhow!("only coded buffers can be mapped"));
        };

        let _guard = self.lock();
        let mapped = MappedCodedBuffer::new(buffer)?;
        let mut data = Vec::new();
        for segment in mapped.segments() {
            if segment.bit_offset > 0 {
                log::warn!("unsupported bit_offset != 0 (yet)");
            }
            data.extend(segment.buf);
        }
        drop(mapped);

        let len = data.len();
        let ptr = NonNull::new(data.as_mut_ptr()).ok_or_else(|| anyhow!("null coded data"))?;
        // Moving the vector keeps its heap allocation in place.
        *snapshot.lock() = Some(data);

        Ok(MappedBuffer { data: ptr, len, pitch: len as u32 })
    }

    fn unmap_buffer(&self, resource: &VaResource) {
        if let VaResource::Coded { snapshot, .. } = resource {
            snapshot.lock().take();
        }
    }

    fn map_planes<'a>(
        &'a self,
        resource: &'a VaResource,
    ) -> anyhow::Result<Box<dyn PlaneAccess + 'a>> {
        let VaResource::Surface { surface, fourcc, va_fourcc } = resource else {
            return Err(anyhow!("coded buffers have no planes"));
        };

        let guard = self.lock();
        let (image, layout) = self.map_surface(surface, *fourcc, *va_fourcc)?;

        Ok(Box::new(VaMapping { image, layout, _guard: guard }))
    }

    fn copy_to_staging(&self, src: &VaResource, dst: &VaResource) -> anyhow::Result<()> {
        let (
            VaResource::Surface { surface: src, fourcc, va_fourcc },
            VaResource::Surface { surface: dst, .. },
        ) = (src, dst)
        else {
            return Err(anyhow!("staging copies are only made between surfaces"));
        };

        let _guard = self.lock();
        let (src_image, src_layout) = self.map_surface(src, *fourcc, *va_fourcc)?;
        let (mut dst_image, dst_layout) = self.map_surface(dst, *fourcc, *va_fourcc)?;
        let resolution = Resolution::from(src.size());

        let src_data: &[u8] = src_image.as_ref();
        let dst_data: &mut [u8] = dst_image.as_mut();
        for (plane, (s, d)) in src_layout.iter().zip(dst_layout.iter()).enumerate() {
            let Some((row_len, rows)) = plane_extent(*fourcc, resolution, plane) else {
                continue;
            };

            for row in 0..rows {
                let src_row = s.offset + row * s.stride;
                let dst_row = d.offset + row * d.stride;
                let (Some(from), Some(to)) = (
                    src_data.get(src_row..src_row + row_len),
                    dst_data.get_mut(dst_row..dst_row + row_len),
                ) else {
                    return Err(anyhow!("plane {} of the staging copy is out of bounds", plane));
                };
                to.copy_from_slice(from);
            }
        }

        Ok(())
    }

    fn native_handle(&self, resource: &VaResource) -> Option<NativeHandle> {
        match resource {
            VaResource::Surface { surface, .. } => Some(NativeHandle::VaSurface(surface.id())),
            VaResource::Coded { buffer, .. } => Some(NativeHandle::VaBuffer(buffer.id())),
        }
    }

    fn export(&self, resource: &VaResource) -> anyhow::Result<ExportedHandle> {
        let VaResource::Surface { surface, fourcc, .. } = resource else {
            return Err(anyhow!("coded buffers cannot be exported"));
        };

        let _guard = self.lock();
        surface.sync().context("while syncing surface")?;
        let descriptor = surface.export_prime().context("while exporting surface")?;

        let layer =
            descriptor.layers.first().ok_or_else(|| anyhow!("exported surface has no layer"))?;
        let planes = (0..num_planes(*fourcc).unwrap_or(1))
            .map(|i| PlaneLayout {
                buffer_index: layer.object_index[i] as usize,
                offset: layer.offset[i] as usize,
                stride: layer.pitch[i] as usize,
            })
            .collect();
        let modifier = descriptor.objects.first().map_or(0, |o| o.drm_format_modifier);

        Ok(ExportedHandle::DmaBuf(DmaBufDescriptor {
            fds: descriptor.objects.into_iter().map(|o| o.fd).collect(),
            fourcc: *fourcc,
            resolution: Resolution::from(surface.size()),
            modifier,
            planes,
        }))
    }
}
