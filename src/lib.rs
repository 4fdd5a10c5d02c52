// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This crate implements the external frame allocator of a session-based hardware codec runtime,
//! along with the surface pools that recycle the memory it hands out.
//!
//! The codec runtime only knows about opaque memory ids. Allocation requests it issues while a
//! session initializes are routed through a [`TaskAggregator`] to the [`Task`] that is current on
//! the calling thread, served by an [`allocator::ExternalAllocator`] from native memory created
//! by a [`backend::NativeResourceProvider`], and recorded in that task's ledger so that joined
//! sessions share one set of surfaces.
//!
//! Two native backends are available: VA-API (`vaapi` feature, enabled by default) and
//! Direct3D 11 (`d3d11` feature, Windows only).

pub mod aggregator;
pub mod allocator;
pub mod backend;
pub mod display_cache;
pub mod object;
pub mod pool;
pub mod runtime;
pub mod session;
pub mod surface;
pub mod task;
pub mod utils;

use std::fmt;
use std::fmt::Debug;
use std::fmt::Display;

#[cfg(feature = "vaapi")]
pub use libva;

pub use aggregator::TaskAggregator;
pub use allocator::AllocError;
pub use allocator::ExternalAllocator;
pub use allocator::FrameAllocator;
pub use allocator::TaskAllocator;
pub use surface::Surface;
pub use surface::SurfacePool;
pub use surface::SurfaceProxy;
pub use task::Task;
pub use task::TaskType;

/// Rounding modes for `Resolution`
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResolutionRoundMode {
    /// Rounds component-wise to the next even value.
    Even,
}

/// A frame resolution in pixels.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Whether `self` can contain `other`.
    pub fn can_contain(&self, other: Self) -> bool {
        self.width >= other.width && self.height >= other.height
    }

    /// Rounds `self` according to `rnd_mode`.
    pub fn round(mut self, rnd_mode: ResolutionRoundMode) -> Self {
        match rnd_mode {
            ResolutionRoundMode::Even => {
                if self.width % 2 != 0 {
                    self.width += 1;
                }

                if self.height % 2 != 0 {
                    self.height += 1;
                }
            }
        }

        self
    }

    pub fn get_area(&self) -> usize {
        (self.width as usize) * (self.height as usize)
    }
}

impl From<(u32, u32)> for Resolution {
    fn from(value: (u32, u32)) -> Self {
        Self { width: value.0, height: value.1 }
    }
}

impl From<Resolution> for (u32, u32) {
    fn from(value: Resolution) -> Self {
        (value.width, value.height)
    }
}

/// A rectangle inside a frame, e.g. the visible region of an aligned surface.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether this rectangle lies entirely within a surface of size `resolution`.
    pub fn fits_in(&self, resolution: Resolution) -> bool {
        self.x.saturating_add(self.width) <= resolution.width
            && self.y.saturating_add(self.height) <= resolution.height
    }
}

impl From<Resolution> for Rect {
    fn from(value: Resolution) -> Self {
        Self { x: 0, y: 0, width: value.width, height: value.height }
    }
}

/// A four-character code, laid out the same way the codec runtime, VA-API and DRM lay them out.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Fourcc(pub u32);

impl Fourcc {
    pub const NV12: Fourcc = Fourcc::new(*b"NV12");
    pub const YV12: Fourcc = Fourcc::new(*b"YV12");
    pub const I420: Fourcc = Fourcc::new(*b"I420");
    pub const P010: Fourcc = Fourcc::new(*b"P010");
    pub const YUY2: Fourcc = Fourcc::new(*b"YUY2");
    pub const UYVY: Fourcc = Fourcc::new(*b"UYVY");
    pub const RGB4: Fourcc = Fourcc::new(*b"RGB4");
    pub const BGRA: Fourcc = Fourcc::new(*b"BGRA");
    pub const AYUV: Fourcc = Fourcc::new(*b"AYUV");
    pub const Y210: Fourcc = Fourcc::new(*b"Y210");
    pub const Y410: Fourcc = Fourcc::new(*b"Y410");
    /// Marks coded-bitstream memory rather than pixels.
    pub const P8: Fourcc = Fourcc(41);

    pub const fn new(c: [u8; 4]) -> Self {
        Self(c[0] as u32 | (c[1] as u32) << 8 | (c[2] as u32) << 16 | (c[3] as u32) << 24)
    }
}

impl From<u32> for Fourcc {
    fn from(fourcc: u32) -> Self {
        Self(fourcc)
    }
}

impl From<Fourcc> for u32 {
    fn from(fourcc: Fourcc) -> Self {
        fourcc.0
    }
}

impl From<&[u8; 4]> for Fourcc {
    fn from(n: &[u8; 4]) -> Self {
        Self::new(*n)
    }
}

impl From<Fourcc> for [u8; 4] {
    fn from(n: Fourcc) -> Self {
        n.0.to_le_bytes()
    }
}

impl Display for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Fourcc::P8 {
            return f.write_str("P8");
        }

        let c: [u8; 4] = (*self).into();

        f.write_fmt(format_args!(
            "{}{}{}{}",
            c[0] as char, c[1] as char, c[2] as char, c[3] as char
        ))
    }
}

impl Debug for Fourcc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

/// Location of one plane inside a mapped buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PlaneLayout {
    pub buffer_index: usize,
    pub offset: usize,
    pub stride: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_string() {
        assert_eq!(Fourcc::NV12.to_string(), "NV12");
        assert_eq!(Fourcc::from(b"AYUV"), Fourcc::AYUV);
        assert_eq!(Fourcc::P8.to_string(), "P8");
        let bytes: [u8; 4] = Fourcc::P010.into();
        assert_eq!(&bytes, b"P010");
    }

    #[test]
    fn rect_fits() {
        let res = Resolution { width: 1920, height: 1088 };
        assert!(Rect { x: 0, y: 0, width: 1920, height: 1080 }.fits_in(res));
        assert!(!Rect { x: 8, y: 0, width: 1920, height: 1080 }.fits_in(res));
        assert!(Rect::default().is_empty());
        assert_eq!(
            Resolution { width: 3, height: 5 }.round(ResolutionRoundMode::Even),
            (4, 6).into()
        );
    }
}
