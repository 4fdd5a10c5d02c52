// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Utility functions used by several parts of this crate.
//!
//! This module is for anything that doesn't fit into the other top-level modules. Try not to add
//! new code here unless it really doesn't belong anywhere else.

use crate::Fourcc;
use crate::PlaneLayout;
use crate::Resolution;

/// Rounds `value` up to the next multiple of `alignment`, which must be a power of two.
pub fn align_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Returns the number of planes of `fourcc`, or `None` if the format is unknown.
pub fn num_planes(fourcc: Fourcc) -> Option<usize> {
    match fourcc {
        Fourcc::NV12 | Fourcc::P010 => Some(2),
        Fourcc::YV12 | Fourcc::I420 => Some(3),
        Fourcc::YUY2
        | Fourcc::UYVY
        | Fourcc::RGB4
        | Fourcc::BGRA
        | Fourcc::AYUV
        | Fourcc::Y210
        | Fourcc::Y410
        | Fourcc::P8 => Some(1),
        _ => None,
    }
}

/// Returns the number of bytes per row and the number of rows of `plane` for a frame of
/// `fourcc` and `resolution`.
pub fn plane_extent(
    fourcc: Fourcc,
    resolution: Resolution,
    plane: usize,
) -> Option<(usize, usize)> {
    let width = resolution.width as usize;
    let height = resolution.height as usize;
    let half_width = width.div_ceil(2);
    let half_height = height.div_ceil(2);

    let extent = match (fourcc, plane) {
        (Fourcc::NV12, 0) => (width, height),
        (Fourcc::NV12, 1) => (half_width * 2, half_height),
        (Fourcc::P010, 0) => (width * 2, height),
        (Fourcc::P010, 1) => (half_width * 4, half_height),
        (Fourcc::YV12 | Fourcc::I420, 0) => (width, height),
        (Fourcc::YV12 | Fourcc::I420, 1 | 2) => (half_width, half_height),
        (Fourcc::YUY2 | Fourcc::UYVY, 0) => (half_width * 4, height),
        (Fourcc::Y210, 0) => (half_width * 8, height),
        (Fourcc::RGB4 | Fourcc::BGRA | Fourcc::AYUV | Fourcc::Y410, 0) => (width * 4, height),
        (Fourcc::P8, 0) => (width, height),
        _ => return None,
    };

    Some(extent)
}

/// Computes a tightly-packed layout of a frame in a single buffer, along with the total size of
/// that buffer. Returns `None` if `fourcc` is unknown.
pub fn packed_layout(fourcc: Fourcc, resolution: Resolution) -> Option<(Vec<PlaneLayout>, usize)> {
    let mut planes = Vec::new();
    let mut offset = 0;

    for plane in 0..num_planes(fourcc)? {
        let (stride, rows) = plane_extent(fourcc, resolution, plane)?;
        planes.push(PlaneLayout { buffer_index: 0, offset, stride });
        offset += stride * rows;
    }

    Some((planes, offset))
}

/// Size of a coded buffer holding the bitstream of one frame of `resolution`.
pub fn coded_buffer_size(resolution: Resolution) -> usize {
    resolution.get_area()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(1920, 16), 1920);
        assert_eq!(align_up(1080, 32), 1088);
    }

    #[test]
    fn nv12_layout() {
        let (planes, size) = packed_layout(Fourcc::NV12, (64, 48).into()).unwrap();
        assert_eq!(planes.len(), 2);
        assert_eq!(planes[0], PlaneLayout { buffer_index: 0, offset: 0, stride: 64 });
        assert_eq!(planes[1], PlaneLayout { buffer_index: 0, offset: 64 * 48, stride: 64 });
        assert_eq!(size, 64 * 48 * 3 / 2);
    }

    #[test]
    fn i420_layout_odd_size() {
        let (planes, size) = packed_layout(Fourcc::I420, (5, 3).into()).unwrap();
        assert_eq!(planes.len(), 3);
        assert_eq!(planes[1].offset, 15);
        assert_eq!(planes[2].offset, 15 + 3 * 2);
        assert_eq!(size, 15 + 2 * 3 * 2);
    }

    #[test]
    fn unknown_format() {
        assert!(packed_layout(Fourcc::from(b"XXXX"), (16, 16).into()).is_none());
    }
}
