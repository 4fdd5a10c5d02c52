// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Types exchanged with the codec runtime through the frame allocator contract.

use std::num::NonZeroU64;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bitflags::bitflags;

use crate::Fourcc;
use crate::Rect;
use crate::Resolution;

/// Opaque identifier of one piece of memory handed to the codec runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemId(NonZeroU64);

impl MemId {
    /// Returns a process-unique memory id.
    pub fn new() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        // The counter starts at 1 and would need centuries to wrap.
        Self(NonZeroU64::new(id).unwrap_or(NonZeroU64::MIN))
    }

    pub fn get(&self) -> u64 {
        self.0.get()
    }
}

impl Default for MemId {
    fn default() -> Self {
        Self::new()
    }
}

bitflags! {
    /// Memory type of an allocation request, using the codec runtime's values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryType: u32 {
        const INTERNAL_FRAME = 0x0001;
        const EXTERNAL_FRAME = 0x0002;
        const OPAQUE_FRAME = 0x0004;
        const EXPORT_FRAME = 0x0008;
        const VIDEO_MEMORY_DECODER_TARGET = 0x0010;
        const VIDEO_MEMORY_PROCESSOR_TARGET = 0x0020;
        const SYSTEM_MEMORY = 0x0040;
        const FROM_ENCODE = 0x0100;
        const FROM_DECODE = 0x0200;
        const FROM_VPPIN = 0x0400;
        const FROM_VPPOUT = 0x0800;
        const VIDEO_MEMORY_ENCODER_TARGET = 0x1000;
    }
}

impl MemoryType {
    pub const VIDEO_MEMORY: MemoryType = MemoryType::VIDEO_MEMORY_DECODER_TARGET
        .union(MemoryType::VIDEO_MEMORY_PROCESSOR_TARGET)
        .union(MemoryType::VIDEO_MEMORY_ENCODER_TARGET);
}

bitflags! {
    /// Where a codec session reads its input from and writes its output to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IoPattern: u32 {
        const IN_VIDEO_MEMORY = 0x01;
        const IN_SYSTEM_MEMORY = 0x02;
        const IN_OPAQUE_MEMORY = 0x04;
        const OUT_VIDEO_MEMORY = 0x10;
        const OUT_SYSTEM_MEMORY = 0x20;
        const OUT_OPAQUE_MEMORY = 0x40;
    }
}

impl IoPattern {
    pub const IN_MASK: IoPattern = IoPattern::IN_VIDEO_MEMORY
        .union(IoPattern::IN_SYSTEM_MEMORY)
        .union(IoPattern::IN_OPAQUE_MEMORY);
    pub const OUT_MASK: IoPattern = IoPattern::OUT_VIDEO_MEMORY
        .union(IoPattern::OUT_SYSTEM_MEMORY)
        .union(IoPattern::OUT_OPAQUE_MEMORY);
}

/// Chroma subsampling of a frame.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChromaFormat {
    Monochrome,
    #[default]
    Yuv420,
    Yuv422,
    Yuv444,
}

/// Description of the frames requested by the codec runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameInfo {
    pub fourcc: Fourcc,
    /// Allocated, aligned, size of the frames.
    pub resolution: Resolution,
    /// Visible region inside `resolution`.
    pub crop: Rect,
    pub chroma_format: ChromaFormat,
    pub bit_depth: u8,
}

impl FrameInfo {
    pub fn new(fourcc: Fourcc, resolution: Resolution) -> Self {
        let (chroma_format, bit_depth) = match fourcc {
            Fourcc::P010 => (ChromaFormat::Yuv420, 10),
            Fourcc::YUY2 | Fourcc::UYVY => (ChromaFormat::Yuv422, 8),
            Fourcc::Y210 => (ChromaFormat::Yuv422, 10),
            Fourcc::AYUV | Fourcc::RGB4 | Fourcc::BGRA => (ChromaFormat::Yuv444, 8),
            Fourcc::Y410 => (ChromaFormat::Yuv444, 10),
            Fourcc::P8 => (ChromaFormat::Monochrome, 8),
            _ => (ChromaFormat::Yuv420, 8),
        };

        Self { fourcc, resolution, crop: resolution.into(), chroma_format, bit_depth }
    }

    /// Whether this describes coded-bitstream memory rather than pixels.
    pub fn is_coded_buffer(&self) -> bool {
        self.fourcc == Fourcc::P8
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameAllocRequest {
    pub info: FrameInfo,
    pub memory_type: MemoryType,
    pub num_frame_min: u16,
    pub num_frame_suggested: u16,
}

/// Identity of the memory id array of a [`FrameAllocResponse`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResponseKey(usize);

/// Answer to a [`FrameAllocRequest`].
///
/// Clones share the same memory id array, and thus the same [`ResponseKey`].
#[derive(Clone, Debug)]
pub struct FrameAllocResponse {
    pub mids: Arc<[MemId]>,
    pub num_frame_actual: u16,
    pub memory_type: MemoryType,
}

impl FrameAllocResponse {
    pub fn key(&self) -> ResponseKey {
        ResponseKey(Arc::as_ptr(&self.mids) as *const MemId as usize)
    }
}

/// CPU view of a locked buffer, filled by `lock` and cleared by `unlock`.
#[derive(Debug, Default)]
pub struct FrameData {
    pub mem_id: Option<MemId>,
    pub pitch: u32,
    pub data: Option<NonNull<u8>>,
    pub len: usize,
}

impl FrameData {
    /// Returns the locked bytes, if any.
    ///
    /// # Safety
    ///
    /// The memory this was locked from must still be locked, and nothing may write to it while
    /// the returned slice is alive.
    pub unsafe fn as_slice(&self) -> Option<&[u8]> {
        self.data.map(|data| std::slice::from_raw_parts(data.as_ptr(), self.len))
    }

    pub fn clear(&mut self) {
        *self = Default::default();
    }
}

/// Status codes of the codec runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, enumn::N)]
#[repr(i32)]
pub enum Status {
    None = 0,
    Unknown = -1,
    NullPtr = -2,
    Unsupported = -3,
    MemoryAlloc = -4,
    NotEnoughBuffer = -5,
    InvalidHandle = -6,
    LockMemory = -7,
    NotInitialized = -8,
    NotFound = -9,
}

/// Which codec implementation a session should be opened with.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Implementation {
    #[default]
    Auto,
    Hardware,
    Software,
}

/// Opaque session handle owned by the codec runtime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Options used to open codec sessions.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub implementation: Implementation,
    /// How many asynchronous operations a session may have in flight.
    pub async_depth: u16,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { implementation: Implementation::Hardware, async_depth: 4 }
    }
}
