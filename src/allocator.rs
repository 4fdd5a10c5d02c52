// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The frame allocator the codec runtime calls back into.
//!
//! The runtime allocates frames through five callbacks (alloc, free, lock, unlock and get_hdl)
//! that do not tell us which pipeline stage they are made for. [`FrameAllocator`] is that
//! runtime-facing contract. The aggregator implements it by resolving the current [`Task`] and
//! forwarding to a [`TaskAllocator`], for which [`ExternalAllocator`] is the implementation
//! generic over the native backend.

pub mod ledger;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;

use parking_lot::Mutex;
use thiserror::Error;

use crate::backend::DisplayInfo;
use crate::backend::MemoryBlock;
use crate::backend::NativeHandle;
use crate::backend::NativeResourceProvider;
use crate::backend::ProviderMemory;
use crate::backend::ResourceKind;
use crate::runtime::FrameAllocRequest;
use crate::runtime::FrameAllocResponse;
use crate::runtime::FrameData;
use crate::runtime::FrameInfo;
use crate::runtime::MemId;
use crate::runtime::MemoryType;
use crate::runtime::Status;
use crate::task::Task;
use crate::task::TaskType;
use ledger::ResponseData;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("unsupported request: {0}")]
    Unsupported(String),
    #[error("failed to allocate native memory: {0:#}")]
    MemoryAlloc(anyhow::Error),
    #[error("no saved allocation matches this response")]
    NotFound,
    #[error("failed to lock memory: {0}")]
    LockFailed(String),
    #[error("invalid memory id or missing native resource")]
    InvalidHandle,
    #[error("no task is current")]
    NoCurrentTask,
    #[error("failed to export memory: {0:#}")]
    Export(anyhow::Error),
}

impl AllocError {
    /// The codec runtime status this error is reported as.
    pub fn status(&self) -> Status {
        match self {
            AllocError::Unsupported(_) => Status::Unsupported,
            AllocError::MemoryAlloc(_) => Status::MemoryAlloc,
            AllocError::NotFound => Status::NotFound,
            AllocError::LockFailed(_) => Status::LockMemory,
            AllocError::InvalidHandle => Status::InvalidHandle,
            AllocError::NoCurrentTask => Status::NotInitialized,
            AllocError::Export(_) => Status::Unknown,
        }
    }
}

/// The allocation callbacks registered with a codec runtime session.
pub trait FrameAllocator: Send + Sync {
    fn alloc(&self, request: &FrameAllocRequest) -> Result<FrameAllocResponse, AllocError>;
    fn free(&self, response: &FrameAllocResponse) -> Result<(), AllocError>;
    /// Maps a coded buffer for CPU reading and describes the mapping in `data`.
    fn lock(&self, mid: MemId, data: &mut FrameData) -> Result<(), AllocError>;
    fn unlock(&self, mid: MemId, data: &mut FrameData) -> Result<(), AllocError>;
    fn get_hdl(&self, mid: MemId) -> Result<NativeHandle, AllocError>;
}

/// Allocation callbacks with the task they are made for made explicit.
pub trait TaskAllocator: Send + Sync {
    fn alloc(&self, task: &Task, request: &FrameAllocRequest)
        -> Result<FrameAllocResponse, AllocError>;
    fn free(&self, task: &Task, response: &FrameAllocResponse) -> Result<(), AllocError>;
    fn lock(&self, mid: MemId, data: &mut FrameData) -> Result<(), AllocError>;
    fn unlock(&self, mid: MemId, data: &mut FrameData) -> Result<(), AllocError>;
    fn get_hdl(&self, mid: MemId) -> Result<NativeHandle, AllocError>;

    /// Memory handed to the codec runtime under `mid`, if it has not been freed.
    fn memory(&self, mid: MemId) -> Option<Arc<dyn MemoryBlock>>;

    /// Creates a surface that is not part of any response.
    fn create_memory(&self, info: &FrameInfo) -> Result<Arc<dyn MemoryBlock>, AllocError>;

    fn display(&self) -> DisplayInfo;
}

/// Frame allocator serving requests with memory of a [`NativeResourceProvider`].
pub struct ExternalAllocator<P: NativeResourceProvider> {
    provider: Arc<P>,
    /// Memory of every live response, for lock, unlock and get_hdl. Task ledgers own the
    /// memory, so entries of a task torn down without freeing go dead here.
    index: Mutex<HashMap<MemId, Weak<dyn MemoryBlock>>>,
}

impl<P: NativeResourceProvider> ExternalAllocator<P> {
    pub fn new(provider: Arc<P>) -> Self {
        Self { provider, index: Mutex::new(HashMap::new()) }
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Number of memory ids currently handed out to the codec runtime.
    pub fn num_live_mids(&self) -> usize {
        let mut index = self.index.lock();
        index.retain(|_, block| block.strong_count() > 0);
        index.len()
    }

    fn create_blocks(
        &self,
        kind: ResourceKind,
        info: &FrameInfo,
        count: usize,
    ) -> Result<Vec<Arc<dyn MemoryBlock>>, AllocError> {
        let with_staging = kind == ResourceKind::Surface && self.provider.needs_staging(info);
        let mut blocks: Vec<Arc<dyn MemoryBlock>> = Vec::with_capacity(count);

        for i in 0..count {
            match ProviderMemory::create(Arc::clone(&self.provider), kind, info, with_staging) {
                Ok(memory) => blocks.push(Arc::new(memory)),
                Err(e) => {
                    log::error!(
                        "Failed to create {:?} {} of {} ({}, {:?}): {:#}",
                        kind,
                        i + 1,
                        count,
                        info.fourcc,
                        info.resolution,
                        e
                    );
                    // Dropping the blocks destroys what was created so far.
                    return Err(AllocError::MemoryAlloc(e));
                }
            }
        }

        Ok(blocks)
    }

    fn lookup(&self, mid: MemId) -> Result<Arc<dyn MemoryBlock>, AllocError> {
        self.memory(mid).ok_or(AllocError::InvalidHandle)
    }
}

impl<P: NativeResourceProvider> TaskAllocator for ExternalAllocator<P> {
    fn alloc(
        &self,
        task: &Task,
        request: &FrameAllocRequest,
    ) -> Result<FrameAllocResponse, AllocError> {
        let memory_type = request.memory_type;
        if !memory_type.intersects(
            MemoryType::VIDEO_MEMORY_DECODER_TARGET | MemoryType::VIDEO_MEMORY_PROCESSOR_TARGET,
        ) {
            return Err(AllocError::Unsupported(format!("memory type {:?}", memory_type)));
        }
        let internal = memory_type.contains(MemoryType::INTERNAL_FRAME);

        let mut ledger = task.ledger();

        if task.has_type(TaskType::DECODER) && !internal {
            if let Some(response) = ledger.latest_response() {
                log::debug!(
                    "Reusing saved response of {} frames for decoder task",
                    response.num_frame_actual
                );
                return Ok(response.clone());
            }
        }

        let suggested = if internal {
            request.num_frame_suggested
        } else {
            task.request().map_or(request.num_frame_suggested, |r| r.num_frame_suggested)
        };
        let count = suggested.max(request.num_frame_min);
        if count == 0 {
            return Err(AllocError::Unsupported("request for zero frames".into()));
        }

        let info = &request.info;
        let kind = if info.is_coded_buffer() {
            ResourceKind::CodedBuffer
        } else if self.provider.supports_format(info.fourcc) {
            ResourceKind::Surface
        } else {
            return Err(AllocError::Unsupported(format!("format {}", info.fourcc)));
        };

        let blocks = self.create_blocks(kind, info, count as usize)?;
        let mids: Arc<[MemId]> = blocks.iter().map(|b| b.mem_id()).collect();

        {
            let mut index = self.index.lock();
            index.retain(|_, block| block.strong_count() > 0);
            for block in &blocks {
                index.insert(block.mem_id(), Arc::downgrade(block));
            }
        }
        task.push_memory_ids(&mids);

        let response =
            FrameAllocResponse { mids: Arc::clone(&mids), num_frame_actual: count, memory_type };
        ledger.insert(ResponseData {
            mids,
            blocks,
            num_frames: count,
            info: info.clone(),
            response: response.clone(),
        });

        log::debug!(
            "Allocated {} {:?} of {} {:?} ({:?})",
            count,
            kind,
            info.fourcc,
            info.resolution,
            memory_type
        );

        Ok(response)
    }

    fn free(&self, task: &Task, response: &FrameAllocResponse) -> Result<(), AllocError> {
        let data = {
            let mut ledger = task.ledger();
            let Some(data) = ledger.remove(response.key()) else {
                log::warn!("Free of unknown response with {} frames", response.num_frame_actual);
                return Err(AllocError::NotFound);
            };

            let mut index = self.index.lock();
            for mid in data.mids.iter() {
                index.remove(mid);
            }

            data
        };

        task.forget_memory_ids(&data.mids);
        log::debug!("Freed {} frames of {}", data.num_frames, data.info.fourcc);

        // Native resources are released when the last surface referencing them goes away.
        drop(data);

        Ok(())
    }

    fn lock(&self, mid: MemId, data: &mut FrameData) -> Result<(), AllocError> {
        let block = self.lookup(mid)?;
        if block.kind() != ResourceKind::CodedBuffer {
            return Err(AllocError::Unsupported(
                "only coded buffers can be locked, surfaces are mapped".into(),
            ));
        }

        let mapped = block.map_buffer().map_err(|e| AllocError::LockFailed(format!("{:#}", e)))?;

        data.mem_id = Some(mid);
        data.pitch = mapped.pitch;
        data.data = Some(mapped.data);
        data.len = mapped.len;

        Ok(())
    }

    fn unlock(&self, mid: MemId, data: &mut FrameData) -> Result<(), AllocError> {
        let block = self.lookup(mid)?;
        if block.kind() != ResourceKind::CodedBuffer {
            return Err(AllocError::Unsupported(
                "only coded buffers can be unlocked, surfaces are mapped".into(),
            ));
        }

        block.unmap_buffer();
        data.clear();

        Ok(())
    }

    fn get_hdl(&self, mid: MemId) -> Result<NativeHandle, AllocError> {
        self.lookup(mid)?.native_handle().ok_or(AllocError::InvalidHandle)
    }

    fn memory(&self, mid: MemId) -> Option<Arc<dyn MemoryBlock>> {
        self.index.lock().get(&mid).and_then(Weak::upgrade)
    }

    fn create_memory(&self, info: &FrameInfo) -> Result<Arc<dyn MemoryBlock>, AllocError> {
        if !self.provider.supports_format(info.fourcc) {
            return Err(AllocError::Unsupported(format!("format {}", info.fourcc)));
        }

        let blocks = self.create_blocks(ResourceKind::Surface, info, 1)?;
        blocks.into_iter().next().ok_or_else(|| {
            AllocError::MemoryAlloc(anyhow::anyhow!("no memory created for {}", info.fourcc))
        })
    }

    fn display(&self) -> DisplayInfo {
        self.provider.display_info()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::aggregator::TaskAggregator;
    use crate::backend::dummy::DummyProvider;
    use crate::backend::dummy::DummyRuntime;
    use crate::runtime::SessionOptions;
    use crate::session::CodecRuntime;
    use crate::Fourcc;

    struct Fixture {
        provider: Arc<DummyProvider>,
        allocator: Arc<ExternalAllocator<DummyProvider>>,
        aggregator: TaskAggregator,
    }

    fn fixture() -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();

        let provider = Arc::new(DummyProvider::new());
        let allocator = Arc::new(ExternalAllocator::new(Arc::clone(&provider)));
        let runtime: Arc<dyn CodecRuntime> = Arc::new(DummyRuntime::new());
        let aggregator = TaskAggregator::new(
            runtime,
            Arc::clone(&allocator) as Arc<dyn TaskAllocator>,
            SessionOptions::default(),
        );

        Fixture { provider, allocator, aggregator }
    }

    fn request(fourcc: Fourcc, memory_type: MemoryType, count: u16) -> FrameAllocRequest {
        FrameAllocRequest {
            info: FrameInfo::new(fourcc, (64, 64).into()),
            memory_type,
            num_frame_min: count,
            num_frame_suggested: count,
        }
    }

    const DECODER_TARGET: MemoryType = MemoryType::VIDEO_MEMORY_DECODER_TARGET
        .union(MemoryType::EXTERNAL_FRAME)
        .union(MemoryType::FROM_DECODE);

    #[test]
    fn alloc_free_round_trip() {
        let f = fixture();
        let task = f.aggregator.create_task(TaskType::VPP_OUT).unwrap();

        let response =
            f.allocator.alloc(&task, &request(Fourcc::NV12, DECODER_TARGET, 4)).unwrap();
        assert_eq!(response.num_frame_actual, 4);
        assert_eq!(task.saved_response_count(), 1);
        assert_eq!(f.allocator.num_live_mids(), 4);
        assert_eq!(f.provider.live(), 4);

        f.allocator.free(&task, &response).unwrap();
        assert_eq!(task.saved_response_count(), 0);
        assert_eq!(f.allocator.num_live_mids(), 0);
        assert_eq!(f.provider.live(), 0);

        assert!(matches!(f.allocator.free(&task, &response), Err(AllocError::NotFound)));
        assert_eq!(AllocError::NotFound.status(), Status::NotFound);
    }

    #[test]
    fn decoder_reuses_saved_response() {
        let f = fixture();
        let decoder = f.aggregator.create_task(TaskType::DECODER).unwrap();
        let req = request(Fourcc::NV12, DECODER_TARGET, 4);

        let first = f.allocator.alloc(&decoder, &req).unwrap();
        let second = f.allocator.alloc(&decoder, &req).unwrap();
        assert_eq!(first.key(), second.key());
        assert_eq!(first.mids, second.mids);
        assert_eq!(f.provider.created(), 4);
        assert_eq!(decoder.saved_response_count(), 1);

        // Internal requests always allocate.
        let internal = request(
            Fourcc::NV12,
            MemoryType::VIDEO_MEMORY_DECODER_TARGET | MemoryType::INTERNAL_FRAME,
            2,
        );
        let third = f.allocator.alloc(&decoder, &internal).unwrap();
        assert_ne!(third.key(), first.key());
        assert_eq!(third.num_frame_actual, 2);
        assert_eq!(decoder.saved_response_count(), 2);
    }

    #[test]
    fn non_internal_count_follows_task_request() {
        let f = fixture();
        let task = f.aggregator.create_task(TaskType::ENCODER).unwrap();
        task.set_request(request(Fourcc::NV12, DECODER_TARGET, 6));

        let mut req = request(Fourcc::NV12, MemoryType::VIDEO_MEMORY_PROCESSOR_TARGET, 2);
        req.num_frame_min = 1;
        let response = f.allocator.alloc(&task, &req).unwrap();
        assert_eq!(response.num_frame_actual, 6);

        // The minimum still wins over a smaller nominal pool size.
        req.num_frame_min = 8;
        let response = f.allocator.alloc(&task, &req).unwrap();
        assert_eq!(response.num_frame_actual, 8);
    }

    #[test]
    fn unsupported_requests() {
        let f = fixture();
        let task = f.aggregator.create_task(TaskType::VPP_IN).unwrap();

        let system = request(Fourcc::NV12, MemoryType::SYSTEM_MEMORY, 2);
        let err = f.allocator.alloc(&task, &system).unwrap_err();
        assert_eq!(err.status(), Status::Unsupported);

        let format = request(Fourcc::from(b"XXXX"), DECODER_TARGET, 2);
        assert!(matches!(f.allocator.alloc(&task, &format), Err(AllocError::Unsupported(_))));

        let empty = request(Fourcc::NV12, DECODER_TARGET, 0);
        assert!(matches!(f.allocator.alloc(&task, &empty), Err(AllocError::Unsupported(_))));

        assert_eq!(f.provider.created(), 0);
        assert_eq!(task.saved_response_count(), 0);
    }

    #[test]
    fn partial_failure_rolls_back() {
        let f = fixture();
        let task = f.aggregator.create_task(TaskType::VPP_OUT).unwrap();
        f.provider.fail_after(3);

        let err = f.allocator.alloc(&task, &request(Fourcc::NV12, DECODER_TARGET, 4)).unwrap_err();
        assert_eq!(err.status(), Status::MemoryAlloc);
        assert_eq!(f.provider.created(), 3);
        assert_eq!(f.provider.live(), 0);
        assert_eq!(task.saved_response_count(), 0);
        assert_eq!(f.allocator.num_live_mids(), 0);
        assert!(task.memory_ids().is_empty());
    }

    #[test]
    fn staging_companions() {
        let f = fixture();
        let task = f.aggregator.create_task(TaskType::VPP_OUT).unwrap();

        let response =
            f.allocator.alloc(&task, &request(Fourcc::AYUV, DECODER_TARGET, 2)).unwrap();
        assert_eq!(f.provider.live(), 4);
        assert!(f.allocator.memory(response.mids[0]).unwrap().has_staging());

        f.allocator.free(&task, &response).unwrap();
        assert_eq!(f.provider.live(), 0);
    }

    #[test]
    fn lock_coded_buffers_only() {
        let f = fixture();
        let task = f.aggregator.create_task(TaskType::ENCODER).unwrap();

        let coded = f
            .allocator
            .alloc(&task, &request(Fourcc::P8, MemoryType::VIDEO_MEMORY_PROCESSOR_TARGET, 1))
            .unwrap();
        let mid = coded.mids[0];

        let mut data = FrameData::default();
        f.allocator.lock(mid, &mut data).unwrap();
        assert_eq!(data.mem_id, Some(mid));
        assert_eq!(data.pitch, 64);
        assert_eq!(data.len, 64 * 64);
        // SAFETY: the buffer is locked and nothing writes to it.
        assert!(unsafe { data.as_slice() }.unwrap().iter().all(|b| *b == 0));

        let mut again = FrameData::default();
        let err = f.allocator.lock(mid, &mut again).unwrap_err();
        assert_eq!(err.status(), Status::LockMemory);

        f.allocator.unlock(mid, &mut data).unwrap();
        assert!(data.data.is_none());
        assert_eq!(data.len, 0);
        // Unlocking twice is harmless.
        f.allocator.unlock(mid, &mut data).unwrap();

        let surfaces =
            f.allocator.alloc(&task, &request(Fourcc::NV12, DECODER_TARGET, 1)).unwrap();
        let err = f.allocator.lock(surfaces.mids[0], &mut data).unwrap_err();
        assert_eq!(err.status(), Status::Unsupported);
    }

    #[test]
    fn get_hdl() {
        let f = fixture();
        let task = f.aggregator.create_task(TaskType::DECODER).unwrap();
        let response =
            f.allocator.alloc(&task, &request(Fourcc::NV12, DECODER_TARGET, 2)).unwrap();

        let a = f.allocator.get_hdl(response.mids[0]).unwrap();
        let b = f.allocator.get_hdl(response.mids[1]).unwrap();
        assert_ne!(a, b);

        let unknown = MemId::new();
        assert_eq!(f.allocator.get_hdl(unknown).unwrap_err().status(), Status::InvalidHandle);

        f.allocator.free(&task, &response).unwrap();
        assert!(matches!(f.allocator.get_hdl(response.mids[0]), Err(AllocError::InvalidHandle)));
    }

    #[test]
    fn task_teardown_releases_memory() {
        let f = fixture();
        let decoder = f.aggregator.create_task(TaskType::DECODER).unwrap();
        let response =
            f.allocator.alloc(&decoder, &request(Fourcc::NV12, DECODER_TARGET, 4)).unwrap();
        assert_eq!(f.provider.live(), 4);

        f.aggregator.remove_task(&decoder);
        drop(decoder);

        assert_eq!(f.provider.live(), 0);
        assert_eq!(f.allocator.num_live_mids(), 0);
        assert!(matches!(f.allocator.get_hdl(response.mids[0]), Err(AllocError::InvalidHandle)));
    }
}
