// Copyright 2022 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! This file contains a dummy backend and codec runtime whose only purpose is to let the
//! allocator, tasks and surfaces run so we can test them in isolation.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::allocator::FrameAllocator;
use crate::backend::system::SystemBuffer;
use crate::backend::BackendKind;
use crate::backend::DisplayInfo;
use crate::backend::ExportedHandle;
use crate::backend::MappedBuffer;
use crate::backend::NativeHandle;
use crate::backend::NativeResourceProvider;
use crate::backend::PlaneAccess;
use crate::backend::ResourceKind;
use crate::runtime::FrameInfo;
use crate::runtime::SessionHandle;
use crate::runtime::SessionOptions;
use crate::session::CodecRuntime;
use crate::Fourcc;

/// Handle of the next dummy display, so tests sharing the display cache don't collide.
static NEXT_DISPLAY: AtomicUsize = AtomicUsize::new(0x1000);

pub(crate) struct DummyResource {
    id: usize,
    kind: ResourceKind,
    buffer: SystemBuffer,
}

/// Dummy provider backed by system memory, counting the resources it creates and destroys.
pub(crate) struct DummyProvider {
    display: usize,
    staging_formats: Vec<Fourcc>,
    /// Number of creations that will still succeed, if limited.
    remaining: Mutex<Option<usize>>,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

impl DummyProvider {
    pub(crate) fn new() -> Self {
        Self {
            display: NEXT_DISPLAY.fetch_add(1, Ordering::SeqCst),
            staging_formats: vec![Fourcc::AYUV, Fourcc::RGB4],
            remaining: Mutex::new(None),
            created: AtomicUsize::new(0),
            destroyed: AtomicUsize::new(0),
        }
    }

    /// Makes every resource creation after the next `n` ones fail.
    pub(crate) fn fail_after(&self, n: usize) {
        *self.remaining.lock() = Some(n);
    }

    pub(crate) fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub(crate) fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Number of resources currently alive.
    pub(crate) fn live(&self) -> usize {
        self.created() - self.destroyed()
    }
}

impl NativeResourceProvider for DummyProvider {
    type Resource = DummyResource;

    fn display_info(&self) -> DisplayInfo {
        DisplayInfo { handle: self.display, backend: BackendKind::Dummy, name: "dummy".into() }
    }

    fn supports_format(&self, fourcc: Fourcc) -> bool {
        crate::utils::num_planes(fourcc).is_some()
    }

    fn needs_staging(&self, info: &FrameInfo) -> bool {
        self.staging_formats.contains(&info.fourcc)
    }

    fn create(&self, kind: ResourceKind, info: &FrameInfo) -> anyhow::Result<DummyResource> {
        if let Some(remaining) = self.remaining.lock().as_mut() {
            if *remaining == 0 {
                return Err(anyhow!("dummy provider out of memory"));
            }
            *remaining -= 1;
        }

        let buffer = SystemBuffer::new(kind, info)?;
        let id = self.created.fetch_add(1, Ordering::SeqCst);

        Ok(DummyResource { id, kind, buffer })
    }

    fn destroy(&self, resource: DummyResource) {
        drop(resource);
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn map_buffer(&self, resource: &DummyResource) -> anyhow::Result<MappedBuffer> {
        if resource.kind != ResourceKind::CodedBuffer {
            return Err(anyhow!("resource {} is not a coded buffer", resource.id));
        }

        Ok(resource.buffer.map())
    }

    fn unmap_buffer(&self, _: &DummyResource) {}

    fn map_planes<'a>(
        &'a self,
        resource: &'a DummyResource,
    ) -> anyhow::Result<Box<dyn PlaneAccess + 'a>> {
        Ok(Box::new(resource.buffer.map_planes()))
    }

    fn copy_to_staging(&self, src: &DummyResource, dst: &DummyResource) -> anyhow::Result<()> {
        src.buffer.copy_to(&dst.buffer)
    }

    fn native_handle(&self, resource: &DummyResource) -> Option<NativeHandle> {
        Some(NativeHandle::System(resource.id))
    }

    fn export(&self, resource: &DummyResource) -> anyhow::Result<ExportedHandle> {
        resource.buffer.export()
    }
}

#[derive(Default)]
struct RuntimeState {
    next_session: u64,
    open: Vec<SessionHandle>,
    joins: Vec<(SessionHandle, SessionHandle)>,
    disjoined: Vec<SessionHandle>,
    closed: Vec<SessionHandle>,
    handles: HashMap<SessionHandle, usize>,
    allocators: HashMap<SessionHandle, Arc<dyn FrameAllocator>>,
}

/// A codec runtime that records what is done to its sessions.
#[derive(Default)]
pub(crate) struct DummyRuntime {
    state: Mutex<RuntimeState>,
    fail_open: AtomicBool,
}

impl DummyRuntime {
    pub(crate) fn new() -> Self {
        Default::default()
    }

    pub(crate) fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn joins(&self) -> Vec<(SessionHandle, SessionHandle)> {
        self.state.lock().joins.clone()
    }

    pub(crate) fn disjoined(&self) -> Vec<SessionHandle> {
        self.state.lock().disjoined.clone()
    }

    pub(crate) fn closed(&self) -> Vec<SessionHandle> {
        self.state.lock().closed.clone()
    }

    pub(crate) fn display_handle(&self, session: SessionHandle) -> Option<usize> {
        self.state.lock().handles.get(&session).copied()
    }

    /// The allocator the runtime would call back while `session` initializes.
    pub(crate) fn allocator_for(&self, session: SessionHandle) -> Option<Arc<dyn FrameAllocator>> {
        self.state.lock().allocators.get(&session).cloned()
    }
}

impl CodecRuntime for DummyRuntime {
    fn open_session(&self, _: &SessionOptions) -> anyhow::Result<SessionHandle> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(anyhow!("no device"));
        }

        let mut state = self.state.lock();
        state.next_session += 1;
        let handle = SessionHandle(state.next_session);
        state.open.push(handle);

        Ok(handle)
    }

    fn join_session(&self, parent: SessionHandle, child: SessionHandle) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if !state.open.contains(&parent) || !state.open.contains(&child) {
            return Err(anyhow!("cannot join {:?} to {:?}", child, parent));
        }
        state.joins.push((parent, child));

        Ok(())
    }

    fn disjoin_session(&self, session: SessionHandle) -> anyhow::Result<()> {
        self.state.lock().disjoined.push(session);
        Ok(())
    }

    fn set_handle(&self, session: SessionHandle, display: &DisplayInfo) -> anyhow::Result<()> {
        self.state.lock().handles.insert(session, display.handle);
        Ok(())
    }

    fn set_frame_allocator(
        &self,
        session: SessionHandle,
        allocator: Arc<dyn FrameAllocator>,
    ) -> anyhow::Result<()> {
        self.state.lock().allocators.insert(session, allocator);
        Ok(())
    }

    fn close_session(&self, session: SessionHandle) {
        let mut state = self.state.lock();
        state.open.retain(|s| *s != session);
        state.allocators.remove(&session);
        state.closed.push(session);
    }
}
