// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Codec runtime sessions.
//!
//! A [`Session`] closes its runtime session when the last clone is dropped. A joined session
//! keeps its parent alive, so the parent is always closed after every session joined to it.

use std::sync::Arc;

use thiserror::Error;

use crate::allocator::FrameAllocator;
use crate::backend::DisplayInfo;
use crate::runtime::SessionHandle;
use crate::runtime::SessionOptions;

/// The session-based codec runtime this crate allocates memory for.
pub trait CodecRuntime: Send + Sync {
    fn open_session(&self, options: &SessionOptions) -> anyhow::Result<SessionHandle>;
    /// Makes `child` share the hardware context of `parent`.
    fn join_session(&self, parent: SessionHandle, child: SessionHandle) -> anyhow::Result<()>;
    fn disjoin_session(&self, session: SessionHandle) -> anyhow::Result<()>;
    fn set_handle(&self, session: SessionHandle, display: &DisplayInfo) -> anyhow::Result<()>;
    /// Registers the allocator the runtime will call while `session` initializes.
    fn set_frame_allocator(
        &self,
        session: SessionHandle,
        allocator: Arc<dyn FrameAllocator>,
    ) -> anyhow::Result<()>;
    fn close_session(&self, session: SessionHandle);
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to open codec session: {0:#}")]
    Open(anyhow::Error),
    #[error("failed to join session to its parent: {0:#}")]
    Join(anyhow::Error),
    #[error("failed to set the native display handle: {0:#}")]
    SetHandle(anyhow::Error),
    #[error("failed to register the frame allocator: {0:#}")]
    SetAllocator(anyhow::Error),
}

struct SessionInner {
    runtime: Arc<dyn CodecRuntime>,
    handle: SessionHandle,
    parent: Option<Session>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.parent.is_some() {
            if let Err(e) = self.runtime.disjoin_session(self.handle) {
                log::warn!("Failed to disjoin session {:?}: {:#}", self.handle, e);
            }
        }

        log::debug!("Closing session {:?}", self.handle);
        self.runtime.close_session(self.handle);
    }
}

/// A codec runtime session.
#[derive(Clone)]
pub struct Session(Arc<SessionInner>);

impl Session {
    /// Opens a new session with its own hardware context.
    pub fn open(
        runtime: &Arc<dyn CodecRuntime>,
        options: &SessionOptions,
    ) -> Result<Self, SessionError> {
        let handle = runtime.open_session(options).map_err(SessionError::Open)?;

        Ok(Self(Arc::new(SessionInner { runtime: Arc::clone(runtime), handle, parent: None })))
    }

    /// Opens a new session sharing the hardware context of `parent`.
    pub fn open_joined(parent: &Session, options: &SessionOptions) -> Result<Self, SessionError> {
        let runtime = &parent.0.runtime;
        let handle = runtime.open_session(options).map_err(SessionError::Open)?;

        if let Err(e) = runtime.join_session(parent.handle(), handle) {
            runtime.close_session(handle);
            return Err(SessionError::Join(e));
        }

        log::debug!("Joined session {:?} to {:?}", handle, parent.handle());

        Ok(Self(Arc::new(SessionInner {
            runtime: Arc::clone(runtime),
            handle,
            parent: Some(parent.clone()),
        })))
    }

    pub fn handle(&self) -> SessionHandle {
        self.0.handle
    }

    pub fn is_joined(&self) -> bool {
        self.0.parent.is_some()
    }

    pub fn parent(&self) -> Option<&Session> {
        self.0.parent.as_ref()
    }

    pub fn set_handle(&self, display: &DisplayInfo) -> Result<(), SessionError> {
        self.0.runtime.set_handle(self.0.handle, display).map_err(SessionError::SetHandle)
    }

    pub fn set_frame_allocator(
        &self,
        allocator: Arc<dyn FrameAllocator>,
    ) -> Result<(), SessionError> {
        self.0
            .runtime
            .set_frame_allocator(self.0.handle, allocator)
            .map_err(SessionError::SetAllocator)
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("handle", &self.0.handle)
            .field("parent", &self.0.parent.as_ref().map(|p| p.handle()))
            .finish()
    }
}
