// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A task is one pipeline stage's codec session plus its allocation bookkeeping.

use std::collections::VecDeque;

use bitflags::bitflags;
use parking_lot::Mutex;
use parking_lot::MutexGuard;

use crate::aggregator::AggregatorInner;
use crate::aggregator::TaskAggregator;
use crate::allocator::ledger::Ledger;
use crate::object::Finalize;
use crate::object::ObjectRef;
use crate::object::WeakRef;
use crate::runtime::FrameAllocRequest;
use crate::runtime::FrameAllocResponse;
use crate::runtime::IoPattern;
use crate::runtime::MemId;
use crate::runtime::MemoryType;
use crate::session::Session;

bitflags! {
    /// The roles a task plays in the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaskType: u32 {
        const DECODER = 1 << 0;
        const VPP_IN = 1 << 1;
        const VPP_OUT = 1 << 2;
        const ENCODER = 1 << 3;
    }
}

impl TaskType {
    pub const VPP: TaskType = TaskType::VPP_IN.union(TaskType::VPP_OUT);
}

struct TaskState {
    request: Option<FrameAllocRequest>,
    io_pattern: IoPattern,
    memtype_is_system: bool,
    /// Memory ids allocated for this task, in the order surfaces are handed out.
    memory_ids: VecDeque<MemId>,
}

pub struct TaskInner {
    aggregator: WeakRef<AggregatorInner>,
    session: Session,
    is_joined: bool,
    task_type: TaskType,
    state: Mutex<TaskState>,
    ledger: Mutex<Ledger>,
}

impl Finalize for TaskInner {
    fn finalize(&mut self) {
        let ledger = self.ledger.get_mut();
        if !ledger.is_empty() {
            log::debug!(
                "Finalizing {:?} task of session {:?} with {} saved responses",
                self.task_type,
                self.session.handle(),
                ledger.len()
            );
            ledger.drain();
        }
    }
}

/// A pipeline stage, shared by reference.
#[derive(Clone)]
pub struct Task(pub(crate) ObjectRef<TaskInner>);

fn default_io_pattern(task_type: TaskType) -> IoPattern {
    let mut pattern = IoPattern::empty();
    if task_type.intersects(TaskType::DECODER | TaskType::VPP) {
        pattern |= IoPattern::OUT_VIDEO_MEMORY;
    }
    if task_type.intersects(TaskType::ENCODER | TaskType::VPP) {
        pattern |= IoPattern::IN_VIDEO_MEMORY;
    }

    pattern
}

impl Task {
    /// Creates a task of `task_type` running on `session`, a session opened by `aggregator`.
    pub fn new(
        aggregator: &TaskAggregator,
        session: Session,
        is_joined: bool,
        task_type: TaskType,
    ) -> Self {
        Self(ObjectRef::new(TaskInner {
            aggregator: aggregator.downgrade(),
            session,
            is_joined,
            task_type,
            state: Mutex::new(TaskState {
                request: None,
                io_pattern: default_io_pattern(task_type),
                memtype_is_system: false,
                memory_ids: VecDeque::new(),
            }),
            ledger: Mutex::new(Ledger::default()),
        }))
    }

    pub fn task_type(&self) -> TaskType {
        self.0.task_type
    }

    /// Whether this task plays any of the roles in `task_type`.
    pub fn has_type(&self, task_type: TaskType) -> bool {
        self.0.task_type.intersects(task_type)
    }

    pub fn session(&self) -> &Session {
        &self.0.session
    }

    pub fn is_joined(&self) -> bool {
        self.0.is_joined
    }

    pub fn aggregator(&self) -> Option<TaskAggregator> {
        self.0.aggregator.upgrade().map(TaskAggregator)
    }

    /// The allocation request this task was configured with, which sets its nominal pool size.
    pub fn request(&self) -> Option<FrameAllocRequest> {
        self.0.state.lock().request.clone()
    }

    pub fn set_request(&self, request: FrameAllocRequest) {
        self.0.state.lock().request = Some(request);
    }

    pub fn io_pattern(&self) -> IoPattern {
        self.0.state.lock().io_pattern
    }

    pub fn set_io_pattern(&self, io_pattern: IoPattern) {
        self.0.state.lock().io_pattern = io_pattern;
    }

    pub fn memtype_is_system(&self) -> bool {
        self.0.state.lock().memtype_is_system
    }

    /// Moves every side of this task to system or video memory.
    pub fn set_memtype_is_system(&self, is_system: bool) {
        let mut state = self.0.state.lock();
        state.memtype_is_system = is_system;

        let pattern = state.io_pattern;
        state.io_pattern = rewrite_side(pattern, IoPattern::IN_MASK, is_system);
        state.io_pattern = rewrite_side(state.io_pattern, IoPattern::OUT_MASK, is_system);

        let task_type = self.0.task_type;
        if let Some(request) = state.request.as_mut() {
            request.memory_type = rewrite_memory_type(request.memory_type, task_type, is_system);
        }
    }

    /// Moves the output side of this task to system or video memory.
    pub(crate) fn apply_output_memtype(&self, is_system: bool) {
        let mut state = self.0.state.lock();
        state.memtype_is_system = is_system;
        state.io_pattern = rewrite_side(state.io_pattern, IoPattern::OUT_MASK, is_system);

        let task_type = self.0.task_type;
        if let Some(request) = state.request.as_mut() {
            request.memory_type = rewrite_memory_type(request.memory_type, task_type, is_system);
        }
    }

    /// Returns the next memory id to wrap in a surface, cycling through the task's memory.
    pub fn next_memory_id(&self) -> Option<MemId> {
        let mut state = self.0.state.lock();
        let mid = state.memory_ids.pop_front()?;
        state.memory_ids.push_back(mid);

        Some(mid)
    }

    pub fn memory_ids(&self) -> Vec<MemId> {
        self.0.state.lock().memory_ids.iter().copied().collect()
    }

    pub(crate) fn push_memory_ids(&self, mids: &[MemId]) {
        self.0.state.lock().memory_ids.extend(mids.iter().copied());
    }

    pub(crate) fn forget_memory_ids(&self, mids: &[MemId]) {
        self.0.state.lock().memory_ids.retain(|mid| !mids.contains(mid));
    }

    pub(crate) fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.0.ledger.lock()
    }

    pub fn saved_response_count(&self) -> usize {
        self.0.ledger.lock().len()
    }

    pub fn latest_response(&self) -> Option<FrameAllocResponse> {
        self.0.ledger.lock().latest_response().cloned()
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        ObjectRef::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("type", &self.0.task_type)
            .field("session", &self.0.session.handle())
            .field("is_joined", &self.0.is_joined)
            .finish()
    }
}

/// Rewrites the side of `pattern` selected by `mask` to system or video memory. Sides the task
/// doesn't have are left alone.
fn rewrite_side(pattern: IoPattern, mask: IoPattern, is_system: bool) -> IoPattern {
    if !pattern.intersects(mask) {
        return pattern;
    }

    let side = if is_system {
        mask & (IoPattern::IN_SYSTEM_MEMORY | IoPattern::OUT_SYSTEM_MEMORY)
    } else {
        mask & (IoPattern::IN_VIDEO_MEMORY | IoPattern::OUT_VIDEO_MEMORY)
    };

    (pattern - mask) | side
}

fn rewrite_memory_type(
    memory_type: MemoryType,
    task_type: TaskType,
    is_system: bool,
) -> MemoryType {
    let base = memory_type - MemoryType::VIDEO_MEMORY - MemoryType::SYSTEM_MEMORY;

    if is_system {
        base | MemoryType::SYSTEM_MEMORY
    } else if task_type.contains(TaskType::DECODER) {
        base | MemoryType::VIDEO_MEMORY_DECODER_TARGET
    } else {
        base | MemoryType::VIDEO_MEMORY_PROCESSOR_TARGET
    }
}
