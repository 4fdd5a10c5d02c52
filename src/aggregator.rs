// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The task aggregator owns the hardware context shared by every task of a pipeline.
//!
//! The first session it opens becomes the parent session that carries the native display; every
//! later session is joined to it, so all tasks share surfaces without copies.
//!
//! The codec runtime's allocation callbacks carry no task identity. Callers run the runtime entry
//! points that may call back into the allocator inside [`TaskAggregator::dispatch`], which makes
//! the task current for the calling thread only. [`TaskAggregator::set_current_task`] is a
//! fallback for callbacks made from threads the caller doesn't control.

use std::cell::RefCell;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::Mutex;

use crate::allocator::AllocError;
use crate::allocator::FrameAllocator;
use crate::allocator::TaskAllocator;
use crate::backend::DisplayInfo;
use crate::backend::NativeHandle;
use crate::display_cache::DisplayCache;
use crate::object::Finalize;
use crate::object::ObjectRef;
use crate::object::ObjectSlot;
use crate::object::WeakRef;
use crate::runtime::FrameAllocRequest;
use crate::runtime::FrameAllocResponse;
use crate::runtime::FrameData;
use crate::runtime::IoPattern;
use crate::runtime::MemId;
use crate::runtime::SessionOptions;
use crate::session::CodecRuntime;
use crate::session::Session;
use crate::session::SessionError;
use crate::task::Task;
use crate::task::TaskInner;
use crate::task::TaskType;

thread_local! {
    /// Tasks made current by `dispatch` on this thread, innermost last, with the id of their
    /// aggregator.
    static DISPATCH_SCOPES: RefCell<Vec<(u64, Task)>> = const { RefCell::new(Vec::new()) };
}

/// Aggregators bound to each native display.
fn display_cache() -> &'static DisplayCache<AggregatorInner> {
    static CACHE: OnceLock<DisplayCache<AggregatorInner>> = OnceLock::new();
    CACHE.get_or_init(DisplayCache::new)
}

pub struct AggregatorInner {
    id: u64,
    runtime: Arc<dyn CodecRuntime>,
    allocator: Arc<dyn TaskAllocator>,
    display: DisplayInfo,
    options: SessionOptions,
    parent_session: Mutex<Option<Session>>,
    /// Most recently added first.
    tasks: Mutex<Vec<Task>>,
    current: ObjectSlot<TaskInner>,
}

impl Finalize for AggregatorInner {
    fn finalize(&mut self) {
        log::debug!(
            "Finalizing aggregator {} of display {:?} with {} tasks",
            self.id,
            self.display.name,
            self.tasks.get_mut().len()
        );
        self.current.take();
        self.tasks.get_mut().clear();
    }
}

/// Owner of the hardware context shared by the tasks of a pipeline.
#[derive(Clone)]
pub struct TaskAggregator(pub(crate) ObjectRef<AggregatorInner>);

impl TaskAggregator {
    pub fn new(
        runtime: Arc<dyn CodecRuntime>,
        allocator: Arc<dyn TaskAllocator>,
        options: SessionOptions,
    ) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let display = allocator.display();
        Self(ObjectRef::new(AggregatorInner {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            runtime,
            allocator,
            display,
            options,
            parent_session: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            current: ObjectSlot::new(),
        }))
    }

    /// Returns the aggregator already bound to the display of `allocator`, or creates one.
    ///
    /// Elements sharing a device share one aggregator, and thus one hardware context.
    pub fn for_display(
        runtime: Arc<dyn CodecRuntime>,
        allocator: Arc<dyn TaskAllocator>,
        options: SessionOptions,
    ) -> Self {
        let display = allocator.display();
        let inner = display_cache().get_or_insert_with(&display, || {
            log::debug!("Creating aggregator for display {:?}", display.name);
            TaskAggregator::new(runtime, allocator, options).0
        });

        Self(inner)
    }

    pub(crate) fn downgrade(&self) -> WeakRef<AggregatorInner> {
        ObjectRef::downgrade(&self.0)
    }

    pub fn display(&self) -> &DisplayInfo {
        &self.0.display
    }

    pub fn allocator(&self) -> &Arc<dyn TaskAllocator> {
        &self.0.allocator
    }

    pub fn parent_session(&self) -> Option<Session> {
        self.0.parent_session.lock().clone()
    }

    /// Returns the allocator to register with the sessions of this aggregator.
    pub fn frame_allocator(&self) -> Arc<dyn FrameAllocator> {
        Arc::new(CurrentTaskAllocator { aggregator: self.downgrade() })
    }

    /// Opens a new codec session, returning it and whether it was joined to the parent session.
    ///
    /// The first session becomes the parent session and receives the native display handle.
    /// Failures are not retried.
    pub fn init_session_context(&self) -> Result<(Session, bool), SessionError> {
        let result = self.open_session();
        if let Err(e) = &result {
            log::error!("Failed to initialize session context: {}", e);
        }

        result
    }

    fn open_session(&self) -> Result<(Session, bool), SessionError> {
        let mut parent = self.0.parent_session.lock();

        let (session, is_joined) = match parent.as_ref() {
            Some(parent) => (Session::open_joined(parent, &self.0.options)?, true),
            None => {
                let session = Session::open(&self.0.runtime, &self.0.options)?;
                session.set_handle(&self.0.display)?;
                *parent = Some(session.clone());
                (session, false)
            }
        };

        session.set_frame_allocator(self.frame_allocator())?;

        Ok((session, is_joined))
    }

    /// Opens a session and adds a new task of `task_type` running on it.
    pub fn create_task(&self, task_type: TaskType) -> Result<Task, SessionError> {
        let (session, is_joined) = self.init_session_context()?;
        let task = Task::new(self, session, is_joined, task_type);
        self.add_task(&task);

        Ok(task)
    }

    pub fn add_task(&self, task: &Task) {
        self.0.tasks.lock().insert(0, task.clone());
    }

    pub fn remove_task(&self, task: &Task) {
        self.0.tasks.lock().retain(|t| !t.ptr_eq(task));

        if self.0.current.load().is_some_and(|current| ObjectRef::ptr_eq(&current, &task.0)) {
            self.0.current.replace(None);
        }
    }

    /// The most recently added task.
    pub fn get_last_task(&self) -> Option<Task> {
        self.0.tasks.lock().first().cloned()
    }

    /// All tasks, most recently added first.
    pub fn tasks(&self) -> Vec<Task> {
        self.0.tasks.lock().clone()
    }

    /// Returns the task allocation callbacks should be made for on this thread.
    pub fn get_current_task(&self) -> Option<Task> {
        let id = self.0.id;
        let scoped = DISPATCH_SCOPES.with(|scopes| {
            scopes
                .borrow()
                .iter()
                .rev()
                .find(|(aggregator, _)| *aggregator == id)
                .map(|(_, task)| task.clone())
        });

        scoped.or_else(|| self.0.current.load().map(Task))
    }

    /// Sets the fallback current task, used by threads without a dispatch scope.
    pub fn set_current_task(&self, task: Option<&Task>) {
        self.0.current.replace(task.map(|t| &t.0));
    }

    /// Runs `f` with `task` current for this aggregator on the calling thread.
    pub fn dispatch<R>(&self, task: &Task, f: impl FnOnce() -> R) -> R {
        DISPATCH_SCOPES.with(|scopes| scopes.borrow_mut().push((self.0.id, task.clone())));
        let _scope = DispatchScope;

        f()
    }

    /// Propagates a memory type choice from `task` to the tasks upstream of it.
    ///
    /// Each visited peer gets its output side moved to the chosen memory. Propagation continues
    /// only while system memory is chosen. A VPP task decouples its input memory from its output
    /// memory, so past a VPP the choice is whatever the VPP reads.
    pub fn update_peer_memtypes(&self, task: &Task, mut memtype_is_system: bool) {
        let tasks = self.tasks();
        let Some(index) = tasks.iter().position(|t| t.ptr_eq(task)) else {
            log::warn!("Cannot propagate memory type from a task this aggregator doesn't own");
            return;
        };

        for peer in &tasks[index + 1..] {
            log::debug!(
                "Moving output of {:?} to {} memory",
                peer,
                if memtype_is_system { "system" } else { "video" }
            );
            peer.apply_output_memtype(memtype_is_system);

            if peer.has_type(TaskType::VPP) {
                memtype_is_system = peer.io_pattern().contains(IoPattern::IN_SYSTEM_MEMORY);
            }
            if !memtype_is_system {
                break;
            }
        }
    }

    pub fn ptr_eq(&self, other: &TaskAggregator) -> bool {
        ObjectRef::ptr_eq(&self.0, &other.0)
    }
}

struct DispatchScope;

impl Drop for DispatchScope {
    fn drop(&mut self) {
        let _ = DISPATCH_SCOPES.try_with(|scopes| scopes.borrow_mut().pop());
    }
}

/// The allocator registered with the codec runtime, forwarding to the current task.
struct CurrentTaskAllocator {
    aggregator: WeakRef<AggregatorInner>,
}

impl CurrentTaskAllocator {
    fn aggregator(&self) -> Result<TaskAggregator, AllocError> {
        self.aggregator.upgrade().map(TaskAggregator).ok_or(AllocError::NoCurrentTask)
    }

    fn current(&self) -> Result<(TaskAggregator, Task), AllocError> {
        let aggregator = self.aggregator()?;
        let task = aggregator.get_current_task().ok_or(AllocError::NoCurrentTask)?;

        Ok((aggregator, task))
    }
}

impl FrameAllocator for CurrentTaskAllocator {
    fn alloc(&self, request: &FrameAllocRequest) -> Result<FrameAllocResponse, AllocError> {
        let (aggregator, task) = self.current()?;
        aggregator.allocator().alloc(&task, request)
    }

    fn free(&self, response: &FrameAllocResponse) -> Result<(), AllocError> {
        let (aggregator, task) = self.current()?;
        aggregator.allocator().free(&task, response)
    }

    fn lock(&self, mid: MemId, data: &mut FrameData) -> Result<(), AllocError> {
        self.aggregator()?.allocator().lock(mid, data)
    }

    fn unlock(&self, mid: MemId, data: &mut FrameData) -> Result<(), AllocError> {
        self.aggregator()?.allocator().unlock(mid, data)
    }

    fn get_hdl(&self, mid: MemId) -> Result<NativeHandle, AllocError> {
        self.aggregator()?.allocator().get_hdl(mid)
    }
}
