//! Tasks: futures bound to the core they were spawned on.

use crate::{local, root::EventManagerRoot};
use core::{
    any::Any,
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicBool, Ordering},
    task::{Context, Poll, Waker},
};
use cpu::CpuId;
use hashbrown::HashMap;
use spin::Mutex;
use std::{sync::Arc, task::Wake};

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// The per-task map used for event-local storage.
pub type TlsMap = HashMap<u64, Box<dyn Any + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued on its core, waiting to be polled.
    Runnable,
    /// Being polled right now.
    Running,
    /// Waiting for a wakeup, e.g., an activation of a saved context.
    Suspended,
    Completed,
}

pub(crate) struct Task {
    cpu: CpuId,
    event_id: u32,
    root: Arc<EventManagerRoot>,
    future: Mutex<Option<BoxFuture>>,
    state: Mutex<TaskState>,
    /// Set while the task sits in a run queue, so a task is queued at most once.
    queued: AtomicBool,
    tls: Mutex<Option<TlsMap>>,
}

impl Task {
    pub(crate) fn new(root: Arc<EventManagerRoot>, cpu: CpuId, event_id: u32, future: BoxFuture) -> Arc<Task> {
        Arc::new(Task {
            cpu,
            event_id,
            root,
            future: Mutex::new(Some(future)),
            state: Mutex::new(TaskState::Runnable),
            queued: AtomicBool::new(false),
            tls: Mutex::new(None),
        })
    }

    pub(crate) fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub(crate) fn event_id(&self) -> u32 {
        self.event_id
    }

    pub(crate) fn state(&self) -> TaskState {
        *self.state.lock()
    }

    /// Queues the task on its home core: the local run queue if we are on
    /// that core, otherwise the core's remote queue.
    pub(crate) fn schedule(self: &Arc<Self>) {
        if self.queued.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock();
            match *state {
                TaskState::Completed => {
                    self.queued.store(false, Ordering::SeqCst);
                    return;
                }
                TaskState::Suspended => *state = TaskState::Runnable,
                TaskState::Runnable | TaskState::Running => {}
            }
        }
        if cpu::try_current_cpu() == Some(self.cpu) && local::push_local(self.clone()) {
            return;
        }
        self.root.push_remote(self.clone());
    }

    /// Marks the task as queued without putting it on any queue, for tasks
    /// that are about to be polled directly.
    pub(crate) fn claim(&self) {
        self.queued.store(true, Ordering::SeqCst);
    }

    /// Polls the task once on the calling core.
    pub(crate) fn run(self: &Arc<Self>) {
        self.queued.store(false, Ordering::SeqCst);
        let mut slot = self.future.lock();
        let future = match slot.as_mut() {
            Some(f) => f,
            None => return,
        };
        *self.state.lock() = TaskState::Running;

        let waker = Waker::from(self.clone());
        let mut context = Context::from_waker(&waker);
        let poll = local::with_current_task(self, || future.as_mut().poll(&mut context));

        match poll {
            Poll::Ready(()) => {
                *slot = None;
                *self.state.lock() = TaskState::Completed;
                trace!("event {:#X} completed", self.event_id);
            }
            Poll::Pending => {
                let mut state = self.state.lock();
                *state = if self.queued.load(Ordering::SeqCst) {
                    TaskState::Runnable
                } else {
                    TaskState::Suspended
                };
            }
        }
    }

    pub(crate) fn with_tls<R, F: FnOnce(&mut TlsMap) -> R>(&self, f: F) -> R {
        let mut tls = self.tls.lock();
        f(tls.get_or_insert_with(HashMap::new))
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule()
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule()
    }
}

/// A handle to a spawned task, used to observe its progress.
#[derive(Clone)]
pub struct TaskHandle {
    task: Arc<Task>,
}

impl TaskHandle {
    pub(crate) fn new(task: Arc<Task>) -> TaskHandle {
        TaskHandle { task }
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn is_finished(&self) -> bool {
        self.state() == TaskState::Completed
    }

    pub fn event_id(&self) -> u32 {
        self.task.event_id()
    }

    /// The core the task runs on.
    pub fn cpu(&self) -> CpuId {
        self.task.cpu()
    }
}

impl core::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("event_id", &format_args!("{:#X}", self.task.event_id))
            .field("cpu", &self.task.cpu)
            .field("state", &self.state())
            .finish()
    }
}
