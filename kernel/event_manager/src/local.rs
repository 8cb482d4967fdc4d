//! State only the owning core touches, kept in a thread-local so the run
//! queue needs no lock.

use crate::{idle::IdleFn, root::EventManagerRoot, task::Task};
use core::cell::RefCell;
use cpu::CpuId;
use hashbrown::HashMap;
use std::{collections::VecDeque, rc::Rc, sync::Arc};
use time::Instant;

pub(crate) type VectorFn = Rc<RefCell<dyn FnMut()>>;

pub(crate) struct RcuCallback {
    pub(crate) snapshot: Vec<u64>,
    pub(crate) callback: Box<dyn FnOnce()>,
}

pub(crate) struct LocalState {
    pub(crate) root: Arc<EventManagerRoot>,
    pub(crate) cpu: CpuId,
    pub(crate) tasks: VecDeque<Arc<Task>>,
    pub(crate) vectors: HashMap<u8, VectorFn>,
    pub(crate) idle: Option<IdleFn>,
    pub(crate) rcu: VecDeque<RcuCallback>,
    /// The tasks being polled, innermost last. Synchronous spawns nest.
    pub(crate) current: Vec<Arc<Task>>,
    /// The event id reported outside of any task.
    pub(crate) loop_event_id: u32,
    pub(crate) alarm: Option<(Instant, u8)>,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalState>> = RefCell::new(None);
}

/// Sets up the calling core's local state.
pub(crate) fn install(root: Arc<EventManagerRoot>, cpu: CpuId) {
    let loop_event_id = root.core(cpu).next_event_id();
    LOCAL.with(|local| {
        let mut local = local.borrow_mut();
        if local.is_some() {
            warn!("event manager: local state of {:?} installed twice", cpu);
        }
        *local = Some(LocalState {
            root,
            cpu,
            tasks: VecDeque::new(),
            vectors: HashMap::new(),
            idle: None,
            rcu: VecDeque::new(),
            current: Vec::new(),
            loop_event_id,
            alarm: None,
        });
    });
}

/// Drops the calling core's local state, along with every queued task.
pub(crate) fn uninstall() {
    let old = LOCAL.with(|local| local.borrow_mut().take());
    drop(old);
}

pub(crate) fn try_with_local<R, F: FnOnce(&mut LocalState) -> R>(f: F) -> Option<R> {
    LOCAL.with(|local| local.borrow_mut().as_mut().map(f))
}

/// Runs `f` on the calling core's local state.
///
/// The borrow is held while `f` runs, so `f` must not call back into the event manager.
pub(crate) fn with_local<R, F: FnOnce(&mut LocalState) -> R>(f: F) -> R {
    match try_with_local(f) {
        Some(ret) => ret,
        None => {
            error!("the event manager is not running on this thread");
            panic!("event manager: no local state on this thread");
        }
    }
}

/// Appends `task` to the local run queue. Returns false if this thread has no event manager.
pub(crate) fn push_local(task: Arc<Task>) -> bool {
    LOCAL.with(|local| match local.try_borrow_mut() {
        Ok(mut local) => match local.as_mut() {
            Some(state) => {
                state.tasks.push_back(task);
                true
            }
            None => false,
        },
        Err(_) => false,
    })
}

pub(crate) fn pop_local() -> Option<Arc<Task>> {
    try_with_local(|l| l.tasks.pop_front()).flatten()
}

pub(crate) fn current_task() -> Option<Arc<Task>> {
    try_with_local(|l| l.current.last().cloned()).flatten()
}

/// Runs `f` with `task` recorded as the current task.
pub(crate) fn with_current_task<R, F: FnOnce() -> R>(task: &Arc<Task>, f: F) -> R {
    try_with_local(|l| l.current.push(task.clone()));
    let ret = f();
    try_with_local(|l| l.current.pop());
    ret
}

/// Invokes the callback registered for `vector`.
pub(crate) fn dispatch_vector(vector: u8) -> bool {
    match try_with_local(|l| l.vectors.get(&vector).cloned()).flatten() {
        Some(callback) => {
            (&mut *callback.borrow_mut())();
            true
        }
        None => false,
    }
}
