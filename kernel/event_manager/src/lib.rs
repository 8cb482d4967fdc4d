//! The event manager: one cooperative event loop per core.
//!
//! Work is expressed as tasks (futures) that run to their next suspension
//! point without preemption. Each core owns a local FIFO run queue that only
//! it touches, and a remote queue behind a lock that other cores append to
//! before raising the core's [`IPI_VECTOR`]. A task always runs on the core
//! it was spawned on.
//!
//! When a core has nothing to do it runs its [`IdleCallback`] if one is
//! started, and otherwise halts until an interrupt arrives. Between tasks and
//! while halted a core is quiescent, which is what [`EventManager::do_rcu()`]
//! waits for. [`RcuHashTable`] builds lock-free reads on top of it.
//!
//! The event manager is a multicore Ebb under [`EVENT_MANAGER_ID`]: the
//! [`EventManagerRoot`] is shared by all cores, and each core's
//! representative is created the first time that core uses it.

#[macro_use] extern crate log;

mod context;
mod idle;
mod local;
mod promise;
mod rcu_table;
mod root;
mod task;
#[cfg(test)]
mod test;

pub use context::{Activator, EventContext, SaveContext};
pub use idle::IdleCallback;
pub use promise::{promise, Promise, PromiseFuture};
pub use rcu_table::RcuHashTable;
pub use root::{EventManagerRoot, StackSource};
pub use task::{TaskHandle, TaskState, TlsMap};

use core::{future::Future, time::Duration};
use cpu::CpuId;
use ebb::{multicore::{self, MulticoreEbb, MulticoreRoot}, Ebb, EbbId, EbbRef, LocalIdMap};
use ebb_id::EVENT_MANAGER_ID;
use kernel_config::{
    memory::STACK_PAGES,
    scheduler::{HALT_TIMEOUT, IPI_VECTOR, RCU_POLL_INTERVAL},
};
use local::RcuCallback;
use memory_structs::VirtualAddress;
use std::{rc::Rc, sync::Arc};
use task::{BoxFuture, Task};
use time::Instant;
use vmem_allocator::StackFaultHandler;

pub const EVENT_MANAGER: EbbRef<EventManager> = EbbRef::new(EVENT_MANAGER_ID);

/// Registers the event manager of all cores described by `root`.
pub fn init(map: &LocalIdMap, root: EventManagerRoot) -> Result<Arc<EventManagerRoot>, &'static str> {
    let root = Arc::new(root);
    multicore::create::<EventManager>(map, EVENT_MANAGER_ID, root.clone())?;
    Ok(root)
}

/// A core's representative of the event manager.
pub struct EventManager {
    cpu: CpuId,
    root: Arc<EventManagerRoot>,
}

impl MulticoreEbb for EventManager {
    type Root = Arc<EventManagerRoot>;

    fn create_rep(root: &Arc<MulticoreRoot<EventManager, Arc<EventManagerRoot>>>) -> EventManager {
        let cpu = cpu::current_cpu();
        let root = root.root().clone();
        local::install(root.clone(), cpu);
        debug!("event manager: created representative for {:?}", cpu);
        EventManager { cpu, root }
    }
}

impl Ebb for EventManager {
    fn handle_fault(id: EbbId) -> Arc<EventManager> {
        multicore::handle_fault(id)
    }
}

impl EventManager {
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    pub fn root(&self) -> &Arc<EventManagerRoot> {
        &self.root
    }

    /// Spawns `future` on this core and runs it right away, up to its first suspension.
    pub fn spawn<F>(&self, future: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn_local(future, false)
    }

    /// Spawns `future` on this core.
    ///
    /// If `force_async` is false the task is polled immediately, before this
    /// function returns, until it first suspends or completes. Otherwise it
    /// is appended to the local run queue.
    pub fn spawn_local<F>(&self, future: F, force_async: bool) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let future: BoxFuture = Box::pin(future);
        let task = Task::new(self.root.clone(), self.cpu, self.root.core(self.cpu).next_event_id(), future);
        if force_async {
            task.schedule();
        } else {
            task.claim();
            task.run();
        }
        TaskHandle::new(task)
    }

    /// Spawns `future` on core `cpu`.
    pub fn spawn_remote<F>(&self, future: F, cpu: CpuId) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.root.spawn_remote(future, cpu)
    }

    /// Registers `callback` for a fresh interrupt vector of this core and returns the vector.
    ///
    /// Callbacks run on the event loop between tasks and must not block.
    pub fn allocate_vector<F: FnMut() + 'static>(&self, callback: F) -> u8 {
        let vector = match self.root.core(self.cpu).allocate_vector() {
            Some(v) => v,
            None => {
                error!("event manager: {:?} ran out of interrupt vectors", self.cpu);
                panic!("event manager: out of interrupt vectors");
            }
        };
        let callback: local::VectorFn = Rc::new(core::cell::RefCell::new(callback));
        local::with_local(|l| l.vectors.insert(vector, callback));
        debug!("event manager: allocated vector {} on {:?}", vector, self.cpu);
        vector
    }

    pub fn raise_interrupt(&self, cpu: CpuId, vector: u8) -> Result<(), &'static str> {
        self.root.raise_interrupt(cpu, vector)
    }

    /// Raises `vector` on this core once `deadline` has passed, replacing any earlier alarm.
    pub fn set_alarm(&self, vector: u8, deadline: Instant) {
        local::with_local(|l| l.alarm = Some((deadline, vector)));
    }

    pub fn clear_alarm(&self) {
        local::with_local(|l| l.alarm = None);
    }

    pub fn alarm(&self) -> Option<Instant> {
        local::with_local(|l| l.alarm.map(|(deadline, _)| deadline))
    }

    /// Runs `callback` on this core once every core has passed a quiescent point.
    pub fn do_rcu<F: FnOnce() + 'static>(&self, callback: F) {
        let snapshot = self.root.quiescent_snapshot();
        local::with_local(|l| l.rcu.push_back(RcuCallback { snapshot, callback: Box::new(callback) }));
    }

    /// Like [`do_rcu()`](Self::do_rcu), but returns a future for the callback's result.
    pub fn call_rcu<R, F>(&self, f: F) -> PromiseFuture<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + 'static,
    {
        let (promise, future) = promise();
        self.do_rcu(move || promise.set_value(f()));
        future
    }

    /// Runs this core's event loop until the runtime shuts down.
    pub fn process(&self) {
        let core = self.root.core(self.cpu);
        core.register_thread(std::thread::current());
        self.allocate_stack();
        info!("event manager: {:?} processing events", self.cpu);

        while !self.root.is_shutdown() {
            core.set_halted(false);
            self.service_interrupts();
            self.fire_alarm();

            if let Some(task) = local::pop_local() {
                task.run();
                core.pass_quiescent_point();
                continue;
            }
            if self.run_rcu_callbacks() {
                continue;
            }
            if let Some(idle) = local::try_with_local(|l| l.idle.clone()).flatten() {
                (&mut *idle.lock())();
                core.pass_quiescent_point();
                continue;
            }
            self.halt();
        }

        core.stop();
        local::uninstall();
        info!("event manager: {:?} stopped", self.cpu);
    }

    fn allocate_stack(&self) {
        let stacks = match self.root.stacks() {
            Some(s) => s,
            None => return,
        };
        let handler = Arc::new(StackFaultHandler::new(
            stacks.page_table.clone(),
            stacks.page_allocator.clone(),
            cpu::current_node(),
        ));
        let range = stacks.vmem.alloc(STACK_PAGES, Some(handler));
        // the stack grows down, so the first touch is just below the top
        stacks.vmem.handle_page_fault(VirtualAddress::new(range.end().start_address().value() - 1));
        self.root.core(self.cpu).set_stack(range);
    }

    fn service_interrupts(&self) {
        let core = self.root.core(self.cpu);
        for vector in core.take_interrupts() {
            if vector == IPI_VECTOR {
                let remote = core.take_remote();
                local::with_local(|l| l.tasks.extend(remote));
            }
            if !local::dispatch_vector(vector) && vector != IPI_VECTOR {
                warn!("event manager: spurious interrupt {} on {:?}", vector, self.cpu);
            }
        }
    }

    fn fire_alarm(&self) {
        let now = Instant::now();
        let due = local::with_local(|l| match l.alarm {
            Some((deadline, vector)) if deadline <= now => {
                l.alarm = None;
                Some(vector)
            }
            _ => None,
        });
        if let Some(vector) = due {
            local::dispatch_vector(vector);
        }
    }

    /// Runs the RCU callbacks whose grace period has ended. Returns true if any ran.
    fn run_rcu_callbacks(&self) -> bool {
        let mut ran = false;
        loop {
            let ready = local::with_local(|l| {
                let elapsed = l.rcu.front().map_or(false, |cb| self.root.grace_period_elapsed(&cb.snapshot));
                if elapsed { l.rcu.pop_front() } else { None }
            });
            match ready {
                Some(cb) => {
                    (cb.callback)();
                    ran = true;
                }
                None => return ran,
            }
        }
    }

    fn halt(&self) {
        let core = self.root.core(self.cpu);
        core.set_halted(true);
        core.pass_quiescent_point();
        if core.has_interrupts() || self.root.is_shutdown() {
            return;
        }
        let (rcu_pending, alarm) = local::with_local(|l| (!l.rcu.is_empty(), l.alarm));
        let mut timeout = HALT_TIMEOUT;
        if rcu_pending {
            timeout = timeout.min(RCU_POLL_INTERVAL);
        }
        if let Some((deadline, _)) = alarm {
            timeout = timeout.min(deadline.saturating_duration_until());
        }
        if timeout > Duration::ZERO {
            std::thread::park_timeout(timeout);
        }
    }
}

/// Runs the event loop of the calling core. The core must already be bound
/// with `cpu::bind_current()` and `ebb::bind_core()`.
pub fn start_processing_events() {
    EVENT_MANAGER.get().process()
}

/// Returns the id of the running event, which carries the core number in its top bits.
pub fn event_id() -> u32 {
    if let Some(task) = local::current_task() {
        return task.event_id();
    }
    local::with_local(|l| l.loop_event_id)
}

/// Runs `f` on the event-local storage of the running task.
pub fn with_tls_map<R, F: FnOnce(&mut TlsMap) -> R>(f: F) -> R {
    match local::current_task() {
        Some(task) => task.with_tls(f),
        None => {
            error!("with_tls_map() called outside of a task");
            panic!("event manager: no running task");
        }
    }
}

/// Lets the other tasks queued on this core run before continuing.
pub async fn yield_now() {
    let mut yielded = false;
    core::future::poll_fn(move |cx| {
        if yielded {
            core::task::Poll::Ready(())
        } else {
            yielded = true;
            cx.waker().wake_by_ref();
            core::task::Poll::Pending
        }
    })
    .await
}
