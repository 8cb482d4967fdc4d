//! State of the event manager that every core can reach.

use crate::task::{BoxFuture, Task, TaskHandle};
use core::{
    future::Future,
    sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering},
};
use cpu::CpuId;
use cpu_local::CpuLocal;
use kernel_config::scheduler::{EVENT_ID_CPU_SHIFT, FIRST_FREE_VECTOR, IPI_VECTOR};
use memory_structs::PageRange;
use page_allocator::PageAllocator;
use spin::{Mutex, Once};
use std::{collections::VecDeque, sync::Arc, thread::Thread};
use vmem_allocator::{PageTable, VMemAllocator};

/// Where the event stacks of the cores come from.
pub struct StackSource {
    pub vmem: Arc<VMemAllocator>,
    pub page_table: Arc<PageTable>,
    pub page_allocator: Arc<PageAllocator>,
}

/// The parts of one core's event manager that other cores touch.
pub(crate) struct CoreShared {
    cpu: CpuId,
    remote: Mutex<VecDeque<Arc<Task>>>,
    interrupts: Mutex<VecDeque<u8>>,
    ipi_pending: AtomicBool,
    thread: Once<Thread>,
    next_event_id: AtomicU32,
    next_vector: AtomicU16,
    /// Bumped every time the core passes a quiescent point.
    quiescent: AtomicU64,
    halted: AtomicBool,
    running: AtomicBool,
    stack: Once<PageRange>,
}

impl CoreShared {
    fn new(cpu: CpuId) -> CoreShared {
        CoreShared {
            cpu,
            remote: Mutex::new(VecDeque::new()),
            interrupts: Mutex::new(VecDeque::new()),
            ipi_pending: AtomicBool::new(false),
            thread: Once::new(),
            next_event_id: AtomicU32::new(0),
            next_vector: AtomicU16::new(FIRST_FREE_VECTOR as u16),
            quiescent: AtomicU64::new(0),
            halted: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stack: Once::new(),
        }
    }

    /// Returns a fresh event id, which carries this core's number in its top bits.
    pub(crate) fn next_event_id(&self) -> u32 {
        let counter = self.next_event_id.fetch_add(1, Ordering::Relaxed) & ((1 << EVENT_ID_CPU_SHIFT) - 1);
        (self.cpu.value() << EVENT_ID_CPU_SHIFT) | counter
    }

    pub(crate) fn allocate_vector(&self) -> Option<u8> {
        let vector = self.next_vector.fetch_add(1, Ordering::Relaxed);
        u8::try_from(vector).ok()
    }

    /// Posts `vector` to this core and wakes it.
    pub(crate) fn raise(&self, vector: u8) {
        self.interrupts.lock().push_back(vector);
        self.unpark();
    }

    pub(crate) fn take_interrupts(&self) -> VecDeque<u8> {
        core::mem::take(&mut *self.interrupts.lock())
    }

    pub(crate) fn has_interrupts(&self) -> bool {
        !self.interrupts.lock().is_empty()
    }

    /// Empties the remote queue. Called by the owning core when the IPI vector fires.
    pub(crate) fn take_remote(&self) -> VecDeque<Arc<Task>> {
        self.ipi_pending.store(false, Ordering::SeqCst);
        core::mem::take(&mut *self.remote.lock())
    }

    fn push_remote(&self, task: Arc<Task>) {
        self.remote.lock().push_back(task);
        if !self.ipi_pending.swap(true, Ordering::SeqCst) {
            self.raise(IPI_VECTOR);
        }
    }

    pub(crate) fn register_thread(&self, thread: Thread) {
        self.thread.call_once(|| thread);
        self.running.store(true, Ordering::SeqCst);
    }

    pub(crate) fn unpark(&self) {
        if let Some(thread) = self.thread.get() {
            thread.unpark();
        }
    }

    pub(crate) fn pass_quiescent_point(&self) {
        self.quiescent.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn set_halted(&self, halted: bool) {
        self.halted.store(halted, Ordering::SeqCst);
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.remote.lock().clear();
        self.interrupts.lock().clear();
    }

    pub(crate) fn set_stack(&self, stack: PageRange) {
        self.stack.call_once(|| stack);
    }
}

/// The root of the event manager Ebb, shared by the representatives of all cores.
pub struct EventManagerRoot {
    cores: CpuLocal<CoreShared>,
    shutdown: AtomicBool,
    stacks: Option<StackSource>,
}

impl EventManagerRoot {
    pub fn new(num_cores: usize) -> Result<EventManagerRoot, &'static str> {
        if num_cores == 0 {
            return Err("EventManagerRoot::new(): need at least one core");
        }
        Ok(EventManagerRoot {
            cores: CpuLocal::new_with(num_cores, CoreShared::new)?,
            shutdown: AtomicBool::new(false),
            stacks: None,
        })
    }

    /// Gives every core an event stack from `stacks` when it starts processing events.
    pub fn with_stacks(mut self, stacks: StackSource) -> EventManagerRoot {
        self.stacks = Some(stacks);
        self
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub(crate) fn stacks(&self) -> Option<&StackSource> {
        self.stacks.as_ref()
    }

    pub(crate) fn core(&self, cpu: CpuId) -> &CoreShared {
        match self.cores.get(cpu) {
            Some(core) => core,
            None => {
                error!("event manager: {:?} is not one of the {} cores", cpu, self.cores.len());
                panic!("event manager: no such core");
            }
        }
    }

    /// Queues `future` as a new task on `cpu` and interrupts that core.
    ///
    /// This may be called from any thread, including ones that are not cores.
    pub fn spawn_remote<F>(self: &Arc<Self>, future: F, cpu: CpuId) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let core = self.core(cpu);
        let future: BoxFuture = Box::pin(future);
        let task = Task::new(self.clone(), cpu, core.next_event_id(), future);
        trace!("spawning event {:#X} on {:?}", task.event_id(), cpu);
        task.claim();
        core.push_remote(task.clone());
        TaskHandle::new(task)
    }

    pub(crate) fn push_remote(&self, task: Arc<Task>) {
        self.core(task.cpu()).push_remote(task);
    }

    /// Delivers interrupt `vector` to `cpu`.
    pub fn raise_interrupt(&self, cpu: CpuId, vector: u8) -> Result<(), &'static str> {
        let core = self.cores.get(cpu).ok_or("raise_interrupt(): no such core")?;
        core.raise(vector);
        Ok(())
    }

    /// Tells every core to leave its event loop.
    pub fn shutdown(&self) {
        info!("event manager: shutting down {} cores", self.cores.len());
        self.shutdown.store(true, Ordering::SeqCst);
        for (_, core) in self.cores.iter() {
            core.unpark();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// The event stack of `cpu`, once that core has started.
    pub fn event_stack(&self, cpu: CpuId) -> Option<PageRange> {
        self.cores.get(cpu).and_then(|core| core.stack.get().copied())
    }

    /// Reads the quiescent counter of every core.
    pub(crate) fn quiescent_snapshot(&self) -> Vec<u64> {
        self.cores.iter().map(|(_, core)| core.quiescent.load(Ordering::SeqCst)).collect()
    }

    /// Returns true once every core has passed a quiescent point since `snapshot` was taken.
    ///
    /// Cores that are halted or not running hold no references and count as quiescent.
    pub(crate) fn grace_period_elapsed(&self, snapshot: &[u64]) -> bool {
        self.cores.iter().zip(snapshot).all(|((_, core), &seen)| {
            !core.running.load(Ordering::SeqCst)
                || core.halted.load(Ordering::SeqCst)
                || core.quiescent.load(Ordering::SeqCst) > seen
        })
    }
}
