//! Brings up the Ebb runtime and runs an application on it.
//!
//! Each core is a host thread bound to a [`CpuId`] and NUMA node. Bring-up
//! builds the subsystems in dependency order on the booting thread:
//!
//! 1. the logger,
//! 2. the early page allocator, fed with the configured memory minus reserved ranges,
//! 3. the memory map and the buddy page allocator, which drains the early allocator,
//! 4. the general-purpose slab allocator,
//! 5. the local id map, holding the allocators under their static ids,
//! 6. the Ebb id allocator,
//! 7. the virtual memory allocator and page table,
//! 8. the event manager, the timer and the global id map.
//!
//! Every representative an Ebb fault handler builds is charged to the
//! general-purpose allocator on the building core's node, and the charge is
//! returned when that core shuts down.
//!
//! Then every core thread starts its event loop, and [`Runtime::run()`]
//! hands the application's entry point to the bootstrap core.

#[macro_use] extern crate log;

mod config;

pub use config::{RuntimeConfig, DEFAULT_MEMORY_SIZE};

use core::{alloc::Layout, future::Future};
use cpu::CpuId;
use early_page_allocator::EarlyPageAllocator;
use ebb::{shared, LocalIdMap};
use ebb_allocator::EbbAllocator;
use ebb_id::{EbbId, EBB_ALLOCATOR_ID, GP_ALLOCATOR_ID, PAGE_ALLOCATOR_ID, VMEM_ALLOCATOR_ID};
use event_manager::{EventManagerRoot, StackSource, TaskHandle};
use gp_allocator::GpAllocator;
use mem_map::MemMap;
use memory_structs::{Frame, FrameRange, Nid, PhysicalAddress};
use page_allocator::PageAllocator;
use std::{
    any::Any,
    sync::{mpsc, Arc},
    thread::{self, JoinHandle},
};
use vmem_allocator::{PageTable, VMemAllocator};

/// The subsystems of a booted runtime, cheap to clone and send to any core.
#[derive(Clone)]
pub struct Handle {
    local_id_map: Arc<LocalIdMap>,
    page_allocator: Arc<PageAllocator>,
    gp_allocator: Arc<GpAllocator>,
    vmem: Arc<VMemAllocator>,
    page_table: Arc<PageTable>,
    events: Arc<EventManagerRoot>,
    core_nodes: Arc<[Nid]>,
}

impl Handle {
    pub fn num_cores(&self) -> usize {
        self.core_nodes.len()
    }

    /// Returns the NUMA node core `cpu` sits on.
    pub fn node_of(&self, cpu: CpuId) -> Option<Nid> {
        self.core_nodes.get(cpu.index()).copied()
    }

    pub fn local_id_map(&self) -> &Arc<LocalIdMap> {
        &self.local_id_map
    }

    pub fn page_allocator(&self) -> &Arc<PageAllocator> {
        &self.page_allocator
    }

    pub fn gp_allocator(&self) -> &Arc<GpAllocator> {
        &self.gp_allocator
    }

    pub fn vmem_allocator(&self) -> &Arc<VMemAllocator> {
        &self.vmem
    }

    pub fn page_table(&self) -> &Arc<PageTable> {
        &self.page_table
    }

    /// Runs `future` as an event on core `cpu`.
    pub fn spawn_on<F>(&self, future: F, cpu: CpuId) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.events.spawn_remote(future, cpu)
    }
}

/// A booted runtime whose cores are processing events.
///
/// Dropping it shuts every core down.
pub struct Runtime {
    handle: Handle,
    threads: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Builds every subsystem described by `config` and starts the cores.
    pub fn boot(config: RuntimeConfig) -> Result<Runtime, &'static str> {
        config.validate()?;
        logger::init(config.log_level)?;
        let memory = config.memory_regions();
        let num_nodes = config.num_nodes();
        info!("runtime: booting {} cores on {} nodes", config.num_cores(), num_nodes);

        let early = EarlyPageAllocator::new();
        for &(start, end) in config.reserved.iter() {
            early.reserve_range(start, end);
        }
        for &(start, length, nid) in memory.iter() {
            early.free_memory_range(start, length, nid)?;
        }

        let mem_map = Arc::new(MemMap::new(memory.iter().map(|&(start, length, nid)| {
            (FrameRange::new(Frame::round_up(start), Frame::containing_address(start + length)), nid)
        }))?);
        let page_allocator = Arc::new(PageAllocator::from_early(&early, mem_map, num_nodes)?);
        let gp_allocator = Arc::new(GpAllocator::with_default_classes(page_allocator.clone(), &config.core_nodes)?);

        let map = Arc::new(LocalIdMap::new());
        ebb::set_rep_allocator(charge_rep, release_rep);
        register(&map, PAGE_ALLOCATOR_ID, page_allocator.clone())?;
        register(&map, GP_ALLOCATOR_ID, gp_allocator.clone())?;

        let ebb_allocator = Arc::new(EbbAllocator::new());
        ebb_allocator.set_id_space(config.id_space)?;
        shared::install(&map, EBB_ALLOCATOR_ID, ebb_allocator)?;

        let vmem = Arc::new(VMemAllocator::new());
        let page_table = Arc::new(PageTable::new());
        register(&map, VMEM_ALLOCATOR_ID, vmem.clone())?;

        let events = event_manager::init(&map, EventManagerRoot::new(config.num_cores())?.with_stacks(StackSource {
            vmem: vmem.clone(),
            page_table: page_table.clone(),
            page_allocator: page_allocator.clone(),
        }))?;
        timer::init(&map)?;
        global_id_map::init(&map, CpuId::bootstrap())?;

        let handle = Handle {
            local_id_map: map,
            page_allocator,
            gp_allocator,
            vmem,
            page_table,
            events,
            core_nodes: config.core_nodes.clone().into(),
        };
        let mut runtime = Runtime { handle, threads: Vec::with_capacity(config.num_cores()) };
        for (i, &nid) in config.core_nodes.iter().enumerate() {
            let cpu = CpuId::new(i as u32).ok_or("Runtime::boot(): core number out of range")?;
            // a failed spawn drops `runtime`, which stops the cores already started
            let thread = start_core(cpu, nid, runtime.handle.local_id_map.clone())?;
            runtime.threads.push(thread);
        }
        info!("runtime: all {} cores started", runtime.threads.len());
        Ok(runtime)
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `entry` once as an event on the bootstrap core, waits for the
    /// future it returns, then shuts the runtime down and returns its output.
    pub fn run<T, F, Fut>(mut self, entry: F) -> Result<T, &'static str>
    where
        T: Send + 'static,
        F: FnOnce(Handle) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let handle = self.handle.clone();
        self.handle.spawn_on(async move {
            let _ = tx.send(entry(handle).await);
        }, CpuId::bootstrap());
        // the sender is dropped without sending if the bootstrap core died
        let ret = rx.recv().map_err(|_| "Runtime::run(): the entry point did not complete");
        self.stop_cores()?;
        ret
    }

    /// Stops every core and waits for its thread to exit.
    pub fn shutdown(mut self) -> Result<(), &'static str> {
        self.stop_cores()
    }

    fn stop_cores(&mut self) -> Result<(), &'static str> {
        self.handle.events.shutdown();
        let mut ret = Ok(());
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                error!("runtime: a core thread panicked");
                ret = Err("runtime: a core thread panicked");
            }
        }
        ret
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            let _ = self.stop_cores();
        }
    }
}

fn register<T: Any + Send + Sync>(map: &LocalIdMap, id: EbbId, service: Arc<T>) -> Result<(), &'static str> {
    if map.insert(id, service) {
        Ok(())
    } else {
        Err("Runtime::boot(): static id registered twice")
    }
}

fn charge_rep(map: &LocalIdMap, layout: Layout) -> Result<usize, &'static str> {
    let gp = map.find_as::<GpAllocator>(GP_ALLOCATOR_ID).ok_or("no general-purpose allocator registered")?;
    let obj = gp.try_alloc(layout.size().max(layout.align()), Nid::ANY)?;
    Ok(obj.value())
}

fn release_rep(map: &LocalIdMap, addr: usize) {
    let freed = map.find_as::<GpAllocator>(GP_ALLOCATOR_ID)
        .ok_or("no general-purpose allocator registered")
        .and_then(|gp| gp.free(PhysicalAddress::new(addr)));
    if let Err(e) = freed {
        error!("runtime: lost the charge for a representative at {:#X}: {}", addr, e);
    }
}

fn start_core(cpu: CpuId, nid: Nid, map: Arc<LocalIdMap>) -> Result<JoinHandle<()>, &'static str> {
    thread::Builder::new()
        .name(format!("core{}", cpu.value()))
        .spawn(move || {
            if let Err(e) = cpu::bind_current(cpu, nid).and_then(|_| ebb::bind_core(map)) {
                error!("runtime: {:?} failed to come up: {}", cpu, e);
                return;
            }
            event_manager::start_processing_events();
            ebb::unbind_core();
            cpu::unbind_current();
        })
        .map_err(|_| "Runtime::boot(): failed to spawn a core thread")
}

/// Returns the buddy page allocator, registered under [`PAGE_ALLOCATOR_ID`].
pub fn page_allocator() -> Arc<PageAllocator> {
    static_service(PAGE_ALLOCATOR_ID)
}

/// Returns the general-purpose allocator, registered under [`GP_ALLOCATOR_ID`].
pub fn gp_allocator() -> Arc<GpAllocator> {
    static_service(GP_ALLOCATOR_ID)
}

/// Returns the virtual memory allocator, registered under [`VMEM_ALLOCATOR_ID`].
pub fn vmem_allocator() -> Arc<VMemAllocator> {
    static_service(VMEM_ALLOCATOR_ID)
}

fn static_service<T: Any + Send + Sync>(id: EbbId) -> Arc<T> {
    match ebb::local_id_map().find_as::<T>(id) {
        Some(service) => service,
        None => {
            error!("runtime: nothing of the expected type is registered under {:?}", id);
            panic!("runtime: missing static service");
        }
    }
}
