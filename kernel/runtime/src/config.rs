//! The description of the machine the runtime boots on.

use kernel_config::{ebb::FIRST_GLOBAL_ID_SPACE, memory::MAX_NUMA_NODES, scheduler::MAX_CPUS};
use log::LevelFilter;
use memory_structs::{Nid, PhysicalAddress};

/// Memory given to a runtime whose configuration names none: 64MiB on node 0.
pub const DEFAULT_MEMORY_SIZE: usize = 64 << 20;

/// How many cores to boot, which NUMA node each one sits on, and what
/// physical memory they share.
///
/// ```ignore
/// let config = RuntimeConfig::new()
///     .core_nodes(&[Nid::new(0), Nid::new(1)])
///     .memory(PhysicalAddress::new(0), 32 << 20, Nid::new(0))
///     .memory(PhysicalAddress::new(32 << 20), 32 << 20, Nid::new(1));
/// ```
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub(crate) core_nodes: Vec<Nid>,
    pub(crate) memory: Vec<(PhysicalAddress, usize, Nid)>,
    pub(crate) reserved: Vec<(PhysicalAddress, PhysicalAddress)>,
    pub(crate) id_space: u16,
    pub(crate) log_level: LevelFilter,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            core_nodes: vec![Nid::new(0)],
            memory: Vec::new(),
            reserved: Vec::new(),
            id_space: FIRST_GLOBAL_ID_SPACE,
            log_level: LevelFilter::Warn,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    /// Boots `count` cores, all on node 0.
    pub fn cores(mut self, count: usize) -> RuntimeConfig {
        self.core_nodes = vec![Nid::new(0); count];
        self
    }

    /// Boots one core per entry, core `i` sitting on node `nodes[i]`.
    pub fn core_nodes(mut self, nodes: &[Nid]) -> RuntimeConfig {
        self.core_nodes = nodes.to_vec();
        self
    }

    /// Adds the physical memory `[start, start + length)` on node `nid`.
    pub fn memory(mut self, start: PhysicalAddress, length: usize, nid: Nid) -> RuntimeConfig {
        self.memory.push((start, length, nid));
        self
    }

    /// Keeps the physical addresses `[start, end)` away from every allocator.
    pub fn reserve(mut self, start: PhysicalAddress, end: PhysicalAddress) -> RuntimeConfig {
        self.reserved.push((start, end));
        self
    }

    /// Sets the global id space this node allocates global Ebb ids from.
    pub fn id_space(mut self, space: u16) -> RuntimeConfig {
        self.id_space = space;
        self
    }

    pub fn log_level(mut self, level: LevelFilter) -> RuntimeConfig {
        self.log_level = level;
        self
    }

    pub fn num_cores(&self) -> usize {
        self.core_nodes.len()
    }

    /// Returns the memory regions to boot with, falling back to [`DEFAULT_MEMORY_SIZE`] on node 0.
    pub(crate) fn memory_regions(&self) -> Vec<(PhysicalAddress, usize, Nid)> {
        if self.memory.is_empty() {
            vec![(PhysicalAddress::zero(), DEFAULT_MEMORY_SIZE, Nid::new(0))]
        } else {
            self.memory.clone()
        }
    }

    /// Returns the number of NUMA nodes named by the cores and the memory.
    pub(crate) fn num_nodes(&self) -> usize {
        self.core_nodes.iter().copied()
            .chain(self.memory_regions().into_iter().map(|(_, _, nid)| nid))
            .map(|nid| nid.index() + 1)
            .max()
            .unwrap_or(1)
    }

    pub(crate) fn validate(&self) -> Result<(), &'static str> {
        if self.core_nodes.is_empty() {
            return Err("RuntimeConfig: at least one core is required");
        }
        if self.core_nodes.len() > MAX_CPUS {
            return Err("RuntimeConfig: more cores than MAX_CPUS");
        }
        let memory = self.memory_regions();
        if self.core_nodes.iter().chain(memory.iter().map(|(_, _, nid)| nid)).any(|nid| nid.is_any()) {
            return Err("RuntimeConfig: Nid::ANY does not name a node");
        }
        if self.num_nodes() > MAX_NUMA_NODES {
            return Err("RuntimeConfig: more NUMA nodes than MAX_NUMA_NODES");
        }
        if memory.iter().all(|&(_, length, _)| length == 0) {
            return Err("RuntimeConfig: no physical memory");
        }
        if self.id_space < FIRST_GLOBAL_ID_SPACE {
            return Err("RuntimeConfig: id space overlaps the local ids");
        }
        Ok(())
    }
}
