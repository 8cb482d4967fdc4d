//! Compile-time configuration of the Ebb runtime.
//!
//! * [`memory`]: page size, buddy orders, slab limits and the virtual memory layout.
//! * [`ebb`]: layout of the Ebb id space.
//! * [`scheduler`]: event manager vectors and tunables.

#![no_std]

pub mod memory;
pub mod ebb;
pub mod scheduler;
