//! SegOS - the kernel core of a small segmentation-isolated operating system
//!
//! This crate implements the protected-mode core: a fixed-pool heap
//! allocator, segment descriptor tables (per-task isolation without
//! paging), interrupt dispatch, a round-robin task scheduler, a software
//! interrupt syscall gateway, and a flat-image process loader.

#![no_std]
// Kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Descriptor packing uses explicit bit shifts for documentation
#![allow(clippy::identity_op)]
// Kernel code needs explicit casts at hardware boundaries
#![allow(clippy::unnecessary_cast)]

#[cfg(test)]
extern crate std;

// Core types
pub mod types;

// Hardware glue
pub mod arch;

// Console and panic plumbing
pub mod console;
pub mod panic;

// Memory management
pub mod heap;

// Segmentation and interrupts
pub mod descriptor;
pub mod interrupt;

// Tasking
pub mod scheduler;
pub mod task;

// Syscall gateway and process loading
pub mod exec;
pub mod syscall;

// Filesystem collaborator interface
pub mod fs;

// Boot sequence
pub mod startup;
