//! rvtiny: process and memory management for a small preemptible RISC-V
//! kernel.
//!
//! Boot code builds one [`kernel::Kernel`] over the page pool and a board
//! [`hal::Hal`], spawns the first programs and enters the scheduler. From
//! then on the trap stub calls [`kernel::Kernel::handle_trap`] for every trap.

#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]

pub mod abi;
pub mod addr;
pub mod arch;
pub mod cpu;
pub mod error;
pub mod exec;
pub mod file;
pub mod hal;
pub mod kalloc;
pub mod kernel;
pub mod klog;
pub mod lock;
pub mod page;
pub mod param;
pub mod pipe;
pub mod pmp;
pub mod proc;
pub mod syscall;
pub mod trap;
pub mod vm;

#[cfg(all(not(test), target_os = "none"))]
mod panic;

#[cfg(test)]
mod testutil;
