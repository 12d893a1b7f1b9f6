// ulib/src/lib.rs
//
// User-space library for the exokernel: process duplication done
// entirely in user mode.
//
//   duppage   per-page duplication policy
//   pgfault   copy-on-write fault handler and its registration
//   fork      fork (copy-on-write) and sfork (shared memory)
//   process   program runtime: thisenv, libmain
//   error     ForkError and the primitive that failed
//
// Generic over the kernel interface, so it runs against anything that
// implements the `kern::abi` traits.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod duppage;
pub mod error;
pub mod fork;
pub mod pgfault;
pub mod process;

pub use duppage::{Duplication, PageClass, PageRole, Policy};
pub use error::{ForkError, Primitive};
pub use fork::{fork, sfork};
pub use pgfault::{cow_fault, handle_cow_fault, set_pgfault_handler};
pub use process::{UserProcess, libmain};
