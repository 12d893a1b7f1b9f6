// kernel/src/lib.rs
//
// A small exokernel, simulated on the host.
//
// The kernel exports raw virtual-memory primitives (page_alloc,
// page_map, page_unmap, exofork, ...) and delivers user page faults to a
// user-registered upcall on a dedicated exception stack.  Everything
// else, fork included, is user code built on top (see the `ulib` crate).
//
// Layout:
//   abi/       what user code sees: flags, ids, errors, traits
//   memlayout  address-space constants
//   memory/    frames, page tables, address spaces
//   env/       environment table, syscalls, MMU + fault delivery
//   kernel     the `Kernel` handle and privileged inspection
//   user       `UserEnv`, the per-environment syscall handle
//   monitor    interactive inspection commands
//   serial     console + log sink

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod abi;
pub mod env;
pub mod kernel;
pub mod memlayout;
pub mod memory;
pub mod monitor;
pub mod serial;
pub mod user;

pub use abi::{
    Abort, EnvId, EnvInfo, EnvStatus, EnvView, ExitReason, FaultCode, MemFault, PageTableView,
    PgfaultUpcall, Pte, PteFlags, PteLookup, Role, SysError, SysResult, Syscalls, UTrapframe,
    UserMemory,
};
pub use kernel::{EnvSummary, Kernel, KernelConfig};
pub use monitor::Monitor;
pub use user::UserEnv;
