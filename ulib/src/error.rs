// ulib/src/error.rs
//
// Everything that can stop a fork or a copy-on-write fault.  None of it
// is recoverable: the caller reports it and the environment dies.

use core::fmt;

use kern::{Abort, EnvId, EnvStatus, FaultCode, MemFault, Pte, PteFlags, SysError, SysResult};
use x86_64::VirtAddr;

/// A kernel primitive together with the arguments it was called with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Exofork,
    PageAlloc {
        env: EnvId,
        va: VirtAddr,
        perm: PteFlags,
    },
    PageMap {
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    },
    PageUnmap {
        env: EnvId,
        va: VirtAddr,
    },
    EnvSetStatus {
        env: EnvId,
        status: EnvStatus,
    },
    EnvSetPgfaultUpcall {
        env: EnvId,
    },
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Primitive::Exofork => f.write_str("sys_exofork()"),
            Primitive::PageAlloc { env, va, perm } => {
                write!(f, "sys_page_alloc({}, {:08x}, {:#x})", env, va.as_u64(), perm.bits())
            }
            Primitive::PageMap {
                src_env,
                src_va,
                dst_env,
                dst_va,
                perm,
            } => write!(
                f,
                "sys_page_map({}, {:08x}, {}, {:08x}, {:#x})",
                src_env,
                src_va.as_u64(),
                dst_env,
                dst_va.as_u64(),
                perm.bits()
            ),
            Primitive::PageUnmap { env, va } => {
                write!(f, "sys_page_unmap({}, {:08x})", env, va.as_u64())
            }
            Primitive::EnvSetStatus { env, status } => {
                write!(f, "sys_env_set_status({}, {:?})", env, status)
            }
            Primitive::EnvSetPgfaultUpcall { env } => {
                write!(f, "sys_env_set_pgfault_upcall({})", env)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForkError {
    /// Fault on a page no page table covers.
    AddressNotMapped { va: VirtAddr },
    /// Fault that is not a write to a copy-on-write page.
    IllegalFault {
        va: VirtAddr,
        pte: Pte,
        err: FaultCode,
    },
    /// A kernel primitive refused.
    PrimitiveFailure { call: Primitive, error: SysError },
    /// A load or store ended the environment.
    Memory(MemFault),
}

impl fmt::Display for ForkError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ForkError::AddressNotMapped { va } => {
                write!(f, "pgfault: address {:08x} not mapped", va.as_u64())
            }
            ForkError::IllegalFault { va, pte, err } => write!(
                f,
                "pgfault: not a write to a copy-on-write page: addr {:08x} pte {:08x} err {:x}",
                va.as_u64(),
                pte.raw(),
                err.bits()
            ),
            ForkError::PrimitiveFailure { call, error } => write!(f, "{}: {}", call, error),
            ForkError::Memory(fault) => write!(f, "{}", fault),
        }
    }
}

impl From<MemFault> for ForkError {
    fn from(fault: MemFault) -> Self {
        ForkError::Memory(fault)
    }
}

impl From<ForkError> for Abort {
    fn from(err: ForkError) -> Self {
        Abort::new(alloc::format!("{}", err))
    }
}

/// Tag a syscall result with the call that produced it.
pub trait PrimitiveResult<T> {
    fn during(self, call: Primitive) -> Result<T, ForkError>;
}

impl<T> PrimitiveResult<T> for SysResult<T> {
    fn during(self, call: Primitive) -> Result<T, ForkError> {
        self.map_err(|error| ForkError::PrimitiveFailure { call, error })
    }
}
