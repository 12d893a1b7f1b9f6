// kernel/src/abi/mod.rs
//
// The contract between user code and the kernel: identities, fault
// frames, exit reasons and the traits user code calls through.
//
// User code never sees kernel structures.  It gets
//   - the syscalls (`Syscalls`)
//   - a read-only view of its own page tables (`PageTableView`)
//   - a read-only view of the environment table (`EnvView`)
//   - loads and stores that go through the MMU (`UserMemory`)

pub mod error;
pub mod flags;

use alloc::string::String;
use core::fmt;

use bitflags::bitflags;
use x86_64::{
    VirtAddr,
    structures::paging::{Page, Size4KiB},
};

pub use error::{SysError, SysResult};
pub use flags::{Pte, PteFlags, PteLookup};

// ============================================================================
// Environment identity
// ============================================================================

/// Opaque environment identity.  The low bits index the environment
/// table, the high bits are a generation counter so a stale id never
/// names a recycled slot.  `EnvId(0)` in a syscall means "the caller".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(pub u32);

impl EnvId {
    pub const CURRENT: EnvId = EnvId(0);

    pub const fn is_current(self) -> bool {
        self.0 == 0
    }

    /// Table slot, given the table size as a power of two.
    pub const fn slot(self, log2_nenv: u32) -> usize {
        (self.0 & ((1 << log2_nenv) - 1)) as usize
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvStatus {
    Free,
    Runnable,
    NotRunnable,
}

/// What the duplication primitive tells each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The caller; here is the new environment.
    Parent(EnvId),
    /// The new environment, resuming at the call site.
    Child,
}

// ============================================================================
// Fault frame
// ============================================================================

bitflags! {
    /// x86 page-fault error code.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultCode: u32 {
        /// Protection violation (the page was present).
        const PROTECTION = 0x1;
        /// The access was a write.
        const WRITE      = 0x2;
        /// The access came from user mode.
        const USER       = 0x4;
    }
}

/// What the kernel pushes on the exception stack before running the
/// user's fault upcall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UTrapframe {
    pub fault_va: VirtAddr,
    pub err: FaultCode,
}

impl UTrapframe {
    pub const SIZE: usize = 8;

    pub fn is_write(&self) -> bool {
        self.err.contains(FaultCode::WRITE)
    }

    /// The page the fault hit.
    pub fn page(&self) -> Page<Size4KiB> {
        Page::containing_address(self.fault_va)
    }

    /// Layout pushed on the exception stack: fault_va, err (little endian).
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[..4].copy_from_slice(&(self.fault_va.as_u64() as u32).to_le_bytes());
        out[4..].copy_from_slice(&self.err.bits().to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let va = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let err = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self {
            fault_va: VirtAddr::new(va as u64),
            err: FaultCode::from_bits_truncate(err),
        }
    }
}

/// A user-mode panic: the diagnostic a fault upcall reports when it
/// cannot continue.  The kernel destroys the environment and records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Abort {
    pub message: String,
}

impl Abort {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl fmt::Display for Abort {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Entry point the kernel calls on a user page fault.
pub type PgfaultUpcall<S> = fn(&S, &UTrapframe) -> Result<(), Abort>;

/// Why an environment stopped existing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// Destroyed itself.
    Exited,
    /// Destroyed by its parent.
    Killed { by: EnvId },
    /// Its fault upcall gave up.
    Panicked(String),
    /// The kernel could not deliver the fault to user mode.
    Faulted {
        va: VirtAddr,
        err: FaultCode,
        reason: &'static str,
    },
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExitReason::Exited => f.write_str("exited"),
            ExitReason::Killed { by } => write!(f, "killed by {}", by),
            ExitReason::Panicked(msg) => write!(f, "panicked: {}", msg),
            ExitReason::Faulted { va, err, reason } => write!(
                f,
                "user fault va {:08x} err {:#x}: {}",
                va.as_u64(),
                err.bits(),
                reason
            ),
        }
    }
}

/// A load or store that ended the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemFault {
    pub va: VirtAddr,
    pub reason: ExitReason,
}

impl fmt::Display for MemFault {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "access to {:08x} failed: {}", self.va.as_u64(), self.reason)
    }
}

/// Read-only snapshot of one environment-table entry.
pub struct EnvInfo<S> {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,
    pub pgfault_upcall: Option<PgfaultUpcall<S>>,
    /// Page faults delivered to the upcall so far.
    pub pgfaults: u32,
}

impl<S> Clone for EnvInfo<S> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S> Copy for EnvInfo<S> {}

impl<S> fmt::Debug for EnvInfo<S> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EnvInfo")
            .field("id", &self.id)
            .field("parent_id", &self.parent_id)
            .field("status", &self.status)
            .field("pgfault_upcall", &self.pgfault_upcall.map(|u| u as usize))
            .field("pgfaults", &self.pgfaults)
            .finish()
    }
}

// ============================================================================
// The interfaces user code is written against
// ============================================================================

/// Kernel entry points available to user code.  Every call is made on
/// behalf of the environment the handle belongs to.
pub trait Syscalls: Sized {
    fn getenvid(&self) -> EnvId;

    /// Create a not-runnable environment with an empty address space.
    /// Returns `Parent(child)` to the caller; the child's first call
    /// after it is scheduled returns `Child`.
    fn exofork(&self) -> SysResult<Role>;

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> SysResult<()>;

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()>;

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()>;

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()>;

    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: PgfaultUpcall<Self>) -> SysResult<()>;

    fn env_destroy(&self, env: EnvId) -> SysResult<()>;

    /// Write a string to the console.
    fn cputs(&self, s: &str);
}

/// Read-only view of the caller's own page tables.
pub trait PageTableView {
    fn lookup(&self, page: Page<Size4KiB>) -> PteLookup;
}

/// Read-only view of the environment table.
pub trait EnvView: Sized {
    fn env_info(&self, env: EnvId) -> Option<EnvInfo<Self>>;
}

/// User-mode loads and stores.  Faults are delivered to the upcall and
/// the access retried; `Err` means the environment did not survive.
pub trait UserMemory {
    fn read_bytes(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), MemFault>;
    fn write_bytes(&self, va: VirtAddr, data: &[u8]) -> Result<(), MemFault>;

    fn read_u8(&self, va: VirtAddr) -> Result<u8, MemFault> {
        let mut b = [0u8; 1];
        self.read_bytes(va, &mut b)?;
        Ok(b[0])
    }

    fn write_u8(&self, va: VirtAddr, value: u8) -> Result<(), MemFault> {
        self.write_bytes(va, &[value])
    }
}
