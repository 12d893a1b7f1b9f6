// kernel/src/env/mod.rs
//
// Environments: the kernel's unit of execution.  An environment is an
// address space plus the little state the kernel keeps for user-level
// fault handling.  There is no saved register state; the code running
// "in" an environment is whoever holds its `UserEnv` handle.

pub mod syscall;
pub mod table;
pub mod trap;

use crate::abi::{EnvId, EnvInfo, EnvStatus, PgfaultUpcall};
use crate::memory::AddressSpace;
use crate::user::UserEnv;

pub use table::EnvTable;

/// Environment control block.
pub struct Env {
    pub id: EnvId,
    pub parent_id: EnvId,
    pub status: EnvStatus,

    // ============ Memory ============
    pub aspace: AddressSpace,

    // ============ User-level fault handling ============
    pub pgfault_upcall: Option<PgfaultUpcall<UserEnv>>,
    /// Set while the upcall runs; a second fault in that window is fatal.
    pub in_fault: bool,
    pub pgfaults: u32,

    /// Created by exofork and not yet told it is the child.
    pub fork_return_pending: bool,
}

impl Env {
    /// A free slot.  The id is kept so the next occupant gets a newer
    /// generation.
    pub fn free(id: EnvId) -> Self {
        Self {
            id,
            parent_id: EnvId::CURRENT,
            status: EnvStatus::Free,
            aspace: AddressSpace::new(),
            pgfault_upcall: None,
            in_fault: false,
            pgfaults: 0,
            fork_return_pending: false,
        }
    }

    pub fn is_free(&self) -> bool {
        self.status == EnvStatus::Free
    }

    pub fn info(&self) -> EnvInfo<UserEnv> {
        EnvInfo {
            id: self.id,
            parent_id: self.parent_id,
            status: self.status,
            pgfault_upcall: self.pgfault_upcall,
            pgfaults: self.pgfaults,
        }
    }
}
