// kernel/src/env/trap.rs
//
// The MMU and user-level page-fault delivery.
//
// Flow for a user load or store (driven by `UserEnv`):
//   1. `mmu_access` walks the page tables.  Success sets ACCESSED (and
//      DIRTY on a write) and hands back the frame.
//   2. On a fault, `begin_fault` checks the environment can take it:
//      an upcall is registered, the exception stack is mapped P|W|U and
//      we are not already inside the upcall.  If so it writes the
//      UTrapframe at the top of the exception stack and returns the
//      upcall; otherwise the environment is destroyed.
//   3. The caller drops the kernel lock, runs the upcall, then calls
//      `end_fault` and retries the access.

use x86_64::{
    VirtAddr,
    structures::paging::{Page, PhysFrame, Size4KiB},
};

use crate::abi::{EnvId, ExitReason, FaultCode, PgfaultUpcall, PteFlags, UTrapframe};
use crate::kernel::KernelState;
use crate::memlayout::{PGSIZE, UTOP, uxstack_page};
use crate::user::UserEnv;

/// Why an access did not complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AccessError {
    /// The environment no longer exists.
    Dead(ExitReason),
    /// Page fault with this error code.
    Fault(FaultCode),
}

impl KernelState {
    /// How `id` ended, for callers that still hold a handle to it.
    pub(crate) fn exit_of(&self, id: EnvId) -> ExitReason {
        self.exits.get(&id).cloned().unwrap_or(ExitReason::Exited)
    }

    /// One user-mode access to `va`.
    pub(crate) fn mmu_access(
        &mut self,
        id: EnvId,
        va: VirtAddr,
        write: bool,
    ) -> Result<PhysFrame<Size4KiB>, AccessError> {
        let Some(env) = self.envs.get_mut(id) else {
            let exit = self.exits.get(&id).cloned().unwrap_or(ExitReason::Exited);
            return Err(AccessError::Dead(exit));
        };

        let mut err = FaultCode::USER;
        if write {
            err |= FaultCode::WRITE;
        }
        if va.as_u64() >= UTOP {
            return Err(AccessError::Fault(err | FaultCode::PROTECTION));
        }

        let page = Page::<Size4KiB>::containing_address(va);
        let Some(pte) = env.aspace.entry_mut(page).filter(|pte| pte.is_present()) else {
            return Err(AccessError::Fault(err));
        };
        let flags = pte.flags();
        if !flags.contains(PteFlags::USER) || (write && !flags.is_writable()) {
            return Err(AccessError::Fault(err | FaultCode::PROTECTION));
        }

        let mut touched = flags | PteFlags::ACCESSED;
        if write {
            touched |= PteFlags::DIRTY;
        }
        *pte = pte.with_flags(touched);
        Ok(pte.frame())
    }

    /// Set up delivery of `utf` to `id`'s upcall.  On `Err` the
    /// environment has been destroyed for the returned reason.
    pub(crate) fn begin_fault(
        &mut self,
        id: EnvId,
        utf: &UTrapframe,
    ) -> Result<PgfaultUpcall<UserEnv>, ExitReason> {
        let Some(env) = self.envs.get(id) else {
            return Err(self.exit_of(id));
        };

        let xstack = env
            .aspace
            .present(uxstack_page())
            .filter(|pte| pte.flags().contains(PteFlags::PRIVATE_RW));
        let checked = match (env.in_fault, env.pgfault_upcall, xstack) {
            (true, _, _) => Err("fault while running the page-fault upcall"),
            (false, None, _) => Err("no page-fault upcall registered"),
            (false, Some(_), None) => Err("exception stack not mapped writable"),
            (false, Some(upcall), Some(pte)) => Ok((upcall, pte.frame())),
        };

        let (upcall, frame) = match checked {
            Ok(found) => found,
            Err(reason) => {
                let exit = ExitReason::Faulted {
                    va: utf.fault_va,
                    err: utf.err,
                    reason,
                };
                log::warn!("[{}] {}", id, exit);
                self.destroy(id, exit.clone());
                return Err(exit);
            }
        };

        if let Some(stack) = self.frames.data_mut(frame) {
            stack[PGSIZE - UTrapframe::SIZE..].copy_from_slice(&utf.to_bytes());
        }
        if let Some(env) = self.envs.get_mut(id) {
            env.in_fault = true;
            env.pgfaults += 1;
        }
        log::trace!(
            "[{}] page fault va {:08x} err {:#x} -> upcall",
            id,
            utf.fault_va.as_u64(),
            utf.err.bits()
        );
        Ok(upcall)
    }

    /// The upcall for `id` returned.
    pub(crate) fn end_fault(&mut self, id: EnvId) {
        if let Some(env) = self.envs.get_mut(id) {
            env.in_fault = false;
        }
    }
}
