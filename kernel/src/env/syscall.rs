// kernel/src/env/syscall.rs
//
// System call implementations.  Each runs with the kernel lock held on
// behalf of `caller`, validates its arguments and either does all of
// its work or none of it.
//
// Argument rules shared by every call:
//   - env 0 is the caller; anything else must be the caller or one of
//     its immediate children
//   - addresses must be page aligned and below UTOP
//   - perm must have PRESENT|USER and nothing outside PteFlags::SYSCALL

use x86_64::VirtAddr;

use crate::abi::{EnvId, EnvStatus, ExitReason, PgfaultUpcall, PteFlags, Role, SysError, SysResult};
use crate::kernel::KernelState;
use crate::memlayout::{is_user_page_addr, page_of};
use crate::user::UserEnv;

fn check_va(va: VirtAddr) -> SysResult<()> {
    if is_user_page_addr(va.as_u64()) { Ok(()) } else { Err(SysError::Inval) }
}

fn check_perm(perm: PteFlags) -> SysResult<()> {
    if perm.is_valid_syscall_perm() { Ok(()) } else { Err(SysError::Inval) }
}

impl KernelState {
    // ========================================================================
    // ENVIRONMENTS
    // ========================================================================

    /// Create a child with an empty address space, not runnable.  A
    /// freshly created child that calls this for the first time is told
    /// it is the child instead.
    pub(crate) fn sys_exofork(&mut self, caller: EnvId) -> SysResult<Role> {
        let me = self.envs.get_mut(caller).ok_or(SysError::BadEnv)?;
        if me.fork_return_pending {
            me.fork_return_pending = false;
            return Ok(Role::Child);
        }

        let child = self.envs.alloc(caller)?;
        if let Some(env) = self.envs.get_mut(child) {
            env.fork_return_pending = true;
        }
        log::debug!("[{}] new env {}", caller, child);
        Ok(Role::Parent(child))
    }

    pub(crate) fn sys_env_set_status(
        &mut self,
        caller: EnvId,
        env: EnvId,
        status: EnvStatus,
    ) -> SysResult<()> {
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(SysError::Inval);
        }
        let target = self.envs.resolve(env, caller, true)?;
        if let Some(e) = self.envs.get_mut(target) {
            e.status = status;
        }
        Ok(())
    }

    pub(crate) fn sys_env_set_pgfault_upcall(
        &mut self,
        caller: EnvId,
        env: EnvId,
        upcall: PgfaultUpcall<UserEnv>,
    ) -> SysResult<()> {
        let target = self.envs.resolve(env, caller, true)?;
        if let Some(e) = self.envs.get_mut(target) {
            e.pgfault_upcall = Some(upcall);
        }
        Ok(())
    }

    pub(crate) fn sys_env_destroy(&mut self, caller: EnvId, env: EnvId) -> SysResult<()> {
        let target = self.envs.resolve(env, caller, true)?;
        let reason = if target == caller {
            log::debug!("[{}] exiting gracefully", caller);
            ExitReason::Exited
        } else {
            log::debug!("[{}] destroying {}", caller, target);
            ExitReason::Killed { by: caller }
        };
        self.destroy(target, reason);
        Ok(())
    }

    // ========================================================================
    // MEMORY
    // ========================================================================

    /// Map a fresh zeroed page at `va`, replacing any existing mapping.
    pub(crate) fn sys_page_alloc(
        &mut self,
        caller: EnvId,
        env: EnvId,
        va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let target = self.envs.resolve(env, caller, true)?;
        check_va(va)?;
        check_perm(perm)?;

        let frame = self.frames.allocate_frame().ok_or(SysError::NoMem)?;
        let Some(e) = self.envs.get_mut(target) else {
            self.frames.release_unmapped(frame);
            return Err(SysError::BadEnv);
        };
        if e.aspace.insert(&mut self.frames, page_of(va.as_u64()), frame, perm).is_err() {
            self.frames.release_unmapped(frame);
            return Err(SysError::Inval);
        }
        log::trace!("[{}] page_alloc {} {:08x} perm {:#x}", caller, target, va.as_u64(), perm.bits());
        Ok(())
    }

    /// Make `dst_va` in `dst` refer to the frame behind `src_va` in `src`.
    pub(crate) fn sys_page_map(
        &mut self,
        caller: EnvId,
        src: EnvId,
        src_va: VirtAddr,
        dst: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        let src = self.envs.resolve(src, caller, true)?;
        let dst = self.envs.resolve(dst, caller, true)?;
        check_va(src_va)?;
        check_va(dst_va)?;
        check_perm(perm)?;

        let pte = self
            .envs
            .get(src)
            .and_then(|e| e.aspace.present(page_of(src_va.as_u64())))
            .ok_or(SysError::Inval)?;
        if perm.is_writable() && !pte.flags().is_writable() {
            return Err(SysError::Inval);
        }

        let e = self.envs.get_mut(dst).ok_or(SysError::BadEnv)?;
        e.aspace
            .insert(&mut self.frames, page_of(dst_va.as_u64()), pte.frame(), perm)
            .map_err(|_| SysError::Inval)?;
        log::trace!(
            "[{}] page_map {}:{:08x} -> {}:{:08x} perm {:#x}",
            caller,
            src,
            src_va.as_u64(),
            dst,
            dst_va.as_u64(),
            perm.bits()
        );
        Ok(())
    }

    pub(crate) fn sys_page_unmap(&mut self, caller: EnvId, env: EnvId, va: VirtAddr) -> SysResult<()> {
        let target = self.envs.resolve(env, caller, true)?;
        check_va(va)?;
        if let Some(e) = self.envs.get_mut(target) {
            e.aspace.remove(&mut self.frames, page_of(va.as_u64()));
        }
        log::trace!("[{}] page_unmap {} {:08x}", caller, target, va.as_u64());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvTable;
    use crate::memlayout::{UTOP, UTEXT};
    use crate::memory::FramePool;
    use alloc::collections::BTreeMap;

    fn state() -> (KernelState, EnvId) {
        let mut k = KernelState {
            frames: FramePool::new(16),
            envs: EnvTable::new(4),
            exits: BTreeMap::new(),
        };
        let root = k.envs.alloc(EnvId::CURRENT).unwrap();
        (k, root)
    }

    fn va(addr: u64) -> VirtAddr {
        VirtAddr::new(addr)
    }

    #[test]
    fn page_alloc_validates_address_and_perm() {
        let (mut k, root) = state();
        let rw = PteFlags::PRIVATE_RW;
        assert_eq!(k.sys_page_alloc(root, EnvId::CURRENT, va(UTOP), rw), Err(SysError::Inval));
        assert_eq!(k.sys_page_alloc(root, EnvId::CURRENT, va(UTEXT + 1), rw), Err(SysError::Inval));
        assert_eq!(
            k.sys_page_alloc(root, EnvId::CURRENT, va(UTEXT), PteFlags::PRESENT),
            Err(SysError::Inval)
        );
        assert_eq!(
            k.sys_page_alloc(root, EnvId::CURRENT, va(UTEXT), rw | PteFlags::DIRTY),
            Err(SysError::Inval)
        );
        assert_eq!(k.sys_page_alloc(root, EnvId::CURRENT, va(UTEXT), rw), Ok(()));
    }

    #[test]
    fn page_alloc_runs_out_of_memory() {
        let (mut k, root) = state();
        let mut n = 0u64;
        let result = loop {
            match k.sys_page_alloc(root, root, va(UTEXT + n * 4096), PteFlags::PRIVATE_RW) {
                Ok(()) => n += 1,
                Err(err) => break err,
            }
        };
        assert_eq!(result, SysError::NoMem);
        assert_eq!(n, 15);
    }

    #[test]
    fn page_map_refuses_to_upgrade_a_read_only_source() {
        let (mut k, root) = state();
        let ro = PteFlags::PRESENT | PteFlags::USER;
        k.sys_page_alloc(root, root, va(UTEXT), ro).unwrap();
        assert_eq!(
            k.sys_page_map(root, root, va(UTEXT), root, va(UTEXT + 4096), PteFlags::PRIVATE_RW),
            Err(SysError::Inval)
        );
        assert_eq!(k.sys_page_map(root, root, va(UTEXT), root, va(UTEXT + 4096), ro), Ok(()));
        // Unmapped source.
        assert_eq!(
            k.sys_page_map(root, root, va(UTEXT + 8192), root, va(UTEXT), ro),
            Err(SysError::Inval)
        );
    }

    #[test]
    fn only_parents_may_touch_children() {
        let (mut k, root) = state();
        let Ok(Role::Parent(child)) = k.sys_exofork(root) else {
            panic!("expected parent role");
        };
        // The child's first exofork is its half of the fork.
        assert_eq!(k.sys_exofork(child), Ok(Role::Child));
        let Ok(Role::Parent(grandchild)) = k.sys_exofork(child) else {
            panic!("expected parent role");
        };

        let rw = PteFlags::PRIVATE_RW;
        assert_eq!(k.sys_page_alloc(root, grandchild, va(UTEXT), rw), Err(SysError::BadEnv));
        assert_eq!(k.sys_env_set_status(root, grandchild, EnvStatus::Runnable), Err(SysError::BadEnv));
        assert_eq!(k.sys_page_alloc(root, child, va(UTEXT), rw), Ok(()));
        assert_eq!(k.sys_page_alloc(child, grandchild, va(UTEXT), rw), Ok(()));
    }

    #[test]
    fn set_status_rejects_free() {
        let (mut k, root) = state();
        assert_eq!(k.sys_env_set_status(root, root, EnvStatus::Free), Err(SysError::Inval));
    }

    #[test]
    fn destroy_records_the_reason() {
        let (mut k, root) = state();
        let Ok(Role::Parent(child)) = k.sys_exofork(root) else {
            panic!("expected parent role");
        };
        k.sys_env_destroy(root, child).unwrap();
        assert_eq!(k.exits.get(&child), Some(&ExitReason::Killed { by: root }));
        k.sys_env_destroy(root, EnvId::CURRENT).unwrap();
        assert_eq!(k.exits.get(&root), Some(&ExitReason::Exited));
        assert_eq!(k.sys_exofork(root), Err(SysError::BadEnv));
    }
}
