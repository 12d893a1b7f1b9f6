// kernel/src/user.rs
//
// UserEnv: what code running inside an environment holds.  Every method
// is a trap into the kernel on behalf of that one environment.
//
// The kernel lock is taken per call and is never held while a page-fault
// upcall runs, since the upcall makes syscalls and touches memory itself.

use core::fmt;

use x86_64::{
    VirtAddr,
    structures::paging::{Page, Size4KiB},
};

use crate::abi::{
    EnvId, EnvInfo, EnvStatus, EnvView, ExitReason, MemFault, PageTableView, PgfaultUpcall,
    PteFlags, PteLookup, Role, SysResult, Syscalls, UTrapframe, UserMemory,
};
use crate::env::trap::AccessError;
use crate::kernel::Kernel;
use crate::memlayout::{PGSIZE, UTOP};

#[derive(Clone)]
pub struct UserEnv {
    kernel: Kernel,
    id: EnvId,
}

impl fmt::Debug for UserEnv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("UserEnv").field(&self.id).finish()
    }
}

impl UserEnv {
    pub(crate) fn new(kernel: Kernel, id: EnvId) -> Self {
        Self { kernel, id }
    }

    pub fn id(&self) -> EnvId {
        self.id
    }

    /// The machine this environment runs on.
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    /// Run `f` on the frame behind `va` once the MMU allows the access.
    /// A fault is delivered to the upcall and the access retried once.
    fn with_page(
        &self,
        va: VirtAddr,
        write: bool,
        mut f: impl FnMut(&mut [u8; PGSIZE]),
    ) -> Result<(), MemFault> {
        let mut delivered = false;
        loop {
            let (upcall, utf) = {
                let mut k = self.kernel.lock();
                let err = match k.mmu_access(self.id, va, write) {
                    Ok(frame) => {
                        if let Some(data) = k.frames.data_mut(frame) {
                            f(data);
                        }
                        return Ok(());
                    }
                    Err(AccessError::Dead(reason)) => return Err(MemFault { va, reason }),
                    Err(AccessError::Fault(err)) => err,
                };
                let utf = UTrapframe { fault_va: va, err };

                if delivered {
                    let reason = ExitReason::Faulted {
                        va,
                        err,
                        reason: "fault persists after the upcall returned",
                    };
                    log::warn!("[{}] {}", self.id, reason);
                    k.destroy(self.id, reason.clone());
                    return Err(MemFault { va, reason });
                }
                match k.begin_fault(self.id, &utf) {
                    Ok(upcall) => (upcall, utf),
                    Err(reason) => return Err(MemFault { va, reason }),
                }
            };

            delivered = true;
            let outcome = upcall(self, &utf);

            let mut k = self.kernel.lock();
            k.end_fault(self.id);
            if let Err(abort) = outcome {
                let reason = ExitReason::Panicked(abort.message);
                k.destroy(self.id, reason.clone());
                return Err(MemFault { va, reason });
            }
        }
    }
}

// ============================================================================
// Syscalls
// ============================================================================

impl Syscalls for UserEnv {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn exofork(&self) -> SysResult<Role> {
        self.kernel.lock().sys_exofork(self.id)
    }

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: PteFlags) -> SysResult<()> {
        self.kernel.lock().sys_page_alloc(self.id, env, va, perm)
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.kernel
            .lock()
            .sys_page_map(self.id, src_env, src_va, dst_env, dst_va, perm)
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> SysResult<()> {
        self.kernel.lock().sys_page_unmap(self.id, env, va)
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        self.kernel.lock().sys_env_set_status(self.id, env, status)
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, upcall: PgfaultUpcall<Self>) -> SysResult<()> {
        self.kernel
            .lock()
            .sys_env_set_pgfault_upcall(self.id, env, upcall)
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        self.kernel.lock().sys_env_destroy(self.id, env)
    }

    fn cputs(&self, s: &str) {
        crate::serial::puts(s);
    }
}

// ============================================================================
// Introspection
// ============================================================================

impl PageTableView for UserEnv {
    fn lookup(&self, page: Page<Size4KiB>) -> PteLookup {
        if page.start_address().as_u64() >= UTOP {
            return PteLookup::Absent;
        }
        self.kernel
            .lock()
            .envs
            .get(self.id)
            .map_or(PteLookup::Absent, |env| env.aspace.lookup(page))
    }
}

impl EnvView for UserEnv {
    fn env_info(&self, env: EnvId) -> Option<EnvInfo<Self>> {
        let target = if env.is_current() { self.id } else { env };
        self.kernel.lock().envs.get(target).map(|e| e.info())
    }
}

// ============================================================================
// Memory
// ============================================================================

impl UserMemory for UserEnv {
    fn read_bytes(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), MemFault> {
        let mut done = 0;
        while done < buf.len() {
            let at = va + done as u64;
            let offset = (at.as_u64() % PGSIZE as u64) as usize;
            let len = (PGSIZE - offset).min(buf.len() - done);
            let chunk = &mut buf[done..done + len];
            self.with_page(at, false, |page| {
                chunk.copy_from_slice(&page[offset..offset + len]);
            })?;
            done += len;
        }
        Ok(())
    }

    fn write_bytes(&self, va: VirtAddr, data: &[u8]) -> Result<(), MemFault> {
        let mut done = 0;
        while done < data.len() {
            let at = va + done as u64;
            let offset = (at.as_u64() % PGSIZE as u64) as usize;
            let len = (PGSIZE - offset).min(data.len() - done);
            let chunk = &data[done..done + len];
            self.with_page(at, true, |page| {
                page[offset..offset + len].copy_from_slice(chunk);
            })?;
            done += len;
        }
        Ok(())
    }
}
