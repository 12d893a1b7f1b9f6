// ulib/src/pgfault.rs
//
// User-level page-fault handling.
//
// The kernel runs our upcall on the exception stack whenever the
// environment faults.  A write to a copy-on-write page is fixed up here:
//   1. allocate a fresh page at PFTEMP
//   2. copy the faulting page into it
//   3. map it over the faulting page, writable
//   4. unmap PFTEMP
// Anything else is fatal.

use kern::memlayout::{PFTEMP, PGSIZE, uxstack_page};
use kern::{
    Abort, EnvId, EnvView, PageTableView, PgfaultUpcall, PteFlags, PteLookup, Syscalls,
    UTrapframe, UserMemory,
};
use x86_64::VirtAddr;

use crate::error::{ForkError, Primitive, PrimitiveResult};

/// Register `handler` as this environment's page-fault upcall.  The
/// first registration also allocates the exception stack.
pub fn set_pgfault_handler<S>(sys: &S, handler: PgfaultUpcall<S>) -> Result<(), ForkError>
where
    S: Syscalls + EnvView,
{
    let installed = sys
        .env_info(EnvId::CURRENT)
        .and_then(|info| info.pgfault_upcall);

    match installed {
        None => {
            let va = uxstack_page().start_address();
            let perm = PteFlags::PRIVATE_RW;
            sys.page_alloc(EnvId::CURRENT, va, perm)
                .during(Primitive::PageAlloc { env: EnvId::CURRENT, va, perm })?;
        }
        Some(current) if current as usize == handler as usize => return Ok(()),
        Some(_) => {}
    }
    sys.env_set_pgfault_upcall(EnvId::CURRENT, handler)
        .during(Primitive::EnvSetPgfaultUpcall { env: EnvId::CURRENT })
}

// ============================================================================
// Scratch page
// ============================================================================

/// PFTEMP, mapped for as long as the guard lives.
struct TempSlot<'a, S: Syscalls> {
    sys: &'a S,
    mapped: bool,
}

impl<'a, S: Syscalls> TempSlot<'a, S> {
    const VA: u64 = PFTEMP;

    fn acquire(sys: &'a S) -> Result<Self, ForkError> {
        let va = VirtAddr::new(Self::VA);
        let perm = PteFlags::PRIVATE_RW;
        sys.page_alloc(EnvId::CURRENT, va, perm)
            .during(Primitive::PageAlloc { env: EnvId::CURRENT, va, perm })?;
        Ok(Self { sys, mapped: true })
    }

    fn va(&self) -> VirtAddr {
        VirtAddr::new(Self::VA)
    }

    /// Unmap and report the result.
    fn release(mut self) -> Result<(), ForkError> {
        self.mapped = false;
        let va = self.va();
        self.sys
            .page_unmap(EnvId::CURRENT, va)
            .during(Primitive::PageUnmap { env: EnvId::CURRENT, va })
    }
}

impl<S: Syscalls> Drop for TempSlot<'_, S> {
    fn drop(&mut self) {
        if self.mapped {
            if let Err(err) = self.sys.page_unmap(EnvId::CURRENT, self.va()) {
                log::error!("pgfault: PFTEMP left mapped: {}", err);
            }
        }
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Privatize the copy-on-write page behind `utf`.
pub fn handle_cow_fault<S>(sys: &S, utf: &UTrapframe) -> Result<(), ForkError>
where
    S: Syscalls + PageTableView + UserMemory,
{
    let va = utf.fault_va;
    let page = utf.page();

    let pte = match sys.lookup(page) {
        PteLookup::Absent => return Err(ForkError::AddressNotMapped { va }),
        PteLookup::Entry(pte) => pte,
    };
    if !(utf.is_write() && pte.is_present() && pte.flags().is_cow()) {
        return Err(ForkError::IllegalFault { va, pte, err: utf.err });
    }
    log::trace!("[{}] cow fault at {:08x}", sys.getenvid(), va.as_u64());

    let slot = TempSlot::acquire(sys)?;
    let mut buf = [0u8; PGSIZE];
    sys.read_bytes(page.start_address(), &mut buf)?;
    sys.write_bytes(slot.va(), &buf)?;

    let dst = page.start_address();
    let perm = PteFlags::PRIVATE_RW;
    sys.page_map(EnvId::CURRENT, slot.va(), EnvId::CURRENT, dst, perm)
        .during(Primitive::PageMap {
            src_env: EnvId::CURRENT,
            src_va: slot.va(),
            dst_env: EnvId::CURRENT,
            dst_va: dst,
            perm,
        })?;
    slot.release()
}

/// The upcall the kernel calls.  Errors become a user panic.
pub fn cow_fault<S>(sys: &S, utf: &UTrapframe) -> Result<(), Abort>
where
    S: Syscalls + PageTableView + UserMemory,
{
    handle_cow_fault(sys, utf).map_err(|err| {
        log::error!("[{}] {}", sys.getenvid(), err);
        Abort::from(err)
    })
}
