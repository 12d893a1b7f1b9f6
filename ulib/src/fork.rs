// ulib/src/fork.rs
//
// fork and sfork, built from exofork + page_map.
//
// Both walk every page below UTOP and let `duppage` decide what the
// child gets.  The child only becomes runnable after its whole address
// space, its exception stack and its upcall are in place.  Nothing is
// rolled back on failure: the half-built child is left not runnable.

use kern::memlayout::{NPTENTRIES, UTOP, page_from_vpn, pgnum, uxstack_page};
use kern::{EnvId, EnvStatus, EnvView, PageTableView, PteFlags, PteLookup, Role, Syscalls, UserMemory};

use crate::duppage::{Policy, apply, classify, decide};
use crate::error::{ForkError, Primitive, PrimitiveResult};
use crate::pgfault::{cow_fault, set_pgfault_handler};

/// Fork with copy-on-write.  Returns `Parent(child)` to the caller and
/// `Child` when called from the freshly created child.
pub fn fork<S>(sys: &S) -> Result<Role, ForkError>
where
    S: Syscalls + PageTableView + EnvView + UserMemory,
{
    duplicate(sys, Policy::Private)
}

/// Shared-memory fork: parent and child share everything except the
/// normal stack, which is copy-on-write, and the exception stack, which
/// is per-environment.
///
/// Pages that are already copy-on-write stay copy-on-write on both
/// sides, so the first write to one of them ends the sharing of that
/// page.
pub fn sfork<S>(sys: &S) -> Result<Role, ForkError>
where
    S: Syscalls + PageTableView + EnvView + UserMemory,
{
    duplicate(sys, Policy::Shared)
}

fn duplicate<S>(sys: &S, policy: Policy) -> Result<Role, ForkError>
where
    S: Syscalls + PageTableView + EnvView + UserMemory,
{
    build_child(sys, policy)
        .inspect_err(|err| log::error!("[{}] {:?} fork: {}", sys.getenvid(), policy, err))
}

fn build_child<S>(sys: &S, policy: Policy) -> Result<Role, ForkError>
where
    S: Syscalls + PageTableView + EnvView + UserMemory,
{
    set_pgfault_handler(sys, cow_fault::<S>)?;

    let child = match sys.exofork().during(Primitive::Exofork)? {
        Role::Child => {
            log::debug!("[{}] fork: child side", sys.getenvid());
            return Ok(Role::Child);
        }
        Role::Parent(child) => child,
    };

    let copied = copy_address_space(sys, child, policy)?;

    let xstack = uxstack_page().start_address();
    let perm = PteFlags::PRIVATE_RW;
    sys.page_alloc(child, xstack, perm)
        .during(Primitive::PageAlloc { env: child, va: xstack, perm })?;

    let upcall = sys
        .env_info(EnvId::CURRENT)
        .and_then(|info| info.pgfault_upcall)
        .unwrap_or(cow_fault::<S>);
    sys.env_set_pgfault_upcall(child, upcall)
        .during(Primitive::EnvSetPgfaultUpcall { env: child })?;

    sys.env_set_status(child, EnvStatus::Runnable)
        .during(Primitive::EnvSetStatus { env: child, status: EnvStatus::Runnable })?;

    log::info!(
        "[{}] {:?} fork -> {} ({} pages)",
        sys.getenvid(),
        policy,
        child,
        copied
    );
    Ok(Role::Parent(child))
}

/// Propagate every user page into `child`.  Returns how many pages the
/// child received.
fn copy_address_space<S>(sys: &S, child: EnvId, policy: Policy) -> Result<usize, ForkError>
where
    S: Syscalls + PageTableView,
{
    let mut copied = 0;
    let mut vpn = 0;
    let end = pgnum(UTOP);
    while vpn < end {
        let page = page_from_vpn(vpn);
        let lookup = sys.lookup(page);
        if lookup == PteLookup::Absent {
            // No page table: skip the whole 4 MiB region.
            vpn = (vpn / NPTENTRIES + 1) * NPTENTRIES;
            continue;
        }
        if let Some(dup) = decide(classify(lookup, policy.role(page))) {
            log::trace!(
                "duppage {:08x}: child {:#x} parent {:?}",
                page.start_address().as_u64(),
                dup.child.bits(),
                dup.parent.map(|p| p.bits())
            );
            apply(sys, child, page, dup)?;
            copied += 1;
        }
        vpn += 1;
    }
    Ok(copied)
}
