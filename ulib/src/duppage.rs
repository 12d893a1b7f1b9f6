// ulib/src/duppage.rs
//
// Per-page duplication policy.
//
// Deciding what happens to one page is a pure function of the parent's
// entry and the page's role; `apply` then carries the decision out with
// two page_map calls at most.  Child first, parent second: once the
// parent's entry is downgraded to COW, its next write faults and gets a
// private copy, so the child can never observe a write made after its
// mapping was taken.

use kern::memlayout::{in_user_stack, uxstack_page};
use kern::{EnvId, Pte, PteFlags, PteLookup, Syscalls};
use x86_64::structures::paging::{Page, Size4KiB};

use crate::error::{ForkError, Primitive, PrimitiveResult};

/// Which flavour of fork is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Classic fork: every writable page becomes copy-on-write.
    Private,
    /// Thread-like fork: only the normal stack is copy-on-write.
    Shared,
}

/// What a page is, before looking at its entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRole {
    /// The exception stack.  Never duplicated.
    ExceptionStack,
    /// Copied lazily.
    Private,
    /// Mapped into the child as-is.
    Shared,
}

impl Policy {
    pub fn role(self, page: Page<Size4KiB>) -> PageRole {
        if page == uxstack_page() {
            return PageRole::ExceptionStack;
        }
        match self {
            Policy::Private => PageRole::Private,
            Policy::Shared if in_user_stack(page.start_address().as_u64()) => PageRole::Private,
            Policy::Shared => PageRole::Shared,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageClass {
    Reserved,
    /// No page table, or an entry that isn't present.
    Absent,
    Shared(Pte),
    WritableOrCow(Pte),
    ReadOnly(Pte),
}

pub fn classify(lookup: PteLookup, role: PageRole) -> PageClass {
    if role == PageRole::ExceptionStack {
        return PageClass::Reserved;
    }
    let Some(pte) = lookup.present() else {
        return PageClass::Absent;
    };
    let flags = pte.flags();
    if flags.is_shared() || role == PageRole::Shared {
        PageClass::Shared(pte)
    } else if flags.is_writable() || flags.is_cow() {
        PageClass::WritableOrCow(pte)
    } else {
        PageClass::ReadOnly(pte)
    }
}

/// Mappings to install for one page: the child's, and a replacement for
/// the parent's if it has to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Duplication {
    pub child: PteFlags,
    pub parent: Option<PteFlags>,
}

pub fn decide(class: PageClass) -> Option<Duplication> {
    match class {
        PageClass::Reserved | PageClass::Absent => None,
        PageClass::Shared(pte) => Some(Duplication {
            child: pte.flags().syscall_bits(),
            parent: None,
        }),
        PageClass::WritableOrCow(pte) => {
            let cow = pte.flags().to_cow();
            Some(Duplication {
                child: cow,
                parent: Some(cow),
            })
        }
        PageClass::ReadOnly(pte) => Some(Duplication {
            child: pte.flags().syscall_bits().difference(PteFlags::WRITABLE),
            parent: None,
        }),
    }
}

/// Install `dup` for `page` in `child`, then fix up our own entry.
pub fn apply<S: Syscalls>(
    sys: &S,
    child: EnvId,
    page: Page<Size4KiB>,
    dup: Duplication,
) -> Result<(), ForkError> {
    let va = page.start_address();
    sys.page_map(EnvId::CURRENT, va, child, va, dup.child)
        .during(Primitive::PageMap {
            src_env: EnvId::CURRENT,
            src_va: va,
            dst_env: child,
            dst_va: va,
            perm: dup.child,
        })?;
    if let Some(perm) = dup.parent {
        sys.page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, perm)
            .during(Primitive::PageMap {
                src_env: EnvId::CURRENT,
                src_va: va,
                dst_env: EnvId::CURRENT,
                dst_va: va,
                perm,
            })?;
    }
    Ok(())
}
