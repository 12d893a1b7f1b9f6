// ulib/src/process.rs
//
// Program runtime: what `umain` gets handed, and the entry wrapper that
// turns a failed program into a user panic.

use alloc::format;
use core::cell::Cell;
use core::fmt;

use kern::{EnvId, EnvInfo, EnvView, PageTableView, Role, Syscalls, UserMemory};

use crate::error::ForkError;

/// A running program: the syscall handle plus a cached copy of this
/// environment's table entry (`thisenv`).
pub struct UserProcess<S> {
    sys: S,
    thisenv: Cell<Option<EnvInfo<S>>>,
}

impl<S: Syscalls + EnvView> UserProcess<S> {
    pub fn new(sys: S) -> Self {
        let thisenv = sys.env_info(EnvId::CURRENT);
        Self {
            sys,
            thisenv: Cell::new(thisenv),
        }
    }

    pub fn sys(&self) -> &S {
        &self.sys
    }

    /// Cached table entry; refreshed on the child side of a fork.
    pub fn thisenv(&self) -> Option<EnvInfo<S>> {
        self.thisenv.get()
    }

    pub fn id(&self) -> EnvId {
        self.thisenv().map_or_else(|| self.sys.getenvid(), |info| info.id)
    }

    fn refresh(&self) {
        self.thisenv.set(self.sys.env_info(EnvId::CURRENT));
    }

    pub fn puts(&self, s: &str) {
        self.sys.cputs(s);
    }

    pub fn exit(&self) {
        // Already gone if a fault killed us.
        let _ = self.sys.env_destroy(EnvId::CURRENT);
    }
}

impl<S> UserProcess<S>
where
    S: Syscalls + PageTableView + EnvView + UserMemory,
{
    pub fn fork(&self) -> Result<Role, ForkError> {
        let role = crate::fork::fork(&self.sys)?;
        if role == Role::Child {
            self.refresh();
        }
        Ok(role)
    }

    pub fn sfork(&self) -> Result<Role, ForkError> {
        let role = crate::fork::sfork(&self.sys)?;
        if role == Role::Child {
            self.refresh();
        }
        Ok(role)
    }
}

/// Run `umain` as the program of the environment behind `sys`, then
/// exit.  A failure is reported as a user panic before exiting and is
/// handed back to the caller.
pub fn libmain<S, E, F>(sys: S, umain: F) -> Result<(), E>
where
    S: Syscalls + EnvView,
    E: fmt::Display,
    F: FnOnce(&UserProcess<S>) -> Result<(), E>,
{
    let process = UserProcess::new(sys);
    let result = umain(&process);
    if let Err(err) = &result {
        let id = process.id();
        log::error!("user panic in {}: {}", id, err);
        process.puts(&format!("user panic in {}: {}\n", id, err));
    }
    process.exit();
    result
}
