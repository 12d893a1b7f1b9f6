#![allow(dead_code)]

use kern::memlayout::page_of;
use kern::{EnvId, Kernel, KernelConfig, PageTableView, Pte, Role, UserEnv};
use x86_64::VirtAddr;

pub fn boot() -> (Kernel, UserEnv) {
    let kernel = Kernel::boot(KernelConfig {
        npages: 512,
        log2_nenv: 4,
    });
    let id = kernel.create_env().unwrap();
    let env = kernel.enter(id).unwrap();
    (kernel, env)
}

pub fn va(addr: u64) -> VirtAddr {
    VirtAddr::new(addr)
}

/// The present entry for `addr` in `env`'s own page tables.
pub fn pte(env: &UserEnv, addr: u64) -> Pte {
    env.lookup(page_of(addr))
        .present()
        .unwrap_or_else(|| panic!("{:08x} not mapped in {}", addr, env.id()))
}

pub fn parent(role: Role) -> EnvId {
    match role {
        Role::Parent(child) => child,
        Role::Child => panic!("expected the parent side of fork"),
    }
}
