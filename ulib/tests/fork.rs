// Copy-on-write fork end to end against the simulated kernel.

mod common;

use common::{boot, parent, pte, va};
use kern::memlayout::{PFTEMP, PGSIZE, USTACKTOP, UTEXT, UXSTACKTOP, page_of};
use kern::{
    EnvId, EnvStatus, EnvView, PteFlags, PteLookup, Role, SysError, Syscalls,
    UserMemory,
};
use ulib::{ForkError, UserProcess, fork, libmain};

const DATA: u64 = UTEXT;
const RODATA: u64 = UTEXT + 0x1000;
const SHARED: u64 = UTEXT + 0x2000;

fn populate(env: &kern::UserEnv) {
    let me = EnvId::CURRENT;
    env.page_alloc(me, va(DATA), PteFlags::PRIVATE_RW).unwrap();
    env.page_alloc(me, va(RODATA), PteFlags::PRESENT | PteFlags::USER).unwrap();
    env.page_alloc(me, va(SHARED), PteFlags::PRIVATE_RW | PteFlags::SHARE).unwrap();
    env.write_bytes(va(DATA), b"parent data").unwrap();
    env.write_bytes(va(SHARED), b"shared").unwrap();
}

#[test]
fn writable_pages_become_cow_on_both_sides() {
    let (kernel, env) = boot();
    populate(&env);
    let before = pte(&env, DATA).frame();

    let child = parent(fork(&env).unwrap());
    for addr in [DATA, USTACKTOP - PGSIZE as u64] {
        let mine = kernel.lookup(env.id(), page_of(addr)).unwrap().present().unwrap();
        let theirs = kernel.lookup(child, page_of(addr)).unwrap().present().unwrap();
        assert_eq!(mine.frame(), theirs.frame());
        for flags in [mine.flags(), theirs.flags()] {
            assert!(flags.is_cow(), "{:08x}: {:?}", addr, flags);
            assert!(!flags.is_writable());
        }
    }
    assert_eq!(pte(&env, DATA).frame(), before);
    assert_eq!(kernel.frame_refcount(before), 2);
}

#[test]
fn read_only_pages_are_shared_read_only() {
    let (kernel, env) = boot();
    populate(&env);
    let child = parent(fork(&env).unwrap());

    let mine = pte(&env, RODATA);
    let theirs = kernel.lookup(child, page_of(RODATA)).unwrap().present().unwrap();
    assert_eq!(mine.frame(), theirs.frame());
    assert_eq!(theirs.flags().syscall_bits(), PteFlags::PRESENT | PteFlags::USER);
    assert!(!mine.flags().is_cow());
}

#[test]
fn the_writer_gets_exactly_one_private_copy() {
    let (kernel, env) = boot();
    populate(&env);
    let original = pte(&env, DATA).frame();
    let child = parent(fork(&env).unwrap());
    let faults = env.env_info(EnvId::CURRENT).unwrap().pgfaults;

    env.write_bytes(va(DATA), b"PARENT").unwrap();
    env.write_bytes(va(DATA + 100), b"again").unwrap();
    assert_eq!(env.env_info(EnvId::CURRENT).unwrap().pgfaults, faults + 1);

    let mine = pte(&env, DATA);
    assert_ne!(mine.frame(), original);
    assert!(mine.flags().is_writable() && !mine.flags().is_cow());

    // The copy started from the bytes present at the fault.
    let mut buf = [0u8; 11];
    env.read_bytes(va(DATA), &mut buf).unwrap();
    assert_eq!(&buf, b"PARENT data");

    // The child still sees the old contents, copy-on-write, on the
    // original frame.
    let theirs = kernel.lookup(child, page_of(DATA)).unwrap().present().unwrap();
    assert_eq!(theirs.frame(), original);
    assert!(theirs.flags().is_cow());
    assert!(kernel.read_virt(child, va(DATA), &mut buf));
    assert_eq!(&buf, b"parent data");
    assert_eq!(kernel.frame_refcount(original), 1);
}

#[test]
fn share_pages_stay_shared_through_writes() {
    let (kernel, env) = boot();
    populate(&env);
    let child = parent(fork(&env).unwrap());
    let child_env = kernel.enter(child).unwrap();

    for round in 0..3u8 {
        env.write_u8(va(SHARED), round).unwrap();
        child_env.write_u8(va(SHARED + 1), round).unwrap();
    }
    let mine = pte(&env, SHARED);
    let theirs = pte(&child_env, SHARED);
    assert_eq!(mine.frame(), theirs.frame());
    assert_eq!(mine.flags().syscall_bits(), theirs.flags().syscall_bits());
    assert!(mine.flags().is_shared() && mine.flags().is_writable());
    assert_eq!(env.read_u8(va(SHARED + 1)), Ok(2));
    assert_eq!(child_env.env_info(EnvId::CURRENT).unwrap().pgfaults, 0);
}

#[test]
fn exception_stacks_are_never_shared() {
    let (kernel, env) = boot();
    populate(&env);
    let child = parent(fork(&env).unwrap());
    let xstack = UXSTACKTOP - PGSIZE as u64;

    let mine = pte(&env, xstack);
    let theirs = kernel.lookup(child, page_of(xstack)).unwrap().present().unwrap();
    assert_ne!(mine.frame(), theirs.frame());
    for pte in [mine, theirs] {
        assert_eq!(pte.flags().syscall_bits(), PteFlags::PRIVATE_RW);
    }
}

#[test]
fn child_is_runnable_with_the_parents_upcall() {
    let (kernel, env) = boot();
    populate(&env);
    let child = parent(fork(&env).unwrap());

    let mine = env.env_info(EnvId::CURRENT).unwrap();
    let theirs = env.env_info(child).unwrap();
    assert_eq!(theirs.status, EnvStatus::Runnable);
    assert_eq!(theirs.parent_id, env.id());
    assert_eq!(
        theirs.pgfault_upcall.map(|u| u as usize),
        mine.pgfault_upcall.map(|u| u as usize)
    );
    assert!(kernel.enter(child).is_ok());
}

#[test]
fn the_child_side_of_fork_returns_child() {
    let (kernel, env) = boot();
    populate(&env);
    let child = parent(fork(&env).unwrap());

    let process = UserProcess::new(kernel.enter(child).unwrap());
    assert_eq!(process.fork(), Ok(Role::Child));
    assert_eq!(process.id(), child);
    assert_eq!(process.thisenv().map(|e| e.parent_id), Some(env.id()));

    // Forking again from the child makes a grandchild.
    let grandchild = parent(process.fork().unwrap());
    assert_eq!(env.env_info(grandchild).unwrap().parent_id, child);
}

#[test]
fn forking_twice_keeps_pages_cow() {
    let (kernel, env) = boot();
    populate(&env);
    let first = parent(fork(&env).unwrap());
    let second = parent(fork(&env).unwrap());

    let frame = pte(&env, DATA).frame();
    for id in [env.id(), first, second] {
        let pte = kernel.lookup(id, page_of(DATA)).unwrap().present().unwrap();
        assert_eq!(pte.frame(), frame);
        assert_eq!(pte.flags().syscall_bits(), PteFlags::PRIVATE_RW.to_cow());
    }
    assert_eq!(kernel.frame_refcount(frame), 3);
}

#[test]
fn temp_slot_is_empty_after_fork_and_faults() {
    let (kernel, env) = boot();
    populate(&env);
    let child = parent(fork(&env).unwrap());
    env.write_u8(va(DATA), 1).unwrap();
    kernel.enter(child).unwrap().write_u8(va(DATA), 2).unwrap();

    for id in [env.id(), child] {
        assert_eq!(kernel.lookup(id, page_of(PFTEMP)).and_then(PteLookup::present), None);
    }
}

#[test]
fn zero_page_scenario() {
    let (kernel, env) = boot();
    env.page_alloc(EnvId::CURRENT, va(DATA), PteFlags::PRIVATE_RW).unwrap();

    let child = parent(fork(&env).unwrap());
    let child_env = kernel.enter(child).unwrap();
    child_env.write_bytes(va(DATA), &[0xFF; PGSIZE]).unwrap();

    let mut page = vec![0u8; PGSIZE];
    env.read_bytes(va(DATA), &mut page).unwrap();
    assert!(page.iter().all(|&b| b == 0x00));
    child_env.read_bytes(va(DATA), &mut page).unwrap();
    assert!(page.iter().all(|&b| b == 0xFF));
    assert_ne!(pte(&env, DATA).frame(), pte(&child_env, DATA).frame());
}

#[test]
fn frames_come_back_when_everyone_exits() {
    let (kernel, env) = boot();
    let idle = kernel.free_frames();
    populate(&env);

    let child = parent(fork(&env).unwrap());
    let child_env = kernel.enter(child).unwrap();
    env.write_u8(va(DATA), 1).unwrap();
    child_env.write_u8(va(USTACKTOP - 1), 2).unwrap();

    child_env.env_destroy(EnvId::CURRENT).unwrap();
    env.env_destroy(EnvId::CURRENT).unwrap();
    // Only the boot stack page of the first environment was allocated
    // before `idle` was sampled.
    assert_eq!(kernel.free_frames(), idle + 1);
}

#[test]
fn fork_reports_the_failing_primitive() {
    let kernel = kern::Kernel::boot(kern::KernelConfig {
        npages: 64,
        log2_nenv: 1,
    });
    let env = kernel.enter(kernel.create_env().unwrap()).unwrap();
    parent(fork(&env).unwrap());

    kern::serial::init(log::LevelFilter::Error);
    let err = fork(&env).unwrap_err();
    assert_eq!(
        err,
        ForkError::PrimitiveFailure {
            call: ulib::Primitive::Exofork,
            error: SysError::NoFreeEnv,
        }
    );
    // The console is shared by every test in this binary.
    let console = kern::serial::take_output();
    let line = format!("[{}] Private fork: sys_exofork(): {}", env.id(), SysError::NoFreeEnv);
    assert!(console.contains(&line), "{}", console);
}

#[test]
fn libmain_exits_and_reports_panics() {
    let (kernel, env) = boot();
    let id = env.id();
    let result = libmain(env, |p| -> Result<(), ForkError> {
        p.sys().write_u8(va(0x1000_0000), 1)?;
        Ok(())
    });
    assert!(matches!(result, Err(ForkError::Memory(_))));
    assert_eq!(kernel.env_status(id), None);

    let (kernel, env) = boot();
    let id = env.id();
    libmain(env, |p| -> Result<(), ForkError> {
        p.fork()?;
        Ok(())
    })
    .unwrap();
    assert_eq!(kernel.exit_reason(id), Some(kern::ExitReason::Exited));
}
