// ufork launcher: boots the simulated kernel on the host and runs one
// demo program on it.
//
//   ufork [cow|illegal|forktree|sfork|monitor]
//
// UFORK_LOG picks the log level (error, warn, info, debug, trace).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::rc::Rc;

use kern::memlayout::{PGSIZE, USTACKTOP, UTEXT};
use kern::{EnvId, Kernel, KernelConfig, Monitor, PteFlags, Role, Syscalls, UserEnv, UserMemory};
use log::LevelFilter;
use ulib::error::{Primitive, PrimitiveResult};
use ulib::{ForkError, UserProcess, libmain};
use x86_64::VirtAddr;

type Process = UserProcess<UserEnv>;
type Program = Box<dyn FnOnce(&Process, &RunQueue) -> Result<(), ForkError>>;

const USAGE: &str = "usage: ufork [cow|illegal|forktree|sfork|monitor]";

// ============================================================================
// Run queue
// ============================================================================

/// Environments waiting to run, each with the rest of its program.  A
/// forked child resumes inside the fork call that created it.
#[derive(Clone, Default)]
struct RunQueue(Rc<RefCell<VecDeque<(EnvId, Program)>>>);

impl RunQueue {
    fn push(&self, env: EnvId, program: Program) {
        self.0.borrow_mut().push_back((env, program));
    }

    fn pop(&self) -> Option<(EnvId, Program)> {
        self.0.borrow_mut().pop_front()
    }

    /// fork (or sfork) from `p`.  The parent gets `Parent(child)` back;
    /// the child is queued to see `Child` from the same call and then run
    /// `rest`.
    fn fork<F>(&self, p: &Process, shared: bool, rest: F) -> Result<Role, ForkError>
    where
        F: FnOnce(&Process, &RunQueue) -> Result<(), ForkError> + 'static,
    {
        let call = move |p: &Process| if shared { p.sfork() } else { p.fork() };
        let role = call(p)?;
        if let Role::Parent(child) = role {
            self.push(
                child,
                Box::new(move |p: &Process, rq: &RunQueue| match call(p)? {
                    Role::Child => rest(p, rq),
                    Role::Parent(id) => {
                        log::error!("{} resumed as a parent of {}", p.id(), id);
                        Ok(())
                    }
                }),
            );
        }
        Ok(role)
    }

    /// Run until nobody is left.
    fn run(&self, kernel: &Kernel) {
        while let Some((id, program)) = self.pop() {
            let env = match kernel.enter(id) {
                Ok(env) => env,
                Err(err) => {
                    log::warn!("skipping {}: {}", id, err);
                    continue;
                }
            };
            // A failure has already been reported as a user panic.
            let _ = libmain(env, |p| program(p, self));
        }
    }
}

// ============================================================================
// Demos
// ============================================================================

fn data_page() -> VirtAddr {
    VirtAddr::new(UTEXT)
}

fn alloc_data(p: &Process, perm: PteFlags) -> Result<VirtAddr, ForkError> {
    let va = data_page();
    p.sys()
        .page_alloc(EnvId::CURRENT, va, perm)
        .during(Primitive::PageAlloc { env: EnvId::CURRENT, va, perm })?;
    Ok(va)
}

/// A zeroed page, fork, the child overwrites it with 0xff; the parent
/// writes its own copy and keeps it.
fn cow(p: &Process, rq: &RunQueue) -> Result<(), ForkError> {
    let va = alloc_data(p, PteFlags::PRIVATE_RW)?;

    let role = rq.fork(p, false, move |p, _| {
        let sys = p.sys();
        p.puts(&format!("[{}] child sees {:02x}\n", p.id(), sys.read_u8(va)?));
        sys.write_bytes(va, &[0xff; PGSIZE])?;
        let mut page = vec![0u8; PGSIZE];
        sys.read_bytes(va, &mut page)?;
        let all_ff = page.iter().all(|&b| b == 0xff);
        p.puts(&format!("[{}] child wrote ff over the page: {}\n", p.id(), all_ff));
        Ok(())
    })?;

    let sys = p.sys();
    sys.write_bytes(va, b"parent")?;
    let mut buf = [0u8; 6];
    sys.read_bytes(va, &mut buf)?;
    p.puts(&format!(
        "[{}] forked {:?}; parent's copy reads {:?}\n",
        p.id(),
        role,
        String::from_utf8_lossy(&buf)
    ));
    Ok(())
}

/// The child writes to a read-only page and panics.
fn illegal(p: &Process, rq: &RunQueue) -> Result<(), ForkError> {
    let va = alloc_data(p, PteFlags::PRESENT | PteFlags::USER)?;
    rq.fork(p, false, move |p, _| {
        p.puts(&format!("[{}] writing to read-only {:08x}\n", p.id(), va.as_u64()));
        p.sys().write_u8(va, 1)?;
        p.puts("not reached\n");
        Ok(())
    })?;
    Ok(())
}

const FORKTREE_DEPTH: usize = 3;

fn forktree(p: &Process, rq: &RunQueue) -> Result<(), ForkError> {
    forkchild(p, rq, String::new())
}

fn forkchild(p: &Process, rq: &RunQueue, cur: String) -> Result<(), ForkError> {
    p.puts(&format!("{}: I am '{}'\n", p.id(), cur));
    if cur.len() >= FORKTREE_DEPTH {
        return Ok(());
    }
    for branch in ['0', '1'] {
        let name = format!("{}{}", cur, branch);
        rq.fork(p, false, move |p, rq| forkchild(p, rq, name))?;
    }
    Ok(())
}

/// Parent and child share the data page but not the stack.
fn sfork(p: &Process, rq: &RunQueue) -> Result<(), ForkError> {
    let counter = alloc_data(p, PteFlags::PRIVATE_RW)?;
    let stack = VirtAddr::new(USTACKTOP - 1);
    p.sys().write_u8(stack, b'p')?;

    rq.fork(p, true, move |p, _| {
        let sys = p.sys();
        let n = sys.read_u8(counter)?;
        sys.write_u8(counter, n + 1)?;
        sys.write_u8(stack, b'c')?;
        p.puts(&format!(
            "[{}] child of {}: counter {} -> {}, stack '{}'\n",
            p.id(),
            p.thisenv().map_or(EnvId::CURRENT, |e| e.parent_id),
            n,
            n + 1,
            sys.read_u8(stack)? as char
        ));
        Ok(())
    })?;

    let sys = p.sys();
    sys.write_u8(counter, 1)?;
    p.puts(&format!(
        "[{}] parent: counter 1, stack '{}'\n",
        p.id(),
        sys.read_u8(stack)? as char
    ));
    Ok(())
}

// ============================================================================
// Monitor
// ============================================================================

/// Set up a parent with a forked child, then hand the machine to the
/// monitor on stdin.
fn monitor(kernel: &Kernel) -> io::Result<()> {
    let rq = RunQueue::default();
    if let Ok(id) = kernel.create_env() {
        if let Ok(env) = kernel.enter(id) {
            let p = UserProcess::new(env);
            let setup = alloc_data(&p, PteFlags::PRIVATE_RW)
                .and_then(|va| Ok(p.sys().write_bytes(va, b"monitor")?))
                .and_then(|_| rq.fork(&p, false, |_, _| Ok(())));
            if let Err(err) = setup {
                log::error!("monitor setup: {}", err);
            }
        }
    }

    let mut mon = Monitor::new(kernel.clone());
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    write!(stdout, "{}{}", Monitor::banner(), kern::monitor::PROMPT)?;
    stdout.flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        if matches!(line.trim(), "exit" | "quit") {
            break;
        }
        write!(stdout, "{}{}", mon.run_command(&line), kern::monitor::PROMPT)?;
        stdout.flush()?;
    }
    writeln!(stdout)
}

// ============================================================================
// main
// ============================================================================

fn stdout_hook(s: &str) {
    print!("{}", s);
}

fn main() {
    // log level from the environment
    let level = std::env::var("UFORK_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    kern::serial::set_output_hook(stdout_hook);
    kern::serial::init(level);

    let demo = std::env::args().nth(1).unwrap_or_else(|| "cow".into());
    let program: fn(&Process, &RunQueue) -> Result<(), ForkError> = match demo.as_str() {
        "cow" => cow,
        "illegal" => illegal,
        "forktree" => forktree,
        "sfork" => sfork,
        "monitor" => {
            let kernel = Kernel::boot(KernelConfig::default());
            if let Err(err) = monitor(&kernel) {
                eprintln!("monitor: {}", err);
                std::process::exit(1);
            }
            return;
        }
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(2);
        }
    };

    let kernel = Kernel::boot(KernelConfig::default());
    let root = match kernel.create_env() {
        Ok(id) => id,
        Err(err) => {
            eprintln!("create_env: {}", err);
            std::process::exit(1);
        }
    };
    let rq = RunQueue::default();
    rq.push(root, Box::new(program));
    rq.run(&kernel);

    let left = kernel.envs();
    if !left.is_empty() {
        log::warn!("{} environments never ran", left.len());
    }
}
