// kernel/src/monitor.rs
//
// Kernel monitor: a line-oriented command interpreter for poking at
// environments from the host.  It reads through the privileged
// inspection interface on `Kernel` and never goes through the MMU, so
// looking at memory cannot fault anyone.
//
// Numbers accept 0x (hex), leading 0 (octal) or plain decimal.  Commands
// that look at an address space take an optional trailing env id and
// otherwise use the lowest-numbered live environment.

use alloc::{format, string::String, vec::Vec};
use core::fmt::Write;

use x86_64::{
    PhysAddr, VirtAddr,
    structures::paging::{Page, Size4KiB},
};

use crate::abi::{EnvId, EnvStatus, PteFlags, PteLookup};
use crate::kernel::Kernel;
use crate::memlayout::{PGSIZE, page_of, pdx, ptx};

pub const PROMPT: &str = "K> ";
pub const MAXARGS: usize = 16;

struct Command {
    name: &'static str,
    desc: &'static str,
    func: fn(&mut Monitor, &[&str], &mut String),
}

const COMMANDS: &[Command] = &[
    Command { name: "help", desc: "Display this list of commands", func: Monitor::cmd_help },
    Command { name: "envs", desc: "List live environments", func: Monitor::cmd_envs },
    Command { name: "showmappings", desc: "Show virtual memory mappings", func: Monitor::cmd_showmappings },
    Command { name: "setperm", desc: "Set the permission of a virtual page", func: Monitor::cmd_setperm },
    Command { name: "dumpmem", desc: "Dump memory to console", func: Monitor::cmd_dumpmem },
];

/// Parse like `strtol(s, NULL, 0)`, but reject trailing junk.
pub fn parse_number(s: &str) -> Option<u64> {
    let (digits, radix) = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        (hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        (&s[1..], 8)
    } else {
        (s, 10)
    };
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, radix).ok()
}

fn round_down(va: u64) -> u64 {
    va & !(PGSIZE as u64 - 1)
}

fn round_up(va: u64) -> u64 {
    round_down(va.saturating_add(PGSIZE as u64 - 1))
}

fn pwu(flags: PteFlags) -> String {
    flags.pwu().iter().collect()
}

pub struct Monitor {
    kernel: Kernel,
}

impl Monitor {
    pub fn new(kernel: Kernel) -> Self {
        Self { kernel }
    }

    pub fn banner() -> &'static str {
        "Welcome to the kernel monitor!\nType 'help' for a list of commands.\n"
    }

    /// Run one command line and return what it printed.
    pub fn run_command(&mut self, line: &str) -> String {
        let mut out = String::new();
        let argv: Vec<&str> = line.split_whitespace().collect();
        if argv.len() >= MAXARGS {
            let _ = writeln!(out, "Too many arguments (max {})", MAXARGS);
            return out;
        }
        let Some(&name) = argv.first() else {
            return out;
        };
        match COMMANDS.iter().find(|c| c.name == name) {
            Some(cmd) => (cmd.func)(self, &argv, &mut out),
            None => {
                let _ = writeln!(out, "Unknown command '{}'", name);
            }
        }
        out
    }

    /// Resolve the optional trailing env argument.
    fn target(&self, arg: Option<&str>, out: &mut String) -> Option<EnvId> {
        let id = match arg {
            Some(s) => match parse_number(s) {
                Some(n) => EnvId(n as u32),
                None => {
                    let _ = writeln!(out, "Invalid number '{}'", s);
                    return None;
                }
            },
            None => match self.kernel.envs().first() {
                Some(summary) => summary.info.id,
                None => {
                    let _ = writeln!(out, "No environments");
                    return None;
                }
            },
        };
        if self.kernel.env_status(id).is_none() {
            let _ = writeln!(out, "No such environment {}", id);
            return None;
        }
        Some(id)
    }

    fn numbers<const N: usize>(args: &[&str], out: &mut String) -> Option<[u64; N]> {
        let mut values = [0u64; N];
        for (value, arg) in values.iter_mut().zip(args) {
            match parse_number(arg) {
                Some(n) => *value = n,
                None => {
                    let _ = writeln!(out, "Invalid number '{}'", arg);
                    return None;
                }
            }
        }
        Some(values)
    }

    // ====================================================================
    // COMMANDS
    // ====================================================================

    fn cmd_help(&mut self, _argv: &[&str], out: &mut String) {
        for cmd in COMMANDS {
            let _ = writeln!(out, "{} - {}", cmd.name, cmd.desc);
        }
    }

    fn cmd_envs(&mut self, _argv: &[&str], out: &mut String) {
        let _ = writeln!(out, "  env       parent    status        pages  faults  upcall");
        for summary in self.kernel.envs() {
            let info = summary.info;
            let status = match info.status {
                EnvStatus::Runnable => "runnable",
                EnvStatus::NotRunnable => "not runnable",
                EnvStatus::Free => "free",
            };
            let _ = writeln!(
                out,
                "  {}  {}  {:<12}  {:>5}  {:>6}  {}",
                info.id,
                info.parent_id,
                status,
                summary.mapped_pages,
                info.pgfaults,
                if info.pgfault_upcall.is_some() { "yes" } else { "no" }
            );
        }
    }

    fn cmd_showmappings(&mut self, argv: &[&str], out: &mut String) {
        if !(3..=4).contains(&argv.len()) {
            let _ = writeln!(out, "Usage: showmappings <va_start> <va_end> [env]");
            return;
        }
        let Some([start, end]) = Self::numbers::<2>(&argv[1..3], out) else {
            return;
        };
        let Some(env) = self.target(argv.get(3).copied(), out) else {
            return;
        };

        let _ = writeln!(out, "Virtual memory mappings of env {}:", env);
        let _ = writeln!(out, "  VA start    VA end      PDX   PTX   PA        PDE flags  PTE flags");
        let mut va = round_down(start);
        let end = round_up(end).min(1 << 32);
        while va < end {
            let page = page_of(va);
            match self.kernel.lookup(env, page) {
                Some(PteLookup::Entry(pte)) => {
                    let pde = self.kernel.pde_flags(env, page).unwrap_or(PteFlags::empty());
                    let flags = pte.flags();
                    let soft = if flags.is_cow() {
                        " cow"
                    } else if flags.is_shared() {
                        " share"
                    } else {
                        ""
                    };
                    let _ = writeln!(
                        out,
                        "  {:08x} - {:08x}:  {:03x}   {:03x}   {:08x}  {}        {}{}",
                        va,
                        va + PGSIZE as u64,
                        pdx(va),
                        ptx(va),
                        if pte.is_backed() { pte.frame().start_address().as_u64() } else { 0 },
                        pwu(pde),
                        pwu(flags),
                        soft
                    );
                }
                _ => {
                    let _ = writeln!(out, "  {:08x} - {:08x}: not mapped", va, va + PGSIZE as u64);
                }
            }
            va += PGSIZE as u64;
        }
    }

    fn cmd_setperm(&mut self, argv: &[&str], out: &mut String) {
        if !(3..=4).contains(&argv.len()) {
            let _ = writeln!(out, "Usage: setperm <va> <perm: [0, 7]> [env]");
            return;
        }
        let Some([va, perm]) = Self::numbers::<2>(&argv[1..3], out) else {
            return;
        };
        let Some(env) = self.target(argv.get(3).copied(), out) else {
            return;
        };

        let va = round_down(va);
        let perm = PteFlags::from_bits_truncate(perm & 0x7);
        let page = VirtAddr::try_new(va).ok().map(Page::<Size4KiB>::containing_address);
        match page.and_then(|page| self.kernel.set_perm(env, page, perm)) {
            Some(_) => {
                let _ = writeln!(out, "Set permission of virtual page {:08x} to {}", va, pwu(perm));
            }
            None => {
                let _ = writeln!(out, "Failed to map virtual address {:08x}", va);
            }
        }
    }

    fn cmd_dumpmem(&mut self, argv: &[&str], out: &mut String) {
        if !(4..=5).contains(&argv.len()) || !matches!(argv[1], "v" | "p") {
            let _ = writeln!(out, "Usage: dumpmem <mode: ['v' | 'p']> <start> <end> [env]");
            return;
        }
        let Some([start, end]) = Self::numbers::<2>(&argv[2..4], out) else {
            return;
        };
        let physical = argv[1] == "p";
        let env = if physical {
            None
        } else {
            match self.target(argv.get(4).copied(), out) {
                Some(env) => Some(env),
                None => return,
            }
        };

        let read = |addr: u64| -> Option<u8> {
            let mut byte = [0u8; 1];
            let ok = match env {
                Some(env) => self.kernel.read_virt(env, VirtAddr::try_new(addr).ok()?, &mut byte),
                None => self.kernel.read_phys(PhysAddr::try_new(addr).ok()?, &mut byte),
            };
            ok.then_some(byte[0])
        };

        let mut row = start;
        while row < end {
            let _ = write!(out, "{:08x}: ", row);
            for group in (0..16u64).step_by(4) {
                let Some(base) = row.checked_add(group).filter(|&a| a < end) else {
                    out.push('\n');
                    break;
                };
                let bytes: Vec<String> = (0..4)
                    .map(|i| match base.checked_add(i).and_then(|a| read(a)) {
                        Some(b) => format!("{:02x}", b),
                        None => String::from("--"),
                    })
                    .collect();
                out.push_str(&bytes.join(" "));
                out.push_str(if group == 12 { "\n" } else { " / " });
            }
            // Top of the address space.
            let Some(next) = row.checked_add(16) else {
                break;
            };
            row = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_follow_strtol_bases() {
        assert_eq!(parse_number("0x800000"), Some(0x80_0000));
        assert_eq!(parse_number("0X1f"), Some(0x1f));
        assert_eq!(parse_number("010"), Some(8));
        assert_eq!(parse_number("0"), Some(0));
        assert_eq!(parse_number("4096"), Some(4096));
        assert_eq!(parse_number("0x"), None);
        assert_eq!(parse_number("12ab"), None);
        assert_eq!(parse_number("09"), None);
    }

    #[test]
    fn rounding() {
        assert_eq!(round_down(0x1234), 0x1000);
        assert_eq!(round_up(0x1234), 0x2000);
        assert_eq!(round_up(0x2000), 0x2000);
    }
}
