// kernel/src/kernel.rs
//
// The kernel object: frames, environments and exit records behind one
// lock.  `Kernel` is a cheap handle; clones share the same machine.
//
// Two kinds of access:
//   - user code gets a `UserEnv` from `enter` and talks through the abi
//     traits, exactly as a running environment would
//   - the host (launcher, monitor, tests) uses the privileged methods
//     here to create the first environment and inspect state

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use spin::{Mutex, MutexGuard};
use x86_64::{
    PhysAddr, VirtAddr,
    structures::paging::{Page, PhysFrame, Size4KiB},
};

use crate::abi::{EnvId, EnvInfo, EnvStatus, ExitReason, PteFlags, PteLookup, SysResult};
use crate::env::EnvTable;
use crate::memlayout::{PGSIZE, USTACKTOP, page_of};
use crate::memory::FramePool;
use crate::user::UserEnv;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Physical memory, in 4 KiB frames.
    pub npages: usize,
    /// The environment table holds `1 << log2_nenv` slots.
    pub log2_nenv: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            npages: 4096,
            log2_nenv: 10,
        }
    }
}

// ============================================================================
// State
// ============================================================================

pub(crate) struct KernelState {
    pub(crate) frames: FramePool,
    pub(crate) envs: EnvTable,
    pub(crate) exits: BTreeMap<EnvId, ExitReason>,
}

impl KernelState {
    /// Tear down `id` and remember why.  No-op if it is already gone.
    pub(crate) fn destroy(&mut self, id: EnvId, reason: ExitReason) {
        if self.envs.get(id).is_none() {
            return;
        }
        log::info!("free env {}: {}", id, reason);
        self.envs.release(id, &mut self.frames);
        self.exits.insert(id, reason);
    }
}

/// One row of the monitor's `envs` listing.
#[derive(Debug, Clone)]
pub struct EnvSummary {
    pub info: EnvInfo<UserEnv>,
    pub mapped_pages: usize,
}

// ============================================================================
// Handle
// ============================================================================

#[derive(Clone)]
pub struct Kernel {
    state: Arc<Mutex<KernelState>>,
}

impl Kernel {
    pub fn boot(config: KernelConfig) -> Self {
        let state = KernelState {
            frames: FramePool::new(config.npages),
            envs: EnvTable::new(config.log2_nenv),
            exits: BTreeMap::new(),
        };
        log::info!(
            "kernel: {} frames, {} env slots",
            state.frames.total_frames(),
            state.envs.nenv()
        );
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.state.lock()
    }

    /// Create a runnable top-level environment with one page of user
    /// stack mapped just below `USTACKTOP`.
    pub fn create_env(&self) -> SysResult<EnvId> {
        let mut guard = self.lock();
        let k = &mut *guard;
        let id = k.envs.alloc(EnvId::CURRENT)?;
        let stack = page_of(USTACKTOP - PGSIZE as u64);
        if let Err(err) = k.sys_page_alloc(id, id, stack.start_address(), PteFlags::PRIVATE_RW) {
            k.envs.release(id, &mut k.frames);
            return Err(err);
        }
        if let Some(env) = k.envs.get_mut(id) {
            env.status = EnvStatus::Runnable;
        }
        log::info!("[00000000] new env {}", id);
        Ok(id)
    }

    /// Run as `id`.  Only runnable environments can be entered.
    pub fn enter(&self, id: EnvId) -> SysResult<UserEnv> {
        let k = self.lock();
        match k.envs.get(id) {
            Some(env) if env.status == EnvStatus::Runnable => Ok(UserEnv::new(self.clone(), id)),
            _ => Err(crate::abi::SysError::BadEnv),
        }
    }

    // ====================================================================
    // PRIVILEGED INSPECTION
    // ====================================================================

    pub fn env_info(&self, id: EnvId) -> Option<EnvInfo<UserEnv>> {
        self.lock().envs.get(id).map(|env| env.info())
    }

    pub fn env_status(&self, id: EnvId) -> Option<EnvStatus> {
        self.lock().envs.get(id).map(|env| env.status)
    }

    /// Live environments in slot order.
    pub fn envs(&self) -> Vec<EnvSummary> {
        self.lock()
            .envs
            .iter()
            .map(|env| EnvSummary {
                info: env.info(),
                mapped_pages: env.aspace.mapped_pages(),
            })
            .collect()
    }

    /// Live environments that can be entered right now.
    pub fn runnable(&self) -> Vec<EnvId> {
        self.lock()
            .envs
            .iter()
            .filter(|env| env.status == EnvStatus::Runnable)
            .map(|env| env.id)
            .collect()
    }

    pub fn exit_reason(&self, id: EnvId) -> Option<ExitReason> {
        self.lock().exits.get(&id).cloned()
    }

    pub fn lookup(&self, id: EnvId, page: Page<Size4KiB>) -> Option<PteLookup> {
        self.lock().envs.get(id).map(|env| env.aspace.lookup(page))
    }

    /// Directory-level flags covering `page` in `id`.
    pub fn pde_flags(&self, id: EnvId, page: Page<Size4KiB>) -> Option<PteFlags> {
        self.lock().envs.get(id).map(|env| env.aspace.pde_flags(page))
    }

    pub fn frame_refcount(&self, frame: PhysFrame<Size4KiB>) -> u32 {
        self.lock().frames.refcount(frame)
    }

    pub fn free_frames(&self) -> usize {
        self.lock().frames.free_frames()
    }

    /// Read physical memory.  Fails if any byte lies in a frame that was
    /// never allocated.
    pub fn read_phys(&self, pa: PhysAddr, buf: &mut [u8]) -> bool {
        let k = self.lock();
        for (i, byte) in buf.iter_mut().enumerate() {
            let addr = pa + i as u64;
            let frame = PhysFrame::<Size4KiB>::containing_address(addr);
            let Some(data) = k.frames.data(frame) else {
                return false;
            };
            *byte = data[(addr.as_u64() % PGSIZE as u64) as usize];
        }
        true
    }

    /// Read `id`'s memory without going through the MMU.  Fails on
    /// unmapped bytes.
    pub fn read_virt(&self, id: EnvId, va: VirtAddr, buf: &mut [u8]) -> bool {
        let k = self.lock();
        let Some(env) = k.envs.get(id) else {
            return false;
        };
        for (i, byte) in buf.iter_mut().enumerate() {
            let Some(pa) = env.aspace.translate(va + i as u64) else {
                return false;
            };
            let frame = PhysFrame::<Size4KiB>::containing_address(pa);
            let Some(data) = k.frames.data(frame) else {
                return false;
            };
            *byte = data[(pa.as_u64() % PGSIZE as u64) as usize];
        }
        true
    }

    /// Overwrite the low P/W/U bits of an existing entry, bypassing every
    /// syscall check.  Returns the new flags.
    pub fn set_perm(&self, id: EnvId, page: Page<Size4KiB>, pwu: PteFlags) -> Option<PteFlags> {
        let mut k = self.lock();
        let env = k.envs.get_mut(id)?;
        let pte = env.aspace.entry_mut(page)?;
        let low = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER;
        let flags = pte.flags().difference(low) | (pwu & low);
        *pte = pte.with_flags(flags);
        Some(flags)
    }
}
