// kernel/src/env/table.rs

use alloc::{collections::VecDeque, vec::Vec};

use super::Env;
use crate::abi::{EnvId, EnvStatus, SysError, SysResult};
use crate::memory::FramePool;

/// Generation counter lives above this bit.
pub const ENVGENSHIFT: u32 = 12;

/// Largest table the id encoding allows.
pub const MAX_LOG2_NENV: u32 = ENVGENSHIFT;

pub struct EnvTable {
    envs: Vec<Env>,
    free: VecDeque<usize>,
    log2_nenv: u32,
}

impl EnvTable {
    pub fn new(log2_nenv: u32) -> Self {
        let log2_nenv = log2_nenv.min(MAX_LOG2_NENV);
        let nenv = 1usize << log2_nenv;
        Self {
            envs: (0..nenv).map(|_| Env::free(EnvId::CURRENT)).collect(),
            // Slot 0 goes first.
            free: (0..nenv).collect(),
            log2_nenv,
        }
    }

    pub fn nenv(&self) -> usize {
        self.envs.len()
    }

    #[inline]
    fn slot(&self, id: EnvId) -> usize {
        id.slot(self.log2_nenv)
    }

    /// Take a free slot for a new child of `parent` (CURRENT for the
    /// first environment).  The new environment is not runnable.
    pub fn alloc(&mut self, parent: EnvId) -> SysResult<EnvId> {
        let slot = self.free.pop_front().ok_or(SysError::NoFreeEnv)?;
        let mask = (self.nenv() - 1) as u32;

        let mut generation = self.envs[slot].id.0.wrapping_add(1 << ENVGENSHIFT) & !mask;
        if generation as i32 <= 0 {
            generation = 1 << ENVGENSHIFT;
        }
        let id = EnvId(generation | slot as u32);

        let env = &mut self.envs[slot];
        *env = Env::free(id);
        env.parent_id = parent;
        env.status = EnvStatus::NotRunnable;
        Ok(id)
    }

    /// Release `id`'s slot.  Its mappings are dropped.
    pub fn release(&mut self, id: EnvId, frames: &mut FramePool) {
        let slot = self.slot(id);
        let Some(env) = self.envs.get_mut(slot) else {
            return;
        };
        if env.id != id || env.is_free() {
            return;
        }
        env.aspace.clear(frames);
        env.status = EnvStatus::Free;
        env.pgfault_upcall = None;
        env.in_fault = false;
        env.fork_return_pending = false;
        self.free.push_back(slot);
    }

    /// The live environment named exactly by `id`.
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        self.envs
            .get(self.slot(id))
            .filter(|env| env.id == id && !env.is_free())
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        let slot = self.slot(id);
        self.envs
            .get_mut(slot)
            .filter(|env| env.id == id && !env.is_free())
    }

    /// Resolve a syscall's env argument.  `0` is the caller.  With
    /// `checkperm`, the target must be the caller or its immediate child.
    pub fn resolve(&self, arg: EnvId, caller: EnvId, checkperm: bool) -> SysResult<EnvId> {
        let target = if arg.is_current() { caller } else { arg };
        let env = self.get(target).ok_or(SysError::BadEnv)?;
        if checkperm && env.id != caller && env.parent_id != caller {
            return Err(SysError::BadEnv);
        }
        Ok(env.id)
    }

    /// Live environments, in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.envs.iter().filter(|env| !env.is_free())
    }
}
