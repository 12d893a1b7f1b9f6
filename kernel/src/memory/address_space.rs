// kernel/src/memory/address_space.rs
//
// AddressSpace: one environment's page directory plus the frame
// bookkeeping that goes with mapping and unmapping.
//
// Every mapping holds one reference on its frame.  Replacing a mapping
// takes the new reference before dropping the old one, so remapping a
// page onto its own frame (the parent side of a fork) never frees it.

use x86_64::{
    PhysAddr, VirtAddr,
    structures::paging::{Page, PhysFrame, Size4KiB},
};

use super::frame_allocator::FramePool;
use super::page_table::PageDirectory;
use crate::abi::{Pte, PteFlags, PteLookup};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The page lies above the 4 GiB the tables span.
    OutOfRange,
}

pub struct AddressSpace {
    pgdir: PageDirectory,
}

impl AddressSpace {
    // ====================================================================
    // CONSTRUCTORS
    // ====================================================================

    /// Empty user address space: no page tables at all.
    pub fn new() -> Self {
        Self {
            pgdir: PageDirectory::new(),
        }
    }

    // ====================================================================
    // MAPPING
    // ====================================================================

    /// Map `page` to `frame` with `flags`, replacing whatever was there.
    pub fn insert(
        &mut self,
        frames: &mut FramePool,
        page: Page<Size4KiB>,
        frame: PhysFrame<Size4KiB>,
        flags: PteFlags,
    ) -> Result<(), MapError> {
        let pte = self.pgdir.walk_mut(page, true).ok_or(MapError::OutOfRange)?;
        frames.incref(frame);
        let old = core::mem::replace(pte, Pte::new(frame, flags | PteFlags::PRESENT));
        if old.is_backed() {
            frames.decref(old.frame());
        }
        Ok(())
    }

    /// Unmap `page`.  Silently does nothing if it isn't mapped.
    pub fn remove(&mut self, frames: &mut FramePool, page: Page<Size4KiB>) {
        if let Some(pte) = self.pgdir.walk_mut(page, false) {
            let old = core::mem::replace(pte, Pte::empty());
            if old.is_backed() {
                frames.decref(old.frame());
            }
        }
    }

    /// Drop every mapping.  Used when the environment is destroyed.
    pub fn clear(&mut self, frames: &mut FramePool) {
        for (_, pte) in self.pgdir.entries().filter(|(_, pte)| pte.is_backed()) {
            frames.decref(pte.frame());
        }
        self.pgdir = PageDirectory::new();
    }

    // ====================================================================
    // INTROSPECTION
    // ====================================================================

    pub fn lookup(&self, page: Page<Size4KiB>) -> PteLookup {
        self.pgdir.lookup(page)
    }

    /// The present entry for `page`, if any.
    pub fn present(&self, page: Page<Size4KiB>) -> Option<Pte> {
        self.pgdir.lookup(page).present()
    }

    /// Physical address backing `va`.  The tables cover 4 GiB; anything
    /// above is unmapped.
    pub fn translate(&self, va: VirtAddr) -> Option<PhysAddr> {
        if va.as_u64() >= 1 << 32 {
            return None;
        }
        let page = Page::<Size4KiB>::containing_address(va);
        let pte = self.present(page)?;
        Some(pte.frame().start_address() + (va - page.start_address()))
    }

    /// Directory-level flags for the region holding `page`.
    pub fn pde_flags(&self, page: Page<Size4KiB>) -> PteFlags {
        self.pgdir.pde_flags(page)
    }

    /// Mutable access to an entry that names a frame, for the MMU's
    /// accessed/dirty bits and the monitor's `setperm`.
    pub fn entry_mut(&mut self, page: Page<Size4KiB>) -> Option<&mut Pte> {
        self.pgdir.walk_mut(page, false).filter(|pte| pte.is_backed())
    }

    pub fn mapped_pages(&self) -> usize {
        self.pgdir.present_entries().count()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::page_of;

    #[test]
    fn insert_takes_a_reference_and_remove_drops_it() {
        let mut frames = FramePool::new(8);
        let mut aspace = AddressSpace::new();
        let frame = frames.allocate_frame().unwrap();
        let page = page_of(0x0080_0000);

        aspace.insert(&mut frames, page, frame, PteFlags::PRIVATE_RW).unwrap();
        assert_eq!(frames.refcount(frame), 1);
        assert_eq!(aspace.present(page).map(|p| p.frame()), Some(frame));

        aspace.remove(&mut frames, page);
        assert_eq!(frames.refcount(frame), 0);
        assert_eq!(aspace.lookup(page), PteLookup::Entry(Pte::empty()));
        assert_eq!(frames.free_frames(), 7);
    }

    #[test]
    fn remapping_onto_the_same_frame_keeps_it_alive() {
        let mut frames = FramePool::new(4);
        let mut aspace = AddressSpace::new();
        let frame = frames.allocate_frame().unwrap();
        let page = page_of(0x0080_0000);

        aspace.insert(&mut frames, page, frame, PteFlags::PRIVATE_RW).unwrap();
        aspace
            .insert(&mut frames, page, frame, PteFlags::PRIVATE_RW.to_cow())
            .unwrap();
        assert_eq!(frames.refcount(frame), 1);
        assert!(aspace.present(page).unwrap().flags().is_cow());
    }

    #[test]
    fn translate_keeps_the_page_offset() {
        let mut frames = FramePool::new(4);
        let mut aspace = AddressSpace::new();
        let frame = frames.allocate_frame().unwrap();
        aspace
            .insert(&mut frames, page_of(0x0080_0000), frame, PteFlags::PRIVATE_RW)
            .unwrap();
        assert_eq!(
            aspace.translate(VirtAddr::new(0x0080_0123)),
            Some(frame.start_address() + 0x123u64)
        );
        assert_eq!(aspace.translate(VirtAddr::new(0x0080_1000)), None);
        assert_eq!(aspace.translate(VirtAddr::new(0x1_0080_0123)), None);
    }

    #[test]
    fn pages_above_4gib_are_refused_not_aliased() {
        let mut frames = FramePool::new(4);
        let mut aspace = AddressSpace::new();
        let frame = frames.allocate_frame().unwrap();
        let high = page_of(0x1_0080_0000);

        assert_eq!(
            aspace.insert(&mut frames, high, frame, PteFlags::PRIVATE_RW),
            Err(MapError::OutOfRange)
        );
        assert_eq!(frames.refcount(frame), 0);
        assert_eq!(aspace.lookup(page_of(0x0080_0000)), PteLookup::Absent);
        assert_eq!(aspace.lookup(high), PteLookup::Absent);
        assert!(aspace.entry_mut(high).is_none());
    }

    #[test]
    fn clear_releases_everything() {
        let mut frames = FramePool::new(4);
        let mut aspace = AddressSpace::new();
        for va in [0x0080_0000u64, 0x0080_1000] {
            let f = frames.allocate_frame().unwrap();
            aspace.insert(&mut frames, page_of(va), f, PteFlags::PRIVATE_RW).unwrap();
        }
        assert_eq!(aspace.mapped_pages(), 2);
        aspace.clear(&mut frames);
        assert_eq!(aspace.mapped_pages(), 0);
        assert_eq!(frames.free_frames(), 3);
    }
}
