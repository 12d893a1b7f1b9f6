// kernel/src/memory/page_table.rs
//
// Two-level page tables: a 1024-entry directory, each entry covering
// 4 MiB through a 1024-entry table.
//
// Tables are created on demand the first time a page in their 4 MiB
// region is mapped and are never torn down while the directory lives.
// So "no table for this region" and "table exists, entry empty" are
// different answers, and introspection reports them differently.

use alloc::{boxed::Box, vec::Vec};

use x86_64::structures::paging::{Page, Size4KiB};

use crate::abi::{Pte, PteFlags, PteLookup};
use crate::memlayout::{NPDENTRIES, NPTENTRIES, pdx, ptx};

/// Flags every directory entry carries; the leaf decides the real
/// permissions.
pub const PDE_FLAGS: PteFlags = PteFlags::PRIVATE_RW;

pub struct PageTable {
    entries: [Pte; NPTENTRIES],
}

impl PageTable {
    fn new() -> Box<Self> {
        Box::new(Self {
            entries: [Pte::empty(); NPTENTRIES],
        })
    }
}

pub struct PageDirectory {
    tables: Vec<Option<Box<PageTable>>>,
}

impl PageDirectory {
    pub fn new() -> Self {
        let mut tables = Vec::with_capacity(NPDENTRIES);
        tables.resize_with(NPDENTRIES, || None);
        Self { tables }
    }

    /// Directory and table index, or `None` above the 4 GiB the
    /// directory spans.
    #[inline]
    fn indices(page: Page<Size4KiB>) -> Option<(usize, usize)> {
        let va = page.start_address().as_u64();
        (va < 1 << 32).then(|| (pdx(va), ptx(va)))
    }

    /// Does a page table cover `page`'s 4 MiB region?
    pub fn pde_present(&self, page: Page<Size4KiB>) -> bool {
        Self::indices(page).is_some_and(|(dir, _)| self.tables[dir].is_some())
    }

    /// Directory flags for `page`'s region (empty if no table).
    pub fn pde_flags(&self, page: Page<Size4KiB>) -> PteFlags {
        if self.pde_present(page) { PDE_FLAGS } else { PteFlags::empty() }
    }

    pub fn lookup(&self, page: Page<Size4KiB>) -> PteLookup {
        let Some((dir, tab)) = Self::indices(page) else {
            return PteLookup::Absent;
        };
        match &self.tables[dir] {
            Some(table) => PteLookup::Entry(table.entries[tab]),
            None => PteLookup::Absent,
        }
    }

    /// Walk to the entry for `page`, creating the page table if asked.
    pub fn walk_mut(&mut self, page: Page<Size4KiB>, create: bool) -> Option<&mut Pte> {
        let (dir, tab) = Self::indices(page)?;
        let slot = &mut self.tables[dir];
        if slot.is_none() {
            if !create {
                return None;
            }
            *slot = Some(PageTable::new());
        }
        slot.as_mut().map(|table| &mut table.entries[tab])
    }

    /// Every leaf entry in an existing table, lowest address first,
    /// keyed by virtual page number.
    pub fn entries(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.tables
            .iter()
            .enumerate()
            .filter_map(|(dir, t)| t.as_ref().map(|t| (dir, t)))
            .flat_map(|(dir, table)| {
                table
                    .entries
                    .iter()
                    .enumerate()
                    .map(move |(tab, pte)| (dir * NPTENTRIES + tab, *pte))
            })
    }

    /// Every present leaf entry, lowest address first.
    pub fn present_entries(&self) -> impl Iterator<Item = (usize, Pte)> + '_ {
        self.entries().filter(|(_, pte)| pte.is_present())
    }
}

impl Default for PageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memlayout::{page_of, pgnum};
    use x86_64::{PhysAddr, structures::paging::PhysFrame};

    #[test]
    fn absent_until_a_table_exists() {
        let mut pgdir = PageDirectory::new();
        let page = page_of(0x0080_0000);
        assert_eq!(pgdir.lookup(page), PteLookup::Absent);
        assert!(pgdir.walk_mut(page, false).is_none());

        pgdir.walk_mut(page, true);
        assert_eq!(pgdir.lookup(page), PteLookup::Entry(Pte::empty()));
        // Neighbour in the same 4 MiB region is now covered too.
        assert_eq!(pgdir.lookup(page_of(0x0080_1000)), PteLookup::Entry(Pte::empty()));
        assert_eq!(pgdir.lookup(page_of(0x00c0_0000)), PteLookup::Absent);
    }

    #[test]
    fn present_entries_reports_vpns() {
        let mut pgdir = PageDirectory::new();
        let frame = PhysFrame::containing_address(PhysAddr::new(0x5000));
        for va in [0x0080_2000u64, 0x0040_0000] {
            *pgdir.walk_mut(page_of(va), true).unwrap() = Pte::new(frame, PteFlags::PRIVATE_RW);
        }
        let vpns: Vec<usize> = pgdir.present_entries().map(|(vpn, _)| vpn).collect();
        assert_eq!(vpns, [pgnum(0x0040_0000), pgnum(0x0080_2000)]);
    }
}
