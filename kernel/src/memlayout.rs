// kernel/src/memlayout.rs
//
// User address layout shared by the kernel and the user library.
//
// Two-level paging, 4 KiB pages, 1024 entries per level:
//
//   UTOP, UXSTACKTOP -> +------------------------------+ 0xeec00000
//                       |   user exception stack       |  PGSIZE
//                       +------------------------------+ 0xeebff000
//                       |   empty guard page           |  PGSIZE
//        USTACKTOP  --> +------------------------------+ 0xeebfe000
//                       |   normal user stack          |  USTACKSIZE
//                       +------------------------------+
//                       :              .               :
//                       |   program data & heap        |
//        UTEXT      --> +------------------------------+ 0x00800000
//        PFTEMP     --> |   fault-handler scratch page | 0x007ff000
//        UTEMP      --> +------------------------------+ 0x00400000
//                       |   unmapped                   |
//                   0 ->+------------------------------+

use x86_64::{
    VirtAddr,
    structures::paging::{Page, Size4KiB},
};

// ============================================================================
// Paging geometry
// ============================================================================

pub const PGSIZE: usize = 4096;
pub const PGSHIFT: u32 = 12;

/// Page-directory entries per directory.
pub const NPDENTRIES: usize = 1024;
/// Page-table entries per table.
pub const NPTENTRIES: usize = 1024;

/// Bytes mapped by one page-directory entry.
pub const PTSIZE: usize = PGSIZE * NPTENTRIES;
pub const PDXSHIFT: u32 = 22;

// ============================================================================
// User layout
// ============================================================================

/// Everything at or above this address belongs to the kernel.
pub const UTOP: u64 = 0xeec0_0000;

/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u64 = UTOP;

/// Top of the normal user stack; one guard page below the exception stack.
pub const USTACKTOP: u64 = UTOP - 2 * PGSIZE as u64;

/// Size of the normal user stack region.  Shared fork keeps this region
/// private to each side.
pub const USTACKSIZE: u64 = 8 * PGSIZE as u64;

pub const UTEMP: u64 = PTSIZE as u64;

/// Scratch page used while privatizing a copy-on-write page.
pub const PFTEMP: u64 = UTEMP + PTSIZE as u64 - PGSIZE as u64;

/// Where program text and data start.
pub const UTEXT: u64 = 2 * PTSIZE as u64;

// ============================================================================
// Helpers
// ============================================================================

/// Page-directory index of `va`.
#[inline]
pub const fn pdx(va: u64) -> usize {
    ((va >> PDXSHIFT) & 0x3FF) as usize
}

/// Page-table index of `va`.
#[inline]
pub const fn ptx(va: u64) -> usize {
    ((va >> PGSHIFT) & 0x3FF) as usize
}

/// Virtual page number of `va`.
#[inline]
pub const fn pgnum(va: u64) -> usize {
    (va >> PGSHIFT) as usize
}

/// The page containing `va`.
#[inline]
pub fn page_of(va: u64) -> Page<Size4KiB> {
    Page::containing_address(VirtAddr::new(va))
}

/// The page with virtual page number `vpn`.
#[inline]
pub fn page_from_vpn(vpn: usize) -> Page<Size4KiB> {
    page_of((vpn as u64) << PGSHIFT)
}

/// The exception stack page.
#[inline]
pub fn uxstack_page() -> Page<Size4KiB> {
    page_of(UXSTACKTOP - PGSIZE as u64)
}

/// Is `va` a page-aligned user address?
#[inline]
pub const fn is_user_page_addr(va: u64) -> bool {
    va < UTOP && va % PGSIZE as u64 == 0
}

/// Does `va` fall in the normal user stack region?
#[inline]
pub const fn in_user_stack(va: u64) -> bool {
    va >= USTACKTOP - USTACKSIZE && va < USTACKTOP
}
