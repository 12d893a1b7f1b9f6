// kernel/src/abi/flags.rs
//
// Page-table entry permission bits.
//
// The low 12 bits of an entry are flags; bits 9-11 are ignored by the
// MMU and handed to software.  Two of them carry fork state:
//   - SHARE: the page is shared for good, never copy-on-write
//   - COW:   logically writable, physically shared until first write

use core::fmt;

use bitflags::bitflags;
use x86_64::{PhysAddr, structures::paging::{PhysFrame, Size4KiB}};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PteFlags: u64 {
        const PRESENT       = 0x001;
        const WRITABLE      = 0x002;
        const USER          = 0x004;
        const WRITE_THROUGH = 0x008;
        const CACHE_DISABLE = 0x010;
        const ACCESSED      = 0x020;
        const DIRTY         = 0x040;
        const HUGE          = 0x080;
        const GLOBAL        = 0x100;

        /// Free for software use.
        const AVAIL         = 0xE00;
        const SHARE         = 0x400;
        const COW           = 0x800;

        /// Bits a user mapping request may carry.
        const SYSCALL = Self::AVAIL.bits()
            | Self::PRESENT.bits()
            | Self::WRITABLE.bits()
            | Self::USER.bits();
    }
}

impl PteFlags {
    /// Present, writable, user: a private data page.
    pub const PRIVATE_RW: PteFlags = PteFlags::PRESENT
        .union(PteFlags::WRITABLE)
        .union(PteFlags::USER);

    /// Project onto the bits a mapping syscall accepts.
    #[inline]
    pub const fn syscall_bits(self) -> PteFlags {
        self.intersection(PteFlags::SYSCALL)
    }

    /// The copy-on-write form of these permissions: settable bits only,
    /// WRITABLE dropped, COW and PRESENT set.
    #[inline]
    pub const fn to_cow(self) -> PteFlags {
        self.syscall_bits()
            .difference(PteFlags::WRITABLE)
            .union(PteFlags::COW)
            .union(PteFlags::PRESENT)
    }

    #[inline]
    pub const fn is_present(self) -> bool {
        self.contains(PteFlags::PRESENT)
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.contains(PteFlags::WRITABLE)
    }

    #[inline]
    pub const fn is_cow(self) -> bool {
        self.contains(PteFlags::COW)
    }

    #[inline]
    pub const fn is_shared(self) -> bool {
        self.contains(PteFlags::SHARE)
    }

    /// Is this a legal `perm` argument for a mapping syscall?
    pub const fn is_valid_syscall_perm(self) -> bool {
        self.contains(PteFlags::PRESENT.union(PteFlags::USER))
            && PteFlags::SYSCALL.contains(self)
    }

    /// `pwu`-style rendering of the low three bits, as the monitor prints.
    pub fn pwu(self) -> [char; 3] {
        [
            if self.contains(PteFlags::PRESENT) { 'p' } else { '-' },
            if self.contains(PteFlags::WRITABLE) { 'w' } else { '-' },
            if self.contains(PteFlags::USER) { 'u' } else { '-' },
        ]
    }
}

// ============================================================================
// Pte
// ============================================================================

/// One page-table entry: frame address in the high bits, flags in the
/// low 12.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct Pte(u64);

impl Pte {
    const ADDR_MASK: u64 = !0xFFF;

    pub const fn empty() -> Self {
        Pte(0)
    }

    pub fn new(frame: PhysFrame<Size4KiB>, flags: PteFlags) -> Self {
        Pte(frame.start_address().as_u64() | flags.bits())
    }

    pub const fn from_raw(raw: u64) -> Self {
        Pte(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub fn frame(self) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(PhysAddr::new(self.0 & Self::ADDR_MASK))
    }

    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & 0xFFF)
    }

    pub const fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Does the entry name a frame?  Frame 0 is never allocated, so any
    /// non-zero address holds a reference even if PRESENT was cleared.
    pub const fn is_backed(self) -> bool {
        self.0 & Self::ADDR_MASK != 0
    }

    pub fn with_flags(self, flags: PteFlags) -> Self {
        Pte((self.0 & Self::ADDR_MASK) | flags.bits())
    }
}

impl fmt::Debug for Pte {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pte")
            .field("frame", &format_args!("{:#x}", self.0 & Self::ADDR_MASK))
            .field("flags", &self.flags())
            .finish()
    }
}

// ============================================================================
// Introspection result
// ============================================================================

/// Answer to "what backs this page?" in the caller's own address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteLookup {
    /// No page table covers the page at all.
    Absent,
    /// A page table exists; the entry itself may still be non-present.
    Entry(Pte),
}

impl PteLookup {
    /// The entry, if it is present.
    pub fn present(self) -> Option<Pte> {
        match self {
            PteLookup::Entry(pte) if pte.is_present() => Some(pte),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(n: u64) -> PhysFrame<Size4KiB> {
        PhysFrame::containing_address(PhysAddr::new(n * 4096))
    }

    #[test]
    fn syscall_mask_covers_software_bits() {
        assert_eq!(PteFlags::SYSCALL.bits(), 0xE07);
        assert!(PteFlags::SYSCALL.contains(PteFlags::COW | PteFlags::SHARE));
        assert!(!PteFlags::SYSCALL.contains(PteFlags::DIRTY));
    }

    #[test]
    fn projection_drops_hardware_bits() {
        let raw = PteFlags::PRIVATE_RW | PteFlags::ACCESSED | PteFlags::DIRTY;
        assert_eq!(raw.syscall_bits(), PteFlags::PRIVATE_RW);
    }

    #[test]
    fn cow_form_is_read_only() {
        let cow = PteFlags::PRIVATE_RW.to_cow();
        assert_eq!(cow, PteFlags::PRESENT | PteFlags::USER | PteFlags::COW);
        assert_eq!(cow.to_cow(), cow);
    }

    #[test]
    fn perm_validation() {
        assert!(PteFlags::PRIVATE_RW.is_valid_syscall_perm());
        assert!(!PteFlags::WRITABLE.is_valid_syscall_perm());
        assert!(!(PteFlags::PRESENT | PteFlags::USER | PteFlags::DIRTY).is_valid_syscall_perm());
    }

    #[test]
    fn pte_packs_frame_and_flags() {
        let pte = Pte::new(frame(7), PteFlags::PRESENT | PteFlags::COW);
        assert_eq!(pte.raw(), 7 * 4096 | 0x801);
        assert_eq!(pte.frame(), frame(7));
        assert!(pte.flags().is_cow());
        assert_eq!(pte.with_flags(PteFlags::PRESENT).frame(), frame(7));
    }

    #[test]
    fn lookup_present_filters_empty_entries() {
        assert_eq!(PteLookup::Absent.present(), None);
        assert_eq!(PteLookup::Entry(Pte::empty()).present(), None);
        let pte = Pte::new(frame(1), PteFlags::PRIVATE_RW);
        assert_eq!(PteLookup::Entry(pte).present(), Some(pte));
    }

    proptest! {
        #[test]
        fn cow_form_never_writable(bits in 0u64..0x1000) {
            let cow = PteFlags::from_bits_truncate(bits).to_cow();
            prop_assert!(!cow.is_writable());
            prop_assert!(cow.is_cow() && cow.is_present());
            prop_assert!(PteFlags::SYSCALL.contains(cow));
        }

        #[test]
        fn projection_is_idempotent(bits in 0u64..0x1000) {
            let flags = PteFlags::from_bits_truncate(bits);
            prop_assert_eq!(flags.syscall_bits().syscall_bits(), flags.syscall_bits());
        }
    }
}
