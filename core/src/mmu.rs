//! Interfaces to the guest memory subsystem.

use crate::excp::{Access, FaultKind};

/// Log2 of the guest page size used for invalidation tracking.
pub const TARGET_PAGE_BITS: u32 = 12;
pub const TARGET_PAGE_SIZE: u64 = 1 << TARGET_PAGE_BITS;

/// Physical page id containing `phys_addr`.
#[inline]
pub fn page_of(phys_addr: u64) -> u64 {
    phys_addr >> TARGET_PAGE_BITS
}

/// Guest virtual-to-physical translation.
///
/// Called from inside running units for every guest memory access
/// and by the translation cache when it accounts for the pages a
/// new unit covers.
pub trait Mmu: Send + Sync {
    /// Translate `vaddr` for `access`, returning the guest physical
    /// address.
    fn translate(&self, vaddr: u64, access: Access) -> Result<u64, FaultKind>;

    /// Give the memory subsystem one chance to repair a failed
    /// translation (demand paging, TLB refill). Returns `true` if
    /// the access should be retried.
    fn fixup(&self, _vaddr: u64, _access: Access) -> bool {
        false
    }
}

/// Self-modifying-code hook registered with the memory subsystem.
///
/// Must be invoked synchronously from the page-write path, before
/// the write is visible to any vCPU that could fetch from the page.
pub trait PageWriteObserver: Send + Sync {
    fn on_page_write(&self, phys_page: u64);
}
