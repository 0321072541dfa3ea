/// Identity of a translation unit.
///
/// Maps to the `(pc, cs_base, flags)` triple QEMU derives with
/// `cpu_get_tb_cpu_state()`. `flags` captures everything that
/// changes instruction semantics without being part of the PC or
/// the segment base (privilege level, operand-size defaults, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BlockKey {
    /// Guest program counter.
    pub pc: u64,
    /// Code segment base (x86) or 0 for flat architectures.
    pub segment_base: u64,
    /// Translation-affecting CPU state bits.
    pub flags: u32,
}

impl BlockKey {
    pub const fn new(pc: u64, segment_base: u64, flags: u32) -> Self {
        Self {
            pc,
            segment_base,
            flags,
        }
    }

    /// Guest virtual address the first instruction is fetched from.
    #[inline]
    pub fn fetch_addr(&self) -> u64 {
        self.segment_base.wrapping_add(self.pc)
    }

    /// Hash used by the global hash table.
    ///
    /// Keyed by the physical address of the first instruction so
    /// that units for aliased virtual mappings of the same code
    /// land in the same chain.
    pub fn hash(&self, phys_pc: u64, cflags: u32) -> u64 {
        let mut h = phys_pc.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        h ^= self.pc.rotate_left(17);
        h ^= self.segment_base.rotate_left(31);
        h ^= (u64::from(self.flags) << 32) | u64::from(cflags);
        h.wrapping_mul(0xff51_afd7_ed55_8ccd) >> 16
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "pc={:#x} seg={:#x} flags={:#x}",
            self.pc, self.segment_base, self.flags
        )
    }
}
