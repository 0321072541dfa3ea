use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::excp::Unwind;
use crate::exit::BlockExit;
use crate::key::BlockKey;

/// Host-executable form of a unit.
///
/// Runs the guest instructions of one unit against the CPU state
/// and reports how it left. Memory faults and helper exceptions
/// come back as `Err` through the fault recovery channel.
pub type HostFn<C> = Box<dyn Fn(&mut C) -> Result<BlockExit, Unwind> + Send + Sync>;

/// Shared handle to a cached unit. Identity is pointer identity.
pub type TbRef<C> = Arc<TranslationBlock<C>>;

/// What the translator hands back for one key.
pub struct TranslatedCode<C> {
    pub host: HostFn<C>,
    /// Size of guest code covered, in bytes.
    pub size: u32,
    /// Number of guest instructions.
    pub icount: u16,
    /// Byte offset of each instruction from the unit's first PC.
    pub insn_start: Vec<u32>,
}

/// Compile flags for `TranslationBlock::cflags`.
pub mod cflags {
    /// Mask for the instruction count limit (0 = default limit).
    pub const CF_COUNT_MASK: u32 = 0x0000_FFFF;
    /// Unit is being single-stepped.
    pub const CF_SINGLE_STEP: u32 = 0x0002_0000;
    /// Never link this unit's exits.
    pub const CF_NO_CHAIN: u32 = 0x0008_0000;
}

/// Default maximum number of guest instructions per unit.
pub const TB_MAX_INSNS: u32 = 512;

/// Successor-link bookkeeping, guarded by the TB's own lock.
pub struct TbJmp<C> {
    /// Outgoing direct links, one per `goto_tb` slot.
    pub jmp_dest: [Option<Weak<TranslationBlock<C>>>; 2],
    /// Incoming links: `(source unit, source slot)`.
    pub jmp_list: Vec<(Weak<TranslationBlock<C>>, usize)>,
}

impl<C> Default for TbJmp<C> {
    fn default() -> Self {
        Self {
            jmp_dest: [None, None],
            jmp_list: Vec::new(),
        }
    }
}

/// A cached translated code block.
///
/// Maps to QEMU's `TranslationBlock`. Represents the mapping from a
/// guest code region to generated host code.
pub struct TranslationBlock<C> {
    pub key: BlockKey,
    pub cflags: u32,
    /// Size of guest code covered by this TB, in bytes.
    pub size: u32,
    /// Number of guest instructions in this TB.
    pub icount: u16,
    /// Physical address of the first instruction.
    pub phys_pc: u64,
    /// Physical pages covered. The second is set only when the
    /// block straddles a page boundary.
    pub page_addr: [Option<u64>; 2],
    /// Byte offset of each instruction from `key.pc`.
    insn_start: Box<[u32]>,
    /// Whether this TB has been invalidated.
    invalid: AtomicBool,
    pub jmp: Mutex<TbJmp<C>>,
    host: HostFn<C>,
}

impl<C> TranslationBlock<C> {
    pub fn new(
        key: BlockKey,
        cflags: u32,
        phys_pc: u64,
        page_addr: [Option<u64>; 2],
        code: TranslatedCode<C>,
    ) -> Self {
        Self {
            key,
            cflags,
            size: code.size,
            icount: code.icount,
            phys_pc,
            page_addr,
            insn_start: code.insn_start.into_boxed_slice(),
            invalid: AtomicBool::new(false),
            jmp: Mutex::new(TbJmp::default()),
            host: code.host,
        }
    }

    /// Maximum number of guest instructions per TB.
    pub fn max_insns(cflags: u32) -> u32 {
        let count = cflags & cflags::CF_COUNT_MASK;
        if count == 0 {
            TB_MAX_INSNS
        } else {
            count
        }
    }

    /// Instructions that completed before an unwind resuming at `pc`.
    ///
    /// A PC outside the unit means the whole unit ran.
    pub fn retired_before(&self, pc: u64) -> u16 {
        let off = pc.wrapping_sub(self.key.pc);
        if off >= u64::from(self.size) {
            return self.icount;
        }
        let n = self
            .insn_start
            .iter()
            .take_while(|&&start| u64::from(start) < off)
            .count();
        n.min(usize::from(self.icount)) as u16
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        !self.invalid.load(Ordering::Acquire)
    }

    /// Mark invalid. Returns `false` if it already was.
    pub fn mark_invalid(&self) -> bool {
        !self.invalid.swap(true, Ordering::AcqRel)
    }

    /// Whether this TB is a valid translation for `(key, cflags)`.
    #[inline]
    pub fn matches(&self, key: &BlockKey, cflags: u32) -> bool {
        self.is_valid() && self.key == *key && self.cflags == cflags
    }

    pub fn covers_page(&self, page: u64) -> bool {
        self.page_addr.iter().any(|p| *p == Some(page))
    }

    /// Live successor linked through `slot`, if any.
    pub fn linked(&self, slot: usize) -> Option<TbRef<C>> {
        let jmp = self.jmp.lock();
        jmp.jmp_dest
            .get(slot)?
            .as_ref()
            .and_then(Weak::upgrade)
            .filter(|tb| tb.is_valid())
    }

    /// Run the host code.
    #[inline]
    pub fn exec(&self, cpu: &mut C) -> Result<BlockExit, Unwind> {
        (self.host)(cpu)
    }
}

impl<C> std::fmt::Debug for TranslationBlock<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationBlock")
            .field("key", &self.key)
            .field("cflags", &format_args!("{:#x}", self.cflags))
            .field("size", &self.size)
            .field("icount", &self.icount)
            .field("phys_pc", &format_args!("{:#x}", self.phys_pc))
            .field("page_addr", &self.page_addr)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Default log2 size of the per-CPU jump cache.
pub const TB_JMP_CACHE_BITS: u32 = 12;

/// Per-CPU direct-mapped TB jump cache.
///
/// Indexed by `(pc >> 2) & (size - 1)`. Provides O(1) lookup for
/// the common case of re-executing the same PC; a hit still has to
/// be checked against the full key.
pub struct JumpCache<C> {
    entries: Box<[Option<TbRef<C>>]>,
    mask: usize,
}

impl<C> JumpCache<C> {
    pub fn new() -> Self {
        Self::with_bits(TB_JMP_CACHE_BITS)
    }

    pub fn with_bits(bits: u32) -> Self {
        let size = 1usize << bits;
        Self {
            entries: (0..size).map(|_| None).collect(),
            mask: size - 1,
        }
    }

    fn index(&self, pc: u64) -> usize {
        (pc as usize >> 2) & self.mask
    }

    pub fn lookup(&self, pc: u64) -> Option<&TbRef<C>> {
        self.entries[self.index(pc)].as_ref()
    }

    pub fn insert(&mut self, pc: u64, tb: TbRef<C>) {
        let i = self.index(pc);
        self.entries[i] = Some(tb);
    }

    pub fn remove(&mut self, pc: u64) {
        let i = self.index(pc);
        self.entries[i] = None;
    }

    pub fn invalidate(&mut self) {
        self.entries.fill(None);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<C> Default for JumpCache<C> {
    fn default() -> Self {
        Self::new()
    }
}
