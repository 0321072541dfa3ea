//! Data model of the execution core: translation-unit identity,
//! cached units, the control-transfer protocol and guest faults.
//!
//! Everything here is shared between the translation cache, the
//! dispatch loop and the external collaborators (translator, MMU,
//! interrupt controllers). No execution logic lives in this crate.

pub mod error;
pub mod excp;
pub mod exit;
pub mod key;
pub mod mmu;
pub mod tb;

pub use error::TranslateError;
pub use excp::{Access, Exception, FaultKind, GuestFault, Unwind};
pub use exit::{BlockExit, ForcedExit, LinkSlot, TbExit};
pub use key::BlockKey;
pub use mmu::{page_of, Mmu, PageWriteObserver, TARGET_PAGE_BITS, TARGET_PAGE_SIZE};
pub use tb::{
    cflags, HostFn, JumpCache, TbRef, TranslatedCode, TranslationBlock,
    TB_JMP_CACHE_BITS, TB_MAX_INSNS,
};
