use thiserror::Error;

use crate::excp::GuestFault;

/// Failure reported by the translator collaborator.
#[derive(Debug, Error)]
pub enum TranslateError {
    /// The guest instruction stream contains something the
    /// translator cannot handle.
    #[error("unsupported instruction {insn:#010x} at pc {pc:#x}")]
    Unsupported { pc: u64, insn: u32 },
    /// Nothing could be translated at all.
    #[error("empty translation at pc {pc:#x}")]
    Empty { pc: u64 },
    /// Fetching guest code faulted. Not fatal: the loop turns it
    /// into an instruction-fetch exception.
    #[error(transparent)]
    Fault(#[from] GuestFault),
}
