//! Guest exceptions and the fault recovery channel's unwind type.

use thiserror::Error;

/// Illegal or undecodable instruction.
pub const EXCP_ILLEGAL: u32 = 1;
/// Guest system call instruction.
pub const EXCP_SYSCALL: u32 = 2;
/// Guest breakpoint instruction.
pub const EXCP_BREAKPOINT: u32 = 3;
/// Instruction fetch fault.
pub const EXCP_FETCH_FAULT: u32 = 4;
/// Data load fault.
pub const EXCP_LOAD_FAULT: u32 = 5;
/// Data store fault.
pub const EXCP_STORE_FAULT: u32 = 6;
/// Arithmetic trap (division by zero etc.).
pub const EXCP_ARITH: u32 = 7;

/// Kind of guest memory access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Fetch,
    Load,
    Store,
}

/// Why a translation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// No mapping for the page.
    Unmapped,
    /// Mapping exists but forbids this access.
    Protection,
}

/// A guest memory access that could not complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{kind:?} fault on {access:?} of {vaddr:#x} at pc {pc:#x}")]
pub struct GuestFault {
    pub vaddr: u64,
    pub access: Access,
    pub kind: FaultKind,
    /// PC of the faulting guest instruction.
    pub pc: u64,
}

/// A synchronous guest exception awaiting delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exception {
    /// One of the `EXCP_*` codes (architectures may add their own).
    pub code: u32,
    /// PC of the instruction that raised it.
    pub pc: u64,
    /// Faulting address or instruction bits, when meaningful.
    pub tval: u64,
}

impl Exception {
    pub const fn new(code: u32, pc: u64, tval: u64) -> Self {
        Self { code, pc, tval }
    }
}

impl From<GuestFault> for Exception {
    fn from(f: GuestFault) -> Self {
        let code = match f.access {
            Access::Fetch => EXCP_FETCH_FAULT,
            Access::Load => EXCP_LOAD_FAULT,
            Access::Store => EXCP_STORE_FAULT,
        };
        Exception::new(code, f.pc, f.vaddr)
    }
}

/// Non-local exit out of a running unit.
///
/// Host code returns this through `?` from any call depth; the
/// dispatch loop is the only place that catches it, so an unwind
/// always lands at the top of the current loop iteration.
///
/// Host code must not commit the architectural effects of the
/// instruction that unwinds: everything written before the
/// faulting instruction is retired, everything after is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Unwind {
    /// Guest memory fault that the MMU could not repair.
    #[error(transparent)]
    Fault(#[from] GuestFault),
    /// Exception raised by a helper (illegal insn, syscall, ...).
    #[error("guest exception {0:?}")]
    Exception(Exception),
    /// Voluntary exit: resume at `pc` after re-checking interrupts.
    #[error("loop exit, resume at pc {pc:#x}")]
    Exit { pc: u64 },
}

impl Unwind {
    /// Guest PC execution resumes at once the unwind has landed.
    pub fn pc(&self) -> u64 {
        match self {
            Unwind::Fault(f) => f.pc,
            Unwind::Exception(e) => e.pc,
            Unwind::Exit { pc } => *pc,
        }
    }
}
