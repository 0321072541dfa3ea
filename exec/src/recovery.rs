//! Fault recovery channel.
//!
//! Host code reaches guest memory through [`probe_access`] and
//! raises exceptions through [`raise_exception`] /
//! [`cpu_loop_exit`]. All of them produce an [`Unwind`] that the
//! unit propagates with `?`; the dispatch loop catches it at the
//! top of the current iteration and turns it into a pending
//! exception via [`recover`].

use dbt_core::{Access, Exception, GuestFault, Mmu, Unwind};

use crate::GuestCpu;

/// Translate `vaddr` for an access made by the instruction at `pc`.
///
/// A failed translation gets one repair attempt through
/// [`Mmu::fixup`] before it becomes a [`GuestFault`].
pub fn probe_access(
    mmu: &dyn Mmu,
    vaddr: u64,
    access: Access,
    pc: u64,
) -> Result<u64, GuestFault> {
    let kind = match mmu.translate(vaddr, access) {
        Ok(phys) => return Ok(phys),
        Err(kind) => kind,
    };
    let kind = if mmu.fixup(vaddr, access) {
        match mmu.translate(vaddr, access) {
            Ok(phys) => return Ok(phys),
            Err(kind) => kind,
        }
    } else {
        kind
    };
    Err(GuestFault {
        vaddr,
        access,
        kind,
        pc,
    })
}

/// Abort the running unit with exception `code` at `pc`.
#[must_use]
pub fn raise_exception(code: u32, pc: u64, tval: u64) -> Unwind {
    Unwind::Exception(Exception::new(code, pc, tval))
}

/// Abort the running unit and resume at `pc` once the loop has
/// re-checked interrupts.
#[must_use]
pub fn cpu_loop_exit(pc: u64) -> Unwind {
    Unwind::Exit { pc }
}

/// Land an unwind: restore the guest PC and hand back the exception
/// to deliver, if any.
pub(crate) fn recover<C: GuestCpu>(cpu: &mut C, unwind: Unwind) -> Option<Exception> {
    match unwind {
        Unwind::Fault(fault) => {
            cpu.set_pc(fault.pc);
            Some(fault.into())
        }
        Unwind::Exception(excp) => {
            cpu.set_pc(excp.pc);
            Some(excp)
        }
        Unwind::Exit { pc } => {
            cpu.set_pc(pc);
            None
        }
    }
}
