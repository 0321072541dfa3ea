//! Fault recovery: guest faults unwind to the loop and come back as
//! exceptions, with nothing from the faulting instruction committed.

use dbt_core::excp::{
    EXCP_ARITH, EXCP_BREAKPOINT, EXCP_FETCH_FAULT, EXCP_ILLEGAL, EXCP_LOAD_FAULT,
    EXCP_STORE_FAULT,
};
use dbt_core::{
    Access, BlockExit, BlockKey, Exception, FaultKind, GuestFault, TranslatedCode,
    TranslationBlock, Unwind,
};
use dbt_exec::{cpu_loop_exit, probe_access, raise_exception, ExitReason, Insert};

use super::{syscall, Machine, CF};
use crate::guest::*;

fn exception(r: ExitReason) -> Exception {
    match r {
        ExitReason::Exception(e) => e,
        other => panic!("expected exception exit, got {other:?}"),
    }
}

// ── probe_access ────────────────────────────────────────────

#[test]
fn probe_access_reports_fault_kind() {
    let ram = GuestRam::new(0x4000);
    ram.set_perm(2, PERM_R);
    ram.set_perm(3, 0);

    assert_eq!(probe_access(&ram, 0x2010, Access::Load, 0x40), Ok(0x2010));
    assert_eq!(
        probe_access(&ram, 0x2010, Access::Store, 0x40),
        Err(GuestFault {
            vaddr: 0x2010,
            access: Access::Store,
            kind: FaultKind::Protection,
            pc: 0x40,
        })
    );
    let f = probe_access(&ram, 0x3000, Access::Load, 0x44).unwrap_err();
    assert_eq!(f.kind, FaultKind::Unmapped);
    let f = probe_access(&ram, 0x10_0000, Access::Fetch, 0x48).unwrap_err();
    assert_eq!(f.kind, FaultKind::Unmapped);
    assert_eq!(ram.fixup_count(), 0);
}

#[test]
fn probe_access_retries_after_fixup() {
    let ram = GuestRam::new(0x4000);
    ram.map_on_demand(3);
    assert_eq!(probe_access(&ram, 0x3008, Access::Store, 0), Ok(0x3008));
    assert_eq!(probe_access(&ram, 0x3010, Access::Store, 0), Ok(0x3010));
    assert_eq!(ram.fixup_count(), 1);
}

#[test]
fn unwind_constructors() {
    assert_eq!(
        raise_exception(EXCP_ILLEGAL, 0x10, 0xff),
        Unwind::Exception(Exception::new(EXCP_ILLEGAL, 0x10, 0xff))
    );
    assert_eq!(cpu_loop_exit(0x20), Unwind::Exit { pc: 0x20 });
}

// ── Faults inside running units ─────────────────────────────

/// r1 keeps its old value and nothing after the load runs.
#[test]
fn load_fault_commits_nothing() {
    let mut m = Machine::new(&[li(2, 0x3000), li(1, 9), ld(1, 2, 0), li(5, 1), sys(0)]);
    m.ram.write_u64(0x3000, 0x1234);
    m.ram.set_perm(3, 0);

    let e = exception(m.run());
    assert_eq!(e, Exception::new(EXCP_LOAD_FAULT, 8, 0x3000));
    assert_eq!(m.cpu.regs[1], 9);
    assert_eq!(m.cpu.regs[2], 0x3000);
    assert_eq!(m.cpu.regs[5], 0);
    assert_eq!(m.cpu.pc, 8);
    assert_eq!(m.stats().unwinds, 1);
    assert_eq!(m.stats().exceptions, 1);

    // The unit survives the fault.
    let tb = m.store().lookup(&BlockKey::new(0, 0, 0), CF, 0);
    assert!(tb.is_some_and(|t| t.is_valid()));
    m.store().verify().expect("consistent");

    // Map the page and restart at the faulting instruction.
    m.ram.set_perm(3, PERM_RWX);
    syscall(m.run());
    assert_eq!(m.cpu.regs[1], 0x1234);
    assert_eq!(m.cpu.regs[5], 1);
}

#[test]
fn store_fault_leaves_memory_alone() {
    let mut m = Machine::new(&[li(2, 0x3000), li(1, 5), st(1, 2, 0), sys(0)]);
    m.ram.write_u64(0x3000, 0xAA);
    m.ram.set_perm(3, PERM_R);

    let e = exception(m.run());
    assert_eq!(e, Exception::new(EXCP_STORE_FAULT, 8, 0x3000));
    assert_eq!(m.ram.read_u64(0x3000), 0xAA);
}

#[test]
fn load_fixed_up_by_mmu() {
    let mut m = Machine::new(&[li(2, 0x3000), ld(1, 2, 0), sys(0)]);
    m.ram.write_u64(0x3000, 0x77);
    m.ram.map_on_demand(3);

    syscall(m.run());
    assert_eq!(m.cpu.regs[1], 0x77);
    assert_eq!(m.ram.fixup_count(), 1);
    assert_eq!(m.stats().unwinds, 0);
}

#[test]
fn arithmetic_trap() {
    let mut m = Machine::new(&[li(1, 10), li(2, 0), div(3, 1, 2), sys(0)]);
    m.cpu.regs[3] = 1;
    let e = exception(m.run());
    assert_eq!(e, Exception::new(EXCP_ARITH, 8, 0));
    assert_eq!(m.cpu.regs[3], 1);
}

#[test]
fn illegal_instruction() {
    let mut m = Machine::new(&[li(1, 1), ill()]);
    let e = exception(m.run());
    assert_eq!(e, Exception::new(EXCP_ILLEGAL, 4, u64::from(ill())));
    assert_eq!(m.cpu.regs[1], 1);
}

// ── Fetch faults ────────────────────────────────────────────

#[test]
fn fetch_fault_never_reaches_translator() {
    let mut m = Machine::new(&[]);
    m.ram.set_perm(3, 0);
    let e = exception(m.run_at(0x3000));
    assert_eq!(e, Exception::new(EXCP_FETCH_FAULT, 0x3000, 0x3000));
    assert_eq!(m.translator.translations(), 0);

    // Readable but not executable.
    m.ram.set_perm(3, PERM_R | PERM_W);
    let e = exception(m.run_at(0x3000));
    assert_eq!(e.code, EXCP_FETCH_FAULT);
    assert_eq!(m.translator.translations(), 0);
}

/// A unit stops before an unfetchable page; the fault is raised when
/// the next unit is looked up.
#[test]
fn fetch_fault_at_page_end() {
    let mut m = Machine::new(&[]);
    m.ram.load(0xFF8, &[li(1, 1), li(2, 2)]);
    m.ram.set_perm(1, 0);

    let e = exception(m.run_at(0xFF8));
    assert_eq!(e, Exception::new(EXCP_FETCH_FAULT, 0x1000, 0x1000));
    assert_eq!(m.cpu.regs[1], 1);
    assert_eq!(m.cpu.regs[2], 2);
    let tb = m
        .store()
        .lookup(&BlockKey::new(0xFF8, 0, 0), CF, 0xFF8)
        .expect("cached");
    assert_eq!(tb.icount, 2);
    assert_eq!(tb.page_addr, [Some(0), None]);
}

// ── Delivery to the guest ───────────────────────────────────

#[test]
fn exception_vectored_to_guest_handler() {
    let mut m = Machine::new(&[li(1, 1), brk()]);
    m.ram.load(0x8400, &[li(1, 77), sys(9)]);
    m.cpu.exc_vector = Some(0x8400);

    let e = syscall(m.run());
    assert_eq!(e.pc, 0x8404);
    assert_eq!(e.tval, 9);
    assert_eq!(m.cpu.regs[1], 77);
    assert_eq!(m.cpu.epc, 4);
    assert_eq!(m.cpu.cause, 0x100 | EXCP_BREAKPOINT);
    assert_eq!(m.cpu.mode, MODE_KERNEL);
    assert_eq!(m.stats().exceptions, 2);
}

/// A unit that leaves through `cpu_loop_exit` resumes at the given
/// PC only after pending interrupts have been taken.
#[test]
fn loop_exit_rechecks_interrupts() {
    let mut m = Machine::new(&[]);
    m.ram.load(0x40, &[sys(4)]);
    m.ram.load(NMI_VECTOR, &[sys(5)]);
    let h = m.handle();
    let code = TranslatedCode {
        host: Box::new(move |_: &mut ToyCpu| -> Result<BlockExit, Unwind> {
            h.inject_interrupt(IRQ_NMI).expect("valid line");
            Err(cpu_loop_exit(0x40))
        }),
        size: 4,
        icount: 1,
        insn_start: vec![0],
    };
    let tb = TranslationBlock::new(BlockKey::new(0, 0, 0), CF, 0, [Some(0), None], code);
    let store = m.env.shared.tb_store.clone();
    assert!(matches!(
        store.insert(tb, &store.begin_build()),
        Insert::Inserted(_)
    ));

    let e = syscall(m.run_at(0));
    assert_eq!(e.pc, NMI_VECTOR);
    assert_eq!(e.tval, 5);
    assert_eq!(m.cpu.epc, 0x40);
    assert_eq!(m.stats().unwinds, 1);
    assert_eq!(m.stats().ht_hits, 1);
    assert_eq!(m.translator.translations(), 1);
}
