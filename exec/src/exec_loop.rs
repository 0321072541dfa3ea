use std::sync::Arc;

use tracing::{debug, error, trace};

use dbt_core::cflags::{CF_COUNT_MASK, CF_NO_CHAIN, CF_SINGLE_STEP};
use dbt_core::{
    page_of, Access, BlockExit, BlockKey, Exception, ForcedExit, LinkSlot, TbExit, TbRef,
    TranslateError, TranslationBlock,
};

use crate::config::ExecConfig;
use crate::error::ExecError;
use crate::interrupt::{claim_interrupt, MODE_IRQ_INHIBIT};
use crate::recovery::{probe_access, recover};
use crate::tb_store::Insert;
use crate::vcpu::IdleWake;
use crate::{ExceptionAction, ExecEnv, GuestCpu, PerCpuState, SharedState};

/// Reason the execution loop returned to its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// `exit_requested` was observed (pause or terminate).
    Requested,
    /// An exception the guest CPU model hands to the embedder.
    Exception(Exception),
    /// Single-step boundary reached.
    Debug,
    /// Instruction budget exhausted.
    InsnLimit,
}

/// Single-step policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SingleStep {
    pub enabled: bool,
    /// Hold back maskable interrupts while stepping; debug-class
    /// lines are still delivered.
    pub no_irq: bool,
}

/// Per-vCPU loop state that persists across `cpu_exec_loop` calls.
///
/// The exit request flag lives in the vCPU's
/// [`VcpuHandle`](crate::VcpuHandle) since other threads set it.
#[derive(Debug, Clone, Default)]
pub struct LoopState {
    /// Key of the unit most recently dispatched.
    pub current_key: Option<BlockKey>,
    pub single_step: SingleStep,
    /// Exception waiting for the next interrupt check.
    pub exception_pending: Option<Exception>,
    /// Remaining guest instructions, if bounded.
    pub insn_budget: Option<u64>,
}

impl LoopState {
    /// Compile flags for units built under the current policy.
    fn tb_cflags(&self, config: &ExecConfig) -> u32 {
        let mut cf = if self.single_step.enabled {
            CF_SINGLE_STEP | 1
        } else {
            let mut count = config.max_insns.min(CF_COUNT_MASK);
            if let Some(budget) = self.insn_budget {
                if budget < u64::from(count) {
                    count = budget.max(1) as u32;
                }
            }
            count
        };
        if !config.chaining {
            cf |= CF_NO_CHAIN;
        }
        cf
    }

    fn interrupt_mode(&self, cpu_mode: u32) -> u32 {
        if self.single_step.enabled && self.single_step.no_irq {
            cpu_mode | MODE_IRQ_INHIBIT
        } else {
            cpu_mode
        }
    }
}

/// Failure to find or build a unit.
#[derive(Debug)]
pub enum FindError {
    /// Guest fault while fetching code; delivered as an exception.
    Fault(Exception),
    Fatal(ExecError),
}

/// Main CPU execution loop for a single-vCPU environment.
pub fn cpu_exec_loop<C: GuestCpu>(
    env: &mut ExecEnv<C>,
    cpu: &mut C,
) -> Result<ExitReason, ExecError> {
    let shared = env.shared.clone();
    cpu_exec_loop_mt(&shared, &mut env.per_cpu, cpu)
}

/// Main CPU execution loop.
///
/// Each iteration: idle while halted, deliver a pending exception
/// and any deliverable interrupts, resolve the next unit (reusing a
/// linked successor when the last unit left through one), run it,
/// and decode how it left. Returns at the first safe point after an
/// exit request, or when the guest produces something the embedder
/// has to handle.
pub fn cpu_exec_loop_mt<C: GuestCpu>(
    shared: &SharedState<C>,
    per_cpu: &mut PerCpuState<C>,
    cpu: &mut C,
) -> Result<ExitReason, ExecError> {
    let vcpu = per_cpu.vcpu.clone();
    let resolver = per_cpu.resolver.clone();
    let mut next_tb_hint: Option<TbRef<C>> = None;

    loop {
        if vcpu.exit_requested() {
            return Ok(ExitReason::Requested);
        }

        // Idle
        if cpu.is_halted() {
            per_cpu.stats.idle_waits += 1;
            match vcpu.wait_for_work(|pending| cpu.has_work(pending)) {
                IdleWake::Exit => return Ok(ExitReason::Requested),
                IdleWake::Work => {
                    trace!("vcpu woke");
                    cpu.set_halted(false);
                    next_tb_hint = None;
                }
            }
        }

        // CheckInterrupt
        if let Some(excp) = per_cpu.state.exception_pending.take() {
            next_tb_hint = None;
            per_cpu.stats.exceptions += 1;
            debug!(
                code = excp.code,
                pc = format_args!("{:#x}", excp.pc),
                tval = format_args!("{:#x}", excp.tval),
                "delivering exception"
            );
            if cpu.do_exception(&excp) == ExceptionAction::Exit {
                return Ok(ExitReason::Exception(excp));
            }
        }
        // A delivery can unmask further lines, so keep going until
        // nothing is selectable.
        while let Some(delivery) = claim_interrupt(
            resolver.as_ref(),
            vcpu.pending(),
            per_cpu.state.interrupt_mode(cpu.interrupt_mode()),
        ) {
            next_tb_hint = None;
            per_cpu.stats.interrupts += 1;
            debug!(
                irq = delivery.irq,
                vector = format_args!("{:#x}", delivery.effects.vector),
                "delivering interrupt"
            );
            cpu.do_interrupt(&delivery);
        }
        if per_cpu.state.insn_budget == Some(0) {
            return Ok(ExitReason::InsnLimit);
        }

        // Resolve
        let cflags = per_cpu.state.tb_cflags(&shared.config);
        let hint = next_tb_hint
            .take()
            .filter(|tb| tb.cflags == cflags && tb.is_valid());
        let tb = match hint {
            Some(tb) => tb,
            None => match tb_find(shared, per_cpu, cpu, cpu.block_key(), cflags) {
                Ok(tb) => tb,
                Err(FindError::Fault(excp)) => {
                    per_cpu.state.exception_pending = Some(excp);
                    continue;
                }
                Err(FindError::Fatal(e)) => {
                    error!(error = %e, "vcpu stopped");
                    return Err(e);
                }
            },
        };
        per_cpu.state.current_key = Some(tb.key);

        // Transfer
        let exit = cpu_tb_exec(per_cpu, cpu, &tb, cflags);

        // Decode
        let mut ret = None;
        match exit {
            TbExit::Continue { next, link } => {
                if let Some(LinkSlot { src, slot }) = link {
                    match tb_find(shared, per_cpu, cpu, next, cflags) {
                        Ok(dst) => {
                            if shared.tb_store.link(&src, slot, &dst) {
                                per_cpu.stats.links += 1;
                            }
                            next_tb_hint = Some(dst);
                        }
                        Err(FindError::Fault(excp)) => {
                            per_cpu.state.exception_pending = Some(excp);
                        }
                        Err(FindError::Fatal(e)) => {
                            error!(error = %e, "vcpu stopped");
                            return Err(e);
                        }
                    }
                }
            }
            TbExit::ContinueLinked(dst) => {
                per_cpu.stats.linked_dispatches += 1;
                next_tb_hint = Some(dst);
            }
            TbExit::ForcedExit(reason) => match reason {
                ForcedExit::InsnLimit => ret = Some(ExitReason::InsnLimit),
                ForcedExit::SingleStep => ret = Some(ExitReason::Debug),
                ForcedExit::Exception(excp) => per_cpu.state.exception_pending = Some(excp),
                ForcedExit::Halt => cpu.set_halted(true),
                ForcedExit::Yield => {}
            },
        }

        if vcpu.exit_requested() {
            return Ok(ExitReason::Requested);
        }
        if let Some(r) = ret {
            return Ok(r);
        }
    }
}

/// Find a TB for `(key, cflags)`, translating if needed.
///
/// Tries the per-CPU jump cache, then the shared hash table, then
/// the translator. A jump cache hit is only taken if the full key
/// and cflags match.
pub fn tb_find<C: GuestCpu>(
    shared: &SharedState<C>,
    per_cpu: &mut PerCpuState<C>,
    cpu: &C,
    key: BlockKey,
    cflags: u32,
) -> Result<TbRef<C>, FindError> {
    let store = &shared.tb_store;
    let gen = store.flush_generation();
    if gen != per_cpu.flush_gen {
        per_cpu.jump_cache.invalidate();
        per_cpu.flush_gen = gen;
    }
    per_cpu.stats.lookups += 1;

    // Fast path: jump cache
    if let Some(tb) = per_cpu.jump_cache.lookup(key.pc) {
        if tb.matches(&key, cflags) {
            per_cpu.stats.jc_hits += 1;
            return Ok(tb.clone());
        }
    }

    let phys_pc = probe_access(cpu.mmu(), key.fetch_addr(), Access::Fetch, key.pc)
        .map_err(|f| FindError::Fault(f.into()))?;

    // Slow path: hash table
    if let Some(tb) = store.lookup(&key, cflags, phys_pc) {
        per_cpu.stats.ht_hits += 1;
        per_cpu.jump_cache.insert(key.pc, tb.clone());
        return Ok(tb);
    }

    // Miss: translate a new TB
    let tb = tb_gen_code(shared, cpu, key, cflags, phys_pc)?;
    per_cpu.stats.translations += 1;
    per_cpu.jump_cache.insert(key.pc, tb.clone());
    if store.verify_enabled() {
        store.verify().map_err(FindError::Fatal)?;
    }
    Ok(tb)
}

/// Translate guest code at `key` into a new TB and cache it.
///
/// The build runs without the store lock. If a covered page is
/// written meanwhile the result is thrown away and rebuilt.
fn tb_gen_code<C: GuestCpu>(
    shared: &SharedState<C>,
    cpu: &C,
    key: BlockKey,
    cflags: u32,
    phys_pc: u64,
) -> Result<TbRef<C>, FindError> {
    let store = &shared.tb_store;
    loop {
        let ticket = store.begin_build();
        let code = match shared.translator.translate(
            cpu,
            &key,
            TranslationBlock::<C>::max_insns(cflags),
            cflags,
        ) {
            Ok(code) => code,
            Err(TranslateError::Fault(f)) => return Err(FindError::Fault(f.into())),
            Err(source) => return Err(FindError::Fatal(ExecError::Translate { key, source })),
        };
        if code.size == 0 || code.icount == 0 {
            return Err(FindError::Fatal(ExecError::Translate {
                key,
                source: TranslateError::Empty { pc: key.pc },
            }));
        }

        // Record the second page when the block straddles a page
        // boundary.
        let first = key.fetch_addr();
        let last = first.wrapping_add(u64::from(code.size) - 1);
        let page0 = page_of(phys_pc);
        let page1 = if page_of(last) != page_of(first) {
            let phys = probe_access(cpu.mmu(), last, Access::Fetch, key.pc)
                .map_err(|f| FindError::Fault(f.into()))?;
            Some(page_of(phys)).filter(|p| *p != page0)
        } else {
            None
        };

        let (size, icount) = (code.size, code.icount);
        let tb = TranslationBlock::new(key, cflags, phys_pc, [Some(page0), page1], code);
        match store.insert(tb, &ticket) {
            Insert::Inserted(tb) => {
                debug!(
                    pc = format_args!("{:#x}", key.pc),
                    flags = format_args!("{:#x}", key.flags),
                    cflags = format_args!("{cflags:#x}"),
                    size,
                    icount,
                    pages = ?tb.page_addr,
                    "translated"
                );
                return Ok(tb);
            }
            Insert::Existing(tb) => return Ok(tb),
            Insert::Stale => {
                trace!(
                    pc = format_args!("{:#x}", key.pc),
                    "code written during translation, retrying"
                );
            }
        }
    }
}

fn charge_budget<C>(per_cpu: &mut PerCpuState<C>, icount: u16) {
    if let Some(budget) = per_cpu.state.insn_budget.as_mut() {
        *budget = budget.saturating_sub(u64::from(icount));
    }
}

/// Execute a single TB and decode how it left.
fn cpu_tb_exec<C: GuestCpu>(
    per_cpu: &mut PerCpuState<C>,
    cpu: &mut C,
    tb: &TbRef<C>,
    cflags: u32,
) -> TbExit<C> {
    per_cpu.stats.executed += 1;
    let stepping = tb.cflags & CF_SINGLE_STEP != 0;
    let exit = match tb.exec(cpu) {
        Ok(exit) => exit,
        Err(unwind) => {
            per_cpu.stats.unwinds += 1;
            charge_budget(per_cpu, tb.retired_before(unwind.pc()));
            return match recover(cpu, unwind) {
                Some(excp) => TbExit::ForcedExit(ForcedExit::Exception(excp)),
                None if stepping => TbExit::ForcedExit(ForcedExit::SingleStep),
                None => TbExit::ForcedExit(ForcedExit::Yield),
            };
        }
    };
    charge_budget(per_cpu, tb.icount);

    let slot = match exit {
        BlockExit::Halt => {
            if stepping {
                cpu.set_halted(true);
                return TbExit::ForcedExit(ForcedExit::SingleStep);
            }
            return TbExit::ForcedExit(ForcedExit::Halt);
        }
        BlockExit::Yield => None,
        BlockExit::Goto(slot) => Some(slot),
        BlockExit::Lookup => None,
    };
    if stepping {
        return TbExit::ForcedExit(ForcedExit::SingleStep);
    }
    if exit == BlockExit::Yield {
        return TbExit::ForcedExit(ForcedExit::Yield);
    }
    if per_cpu.state.insn_budget == Some(0) {
        return TbExit::ForcedExit(ForcedExit::InsnLimit);
    }

    let next = cpu.block_key();
    let Some(slot) = slot else {
        // Indirect jump: no slot to link through.
        return TbExit::Continue { next, link: None };
    };
    if let Some(dst) = tb.linked(slot) {
        if dst.matches(&next, cflags) {
            return TbExit::ContinueLinked(dst);
        }
    }
    let chainable = tb.cflags & CF_NO_CHAIN == 0 && slot < 2;
    TbExit::Continue {
        next,
        link: chainable.then(|| LinkSlot {
            src: Arc::clone(tb),
            slot,
        }),
    }
}
