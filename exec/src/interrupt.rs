//! Pending interrupt lines and priority resolution.
//!
//! Device models and interrupt controllers raise lines in a
//! per-vCPU [`PendingInterrupts`] set from any thread. The dispatch
//! loop asks the vCPU's [`InterruptResolver`] which single line to
//! deliver next and clears exactly that bit; nothing else ever
//! clears a bit, so every assertion is delivered at most once.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ConfigError;

/// Number of interrupt request lines per vCPU.
pub const MAX_IRQ_LINES: u32 = 64;

/// Mode flag: the CPU is in an interrupt shadow (e.g. between an
/// instruction pair that must not be split). Only debug-class
/// lines may be delivered while it is set.
pub const MODE_IRQ_INHIBIT: u32 = 1 << 31;

fn line_bit(irq: u32) -> Result<u64, ConfigError> {
    if irq < MAX_IRQ_LINES {
        Ok(1 << irq)
    } else {
        Err(ConfigError::IrqOutOfRange(irq))
    }
}

/// Bitmask of asserted interrupt/exception request lines.
#[derive(Debug, Default)]
pub struct PendingInterrupts {
    bits: AtomicU64,
}

impl PendingInterrupts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assert line `irq`. Safe to call from any thread.
    pub fn raise(&self, irq: u32) -> Result<(), ConfigError> {
        let bit = line_bit(irq)?;
        self.bits.fetch_or(bit, Ordering::AcqRel);
        Ok(())
    }

    pub fn snapshot(&self) -> u64 {
        self.bits.load(Ordering::Acquire)
    }

    pub fn is_pending(&self, irq: u32) -> bool {
        line_bit(irq).is_ok_and(|bit| self.snapshot() & bit != 0)
    }

    /// Clear line `irq`, returning whether it was set.
    ///
    /// Only the dispatch loop calls this, for the line its resolver
    /// selected.
    pub(crate) fn take(&self, irq: u32) -> bool {
        match line_bit(irq) {
            Ok(bit) => self.bits.fetch_and(!bit, Ordering::AcqRel) & bit != 0,
            Err(_) => false,
        }
    }
}

/// State changes the caller applies when delivering an interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryEffects {
    /// Guest PC of the handler.
    pub vector: u64,
    /// Execution mode to switch to, if any.
    pub target_mode: Option<u32>,
    /// Save the interrupted context (return PC, mode) first.
    pub push_frame: bool,
}

/// An interrupt selected for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptDelivery {
    pub irq: u32,
    pub effects: DeliveryEffects,
}

/// Architecture policy deciding which pending line to deliver.
///
/// Must be pure: it inspects `pending` and `mode_flags` and returns
/// at most one line. Clearing that line is the caller's job.
pub trait InterruptResolver: Send + Sync {
    fn resolve(&self, pending: u64, mode_flags: u32) -> Option<InterruptDelivery>;
}

/// Resolve against the live pending set and claim the selected line.
///
/// Non-selected lines are left untouched.
pub fn claim_interrupt(
    resolver: &dyn InterruptResolver,
    pending: &PendingInterrupts,
    mode_flags: u32,
) -> Option<InterruptDelivery> {
    let snap = pending.snapshot();
    if snap == 0 {
        return None;
    }
    let delivery = resolver.resolve(snap, mode_flags)?;
    pending.take(delivery.irq).then_some(delivery)
}

/// When an interrupt class may be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Always, except inside an interrupt shadow.
    Unmaskable,
    /// Only when every bit of the mask is set in the mode flags and
    /// the CPU is not in an interrupt shadow.
    Masked(u32),
    /// Always, even inside an interrupt shadow.
    Debug,
}

/// One entry of a [`PriorityTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptClass {
    pub irq: u32,
    pub name: &'static str,
    pub gate: Gate,
    pub effects: DeliveryEffects,
}

impl InterruptClass {
    pub fn new(irq: u32, name: &'static str, gate: Gate, vector: u64) -> Self {
        Self {
            irq,
            name,
            gate,
            effects: DeliveryEffects {
                vector,
                target_mode: None,
                push_frame: true,
            },
        }
    }

    /// Switch to `mode` on delivery.
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.effects.target_mode = Some(mode);
        self
    }

    /// Deliver without saving the interrupted context.
    pub fn without_frame(mut self) -> Self {
        self.effects.push_frame = false;
        self
    }

    fn deliverable(&self, mode_flags: u32) -> bool {
        let inhibited = mode_flags & MODE_IRQ_INHIBIT != 0;
        match self.gate {
            Gate::Debug => true,
            Gate::Unmaskable => !inhibited,
            Gate::Masked(mask) => !inhibited && mode_flags & mask == mask,
        }
    }
}

/// Table-driven resolver: a strict total order of interrupt classes,
/// highest priority first.
#[derive(Debug, Clone)]
pub struct PriorityTable {
    classes: Vec<InterruptClass>,
}

impl PriorityTable {
    pub fn new(classes: Vec<InterruptClass>) -> Result<Self, ConfigError> {
        let mut seen = 0u64;
        for class in &classes {
            let bit = line_bit(class.irq)?;
            if seen & bit != 0 {
                return Err(ConfigError::DuplicateIrq(class.irq));
            }
            seen |= bit;
        }
        Ok(Self { classes })
    }

    pub fn classes(&self) -> &[InterruptClass] {
        &self.classes
    }
}

impl InterruptResolver for PriorityTable {
    fn resolve(&self, pending: u64, mode_flags: u32) -> Option<InterruptDelivery> {
        self.classes
            .iter()
            .filter(|c| pending & (1 << c.irq) != 0)
            .find(|c| c.deliverable(mode_flags))
            .map(|c| InterruptDelivery {
                irq: c.irq,
                effects: c.effects,
            })
    }
}
