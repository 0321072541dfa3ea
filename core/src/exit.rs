//! Control-transfer protocol between compiled units and the loop.

use crate::excp::Exception;
use crate::key::BlockKey;
use crate::tb::TbRef;

/// Raw result of running a unit's host code.
///
/// Maps to the `exit_tb` operand QEMU encodes in generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockExit {
    /// Direct branch through `goto_tb` slot `n`. The guest PC has
    /// already been set to the branch target.
    Goto(usize),
    /// Indirect branch; the target is only known at run time.
    Lookup,
    /// The unit changed translation-relevant state and must return
    /// to the loop before anything else runs.
    Yield,
    /// Guest executed a halt / wait-for-interrupt instruction.
    Halt,
}

/// A chainable exit slot of the unit that just ran.
pub struct LinkSlot<C> {
    pub src: TbRef<C>,
    pub slot: usize,
}

/// Why a unit stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForcedExit {
    /// Instruction budget exhausted.
    InsnLimit,
    /// Single-step boundary reached.
    SingleStep,
    /// Exception raised mid-unit (including recovered faults).
    Exception(Exception),
    /// Unit requested a return to the loop.
    Yield,
    /// Guest halted.
    Halt,
}

/// Decoded result of a control transfer.
pub enum TbExit<C> {
    /// Fell through or took a branch whose slot is not linked.
    /// `link` names the slot the next unit may be linked into.
    Continue {
        next: BlockKey,
        link: Option<LinkSlot<C>>,
    },
    /// Took a branch already linked to a live successor; the caller
    /// may dispatch it without resolving the key again.
    ContinueLinked(TbRef<C>),
    /// Stopped early; the caller must run the interrupt check first.
    ForcedExit(ForcedExit),
}

impl<C> std::fmt::Debug for TbExit<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TbExit::Continue { next, link } => f
                .debug_struct("Continue")
                .field("next", next)
                .field("slot", &link.as_ref().map(|l| l.slot))
                .finish(),
            TbExit::ContinueLinked(tb) => {
                f.debug_tuple("ContinueLinked").field(&tb.key).finish()
            }
            TbExit::ForcedExit(r) => f.debug_tuple("ForcedExit").field(r).finish(),
        }
    }
}
