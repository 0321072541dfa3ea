//! Guest-agnostic execution core of a dynamic binary translator.
//!
//! Each vCPU thread drives a loop of interrupt check, unit lookup,
//! translation on miss, execution and exit decoding. Units live in a
//! shared [`TbStore`] fronted by a per-CPU jump cache, and are linked
//! to their direct successors so hot paths skip the lookup.
//!
//! Modelled on QEMU's `accel/tcg/cpu-exec.c` and
//! `accel/tcg/translate-all.c`.

pub mod config;
pub mod error;
pub mod exec_loop;
pub mod interrupt;
pub mod recovery;
pub mod stats;
pub mod tb_store;
pub mod vcpu;

pub use config::{ExecConfig, MAX_TBS, TB_HASH_BITS};
pub use error::{ConfigError, ExecError};
pub use exec_loop::{
    cpu_exec_loop, cpu_exec_loop_mt, tb_find, ExitReason, FindError, LoopState, SingleStep,
};
pub use interrupt::{
    claim_interrupt, DeliveryEffects, Gate, InterruptClass, InterruptDelivery,
    InterruptResolver, PendingInterrupts, PriorityTable, MODE_IRQ_INHIBIT,
};
pub use recovery::{cpu_loop_exit, probe_access, raise_exception};
pub use stats::ExecStats;
pub use tb_store::{BuildTicket, Insert, TbStore};
pub use vcpu::{run_vcpu_thread, VcpuHandle};

use std::sync::Arc;

use dbt_core::{BlockKey, Exception, JumpCache, Mmu, TranslateError, TranslatedCode};

/// What the guest CPU model did with an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionAction {
    /// Vectored into the guest's own handler; keep executing.
    Delivered,
    /// Not handled by the guest model; hand it to the embedder.
    Exit,
}

/// Trait for guest CPU state used by the execution loop.
///
/// Each guest architecture implements this to expose the generic
/// control-transfer state; register layout stays private to it.
pub trait GuestCpu {
    /// Identity of the unit that would run next.
    fn block_key(&self) -> BlockKey;

    fn set_pc(&mut self, pc: u64);

    /// Address translation used for code fetch and page accounting.
    fn mmu(&self) -> &dyn Mmu;

    fn is_halted(&self) -> bool;

    fn set_halted(&mut self, halted: bool);

    /// Whether a halted CPU should wake for this pending set.
    fn has_work(&self, pending: u64) -> bool {
        pending != 0
    }

    /// Mode flags handed to the interrupt resolver.
    fn interrupt_mode(&self) -> u32;

    /// Apply the side effects of a selected interrupt.
    fn do_interrupt(&mut self, delivery: &InterruptDelivery);

    /// Deliver a synchronous exception.
    fn do_exception(&mut self, excp: &Exception) -> ExceptionAction;
}

/// Translator collaborator: produces host code for one unit.
///
/// Called only on a cache miss, on the vCPU thread that missed.
pub trait Translator<C>: Send + Sync {
    fn translate(
        &self,
        cpu: &C,
        key: &BlockKey,
        max_insns: u32,
        cflags: u32,
    ) -> Result<TranslatedCode<C>, TranslateError>;
}

/// State shared by every vCPU: the translation cache and the
/// translator that fills it.
pub struct SharedState<C> {
    pub tb_store: Arc<TbStore<C>>,
    pub translator: Arc<dyn Translator<C>>,
    pub config: ExecConfig,
}

impl<C> SharedState<C> {
    pub fn new(
        translator: Arc<dyn Translator<C>>,
        config: ExecConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            tb_store: Arc::new(TbStore::from_config(&config)),
            translator,
            config,
        })
    }
}

/// State owned by a single vCPU thread.
pub struct PerCpuState<C> {
    pub jump_cache: JumpCache<C>,
    pub stats: ExecStats,
    pub state: LoopState,
    pub vcpu: Arc<VcpuHandle>,
    pub resolver: Arc<dyn InterruptResolver>,
    /// Store flush generation the jump cache was filled under.
    pub(crate) flush_gen: u64,
}

impl<C> PerCpuState<C> {
    pub fn new(config: &ExecConfig, resolver: Arc<dyn InterruptResolver>) -> Self {
        Self {
            jump_cache: JumpCache::with_bits(config.jmp_cache_bits),
            stats: ExecStats::default(),
            state: LoopState::default(),
            vcpu: Arc::new(VcpuHandle::new()),
            resolver,
            flush_gen: 0,
        }
    }
}

/// Execution environment for a single vCPU.
pub struct ExecEnv<C> {
    pub shared: Arc<SharedState<C>>,
    pub per_cpu: PerCpuState<C>,
}

impl<C> ExecEnv<C> {
    pub fn new(
        translator: Arc<dyn Translator<C>>,
        resolver: Arc<dyn InterruptResolver>,
    ) -> Self {
        let config = ExecConfig::default();
        let per_cpu = PerCpuState::new(&config, resolver);
        Self {
            shared: Arc::new(SharedState {
                tb_store: Arc::new(TbStore::from_config(&config)),
                translator,
                config,
            }),
            per_cpu,
        }
    }

    pub fn with_config(
        translator: Arc<dyn Translator<C>>,
        resolver: Arc<dyn InterruptResolver>,
        config: ExecConfig,
    ) -> Result<Self, ConfigError> {
        let shared = SharedState::new(translator, config)?;
        let per_cpu = PerCpuState::new(&shared.config, resolver);
        Ok(Self {
            shared: Arc::new(shared),
            per_cpu,
        })
    }

    /// Per-CPU state for an additional vCPU sharing this cache.
    pub fn new_vcpu(&self, resolver: Arc<dyn InterruptResolver>) -> PerCpuState<C> {
        PerCpuState::new(&self.shared.config, resolver)
    }
}
