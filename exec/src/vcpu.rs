//! Cross-thread control surface of one vCPU.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::{ConfigError, ExecError};
use crate::exec_loop::{cpu_exec_loop_mt, ExitReason};
use crate::interrupt::PendingInterrupts;
use crate::{GuestCpu, PerCpuState, SharedState};

/// What ended an idle wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleWake {
    Work,
    Exit,
}

/// State of a vCPU that other threads may touch: the exit request
/// flag, the pending interrupt set and the idle wake condition.
#[derive(Debug, Default)]
pub struct VcpuHandle {
    exit_requested: AtomicBool,
    terminated: AtomicBool,
    pending: PendingInterrupts,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl VcpuHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to stop at its next safe point.
    pub fn pause(&self) {
        self.exit_requested.store(true, Ordering::Release);
        self.kick();
    }

    /// Clear a pause request and wake the vCPU.
    pub fn resume(&self) {
        self.exit_requested.store(false, Ordering::Release);
        self.kick();
    }

    /// Stop the vCPU for good.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
        self.pause();
    }

    /// Assert interrupt line `irq` and wake the vCPU if idle.
    pub fn inject_interrupt(&self, irq: u32) -> Result<(), ConfigError> {
        self.pending.raise(irq)?;
        self.kick();
        Ok(())
    }

    /// Wake the vCPU if it is waiting.
    pub fn kick(&self) {
        let _g = self.wake_lock.lock();
        self.wake.notify_all();
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub fn pending(&self) -> &PendingInterrupts {
        &self.pending
    }

    /// Block until `has_work` holds for the pending set or an exit is
    /// requested. Both conditions are rechecked under the wake lock,
    /// so a producer that raises a line and then kicks cannot be
    /// missed.
    pub(crate) fn wait_for_work(&self, has_work: impl Fn(u64) -> bool) -> IdleWake {
        let mut g = self.wake_lock.lock();
        loop {
            if self.exit_requested() {
                return IdleWake::Exit;
            }
            if has_work(self.pending.snapshot()) {
                return IdleWake::Work;
            }
            trace!("vcpu idle");
            self.wake.wait(&mut g);
        }
    }

    /// Block while paused. Returns `false` once terminated.
    pub(crate) fn wait_resumed(&self) -> bool {
        let mut g = self.wake_lock.lock();
        loop {
            if self.is_terminated() {
                return false;
            }
            if !self.exit_requested() {
                return true;
            }
            self.wake.wait(&mut g);
        }
    }
}

/// Body of a vCPU thread.
///
/// Runs the dispatch loop, parks while paused and returns when the
/// vCPU is terminated, the loop hands an exit reason back to the
/// embedder, or a fatal error occurs.
pub fn run_vcpu_thread<C: GuestCpu>(
    shared: &SharedState<C>,
    per_cpu: &mut PerCpuState<C>,
    cpu: &mut C,
) -> Result<ExitReason, ExecError> {
    loop {
        match cpu_exec_loop_mt(shared, per_cpu, cpu)? {
            ExitReason::Requested => {
                if !per_cpu.vcpu.wait_resumed() {
                    return Ok(ExitReason::Requested);
                }
            }
            other => return Ok(other),
        }
    }
}
