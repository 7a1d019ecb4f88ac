//! The per-core halt controller.
//!
//! A core that has nothing to run either halts, waiting for the next timer
//! interrupt to send it back into the scheduler, or, if there is nothing in
//! flight *anywhere* in the system, drops into the kernel monitor so that an
//! operator can see what happened. Nothing will ever wake a core in the
//! latter case, so halting would just hang the machine silently.
use crate::{cpu::Cpu, env::EnvTable, kernel::KernelGuard, sched::Decision, CpuId, CpuStatus};
use hal_core::{cpu::Idle, mem::AddressSpace, VAddr};
use maitake_sync::blocking::RawMutex;

/// A core which has published that it is halted and released the kernel
/// lock, but has not yet parked itself.
///
/// The only thing left to do with a `Halted` core is [wait](Halted::wait).
#[derive(Debug)]
#[must_use = "a `Halted` core must wait for an interrupt"]
pub struct Halted {
    cpu: CpuId,
    stack_top: VAddr,
}

/// Decides how a core with nothing to run should stop.
///
/// Returns [`Decision::Halt`] if any environment is runnable, running, or
/// dying, and [`Decision::Diagnostic`] if the whole system is idle.
pub fn decide(envs: &EnvTable) -> Decision {
    if envs.has_work() {
        Decision::Halt
    } else {
        Decision::Diagnostic
    }
}

/// Halts `cpu`.
///
/// This clears the core's current environment, switches it to the kernel
/// address space, marks it [`CpuStatus::Halted`] and only then releases the
/// kernel lock. Another core that takes the lock afterwards will never see a
/// halted core that still owns an environment.
#[tracing::instrument(level = "debug", name = "halt", skip_all, fields(cpu = %cpu.id()))]
pub fn enter<L, A>(mut guard: KernelGuard<'_, L>, cpu: &Cpu, arch: &A) -> Halted
where
    L: RawMutex,
    A: AddressSpace + ?Sized,
{
    let prev_env = guard.take_current(cpu.id());
    arch.load_kernel_address_space();

    let prev_status = cpu.halt();
    debug_assert_eq!(
        prev_status,
        CpuStatus::Active,
        "only an active core can halt (was {prev_status})"
    );

    drop(guard);
    tracing::debug!(prev_env = ?prev_env, stack_top = %cpu.stack_top(), "halting");

    Halted {
        cpu: cpu.id(),
        stack_top: cpu.stack_top(),
    }
}

// === impl Halted ===

impl Halted {
    #[must_use]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    /// The stack pointer the core will be reset to.
    #[must_use]
    pub fn stack_top(&self) -> VAddr {
        self.stack_top
    }

    /// Parks the core until a timer interrupt arrives.
    ///
    /// The interrupt path resumes the core by re-entering the kernel (see
    /// [`Kernel::trap_entry`](crate::Kernel::trap_entry)); this never returns.
    pub fn wait<A: Idle + ?Sized>(self, arch: &A) -> ! {
        unsafe {
            // Safety: by the time we have a `Halted`, the kernel lock has been
            // released and the core holds no references to the current stack,
            // which is the core's own kernel stack.
            arch.idle(self.stack_top)
        }
    }
}
