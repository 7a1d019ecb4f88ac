//! The kernel's scheduling context.
//!
//! [`Kernel`] owns everything the scheduler reads or writes: the
//! [environment table](EnvTable), each core's current environment, and the
//! per-core [`Cpu`] records, along with the kernel lock that serializes all
//! of it across cores.
//!
//! The scheduler itself never returns to its caller: a core either ends up
//! running an environment, halts, or sits in the kernel monitor. To keep that
//! testable, [`Kernel::prepare_yield`] does everything that touches shared
//! state and returns a [`Transfer`] describing the one irreversible step left
//! to take, which [`Transfer::perform`] then takes.
use crate::{
    config::{Config, ConfigError},
    cpu::{Cpu, CpuId, CpuStatus},
    env::{EnvError, EnvId, EnvTable, Status},
    halt::{self, Halted},
    monitor,
    sched::{self, Decision},
};
use alloc::{boxed::Box, vec::Vec};
use core::fmt;
use hal_core::{mem::AddressSpace, task::Dispatch, Architecture};
use maitake_sync::{
    blocking::{Mutex, MutexGuard, RawMutex},
    spin::Spinlock,
};

/// Scheduling state shared by all cores, protected by the kernel lock.
#[derive(Debug)]
pub struct State {
    envs: EnvTable,
    /// The environment each core last dispatched, indexed by core ID.
    current: Box<[Option<EnvId>]>,
}

/// Proof that the kernel lock is held.
pub type KernelGuard<'a, L = Spinlock> = MutexGuard<'a, State, L>;

/// The scheduling context for the whole machine.
///
/// `L` is the raw lock used as the kernel lock.
pub struct Kernel<L = Spinlock> {
    state: Mutex<State, L>,
    cpus: Box<[Cpu]>,
}

/// The last step of a scheduling decision, taken after all shared state has
/// been updated.
#[must_use = "a `Transfer` must be performed"]
pub enum Transfer<'a, L: RawMutex = Spinlock> {
    /// Run `env` on `cpu`. The kernel lock has been released.
    Run { cpu: CpuId, env: EnvId },
    /// The core is halted and the kernel lock has been released.
    Halt(Halted),
    /// There is nothing left to run anywhere; enter the kernel monitor. The
    /// kernel lock is still held, so the monitor sees a consistent snapshot.
    Diagnostic(KernelGuard<'a, L>),
}

// === impl State ===

impl State {
    #[must_use]
    pub fn envs(&self) -> &EnvTable {
        &self.envs
    }

    #[must_use]
    pub fn envs_mut(&mut self) -> &mut EnvTable {
        &mut self.envs
    }

    /// Returns the environment `cpu` last dispatched, if it still has one.
    #[track_caller]
    #[must_use]
    pub fn current(&self, cpu: CpuId) -> Option<EnvId> {
        self.current[cpu.as_usize()]
    }

    /// Changes the status of the environment `cpu` is running, on behalf of
    /// that environment (e.g. it blocked, yielded, or exited in a system
    /// call), returning its ID.
    ///
    /// Other cores cannot change the status of a running environment. The
    /// caller should yield `cpu` with this same guard.
    pub fn set_current_status(&mut self, cpu: CpuId, status: Status) -> Result<EnvId, EnvError> {
        let id = self.current(cpu).ok_or(EnvError::NoCurrent(cpu))?;
        self.envs.set_running_status(id, cpu, status)?;
        Ok(id)
    }

    pub(crate) fn take_current(&mut self, cpu: CpuId) -> Option<EnvId> {
        self.current[cpu.as_usize()].take()
    }

    /// Dispatch bookkeeping: `cpu` stops running its current environment
    /// and starts running `next`.
    fn switch_to(&mut self, cpu: CpuId, next: EnvId) {
        let idx = cpu.as_usize();
        debug_assert!(
            self.current
                .iter()
                .enumerate()
                .all(|(i, &current)| i == idx || current != Some(next)),
            "{next} is already the current environment of another core"
        );

        if let Some(prev) = self.current[idx] {
            if prev != next {
                self.envs.preempt(prev);
            }
        }

        if let Err(error) = self.envs.run_on(next, cpu) {
            panic!("cannot dispatch {next} on {cpu}: {error}");
        }
        self.current[idx] = Some(next);
    }
}

// === impl Kernel ===

impl Kernel {
    /// Returns a new kernel using a spinlock as the kernel lock.
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Self::with_lock(config, Spinlock::new())
    }
}

impl<L: RawMutex> Kernel<L> {
    /// Returns a new kernel using `lock` as the kernel lock.
    pub fn with_lock(config: &Config, lock: L) -> Result<Self, ConfigError> {
        config.validate()?;

        let cpus = (0..config.cpus())
            .map(|i| {
                let id = CpuId::new(i);
                Cpu::new(id, config.stack_top(id))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let state = State {
            envs: EnvTable::new(config.envs()),
            current: alloc::vec![None; config.cpus()].into_boxed_slice(),
        };

        tracing::info!(
            envs = config.envs(),
            cpus = config.cpus(),
            "initialized environment scheduler"
        );

        Ok(Self {
            state: Mutex::new_with_raw_mutex(state, lock),
            cpus,
        })
    }

    #[must_use]
    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    /// # Panics
    ///
    /// If there is no core with the given ID.
    #[track_caller]
    #[must_use]
    pub fn cpu(&self, id: CpuId) -> &Cpu {
        match self.cpus.get(id.as_usize()) {
            Some(cpu) => cpu,
            None => panic!("no such core: {id} (there are {} cores)", self.cpus.len()),
        }
    }

    /// Acquires the kernel lock, spinning until it is available.
    pub fn lock(&self) -> KernelGuard<'_, L> {
        self.state.lock()
    }

    /// Attempts to acquire the kernel lock without spinning.
    #[must_use]
    pub fn try_lock(&self) -> Option<KernelGuard<'_, L>> {
        self.state.try_lock()
    }

    /// Brings `cpu` online and enters the kernel on it.
    ///
    /// # Panics
    ///
    /// If `cpu` was already started.
    pub fn start_cpu(&self, cpu: CpuId) -> KernelGuard<'_, L> {
        let prev = self.cpu(cpu).activate();
        assert_eq!(prev, CpuStatus::Unused, "{cpu} was already started");
        tracing::info!(%cpu, "started core");
        self.lock()
    }

    /// Enters the kernel on `cpu` from a trap or interrupt.
    ///
    /// If the core was halted, this is what wakes it: it becomes active again
    /// and re-acquires the kernel lock it gave up when it halted.
    pub fn trap_entry(&self, cpu: CpuId) -> KernelGuard<'_, L> {
        let prev = self.cpu(cpu).activate();
        debug_assert_ne!(prev, CpuStatus::Unused, "{cpu} trapped before it was started");
        if prev == CpuStatus::Halted {
            tracing::trace!(%cpu, "resuming halted core");
        }
        self.lock()
    }

    /// Picks `cpu`'s next environment and updates all shared state to match.
    ///
    /// This consumes the kernel lock guard: the lock must be held to make a
    /// scheduling decision. Unless there is nothing to run anywhere, the lock
    /// is released before this returns.
    #[tracing::instrument(level = "trace", skip(self, guard, arch))]
    pub fn prepare_yield<'a, A>(
        &'a self,
        mut guard: KernelGuard<'a, L>,
        cpu: CpuId,
        arch: &A,
    ) -> Transfer<'a, L>
    where
        A: AddressSpace + ?Sized,
    {
        let core = self.cpu(cpu);
        let current = guard.current(cpu);

        match sched::schedule(&guard.envs, cpu, current) {
            Decision::Dispatch(env) => {
                guard.switch_to(cpu, env);
                drop(guard);
                tracing::trace!(%env, env.slot = env.slot(), "dispatching");
                Transfer::Run { cpu, env }
            }
            Decision::Halt => Transfer::Halt(halt::enter(guard, core, arch)),
            Decision::Diagnostic => {
                tracing::warn!("no runnable environments in the system!");
                Transfer::Diagnostic(guard)
            }
        }
    }

    /// Picks new work for `cpu` and switches to it.
    ///
    /// This must be called with the kernel lock held, whenever the core's
    /// current environment yields, exits, or is preempted. It never returns.
    pub fn yield_cpu<'a, A>(&'a self, guard: KernelGuard<'a, L>, cpu: CpuId, arch: &A) -> !
    where
        A: Architecture + Dispatch<EnvId>,
    {
        self.prepare_yield(guard, cpu, arch).perform(self, arch)
    }
}

impl<L> fmt::Debug for Kernel<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("cpus", &self.cpus)
            .finish_non_exhaustive()
    }
}

// === impl Transfer ===

impl<'a, L: RawMutex> Transfer<'a, L> {
    /// Takes the final, irreversible step of a scheduling decision.
    pub fn perform<A>(self, kernel: &Kernel<L>, arch: &A) -> !
    where
        A: Architecture + Dispatch<EnvId>,
    {
        match self {
            Self::Run { env, .. } => arch.dispatch(env),
            Self::Halt(halted) => halted.wait(arch),
            Self::Diagnostic(guard) => monitor::run(guard, kernel.cpus(), arch),
        }
    }
}

impl<L: RawMutex> fmt::Debug for Transfer<'_, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Run { cpu, env } => f
                .debug_struct("Transfer::Run")
                .field("cpu", cpu)
                .field("env", env)
                .finish(),
            Self::Halt(halted) => f.debug_tuple("Transfer::Halt").field(halted).finish(),
            Self::Diagnostic(_) => f.write_str("Transfer::Diagnostic(..)"),
        }
    }
}
