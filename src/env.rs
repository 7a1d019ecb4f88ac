//! Environments and the fixed-capacity environment table.
//!
//! An environment is the kernel's unit of scheduling. Environments live in
//! an [`EnvTable`] whose capacity is fixed when the kernel is initialized;
//! an environment's slot in the table never changes while it is alive.
//! Everything else in the kernel refers to environments by [`EnvId`], which
//! pairs the slot with a generation number so that a handle to an
//! environment which has since been freed (and whose slot may have been
//! reused) can be detected.
use crate::cpu::CpuId;
use alloc::{boxed::Box, vec::Vec};
use core::fmt;

/// An environment's identifier.
///
/// The low [`EnvId::GEN_SHIFT`] bits are the environment's slot in the
/// table; the remaining bits are a generation counter which is bumped every
/// time the slot is allocated.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
#[repr(transparent)]
pub struct EnvId(u32);

/// The lifecycle states an environment moves through.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Status {
    /// The slot is not in use.
    Free = 0,
    /// The environment is being torn down, but is still running on some core.
    Dying,
    /// The environment is waiting to be dispatched.
    Runnable,
    /// The environment is currently running on a core.
    Running,
    /// The environment is blocked (e.g. waiting on IPC).
    NotRunnable,
}

/// A schedulable environment.
#[derive(Clone, Debug)]
pub struct Env {
    id: EnvId,
    status: Status,
    /// The core that last dispatched this environment.
    cpu: Option<CpuId>,
    runs: u64,
}

/// The fixed-capacity table of environments.
#[derive(Debug)]
pub struct EnvTable {
    envs: Box<[Env]>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum EnvError {
    /// The handle does not name a live environment: its slot is out of
    /// range, the slot is free, or the slot has since been reallocated.
    #[error("environment {0} does not exist")]
    BadEnv(EnvId),
    /// Every slot in the table is in use.
    #[error("no free environment slots")]
    NoFreeEnv,
    /// The requested status may not be set directly.
    #[error("status {0} cannot be assigned directly")]
    InvalidStatus(Status),
    /// The environment is running on a core, and only that core may change
    /// its status (other than marking it dying).
    #[error("environment {id} is running on {cpu}")]
    Running { id: EnvId, cpu: CpuId },
    /// The core has no running environment of its own.
    #[error("{0} is not running an environment")]
    NoCurrent(CpuId),
}

// === impl EnvId ===

impl EnvId {
    /// Number of low-order bits encoding the slot index.
    pub const GEN_SHIFT: u32 = 12;

    /// The largest table capacity an `EnvId` can address.
    pub const MAX_SLOTS: usize = 1 << Self::GEN_SHIFT;

    const SLOT_MASK: u32 = (1 << Self::GEN_SHIFT) - 1;

    #[must_use]
    pub const fn from_u32(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the table slot this ID refers to.
    #[inline]
    #[must_use]
    pub const fn slot(self) -> usize {
        (self.0 & Self::SLOT_MASK) as usize
    }

    #[inline]
    #[must_use]
    pub const fn generation(self) -> u32 {
        self.0 >> Self::GEN_SHIFT
    }

    /// Returns the ID for the next environment to occupy `prev`'s slot.
    ///
    /// Generations wrap back to 1 rather than becoming negative when the ID
    /// is viewed as an `i32`, so a live ID is never zero or negative.
    fn next_generation(prev: Self) -> Self {
        let mut generation = prev.0.wrapping_add(1 << Self::GEN_SHIFT) & !Self::SLOT_MASK;
        if generation == 0 || generation > i32::MAX as u32 {
            generation = 1 << Self::GEN_SHIFT;
        }
        Self(generation | (prev.0 & Self::SLOT_MASK))
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvId")
            .field("slot", &self.slot())
            .field("generation", &self.generation())
            .finish()
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

// === impl Status ===

impl Status {
    /// Returns `true` if an environment in this state still has work in
    /// flight somewhere in the system.
    ///
    /// A core may only halt and wait for an interrupt while at least one
    /// environment is in flight; otherwise nothing will ever wake it.
    #[must_use]
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Runnable | Self::Running | Self::Dying)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Free => "free",
            Self::Dying => "dying",
            Self::Runnable => "runnable",
            Self::Running => "running",
            Self::NotRunnable => "not runnable",
        })
    }
}

// === impl Env ===

impl Env {
    fn check_not_running(&self) -> Result<(), EnvError> {
        match (self.status, self.cpu) {
            (Status::Running, Some(cpu)) => Err(EnvError::Running { id: self.id, cpu }),
            _ => Ok(()),
        }
    }

    fn set_status(&mut self, status: Status) {
        tracing::trace!(env.id = %self.id, from = %self.status, to = %status, "set environment status");
        self.status = status;
    }

    const fn empty(slot: usize) -> Self {
        Self {
            id: EnvId(slot as u32),
            status: Status::Free,
            cpu: None,
            runs: 0,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> EnvId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Returns the core that most recently dispatched this environment.
    #[must_use]
    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    /// Returns how many times this environment has been dispatched.
    #[must_use]
    pub fn runs(&self) -> u64 {
        self.runs
    }
}

// === impl EnvTable ===

impl EnvTable {
    /// Returns a new table with `capacity` free slots.
    ///
    /// # Panics
    ///
    /// If `capacity` is zero or greater than [`EnvId::MAX_SLOTS`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= EnvId::MAX_SLOTS,
            "environment table capacity must be in 1..={}, got {capacity}",
            EnvId::MAX_SLOTS,
        );
        let envs = (0..capacity).map(Env::empty).collect::<Vec<_>>();
        Self {
            envs: envs.into_boxed_slice(),
        }
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.envs.len()
    }

    /// Returns the environment in `slot`, whatever its state.
    ///
    /// # Panics
    ///
    /// If `slot` is out of range. Slot indices come from the table itself, so
    /// an out of range index means an invariant was violated somewhere.
    #[inline]
    #[track_caller]
    #[must_use]
    pub fn slot(&self, slot: usize) -> &Env {
        match self.envs.get(slot) {
            Some(env) => env,
            None => panic!(
                "environment slot {slot} out of range for a table of {} slots",
                self.envs.len()
            ),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Env> + '_ {
        self.envs.iter()
    }

    /// Looks up a live environment by ID.
    ///
    /// This fails if `id` is stale: the slot was freed or reallocated since
    /// the handle was issued.
    pub fn get(&self, id: EnvId) -> Result<&Env, EnvError> {
        match self.envs.get(id.slot()) {
            Some(env) if env.id == id && env.status != Status::Free => Ok(env),
            _ => Err(EnvError::BadEnv(id)),
        }
    }

    fn get_mut(&mut self, id: EnvId) -> Result<&mut Env, EnvError> {
        match self.envs.get_mut(id.slot()) {
            Some(env) if env.id == id && env.status != Status::Free => Ok(env),
            _ => Err(EnvError::BadEnv(id)),
        }
    }

    /// Allocates the lowest free slot for a new, runnable environment.
    pub fn alloc(&mut self) -> Result<EnvId, EnvError> {
        let env = self
            .envs
            .iter_mut()
            .find(|env| env.status == Status::Free)
            .ok_or(EnvError::NoFreeEnv)?;
        env.id = EnvId::next_generation(env.id);
        env.status = Status::Runnable;
        env.cpu = None;
        env.runs = 0;
        tracing::trace!(env.id = %env.id, env.slot = env.id.slot(), "allocated environment");
        Ok(env.id)
    }

    /// Returns `id`'s slot to the free pool.
    ///
    /// The slot keeps its ID until it is reallocated, so outstanding handles
    /// to it fail to resolve rather than silently naming a new environment.
    ///
    /// An environment that is running on a core must be marked
    /// [`Status::Dying`] first.
    pub fn free(&mut self, id: EnvId) -> Result<(), EnvError> {
        let env = self.get_mut(id)?;
        env.check_not_running()?;
        env.status = Status::Free;
        tracing::trace!(env.id = %id, "freed environment");
        Ok(())
    }

    /// Sets the status of a live environment.
    ///
    /// [`Status::Free`] must go through [`EnvTable::free`], and
    /// [`Status::Running`] is only ever entered by dispatching the
    /// environment on a core. An environment that is running on a core may
    /// only be marked [`Status::Dying`] from here; anything else must be
    /// done by the core running it (see
    /// [`State::set_current_status`](crate::kernel::State::set_current_status)).
    pub fn set_status(&mut self, id: EnvId, status: Status) -> Result<(), EnvError> {
        if matches!(status, Status::Free | Status::Running) {
            return Err(EnvError::InvalidStatus(status));
        }
        let env = self.get_mut(id)?;
        if status != Status::Dying {
            env.check_not_running()?;
        }
        env.set_status(status);
        Ok(())
    }

    /// Sets the status of `id`, which `cpu` is running.
    pub(crate) fn set_running_status(
        &mut self,
        id: EnvId,
        cpu: CpuId,
        status: Status,
    ) -> Result<(), EnvError> {
        if matches!(status, Status::Free | Status::Running) {
            return Err(EnvError::InvalidStatus(status));
        }
        let env = self.get_mut(id)?;
        if env.status != Status::Running || env.cpu != Some(cpu) {
            return Err(EnvError::NoCurrent(cpu));
        }
        env.set_status(status);
        Ok(())
    }

    /// Returns `true` if any environment is runnable, running, or dying.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.envs.iter().any(|env| env.status.is_in_flight())
    }

    /// Marks `id` as running on `cpu`.
    pub(crate) fn run_on(&mut self, id: EnvId, cpu: CpuId) -> Result<(), EnvError> {
        let env = self.get_mut(id)?;
        env.status = Status::Running;
        env.cpu = Some(cpu);
        env.runs += 1;
        Ok(())
    }

    /// If `id` is running, puts it back in the runnable state.
    pub(crate) fn preempt(&mut self, id: EnvId) {
        if let Ok(env) = self.get_mut(id) {
            if env.status == Status::Running {
                env.status = Status::Runnable;
            }
        }
    }
}
