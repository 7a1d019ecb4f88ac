//! Strict round-robin environment selection.
//!
//! Each core remembers the environment it last dispatched. When the core
//! needs new work, the table is scanned in circular order starting with the
//! slot *after* that environment, and the first [`Runnable`] environment
//! found is chosen. Across a run of decisions on an unchanging table, every
//! runnable environment is therefore chosen once before any is chosen again.
//!
//! If nothing is runnable, a core may keep running its own environment, as
//! long as that environment is still [`Running`]. Otherwise the core goes
//! to the [halt controller](crate::halt).
//!
//! [`Runnable`]: Status::Runnable
//! [`Running`]: Status::Running
use crate::{
    cpu::CpuId,
    env::{Env, EnvId, EnvTable, Status},
    halt,
};

/// What a core should do next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub enum Decision {
    /// Dispatch this environment on the calling core.
    Dispatch(EnvId),
    /// Nothing to run on this core, but there is work in flight elsewhere in
    /// the system: halt until the next timer interrupt.
    Halt,
    /// Nothing to run anywhere in the system: drop into the kernel monitor.
    Diagnostic,
}

/// Decides what `cpu` should run next, given the environment it last ran.
///
/// # Panics
///
/// If `current`'s slot is outside the table.
#[tracing::instrument(level = "trace", skip(envs, current), fields(current = ?current.map(EnvId::slot)))]
pub fn schedule(envs: &EnvTable, cpu: CpuId, current: Option<EnvId>) -> Decision {
    if let Some(next) = next_runnable(envs, current) {
        tracing::trace!(next = %next, next.slot = next.slot(), "found runnable environment");
        return Decision::Dispatch(next);
    }

    // nothing else wants the CPU; the core may keep its own environment,
    // provided nobody has changed its state out from under us.
    if let Some(current) = current {
        if still_running(envs, current) {
            tracing::trace!(env = %current, "continuing current environment");
            return Decision::Dispatch(current);
        }
    }

    halt::decide(envs)
}

/// Scans the table in circular order, starting just past `current`'s slot,
/// and returns the first runnable environment.
///
/// # Panics
///
/// If `current`'s slot is outside the table.
#[must_use]
pub fn next_runnable(envs: &EnvTable, current: Option<EnvId>) -> Option<EnvId> {
    let len = envs.capacity();
    let start = match current {
        Some(id) => {
            let slot = id.slot();
            assert!(
                slot < len,
                "current environment {id} is in slot {slot}, but the table only has {len} slots"
            );
            (slot + 1) % len
        }
        None => 0,
    };

    (start..len)
        .chain(0..start)
        .map(|slot| envs.slot(slot))
        .find(|env| env.status() == Status::Runnable)
        .map(Env::id)
}

fn still_running(envs: &EnvTable, id: EnvId) -> bool {
    // a stale handle means the environment was freed (and maybe its slot
    // reused) since this core last ran it.
    envs.get(id)
        .map(|env| env.status() == Status::Running)
        .unwrap_or(false)
}
