//! A per-core round-robin scheduler for a preemptive multiprocessor kernel.
//!
//! Each core calls into the scheduler whenever it needs new work: after the
//! environment it was running yields, exits, or is preempted by the timer.
//! The scheduler scans the [environment table](env::EnvTable) in circular
//! order from just past the slot this core last ran, and either dispatches
//! the first runnable environment, keeps running the core's own environment,
//! or idles the core.
//!
//! Scheduling decisions are computed by pure functions ([`sched::schedule`],
//! [`halt::decide`]) returning a [`Decision`]; the [`Kernel`] context object
//! then performs the matching irreversible action through the [`hal_core`]
//! traits.
#![cfg_attr(target_os = "none", no_std)]

extern crate alloc;

pub mod config;
pub mod cpu;
pub mod env;
pub mod halt;
pub mod kernel;
pub mod monitor;
pub mod sched;

pub(crate) mod loom;

pub use self::{
    config::Config,
    cpu::{CpuId, CpuStatus},
    env::{EnvId, EnvTable, Status},
    kernel::{Kernel, KernelGuard, Transfer},
    sched::Decision,
};
