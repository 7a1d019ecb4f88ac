//! Hardware abstraction traits consumed by the kernel's scheduler.
//!
//! Everything in here is an *irreversible* or architecture-specific
//! primitive: switching address spaces, transferring the processor to an
//! environment, idling a core until the next interrupt, and reading operator
//! input for the kernel monitor. The scheduler is written against these traits
//! so that its decision logic can be exercised on the host with test doubles.
#![cfg_attr(target_os = "none", no_std)]

mod addr;
pub mod console;
pub mod cpu;
pub mod mem;
pub mod task;

pub use self::addr::VAddr;

/// A platform the scheduler can run on.
///
/// This bundles the primitives a core needs while idling or sitting in the
/// kernel monitor. Context switching is a separate [`task::Dispatch`] trait,
/// since it is generic over the kernel's task handle type.
pub trait Architecture: cpu::Idle + mem::AddressSpace + console::ReadLine {
    /// The name of the architecture, as a string.
    const NAME: &'static str;
}
