//! Per-core records.
use crate::loom::sync::atomic::{AtomicU8, Ordering::*};
use core::fmt;
use hal_core::VAddr;

/// Identifies a CPU core.
///
/// ID 0 is the first CPU core started when the system boots.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct CpuId(usize);

/// What a core is currently doing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CpuStatus {
    /// The core has not been started yet.
    Unused = 0,
    /// The core is executing kernel or environment code.
    Active = 1,
    /// The core is idle with interrupts enabled, waiting for a timer
    /// interrupt.
    Halted = 2,
}

/// A CPU core's scheduling record.
///
/// The status is read by the interrupt path *before* it takes the kernel
/// lock, so it is kept here as an atomic rather than in the lock-protected
/// kernel state.
pub struct Cpu {
    id: CpuId,
    status: AtomicU8,
    /// Top of this core's kernel stack, restored when the core halts.
    stack_top: VAddr,
}

// === impl CpuId ===

impl CpuId {
    #[must_use]
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

// === impl CpuStatus ===

impl CpuStatus {
    fn from_u8(u: u8) -> Self {
        match u {
            0 => Self::Unused,
            1 => Self::Active,
            2 => Self::Halted,
            bits => unreachable!("invalid CPU status {bits:#x}"),
        }
    }
}

impl fmt::Display for CpuStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Self::Unused => "unused",
            Self::Active => "active",
            Self::Halted => "halted",
        })
    }
}

// === impl Cpu ===

impl Cpu {
    pub(crate) fn new(id: CpuId, stack_top: VAddr) -> Self {
        Self {
            id,
            status: AtomicU8::new(CpuStatus::Unused as u8),
            stack_top,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> CpuId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn stack_top(&self) -> VAddr {
        self.stack_top
    }

    #[must_use]
    pub fn status(&self) -> CpuStatus {
        CpuStatus::from_u8(self.status.load(Acquire))
    }

    /// Publishes that this core is halted, returning its previous status.
    pub(crate) fn halt(&self) -> CpuStatus {
        CpuStatus::from_u8(self.status.swap(CpuStatus::Halted as u8, AcqRel))
    }

    /// Marks this core as active, returning its previous status.
    ///
    /// Called on boot and whenever the core enters the kernel through the
    /// interrupt path.
    pub(crate) fn activate(&self) -> CpuStatus {
        CpuStatus::from_u8(self.status.swap(CpuStatus::Active as u8, AcqRel))
    }
}

impl fmt::Debug for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cpu")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("stack_top", &self.stack_top)
            .finish()
    }
}
