//! Kernel scheduling configuration.
use crate::{cpu::CpuId, env::EnvId};
use hal_core::VAddr;

/// Sizing of the environment table and the per-core kernel stacks.
///
/// The defaults match the classic 32-bit teaching kernel layout: 1024
/// environments, up to 8 cores, and per-core kernel stacks growing down from
/// the start of the kernel's address range, each followed by an unmapped
/// guard gap.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Config {
    envs: usize,
    cpus: usize,
    kstack_top: VAddr,
    kstack_size: usize,
    kstack_gap: usize,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("environment table capacity must be between 1 and {max}, got {envs}")]
    EnvCapacity { envs: usize, max: usize },
    #[error("at least one CPU core is required")]
    NoCpus,
    #[error("kernel stack size must be a non-zero multiple of {align:#x}, got {size:#x}")]
    StackSize { size: usize, align: usize },
    #[error("kernel stacks must start on a {align:#x}-byte boundary, got {top}")]
    StackAlign { top: VAddr, align: usize },
    #[error("kernel stack guard gaps must be a multiple of {align:#x}, got {gap:#x}")]
    StackGap { gap: usize, align: usize },
    #[error("{cpus} kernel stacks of {size:#x} bytes (plus {gap:#x} byte gaps) do not fit below {top}")]
    StacksOverflow {
        cpus: usize,
        size: usize,
        gap: usize,
        top: VAddr,
    },
}

impl Config {
    pub const DEFAULT_ENVS: usize = 1024;
    pub const DEFAULT_CPUS: usize = 8;
    pub const PAGE_SIZE: usize = 4096;
    pub const DEFAULT_KSTACK_SIZE: usize = 8 * Self::PAGE_SIZE;
    pub const DEFAULT_KSTACK_GAP: usize = 8 * Self::PAGE_SIZE;
    pub const DEFAULT_KSTACK_TOP: VAddr = VAddr::from_usize(0xf000_0000);

    #[must_use]
    pub const fn new() -> Self {
        Self {
            envs: Self::DEFAULT_ENVS,
            cpus: Self::DEFAULT_CPUS,
            kstack_top: Self::DEFAULT_KSTACK_TOP,
            kstack_size: Self::DEFAULT_KSTACK_SIZE,
            kstack_gap: Self::DEFAULT_KSTACK_GAP,
        }
    }

    /// Sets the capacity of the environment table.
    #[must_use]
    pub const fn with_envs(self, envs: usize) -> Self {
        Self { envs, ..self }
    }

    /// Sets the number of CPU cores.
    #[must_use]
    pub const fn with_cpus(self, cpus: usize) -> Self {
        Self { cpus, ..self }
    }

    /// Sets where the first core's kernel stack starts, and how large each
    /// stack and the guard gap below it are.
    #[must_use]
    pub const fn with_kernel_stacks(self, top: VAddr, size: usize, gap: usize) -> Self {
        Self {
            kstack_top: top,
            kstack_size: size,
            kstack_gap: gap,
            ..self
        }
    }

    #[must_use]
    pub fn envs(&self) -> usize {
        self.envs
    }

    #[must_use]
    pub fn cpus(&self) -> usize {
        self.cpus
    }

    /// Returns the top of `cpu`'s kernel stack.
    ///
    /// Core *i*'s stack top is `kstack_top - i * (kstack_size + kstack_gap)`.
    ///
    /// # Panics
    ///
    /// If the configuration has not been [validated](Self::validate) and the
    /// stack would lie below address zero.
    #[must_use]
    pub fn stack_top(&self, cpu: CpuId) -> VAddr {
        self.try_stack_top(cpu.as_usize())
            .unwrap_or_else(|| panic!("kernel stack for {cpu} lies below address zero"))
    }

    fn try_stack_top(&self, cpu: usize) -> Option<VAddr> {
        let stride = self.kstack_size.checked_add(self.kstack_gap)?;
        let offset = stride.checked_mul(cpu)?;
        let top = self.kstack_top.checked_sub(offset)?;
        // the bottom of the stack must also be addressable.
        top.checked_sub(self.kstack_size)?;
        Some(top)
    }

    /// Checks that this configuration describes a usable kernel.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.envs == 0 || self.envs > EnvId::MAX_SLOTS {
            return Err(ConfigError::EnvCapacity {
                envs: self.envs,
                max: EnvId::MAX_SLOTS,
            });
        }

        if self.cpus == 0 {
            return Err(ConfigError::NoCpus);
        }

        if self.kstack_size == 0 || self.kstack_size % Self::PAGE_SIZE != 0 {
            return Err(ConfigError::StackSize {
                size: self.kstack_size,
                align: Self::PAGE_SIZE,
            });
        }

        if !self.kstack_top.is_aligned(Self::PAGE_SIZE) {
            return Err(ConfigError::StackAlign {
                top: self.kstack_top,
                align: Self::PAGE_SIZE,
            });
        }

        if self.kstack_gap % Self::PAGE_SIZE != 0 {
            return Err(ConfigError::StackGap {
                gap: self.kstack_gap,
                align: Self::PAGE_SIZE,
            });
        }

        if self.try_stack_top(self.cpus - 1).is_none() {
            return Err(ConfigError::StacksOverflow {
                cpus: self.cpus,
                size: self.kstack_size,
                gap: self.kstack_gap,
                top: self.kstack_top,
            });
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
