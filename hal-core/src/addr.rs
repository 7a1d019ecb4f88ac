use core::fmt;

/// A virtual address.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[repr(transparent)]
pub struct VAddr(usize);

impl VAddr {
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn from_usize(u: usize) -> Self {
        Self(u)
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Subtracts `rhs` bytes from this address, returning `None` if the
    /// result would wrap below zero.
    #[must_use]
    pub const fn checked_sub(self, rhs: usize) -> Option<Self> {
        match self.0.checked_sub(rhs) {
            Some(u) => Some(Self(u)),
            None => None,
        }
    }

    /// Returns `true` if `self` is aligned on the specified alignment.
    ///
    /// # Panics
    ///
    /// - If `align` is not a power of two.
    pub fn is_aligned(self, align: usize) -> bool {
        assert!(align.is_power_of_two());
        self.0 & (align - 1) == 0
    }
}

impl fmt::Debug for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VAddr")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

impl fmt::Display for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
