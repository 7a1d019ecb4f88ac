use crate::VAddr;

/// Parking a CPU core until the next interrupt arrives.
pub trait Idle {
    /// Reset the calling core's stack to `stack_top`, enable interrupts, and
    /// wait for an interrupt in a loop, forever.
    ///
    /// The only way out of this function is the interrupt path: a timer
    /// interrupt will enter the kernel on a fresh stack frame. This function
    /// itself never returns.
    ///
    /// # Safety
    ///
    /// Everything on the current stack is discarded. The caller must not hold
    /// any locks or references into that stack, and `stack_top` must be the
    /// top of the kernel stack reserved for the calling core.
    unsafe fn idle(&self, stack_top: VAddr) -> !;
}
