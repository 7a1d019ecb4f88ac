/// Transfers the calling core to a task.
///
/// `T` is the kernel's handle for whatever it schedules.
pub trait Dispatch<T> {
    /// Restore `task`'s saved register state and resume executing it.
    ///
    /// The kernel will only regain control of this core through a trap or
    /// interrupt, so this never returns.
    fn dispatch(&self, task: T) -> !;
}
