/// Control over the calling core's active address space.
pub trait AddressSpace {
    /// Load the kernel-only page tables on the calling core.
    ///
    /// This is used when a core stops executing on behalf of any environment,
    /// so that the environment's mappings may be torn down without the core
    /// still referencing them.
    fn load_kernel_address_space(&self);
}
