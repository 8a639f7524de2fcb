use easyerr::Error;

/// A host memory fault raised while running generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// Host instruction that faulted.
    pub host_pc: usize,
    /// Host address that was accessed.
    pub fault_address: usize,
    pub is_write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResult {
    /// Execution can resume at the faulting instruction.
    Resolved,
    /// The fault is not ours; pass it on to the next handler.
    Unhandled,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a page fault handler is already installed")]
    AlreadyInstalled,
    #[error(transparent)]
    Os { source: std::io::Error },
}

/// Host facility that catches memory faults raised by generated code.
///
/// The registry only claims the host fault hook; it is owned by the cache and never sees the
/// cache or the guest. Whoever owns both, usually the thread running [`CodeCache::run`], must
/// turn every fault caught while the hook is installed into a [`PageFault`], pass it to
/// [`CodeCache::handle_page_fault`] and resume the faulting instruction on
/// [`FaultResult::Resolved`]. On [`FaultResult::Unhandled`] the fault goes to the next handler
/// in the chain.
///
/// [`CodeCache::run`]: crate::CodeCache::run
/// [`CodeCache::handle_page_fault`]: crate::CodeCache::handle_page_fault
pub trait FaultHandlerRegistry {
    /// Claims the host fault hook. Called when fastmem is turned on.
    fn install(&mut self) -> Result<(), RegistryError>;
    /// Releases the hook. Faults are no longer forwarded after this returns.
    fn remove(&mut self);
}
