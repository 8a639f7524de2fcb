use super::CodeCache;
use crate::{FaultResult, Guest, PageFault};

impl<G: Guest> CodeCache<G> {
    /// Installs the fault handler and asks the guest for its fastmem views. Returns whether
    /// fastmem is usable.
    pub(super) fn initialize_fastmem(&mut self, guest: &mut G) -> bool {
        let Some(registry) = self.faults.as_mut() else {
            tracing::warn!("no page fault handler registry - fastmem disabled");
            return false;
        };

        if let Err(e) = registry.install() {
            tracing::error!("failed to install page fault handler - fastmem disabled: {e}");
            return false;
        }

        self.fault_handler_installed = true;
        if !guest.set_fastmem_enabled(true) {
            tracing::warn!("guest has no fastmem views - fastmem disabled");
            self.shutdown_fastmem(guest);
            return false;
        }

        tracing::info!("fastmem enabled");
        true
    }

    pub(super) fn shutdown_fastmem(&mut self, guest: &mut G) {
        if self.fault_handler_installed {
            if let Some(registry) = self.faults.as_mut() {
                registry.remove();
            }

            self.fault_handler_installed = false;
        }

        if self.fastmem {
            tracing::info!("fastmem disabled");
        }

        guest.set_fastmem_enabled(false);
        self.fastmem = false;
    }

    /// Resolves a host memory fault raised by generated code.
    ///
    /// Writes through fastmem into a code page invalidate that page. Faults on known memory
    /// access sites are resolved by rewriting the access to the slow path. Anything else is
    /// left to the next handler.
    pub fn handle_page_fault(&mut self, guest: &mut G, fault: PageFault) -> FaultResult {
        if !self.fastmem {
            return FaultResult::Unhandled;
        }

        if fault.is_write
            && let Some(view) = guest.fastmem_view()
            && view.contains(&fault.fault_address)
            && let Ok(offset) = u32::try_from(fault.fault_address - view.start)
            && let Some(page) = self.map.ram_page(offset)
            && self.pages.is_tracked(page)
        {
            tracing::debug!(page, "fastmem write to code page");
            self.invalidate_blocks_with_page_index(guest, page);
            self.backpatch_access(fault.host_pc);

            return FaultResult::Resolved;
        }

        if self.backpatch_access(fault.host_pc) {
            return FaultResult::Resolved;
        }

        tracing::error!(
            "unhandled page fault at {:#X} while accessing {:#X}",
            fault.host_pc,
            fault.fault_address
        );

        FaultResult::Unhandled
    }

    /// Rewrites the memory access at `host_pc` to go through the slow path. Returns whether a
    /// known access site was patched.
    fn backpatch_access(&mut self, host_pc: usize) -> bool {
        let Some((_, id)) = self.host_index.find(host_pc) else {
            return false;
        };

        let Some(block) = self.blocks.get(id) else {
            return false;
        };

        if !block.host_code.is_some_and(|code| code.contains(host_pc)) {
            return false;
        }

        let Some(site) = block.backpatch.iter().find(|s| s.host_pc == host_pc).copied() else {
            tracing::warn!("no backpatch info for access at {host_pc:#X} in {}", block.key);
            return false;
        };

        let (Some(backend), Some(buffer)) = (self.backend.as_mut(), self.buffer.as_mut()) else {
            return false;
        };

        // a site stays known until its rewrite succeeds
        match backend.backpatch(buffer, &self.blocks[id], &site) {
            Ok(()) => {
                tracing::debug!(
                    "backpatched access to {:08X} at {host_pc:#X}",
                    site.guest_pc
                );

                self.blocks[id].backpatch.retain(|s| s.host_pc != host_pc);
                self.stats.backpatches += 1;
                true
            }
            Err(e) => {
                tracing::error!("failed to backpatch access at {host_pc:#X}: {e}");
                false
            }
        }
    }
}
