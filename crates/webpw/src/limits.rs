//! Resource limits for the sandbox.

use std::time::Duration;

/// Size of a WebAssembly page.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Memory cap on hosts with a 32-bit (or narrower) address space: 512 pages.
pub const NARROW_HOST_MEMORY_BYTES: u64 = 512 * WASM_PAGE_SIZE;

/// Memory cap on hosts with a 64-bit address space: 4096 pages.
pub const WIDE_HOST_MEMORY_BYTES: u64 = 4096 * WASM_PAGE_SIZE;

/// Map a host pointer width in bits to the sandbox's linear memory cap.
///
/// Narrow hosts get 32 MiB so a handful of instances cannot exhaust the
/// host's address space; wide hosts get 256 MiB.
#[must_use]
pub const fn memory_cap_for_pointer_width(bits: u32) -> u64 {
    if bits < 64 {
        NARROW_HOST_MEMORY_BYTES
    } else {
        WIDE_HOST_MEMORY_BYTES
    }
}

/// Resource limits applied to every module instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Maximum size of an instance's linear memory, enforced by the sandbox.
    pub max_memory_bytes: u64,
    /// Deadline for a request when the caller does not supply one. Covers
    /// waiting for an instance as well as every call into it.
    pub call_timeout: Duration,
    /// How often the engine epoch advances. Deadlines and cancellation are
    /// observed at this granularity.
    pub epoch_tick: Duration,
    /// Maximum native stack used by sandboxed code.
    pub max_wasm_stack: usize,
    /// Maximum size of the decompressed module image.
    pub max_module_bytes: usize,
}

impl ResourceLimits {
    /// Limits for a host with the given pointer width.
    #[must_use]
    pub fn for_pointer_width(bits: u32) -> Self {
        Self {
            max_memory_bytes: memory_cap_for_pointer_width(bits),
            call_timeout: Duration::from_secs(30),
            epoch_tick: Duration::from_millis(10),
            max_wasm_stack: 512 * 1024,
            max_module_bytes: 64 * 1024 * 1024,
        }
    }

    /// The memory cap in WebAssembly pages.
    #[must_use]
    pub const fn max_memory_pages(&self) -> u64 {
        self.max_memory_bytes / WASM_PAGE_SIZE
    }
}

impl Default for ResourceLimits {
    /// Limits for the host this crate was compiled for.
    fn default() -> Self {
        Self::for_pointer_width(usize::BITS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrow_hosts_get_512_pages() {
        let limits = ResourceLimits::for_pointer_width(32);
        assert_eq!(limits.max_memory_bytes, 32 * 1024 * 1024);
        assert_eq!(limits.max_memory_pages(), 512);
        assert_eq!(memory_cap_for_pointer_width(16), NARROW_HOST_MEMORY_BYTES);
    }

    #[test]
    fn wide_hosts_get_4096_pages() {
        let limits = ResourceLimits::for_pointer_width(64);
        assert_eq!(limits.max_memory_bytes, 256 * 1024 * 1024);
        assert_eq!(limits.max_memory_pages(), 4096);
    }

    #[test]
    fn default_follows_the_compiling_host() {
        assert_eq!(
            ResourceLimits::default().max_memory_bytes,
            memory_cap_for_pointer_width(usize::BITS)
        );
    }
}
