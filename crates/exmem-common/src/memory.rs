//! Process-wide memory-limit registry.
//!
//! Stages and file streams estimate their memory footprint up front and
//! negotiate budgets before any I/O happens. The registry is the shared
//! ledger those estimates are checked against: it holds the configured
//! ceiling, tracks registered usage, and publishes the bookkeeping overhead
//! charged per heap allocation.
//!
//! The registry does not hook the allocator; components register and release
//! their footprints explicitly. The engine itself is single-threaded, but the
//! global instance is shared process state and therefore lock-protected.

use parking_lot::RwLock;

/// Bookkeeping overhead charged per tracked allocation, in bytes.
///
/// Every `memory_usage` estimate in the engine adds this once per owned heap
/// allocation, so budget arithmetic stays consistent across components.
pub const SPACE_OVERHEAD: usize = 16;

/// Default memory ceiling when the embedding application sets none: 128 MiB.
const DEFAULT_LIMIT: usize = 128 * 1024 * 1024;

/// Ledger of the memory ceiling and registered usage.
#[derive(Debug)]
pub struct MemoryRegistry {
    limit: usize,
    used: usize,
}

impl MemoryRegistry {
    /// Creates a registry with the given ceiling in bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    /// Returns the configured ceiling in bytes.
    #[must_use]
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns the bytes currently registered.
    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Returns how many bytes remain under the ceiling.
    #[must_use]
    pub fn available(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }

    /// Records `bytes` of usage.
    pub fn register(&mut self, bytes: usize) {
        self.used += bytes;
    }

    /// Releases `bytes` of previously registered usage.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` exceeds the registered usage; releasing memory that
    /// was never registered is a caller bug.
    pub fn release(&mut self, bytes: usize) {
        assert!(
            bytes <= self.used,
            "released {bytes} bytes but only {} are registered",
            self.used
        );
        self.used -= bytes;
    }

    /// The per-allocation bookkeeping overhead, in bytes.
    #[must_use]
    pub fn space_overhead() -> usize {
        SPACE_OVERHEAD
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT)
    }
}

static GLOBAL: RwLock<Option<MemoryRegistry>> = RwLock::new(None);

/// Sets the ceiling of the process-wide registry.
pub fn set_global_limit(limit: usize) {
    let mut guard = GLOBAL.write();
    match guard.as_mut() {
        Some(reg) => reg.limit = limit,
        None => *guard = Some(MemoryRegistry::new(limit)),
    }
}

/// Reads a value out of the process-wide registry, initializing it with the
/// default ceiling on first use.
pub fn with_global<T>(f: impl FnOnce(&mut MemoryRegistry) -> T) -> T {
    let mut guard = GLOBAL.write();
    f(guard.get_or_insert_with(MemoryRegistry::default))
}

/// Bytes remaining under the process-wide ceiling.
#[must_use]
pub fn global_available() -> usize {
    with_global(|registry| registry.available())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_release() {
        let mut reg = MemoryRegistry::new(1024);
        assert_eq!(reg.available(), 1024);
        reg.register(100);
        assert_eq!(reg.used(), 100);
        assert_eq!(reg.available(), 924);
        reg.release(100);
        assert_eq!(reg.used(), 0);
    }

    #[test]
    fn test_available_saturates() {
        let mut reg = MemoryRegistry::new(10);
        reg.register(50);
        assert_eq!(reg.available(), 0);
    }

    #[test]
    #[should_panic(expected = "released")]
    fn test_release_unregistered_panics() {
        let mut reg = MemoryRegistry::new(10);
        reg.release(1);
    }
}
