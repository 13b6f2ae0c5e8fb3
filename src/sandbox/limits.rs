//! Resource limiting for guest stores.

use wasmtime::{ResourceLimiter, Store};
use wasmtime_wasi::preview1::WasiP1Ctx;

/// Default cap on table elements (function tables grow with the interpreter).
pub const DEFAULT_MAX_TABLE_ELEMENTS: usize = 100_000;

/// Enforces the linear memory and table limits of one store.
#[derive(Debug)]
pub struct MemoryLimiter {
    max_memory: u64,
    max_table_elements: usize,
    peak_memory: u64,
    denied: Option<String>,
}

impl MemoryLimiter {
    /// Create a limiter with the given memory cap in bytes.
    pub fn new(max_memory: u64) -> Self {
        Self {
            max_memory,
            max_table_elements: DEFAULT_MAX_TABLE_ELEMENTS,
            peak_memory: 0,
            denied: None,
        }
    }

    /// Description of the first growth request that was refused.
    pub fn denied(&self) -> Option<&str> {
        self.denied.as_deref()
    }

    /// Check if any limit has been hit.
    pub fn limit_exceeded(&self) -> bool {
        self.denied.is_some()
    }

    /// Highest linear memory size observed, in bytes.
    pub fn peak_memory(&self) -> u64 {
        self.peak_memory
    }

    /// Get the configured maximum memory.
    pub fn max_memory(&self) -> u64 {
        self.max_memory
    }

    fn deny(&mut self, reason: String) {
        if self.denied.is_none() {
            self.denied = Some(reason);
        }
    }
}

impl ResourceLimiter for MemoryLimiter {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        let desired_bytes = desired as u64;
        if desired_bytes > self.max_memory {
            self.deny(format!(
                "guest requested {} bytes of linear memory (currently {}, limit {})",
                desired_bytes, current, self.max_memory
            ));
            return Ok(false);
        }
        self.peak_memory = self.peak_memory.max(desired_bytes);
        Ok(true)
    }

    fn table_growing(
        &mut self,
        _current: usize,
        desired: usize,
        _maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.max_table_elements {
            self.deny(format!(
                "guest requested a table of {} elements (limit {})",
                desired, self.max_table_elements
            ));
            return Ok(false);
        }
        Ok(true)
    }
}

/// Data owned by a guest store.
pub struct StoreData {
    /// The resource limiter.
    pub limiter: MemoryLimiter,
    /// WASI preview 1 context wired to the host bridge streams.
    pub wasi: WasiP1Ctx,
}

impl StoreData {
    /// Create store data with the given memory limit and WASI context.
    pub fn new(max_memory: u64, wasi: WasiP1Ctx) -> Self {
        Self {
            limiter: MemoryLimiter::new(max_memory),
            wasi,
        }
    }
}

/// Extension trait for stores that carry [`StoreData`].
pub trait StoreLimiterExt {
    /// Install the memory limiter on the store.
    fn configure_limiter(&mut self);
}

impl StoreLimiterExt for Store<StoreData> {
    fn configure_limiter(&mut self) {
        self.limiter(|data| &mut data.limiter);
    }
}
