mod share;

pub use share::{Mount, MountMode};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Size of one WebAssembly linear memory page in bytes.
pub const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Largest page count a 32-bit linear memory can address (4 GiB).
pub const MAX_WASM32_PAGES: u32 = 65536;

/// Initial and maximum page count the reference host gives the worker.
pub const DEFAULT_MEMORY_PAGES: u32 = 10000;

/// Linear memory granted to a worker.
///
/// For memories the module imports, the budget is pre-allocated at launch.
/// Shared memories cannot grow past what was reserved, so `initial_pages`
/// should normally equal `maximum_pages`.
///
/// A module that defines its own memory (a Go `wasip1` binary, for one) keeps
/// its declared initial size and sharedness. Only `maximum_pages` applies to
/// it, as a cap on growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryBudget {
    pub initial_pages: u32,
    pub maximum_pages: u32,
    #[serde(default = "default_shared")]
    pub shared: bool,
}

fn default_shared() -> bool {
    true
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            initial_pages: DEFAULT_MEMORY_PAGES,
            maximum_pages: DEFAULT_MEMORY_PAGES,
            shared: true,
        }
    }
}

impl MemoryBudget {
    /// Creates a budget with a fixed size (`initial == maximum`).
    pub fn fixed(pages: u32, shared: bool) -> Self {
        Self {
            initial_pages: pages,
            maximum_pages: pages,
            shared,
        }
    }

    /// Checks the budget against the limits of a 32-bit linear memory.
    pub fn validate(&self) -> Result<()> {
        if self.initial_pages > self.maximum_pages {
            return Err(Error::Resource(format!(
                "initial pages ({}) exceed maximum pages ({})",
                self.initial_pages, self.maximum_pages
            )));
        }
        if self.maximum_pages > MAX_WASM32_PAGES {
            return Err(Error::Resource(format!(
                "maximum pages ({}) exceed the {MAX_WASM32_PAGES} page limit",
                self.maximum_pages
            )));
        }
        Ok(())
    }

    /// Maximum size of the memory in bytes.
    pub fn maximum_bytes(&self) -> u64 {
        u64::from(self.maximum_pages) * WASM_PAGE_SIZE
    }
}
