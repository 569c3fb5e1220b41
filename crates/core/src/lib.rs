pub mod channel;
pub mod client;
pub mod error;
pub mod scope;
pub mod translate;
pub mod types;

pub use channel::{MemoryChannel, OutputChannel, TracingChannel};
pub use client::{ClientOptions, DocumentFilter};
pub use error::{Error, Result, Stage};
pub use scope::{CapabilityScope, CapabilityScopeBuilder, ScopePolicy, WORKSPACE_MOUNT};
pub use translate::{Direction, PathTranslator, path_to_uri};
pub use types::{
    DEFAULT_MEMORY_PAGES, MAX_WASM32_PAGES, MemoryBudget, Mount, MountMode, WASM_PAGE_SIZE,
};
