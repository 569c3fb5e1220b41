//! Loading and compiling worker modules.
//!
//! The loader reads a module image through a [`ModuleStorage`], checks its
//! header and compiles it ahead of time into a [`CompiledModule`]. Every
//! failure is reported as [`Error::Load`] and is not retried.

use async_trait::async_trait;
use sandbridge_core::{Error, Result};
use std::path::PathBuf;
use wasmtime::{Engine, Module};

const WASM_MAGIC: [u8; 4] = *b"\0asm";
const WASM_CORE_VERSION: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

/// Byte-buffer storage a module image is read from.
#[async_trait]
pub trait ModuleStorage: Send + Sync {
    async fn read(&self, location: &str) -> std::io::Result<Vec<u8>>;
}

/// Reads module images from the local filesystem, relative to an optional
/// base directory.
#[derive(Debug, Clone, Default)]
pub struct FileStorage {
    base: Option<PathBuf>,
}

impl FileStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves relative locations against `base`.
    pub fn with_base(base: impl Into<PathBuf>) -> Self {
        Self {
            base: Some(base.into()),
        }
    }

    fn resolve(&self, location: &str) -> PathBuf {
        match &self.base {
            Some(base) => base.join(location),
            None => PathBuf::from(location),
        }
    }
}

#[async_trait]
impl ModuleStorage for FileStorage {
    async fn read(&self, location: &str) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(self.resolve(location)).await
    }
}

/// A validated, compiled module ready to be launched.
///
/// Cloning is cheap; clones share the compiled code.
#[derive(Clone)]
pub struct CompiledModule {
    module: Module,
    location: String,
}

impl CompiledModule {
    pub fn location(&self) -> &str {
        &self.location
    }

    pub(crate) fn module(&self) -> &Module {
        &self.module
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Compiles module images against one engine.
#[derive(Clone)]
pub struct SandboxLoader {
    engine: Engine,
}

impl SandboxLoader {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Reads `location` from `storage` and compiles it.
    pub async fn load(
        &self,
        storage: &dyn ModuleStorage,
        location: &str,
    ) -> Result<CompiledModule> {
        let bytes = storage
            .read(location)
            .await
            .map_err(|e| Error::load(location, e))?;
        tracing::debug!(location, size = bytes.len(), "read module image");
        self.compile(location, &bytes)
    }

    /// Validates and compiles an in-memory module image.
    pub fn compile(&self, location: &str, bytes: &[u8]) -> Result<CompiledModule> {
        check_header(bytes).map_err(|reason| Error::load(location, reason))?;

        Module::validate(&self.engine, bytes)
            .map_err(|e| Error::load(location, format!("invalid module: {e:#}")))?;
        let module = Module::from_binary(&self.engine, bytes)
            .map_err(|e| Error::load(location, format!("compilation failed: {e:#}")))?;

        tracing::info!(location, "compiled module");
        Ok(CompiledModule {
            module,
            location: location.to_string(),
        })
    }
}

fn check_header(bytes: &[u8]) -> std::result::Result<(), String> {
    if bytes.len() < 8 {
        return Err(format!(
            "truncated header: expected at least 8 bytes, got {}",
            bytes.len()
        ));
    }
    if bytes[..4] != WASM_MAGIC {
        return Err(format!("bad magic bytes {:02x?}", &bytes[..4]));
    }
    if bytes[4..8] != WASM_CORE_VERSION {
        return Err(format!("unsupported module version {:02x?}", &bytes[4..8]));
    }
    Ok(())
}
