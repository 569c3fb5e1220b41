//! The `--config` file.
//!
//! Every field is optional; missing fields keep the defaults the protobuf
//! language server is normally run with.
//!
//! ```toml
//! module = "protolsp.wasm"
//! process_name = "protolsp"
//! trace = false
//! mount_mode = "readonly"
//!
//! [memory]
//! initial_pages = 4096
//! maximum_pages = 4096
//! shared = true
//!
//! [env]
//! RUST_LOG = "info"
//! ```

use anyhow::Context;
use sandbridge::{
    ActivationOptions, ClientOptions, DEFAULT_ENV, DEFAULT_PROCESS_NAME, DocumentFilter, Error,
    MemoryBudget, MountMode,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub module: Option<PathBuf>,
    pub workspace: Option<PathBuf>,
    pub process_name: String,
    pub trace: bool,
    pub mount_mode: MountMode,
    pub memory: MemoryBudget,
    /// Replaces the default environment when present.
    pub env: BTreeMap<String, String>,
    pub document_selector: Vec<DocumentFilter>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            module: None,
            workspace: None,
            process_name: DEFAULT_PROCESS_NAME.to_string(),
            trace: true,
            mount_mode: MountMode::ReadWrite,
            memory: MemoryBudget::default(),
            env: DEFAULT_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            document_selector: ClientOptions::proto().document_selector,
        }
    }
}

impl BridgeConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> sandbridge::Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| Error::InvalidConfig(e.message().to_string()))?;
        config
            .memory
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(config)
    }

    /// Builds activation options for `module` served over `workspace`.
    pub fn activation_options(&self, module: &Path, workspace: &Path) -> ActivationOptions {
        let mut options = ActivationOptions::new(module.to_string_lossy(), workspace);
        options.process_name = self.process_name.clone();
        options.trace = self.trace;
        options.workspace_mode = self.mount_mode;
        options.memory = self.memory;
        options.env = self.env.clone();
        options.client = ClientOptions::new(self.document_selector.clone());
        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_keeps_defaults() {
        let config = BridgeConfig::from_toml("").unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.process_name, "protolsp");
        assert_eq!(config.memory, MemoryBudget::fixed(10000, true));
        assert_eq!(config.env.get("PROTOLSP_DEBUG").map(String::as_str), Some("1"));
        assert!(config.trace);
    }

    #[test]
    fn parses_all_fields() {
        let config = BridgeConfig::from_toml(
            r#"
            module = "server.wasm"
            workspace = "/src/project"
            process_name = "buf-lsp"
            trace = false
            mount_mode = "readonly"

            [memory]
            initial_pages = 256
            maximum_pages = 1024
            shared = false

            [env]
            RUST_LOG = "warn"

            [[document_selector]]
            language = "proto"
            "#,
        )
        .unwrap();

        assert_eq!(config.module, Some(PathBuf::from("server.wasm")));
        assert_eq!(config.workspace, Some(PathBuf::from("/src/project")));
        assert_eq!(config.process_name, "buf-lsp");
        assert!(!config.trace);
        assert_eq!(config.mount_mode, MountMode::ReadOnly);
        assert_eq!(config.memory.initial_pages, 256);
        assert_eq!(config.memory.maximum_pages, 1024);
        assert!(!config.memory.shared);
        assert_eq!(config.env.len(), 1);
        assert_eq!(config.document_selector.len(), 1);
        assert_eq!(config.document_selector[0].scheme, None);
    }

    #[test]
    fn memory_shared_defaults_to_true() {
        let config = BridgeConfig::from_toml(
            "[memory]\ninitial_pages = 10\nmaximum_pages = 10\n",
        )
        .unwrap();
        assert!(config.memory.shared);
    }

    #[test]
    fn rejects_invalid_budget() {
        let err = BridgeConfig::from_toml("[memory]\ninitial_pages = 20\nmaximum_pages = 10\n")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err:?}");
        assert!(err.to_string().contains("initial pages"), "{err}");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = BridgeConfig::from_toml("cpus = 4").unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err:?}");
        assert!(err.to_string().contains("cpus"), "{err}");
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbridge.toml");
        std::fs::write(&path, "process_name = \"custom\"\n").unwrap();

        let config = BridgeConfig::load(&path).unwrap();
        assert_eq!(config.process_name, "custom");
    }

    #[test]
    fn load_reports_missing_file() {
        let err = BridgeConfig::load(Path::new("/nonexistent/sandbridge.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }

    #[test]
    fn activation_options_carry_config() {
        let config = BridgeConfig {
            process_name: "custom".into(),
            trace: false,
            mount_mode: MountMode::ReadOnly,
            ..BridgeConfig::default()
        };
        let options =
            config.activation_options(Path::new("server.wasm"), Path::new("/src/project"));

        assert_eq!(options.module_location, "server.wasm");
        assert_eq!(options.workspace_root, PathBuf::from("/src/project"));
        assert_eq!(options.process_name, "custom");
        assert!(!options.trace);
        assert_eq!(options.workspace_mode, MountMode::ReadOnly);
        assert!(options.client.selects("file", "proto"));
    }
}
