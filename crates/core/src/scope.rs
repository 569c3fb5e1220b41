//! Capability scopes: what a worker is allowed to see of the host.
//!
//! A [`CapabilityScope`] is built once, before launch, and never changes
//! afterwards. It lists the host directories mounted into the worker's
//! filesystem view, the environment the worker starts with and the name it
//! runs under.
//!
//! ```
//! use sandbridge_core::{CapabilityScope, MountMode};
//!
//! let scope = CapabilityScope::builder("protolsp")
//!     .workspace("/home/me/project", MountMode::ReadWrite)
//!     .env("RUST_LOG", "debug")
//!     .build();
//!
//! assert_eq!(scope.mounts()[0].virtual_path, "/workspace");
//! assert_eq!(scope.args(), ["protolsp"]);
//! ```

use crate::translate::PathTranslator;
use crate::types::{Mount, MountMode};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Virtual path the active workspace is mounted at.
pub const WORKSPACE_MOUNT: &str = "/workspace";

/// Immutable set of host resources granted to one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityScope {
    mounts: Vec<Mount>,
    env: BTreeMap<String, String>,
    process_name: String,
    args: Vec<String>,
}

impl CapabilityScope {
    pub fn builder(process_name: impl Into<String>) -> CapabilityScopeBuilder {
        CapabilityScopeBuilder::new(process_name)
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    /// Command line seen by the worker; `args()[0]` is the process name.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Returns a translator derived from this scope's mount table.
    pub fn translator(&self) -> PathTranslator {
        PathTranslator::new(self.mounts.iter().cloned())
    }
}

/// Builder for [`CapabilityScope`].
///
/// Mount paths are normalised to an absolute form without a trailing slash.
/// Mounting the same virtual path twice keeps the last mount.
#[derive(Debug, Clone)]
pub struct CapabilityScopeBuilder {
    mounts: Vec<Mount>,
    env: BTreeMap<String, String>,
    process_name: String,
    extra_args: Vec<String>,
}

impl CapabilityScopeBuilder {
    pub fn new(process_name: impl Into<String>) -> Self {
        Self {
            mounts: Vec::new(),
            env: BTreeMap::new(),
            process_name: process_name.into(),
            extra_args: Vec::new(),
        }
    }

    /// Mounts a host directory at `virtual_path`.
    pub fn mount(
        mut self,
        virtual_path: impl Into<String>,
        host_path: impl Into<PathBuf>,
        mode: MountMode,
    ) -> Self {
        let virtual_path = normalize_virtual_path(&virtual_path.into());
        self.mounts.retain(|m| m.virtual_path != virtual_path);
        self.mounts.push(Mount::new(virtual_path, host_path, mode));
        self
    }

    /// Mounts the whole workspace root at [`WORKSPACE_MOUNT`].
    pub fn workspace(self, root: impl Into<PathBuf>, mode: MountMode) -> Self {
        self.mount(WORKSPACE_MOUNT, root, mode)
    }

    /// Adds one environment variable to the allow-list.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Adds several environment variables to the allow-list.
    pub fn envs<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.env.insert(key.into(), value.into());
        }
        self
    }

    /// Appends an argument after the process name.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn build(self) -> CapabilityScope {
        let mut args = Vec::with_capacity(self.extra_args.len() + 1);
        args.push(self.process_name.clone());
        args.extend(self.extra_args);

        CapabilityScope {
            mounts: self.mounts,
            env: self.env,
            process_name: self.process_name,
            args,
        }
    }
}

/// The coarse policy used by the editor host: the whole workspace plus an
/// explicit environment allow-list.
#[derive(Debug, Clone)]
pub struct ScopePolicy {
    pub workspace_root: PathBuf,
    pub workspace_mode: MountMode,
    pub env: BTreeMap<String, String>,
}

impl ScopePolicy {
    /// Exposes `root` read-write, with an empty environment.
    pub fn workspace(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            workspace_mode: MountMode::ReadWrite,
            env: BTreeMap::new(),
        }
    }

    pub fn with_mode(mut self, mode: MountMode) -> Self {
        self.workspace_mode = mode;
        self
    }

    pub fn with_env<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn scope(&self, process_name: impl Into<String>) -> CapabilityScope {
        CapabilityScope::builder(process_name)
            .workspace(self.workspace_root.clone(), self.workspace_mode)
            .envs(self.env.clone())
            .build()
    }
}

fn normalize_virtual_path(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod builder {
        use super::*;

        #[test]
        fn args_start_with_process_name() {
            let scope = CapabilityScope::builder("protolsp").arg("--stdio").build();
            assert_eq!(scope.process_name(), "protolsp");
            assert_eq!(scope.args(), ["protolsp", "--stdio"]);
        }

        #[test]
        fn workspace_mounts_at_workspace() {
            let scope = CapabilityScope::builder("p")
                .workspace("/home/me/project", MountMode::ReadWrite)
                .build();
            assert_eq!(
                scope.mounts(),
                [Mount::new(
                    "/workspace",
                    "/home/me/project",
                    MountMode::ReadWrite
                )]
            );
        }

        #[test]
        fn virtual_paths_are_normalised() {
            let scope = CapabilityScope::builder("p")
                .mount("data/", "/srv/data", MountMode::ReadOnly)
                .mount("/", "/srv/root", MountMode::ReadOnly)
                .build();
            assert_eq!(scope.mounts()[0].virtual_path, "/data");
            assert_eq!(scope.mounts()[1].virtual_path, "/");
        }

        #[test]
        fn remounting_replaces_previous_mount() {
            let scope = CapabilityScope::builder("p")
                .mount("/data", "/srv/a", MountMode::ReadOnly)
                .mount("/data/", "/srv/b", MountMode::ReadWrite)
                .build();
            assert_eq!(scope.mounts().len(), 1);
            assert_eq!(scope.mounts()[0].host_path, PathBuf::from("/srv/b"));
        }

        #[test]
        fn env_is_an_explicit_allow_list() {
            let scope = CapabilityScope::builder("p")
                .env("PROTOLSP_DEBUG", "1")
                .envs([("RUST_LOG", "debug")])
                .build();
            assert_eq!(scope.env().len(), 2);
            assert_eq!(scope.env()["PROTOLSP_DEBUG"], "1");
            assert_eq!(scope.env()["RUST_LOG"], "debug");
        }
    }

    mod policy {
        use super::*;

        #[test]
        fn workspace_policy_is_read_write_by_default() {
            let scope = ScopePolicy::workspace("/ws").scope("protolsp");
            assert_eq!(scope.mounts().len(), 1);
            assert_eq!(scope.mounts()[0].mode, MountMode::ReadWrite);
            assert!(scope.env().is_empty());
        }

        #[test]
        fn policy_forwards_env_and_mode() {
            let scope = ScopePolicy::workspace("/ws")
                .with_mode(MountMode::ReadOnly)
                .with_env([("RUST_BACKTRACE", "1")])
                .scope("protolsp");
            assert!(scope.mounts()[0].is_read_only());
            assert_eq!(scope.env()["RUST_BACKTRACE"], "1");
        }

        #[test]
        fn same_policy_yields_equal_scopes() {
            let policy = ScopePolicy::workspace("/ws").with_env([("A", "1")]);
            assert_eq!(policy.scope("p"), policy.scope("p"));
        }
    }
}
