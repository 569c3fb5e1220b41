use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Access mode for mounted directories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    /// Worker can read but not modify files.
    #[default]
    ReadOnly,
    /// Worker can read and write files.
    ReadWrite,
}

/// A host directory made visible to the worker under a virtual path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub virtual_path: String,
    pub host_path: PathBuf,
    #[serde(default)]
    pub mode: MountMode,
}

impl Mount {
    pub fn new(
        virtual_path: impl Into<String>,
        host_path: impl Into<PathBuf>,
        mode: MountMode,
    ) -> Self {
        Self {
            virtual_path: virtual_path.into(),
            host_path: host_path.into(),
            mode,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == MountMode::ReadOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod mount_mode {
        use super::*;

        #[test]
        fn default_is_read_only() {
            assert_eq!(MountMode::default(), MountMode::ReadOnly);
        }

        #[test]
        fn serializes_lowercase() {
            assert_eq!(
                serde_json::to_string(&MountMode::ReadOnly).unwrap(),
                "\"readonly\""
            );
            assert_eq!(
                serde_json::to_string(&MountMode::ReadWrite).unwrap(),
                "\"readwrite\""
            );
        }
    }

    mod mount {
        use super::*;

        #[test]
        fn new_sets_fields() {
            let mount = Mount::new("/workspace", "/home/me/project", MountMode::ReadWrite);
            assert_eq!(mount.virtual_path, "/workspace");
            assert_eq!(mount.host_path, PathBuf::from("/home/me/project"));
            assert!(!mount.is_read_only());
        }

        #[test]
        fn mode_defaults_when_missing() {
            let mount: Mount =
                serde_json::from_str(r#"{"virtual_path": "/data", "host_path": "/srv/data"}"#)
                    .unwrap();
            assert!(mount.is_read_only());
        }
    }
}
