//! Translation between host identifiers and the worker's virtual view.
//!
//! The worker only sees the directories in its mount table, remapped under
//! their virtual paths. Identifiers that cross the protocol boundary have to
//! be rewritten in both directions. Identifiers outside every mount are left
//! untouched, so translation never fails.

use crate::types::Mount;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use serde_json::Value;
use std::path::{Component, Path, PathBuf};

const FILE_SCHEME: &str = "file://";

/// Everything but unreserved characters and `/` is escaped in a path.
const PATH_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~')
    .remove(b'/');

/// Which way an identifier is being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host identifier to the worker's view.
    ToVirtual,
    /// Worker identifier back to the host's view.
    ToHost,
}

/// Bidirectional mapping derived from a mount table.
#[derive(Debug, Clone, Default)]
pub struct PathTranslator {
    mounts: Vec<Mount>,
}

impl PathTranslator {
    pub fn new(mounts: impl IntoIterator<Item = Mount>) -> Self {
        Self {
            mounts: mounts.into_iter().collect(),
        }
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Maps a host path into the worker's view.
    pub fn to_virtual(&self, host_path: &Path) -> PathBuf {
        self.translate_path(host_path, Direction::ToVirtual)
            .unwrap_or_else(|| host_path.to_path_buf())
    }

    /// Maps a worker path back to the host.
    pub fn to_host(&self, virtual_path: &Path) -> PathBuf {
        self.translate_path(virtual_path, Direction::ToHost)
            .unwrap_or_else(|| virtual_path.to_path_buf())
    }

    /// Translates `path`, or returns `None` when no mount covers it.
    ///
    /// The mount with the longest matching root wins.
    pub fn translate_path(&self, path: &Path, direction: Direction) -> Option<PathBuf> {
        let mut best: Option<(usize, PathBuf)> = None;

        for mount in &self.mounts {
            let virtual_root = Path::new(&mount.virtual_path);
            let (from, to) = match direction {
                Direction::ToVirtual => (mount.host_path.as_path(), virtual_root),
                Direction::ToHost => (virtual_root, mount.host_path.as_path()),
            };

            let Ok(rest) = path.strip_prefix(from) else {
                continue;
            };

            let depth = from.components().count();
            if best.as_ref().is_some_and(|(d, _)| *d >= depth) {
                continue;
            }

            let translated = if rest.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(rest)
            };
            best = Some((depth, translated));
        }

        best.map(|(_, path)| path)
    }

    pub fn uri_to_virtual(&self, uri: &str) -> String {
        self.translate_uri(uri, Direction::ToVirtual)
    }

    pub fn uri_to_host(&self, uri: &str) -> String {
        self.translate_uri(uri, Direction::ToHost)
    }

    /// Translates a `file://` URI. Other schemes, URIs with an authority and
    /// paths outside every mount are returned unchanged.
    ///
    /// Only the mount root is replaced. The rest of the URI is copied as
    /// encoded, so a URI translated there and back is byte-identical.
    pub fn translate_uri(&self, uri: &str, direction: Direction) -> String {
        let Some(rest) = uri.strip_prefix(FILE_SCHEME) else {
            return uri.to_string();
        };
        if !rest.starts_with('/') {
            return uri.to_string();
        }

        let split = rest.find(['?', '#']).unwrap_or(rest.len());
        let (encoded_path, suffix) = rest.split_at(split);

        let mut best: Option<(usize, &Path, &str)> = None;
        for mount in &self.mounts {
            let virtual_root = Path::new(&mount.virtual_path);
            let (from, to) = match direction {
                Direction::ToVirtual => (mount.host_path.as_path(), virtual_root),
                Direction::ToHost => (virtual_root, mount.host_path.as_path()),
            };

            let Some(remainder) = strip_encoded_root(encoded_path, from) else {
                continue;
            };
            let depth = from.components().count();
            if best.is_some_and(|(d, _, _)| d >= depth) {
                continue;
            }
            best = Some((depth, to, remainder));
        }

        let Some((_, root, remainder)) = best else {
            return uri.to_string();
        };
        let base = path_to_uri(root);
        let remainder = if base.ends_with('/') {
            remainder.strip_prefix('/').unwrap_or(remainder)
        } else {
            remainder
        };
        format!("{base}{remainder}{suffix}")
    }

    /// Rewrites every `file://` URI inside a JSON value, including object
    /// keys, and returns how many identifiers changed.
    pub fn rewrite_uris(&self, value: &mut Value, direction: Direction) -> usize {
        match value {
            Value::String(s) if s.starts_with(FILE_SCHEME) => {
                let translated = self.translate_uri(s, direction);
                if translated != *s {
                    *s = translated;
                    1
                } else {
                    0
                }
            }
            Value::Array(items) => items
                .iter_mut()
                .map(|item| self.rewrite_uris(item, direction))
                .sum(),
            Value::Object(map) => {
                let mut rewritten = 0;
                let entries = std::mem::take(map);
                for (key, mut item) in entries {
                    rewritten += self.rewrite_uris(&mut item, direction);
                    let key = if key.starts_with(FILE_SCHEME) {
                        let translated = self.translate_uri(&key, direction);
                        if translated != key {
                            rewritten += 1;
                        }
                        translated
                    } else {
                        key
                    };
                    map.insert(key, item);
                }
                rewritten
            }
            _ => 0,
        }
    }
}

/// Formats an absolute path as a `file://` URI.
pub fn path_to_uri(path: &Path) -> String {
    let path = path.to_string_lossy();
    format!("{FILE_SCHEME}{}", utf8_percent_encode(&path, PATH_ESCAPE))
}

/// Strips the segments of `root` off an encoded URI path.
///
/// Segments are compared decoded. Returns the untouched encoded remainder,
/// which is empty or starts with `/`.
fn strip_encoded_root<'a>(encoded_path: &'a str, root: &Path) -> Option<&'a str> {
    let mut rest = encoded_path;
    for component in root.components() {
        let name = match component {
            Component::RootDir => continue,
            Component::Normal(name) => name.to_str()?,
            _ => return None,
        };
        let tail = rest.strip_prefix('/')?;
        let end = tail.find('/').unwrap_or(tail.len());
        let segment = percent_decode_str(&tail[..end]).decode_utf8().ok()?;
        if segment != name {
            return None;
        }
        rest = &tail[end..];
    }
    Some(rest)
}
