//! Purpose: Canonical identity for level paths.
//! Exports: `ResourceKey`, `absolute_path`.
//! Role: Deduplication key for the level table; two spellings of one location share a key.
//! Invariants: Keys are absolute, lexically normalized, `/`-separated and lowercase.
//! Invariants: Canonicalization never touches the filesystem, so missing paths still key.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;

use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn for_path(path: impl AsRef<Path>) -> Result<Self, Error> {
        let absolute = absolute_path(path.as_ref())?;
        Ok(Self::from_absolute(&absolute))
    }

    fn from_absolute(path: &Path) -> Self {
        let text = path.to_string_lossy().replace('\\', "/");
        Self(text.to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Absolute form of `path` with `.` and `..` resolved lexically.
pub fn absolute_path(path: &Path) -> Result<PathBuf, Error> {
    if path.as_os_str().is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("path must not be empty"));
    }
    let absolute = std::path::absolute(path).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to resolve absolute path")
            .with_path(path)
            .with_source(err)
    })?;
    Ok(normalize(&absolute))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
