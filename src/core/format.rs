//! Purpose: Resolve a target format name to a writer for a destination path.
//! Exports: `FormatRegistry`, `TargetWriter`, `WriterFactory`.
//! Role: Stateless lookup consulted before a conversion starts.
//! Invariants: Unknown names fail with `UnknownFormat`; nothing is guessed.
//! Invariants: An existing destination fails with `AlreadyExists`; conversions never overwrite.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::core::error::{Error, ErrorKind};
use crate::core::fs_store::DirWriter;
use crate::core::key::absolute_path;
use crate::core::store::{LevelWriter, Platform};

pub type WriterFactory = Arc<dyn Fn(&Path) -> Box<dyn LevelWriter> + Send + Sync>;

#[derive(Clone, Default)]
pub struct FormatRegistry {
    writers: BTreeMap<String, WriterFactory>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the writers shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DirWriter::FORMAT_NAME, |path| {
            Box::new(DirWriter::new(path)) as Box<dyn LevelWriter>
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(&Path) -> Box<dyn LevelWriter> + Send + Sync + 'static,
    {
        self.writers.insert(name.into(), Arc::new(factory));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.writers.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.writers.contains_key(name)
    }

    pub fn resolve(&self, path: &Path, format_name: &str) -> Result<TargetWriter, Error> {
        let path = absolute_path(path)?;
        let exists = path.try_exists().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to check target path")
                .with_path(&path)
                .with_source(err)
        })?;
        if exists {
            return Err(Error::new(ErrorKind::AlreadyExists)
                .with_message(format!("Already exists path: {}", path.display()))
                .with_path(&path)
                .with_hint("Choose a target path that does not exist yet."));
        }
        let factory = self.writers.get(format_name).ok_or_else(|| {
            Error::new(ErrorKind::UnknownFormat)
                .with_message(format!("Unknown format: {format_name}"))
                .with_hint(format!("Known formats: {}", self.names().join(", ")))
        })?;
        let writer = factory(&path);
        Ok(TargetWriter {
            path,
            format: format_name.to_string(),
            platform: None,
            writer,
        })
    }
}

impl fmt::Debug for FormatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormatRegistry")
            .field("writers", &self.names())
            .finish()
    }
}

/// A resolved, not yet opened, conversion target.
pub struct TargetWriter {
    path: PathBuf,
    format: String,
    platform: Option<Platform>,
    writer: Box<dyn LevelWriter>,
}

impl TargetWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn platform(&self) -> Option<&Platform> {
        self.platform.as_ref()
    }

    /// Platform and version to write; defaults to the source level's.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub(crate) fn into_parts(self) -> (PathBuf, String, Option<Platform>, Box<dyn LevelWriter>) {
        (self.path, self.format, self.platform, self.writer)
    }
}

impl fmt::Debug for TargetWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetWriter")
            .field("path", &self.path)
            .field("format", &self.format)
            .field("platform", &self.platform)
            .field("class", &self.writer.class_name())
            .finish()
    }
}
