//! Purpose: Shared handle to one opened level plus its use-token bookkeeping.
//! Exports: `LevelHandle`, `UseToken`.
//! Role: What `LevelManager::open` hands out; jobs and pins register uses through it.
//! Invariants: The use set lives in the manager table slot, mutated only under the table lock.
//! Invariants: A handle whose slot is gone (or replaced) rejects new uses with `Closed`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde::Serialize;

use crate::core::error::{Error, ErrorKind};
use crate::core::key::ResourceKey;
use crate::core::manager::Shared;
use crate::core::store::Level;

/// Opaque marker for one consumer of a level.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct UseToken(u64);

impl UseToken {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for UseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "use#{}", self.0)
    }
}

pub struct LevelHandle {
    key: ResourceKey,
    path: PathBuf,
    level: Arc<dyn Level>,
    manager: Weak<Shared>,
}

impl LevelHandle {
    pub(crate) fn new(
        key: ResourceKey,
        path: PathBuf,
        level: Arc<dyn Level>,
        manager: Weak<Shared>,
    ) -> Self {
        Self {
            key,
            path,
            level,
            manager,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn level(&self) -> &Arc<dyn Level> {
        &self.level
    }

    pub fn add_use(self: &Arc<Self>, token: UseToken) -> Result<(), Error> {
        match self.manager.upgrade() {
            Some(shared) => shared.add_use(self, token),
            None => Err(Error::new(ErrorKind::Closed)
                .with_message("level manager has shut down")
                .with_path(&self.path)),
        }
    }

    /// Drops `token`; the level is unloaded when this was its last use.
    pub async fn remove_use(self: &Arc<Self>, token: UseToken) {
        if let Some(shared) = self.manager.upgrade() {
            shared.remove_use(self, token).await;
        }
    }

    pub fn uses(self: &Arc<Self>) -> usize {
        self.manager
            .upgrade()
            .map(|shared| shared.use_count(self))
            .unwrap_or(0)
    }

    pub fn is_used(self: &Arc<Self>) -> bool {
        self.uses() > 0
    }
}

impl fmt::Debug for LevelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LevelHandle")
            .field("key", &self.key)
            .field("path", &self.path)
            .field("class", &self.level.class_name())
            .finish()
    }
}
